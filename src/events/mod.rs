//! Typed lifecycle events.
//!
//! Publishing an event appends it to the script's bounded history, then
//! delivers it to the live broadcast stream and to registered handlers.
//! History and live delivery therefore never disagree.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::execution::FailureKind;

/// Scope used for events that are not about a single script.
pub const ALL_SCRIPTS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ScriptEventKind {
    ScriptCreated {
        name: String,
        version: String,
    },
    ScriptUpdated {
        version: String,
    },
    ScriptDeleted,
    ExecutionStarted {
        execution_id: Uuid,
    },
    ExecutionProgress {
        execution_id: Uuid,
        stream: OutputStream,
        output: String,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        exit_code: i32,
        success: bool,
        duration_ms: u64,
        peak_memory_mb: f64,
        average_cpu_percent: f64,
    },
    ExecutionFailed {
        execution_id: Uuid,
        reason: FailureKind,
        message: String,
        duration_ms: u64,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        duration_ms: u64,
    },
    DependenciesInstalling {
        dependencies: Vec<String>,
    },
    DependenciesInstalled {
        dependencies: Vec<String>,
    },
    DependenciesError {
        message: String,
    },
    ValidationStarted,
    ValidationCompleted {
        warnings: Vec<String>,
    },
    ValidationFailed {
        errors: Vec<String>,
    },
    CacheUpdated,
    CacheCleared,
    CacheError {
        message: String,
    },
}

/// Event tag without payload, used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptEventType {
    ScriptCreated,
    ScriptUpdated,
    ScriptDeleted,
    ExecutionStarted,
    ExecutionProgress,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    DependenciesInstalling,
    DependenciesInstalled,
    DependenciesError,
    ValidationStarted,
    ValidationCompleted,
    ValidationFailed,
    CacheUpdated,
    CacheCleared,
    CacheError,
}

impl ScriptEventKind {
    pub fn event_type(&self) -> ScriptEventType {
        match self {
            ScriptEventKind::ScriptCreated { .. } => ScriptEventType::ScriptCreated,
            ScriptEventKind::ScriptUpdated { .. } => ScriptEventType::ScriptUpdated,
            ScriptEventKind::ScriptDeleted => ScriptEventType::ScriptDeleted,
            ScriptEventKind::ExecutionStarted { .. } => ScriptEventType::ExecutionStarted,
            ScriptEventKind::ExecutionProgress { .. } => ScriptEventType::ExecutionProgress,
            ScriptEventKind::ExecutionCompleted { .. } => ScriptEventType::ExecutionCompleted,
            ScriptEventKind::ExecutionFailed { .. } => ScriptEventType::ExecutionFailed,
            ScriptEventKind::ExecutionCancelled { .. } => ScriptEventType::ExecutionCancelled,
            ScriptEventKind::DependenciesInstalling { .. } => {
                ScriptEventType::DependenciesInstalling
            }
            ScriptEventKind::DependenciesInstalled { .. } => ScriptEventType::DependenciesInstalled,
            ScriptEventKind::DependenciesError { .. } => ScriptEventType::DependenciesError,
            ScriptEventKind::ValidationStarted => ScriptEventType::ValidationStarted,
            ScriptEventKind::ValidationCompleted { .. } => ScriptEventType::ValidationCompleted,
            ScriptEventKind::ValidationFailed { .. } => ScriptEventType::ValidationFailed,
            ScriptEventKind::CacheUpdated => ScriptEventType::CacheUpdated,
            ScriptEventKind::CacheCleared => ScriptEventType::CacheCleared,
            ScriptEventKind::CacheError { .. } => ScriptEventType::CacheError,
        }
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScriptEventKind::ExecutionCompleted { .. }
                | ScriptEventKind::ExecutionFailed { .. }
                | ScriptEventKind::ExecutionCancelled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptEvent {
    pub script_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ScriptEventKind,
}

impl fmt::Display for ScriptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.script_id, self.kind.event_type())
    }
}

/// Run statistics derived from a script's event history.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub average_duration_ms: f64,
}

pub type EventHandler = Arc<dyn Fn(&ScriptEvent) + Send + Sync>;

/// Returned by `on_script_event`, used to unregister the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct EventBus {
    history_capacity: usize,
    history: RwLock<HashMap<String, VecDeque<ScriptEvent>>>,
    handlers: RwLock<HashMap<ScriptEventType, Vec<(HandlerId, EventHandler)>>>,
    next_handler: AtomicU64,
    sender: broadcast::Sender<ScriptEvent>,
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            history_capacity: config.history_capacity.max(1),
            history: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            sender,
        }
    }

    /// Publishes an event. The timestamp is taken under the history lock
    /// and never goes backwards for a given script.
    pub fn emit_script_event(&self, script_id: &str, kind: ScriptEventKind) -> ScriptEvent {
        let event = {
            let mut history = self.history.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let entries = history.entry(script_id.to_string()).or_default();
            let mut timestamp = Utc::now();
            if let Some(last) = entries.back() {
                timestamp = timestamp.max(last.timestamp);
            }
            let event = ScriptEvent {
                script_id: script_id.to_string(),
                timestamp,
                kind,
            };
            if entries.len() == self.history_capacity {
                entries.pop_front();
            }
            entries.push_back(event.clone());
            // Sent under the lock so live order matches history order.
            let _ = self.sender.send(event.clone());
            event
        };
        trace!("Event {event}");

        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event.kind.event_type())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }
        event
    }

    pub fn on_script_event<F>(&self, event_type: ScriptEventType, handler: F) -> HandlerId
    where
        F: Fn(&ScriptEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Handler {id:?} registered for {event_type:?}");
        id
    }

    /// Returns whether the handler was registered.
    pub fn off_script_event(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Live stream of every event. Slow receivers lose the oldest events
    /// (see `broadcast::error::RecvError::Lagged`); history is unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<ScriptEvent> {
        self.sender.subscribe()
    }

    /// Oldest first.
    pub fn get_script_event_history(&self, script_id: &str) -> Vec<ScriptEvent> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(script_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_script_event_history(&self, script_id: &str) {
        self.history
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(script_id);
    }

    pub fn get_execution_stats(&self, script_id: &str) -> ExecutionStats {
        let history = self.get_script_event_history(script_id);
        let mut stats = ExecutionStats::default();
        let mut total_duration = 0u64;
        for event in &history {
            let duration = match &event.kind {
                ScriptEventKind::ExecutionCompleted { success, duration_ms, .. } => {
                    if *success {
                        stats.successful += 1;
                    } else {
                        stats.failed += 1;
                    }
                    *duration_ms
                }
                ScriptEventKind::ExecutionFailed { duration_ms, .. } => {
                    stats.failed += 1;
                    *duration_ms
                }
                ScriptEventKind::ExecutionCancelled { duration_ms, .. } => {
                    stats.cancelled += 1;
                    *duration_ms
                }
                _ => continue,
            };
            total_duration += duration;
            stats.total += 1;
        }
        if stats.total > 0 {
            stats.average_duration_ms = total_duration as f64 / stats.total as f64;
        }
        stats
    }

    // ── Typed wrappers ────────────────────────────────────

    pub fn notify_script_created(&self, script_id: &str, name: &str, version: &str) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ScriptCreated {
                name: name.to_string(),
                version: version.to_string(),
            },
        );
    }

    pub fn notify_script_updated(&self, script_id: &str, version: &str) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ScriptUpdated {
                version: version.to_string(),
            },
        );
    }

    pub fn notify_script_deleted(&self, script_id: &str) {
        self.emit_script_event(script_id, ScriptEventKind::ScriptDeleted);
    }

    pub fn notify_execution_started(&self, script_id: &str, execution_id: Uuid) {
        self.emit_script_event(script_id, ScriptEventKind::ExecutionStarted { execution_id });
    }

    pub fn notify_execution_progress(
        &self,
        script_id: &str,
        execution_id: Uuid,
        stream: OutputStream,
        output: &str,
    ) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ExecutionProgress {
                execution_id,
                stream,
                output: output.to_string(),
            },
        );
    }

    pub fn notify_execution_completed(
        &self,
        script_id: &str,
        execution_id: Uuid,
        exit_code: i32,
        duration_ms: u64,
        peak_memory_mb: f64,
        average_cpu_percent: f64,
    ) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ExecutionCompleted {
                execution_id,
                exit_code,
                success: exit_code == 0,
                duration_ms,
                peak_memory_mb,
                average_cpu_percent,
            },
        );
    }

    pub fn notify_execution_failed(
        &self,
        script_id: &str,
        execution_id: Uuid,
        reason: FailureKind,
        message: &str,
        duration_ms: u64,
    ) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ExecutionFailed {
                execution_id,
                reason,
                message: message.to_string(),
                duration_ms,
            },
        );
    }

    pub fn notify_execution_cancelled(
        &self,
        script_id: &str,
        execution_id: Uuid,
        duration_ms: u64,
    ) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::ExecutionCancelled {
                execution_id,
                duration_ms,
            },
        );
    }

    pub fn notify_dependencies_installing(&self, script_id: &str, dependencies: &[String]) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::DependenciesInstalling {
                dependencies: dependencies.to_vec(),
            },
        );
    }

    pub fn notify_dependencies_installed(&self, script_id: &str, dependencies: &[String]) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::DependenciesInstalled {
                dependencies: dependencies.to_vec(),
            },
        );
    }

    pub fn notify_dependencies_error(&self, script_id: &str, message: &str) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::DependenciesError {
                message: message.to_string(),
            },
        );
    }

    pub fn notify_validation_started(&self, script_id: &str) {
        self.emit_script_event(script_id, ScriptEventKind::ValidationStarted);
    }

    pub fn notify_validation_completed(&self, script_id: &str, warnings: Vec<String>) {
        self.emit_script_event(script_id, ScriptEventKind::ValidationCompleted { warnings });
    }

    pub fn notify_validation_failed(&self, script_id: &str, errors: Vec<String>) {
        self.emit_script_event(script_id, ScriptEventKind::ValidationFailed { errors });
    }

    pub fn notify_cache_updated(&self, script_id: &str) {
        self.emit_script_event(script_id, ScriptEventKind::CacheUpdated);
    }

    /// Recorded under [`ALL_SCRIPTS`].
    pub fn notify_cache_cleared(&self) {
        self.emit_script_event(ALL_SCRIPTS, ScriptEventKind::CacheCleared);
    }

    pub fn notify_cache_error(&self, script_id: &str, message: &str) {
        self.emit_script_event(
            script_id,
            ScriptEventKind::CacheError {
                message: message.to_string(),
            },
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventsConfig::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}
