use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One raw reading of a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub threads: Option<u64>,
    pub open_files: Option<u64>,
}

/// Source of per-process readings. The sampling loop owns one probe per
/// monitored process.
pub trait ProcessProbe: Send + 'static {
    /// `None` when the process no longer exists.
    fn sample(&mut self, pid: u32) -> Option<ProcessSample>;
}

/// Builds a fresh probe for each monitoring session.
pub type ProbeFactory = Arc<dyn Fn() -> Box<dyn ProcessProbe> + Send + Sync>;

pub fn sysinfo_probe_factory() -> ProbeFactory {
    Arc::new(|| Box::new(SysinfoProbe::new()) as Box<dyn ProcessProbe>)
}

/// Probe backed by `sysinfo`. CPU is the time delta between two refreshes
/// scaled to a percentage of one core, so the very first reading is 0.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));
        let process = self.system.process(sys_pid)?;
        Some(ProcessSample {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_bytes: process.memory(),
            threads: proc_entries(pid, "task"),
            open_files: proc_entries(pid, "fd"),
        })
    }
}

#[cfg(target_os = "linux")]
fn proc_entries(pid: u32, dir: &str) -> Option<u64> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/{dir}")).ok()?;
    Some(entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn proc_entries(_pid: u32, _dir: &str) -> Option<u64> {
    None
}

/// A usage sample as recorded in the history. Memory is in MB, CPU in
/// percent; peaks are running maxima since monitoring started.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub current_cpu: f64,
    pub current_memory: f64,
    pub peak_cpu: f64,
    pub peak_memory: f64,
    pub threads: Option<u64>,
    pub open_files: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UsageStats {
    pub cpu: f64,
    pub memory: f64,
}

/// Bounded, shared sample history. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct UsageHistory {
    capacity: usize,
    samples: Arc<Mutex<VecDeque<ResourceUsage>>>,
}

impl UsageHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ResourceUsage>> {
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a reading, evicting the oldest sample when full.
    pub fn record(&self, sample: ProcessSample, timestamp: DateTime<Utc>) -> ResourceUsage {
        let mut samples = self.lock();
        let memory = sample.memory_bytes as f64 / BYTES_PER_MB;
        let (peak_cpu, peak_memory) = samples
            .back()
            .map(|last| (last.peak_cpu, last.peak_memory))
            .unwrap_or((0.0, 0.0));
        let usage = ResourceUsage {
            current_cpu: sample.cpu_percent,
            current_memory: memory,
            peak_cpu: peak_cpu.max(sample.cpu_percent),
            peak_memory: peak_memory.max(memory),
            threads: sample.threads,
            open_files: sample.open_files,
            timestamp,
        };
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(usage);
        usage
    }

    pub fn snapshot(&self) -> Vec<ResourceUsage> {
        self.lock().iter().copied().collect()
    }

    pub fn latest(&self) -> Option<ResourceUsage> {
        self.lock().back().copied()
    }

    pub fn first(&self) -> Option<ResourceUsage> {
        self.lock().front().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn average(&self) -> Option<UsageStats> {
        let samples = self.lock();
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        Some(UsageStats {
            cpu: samples.iter().map(|s| s.current_cpu).sum::<f64>() / n,
            memory: samples.iter().map(|s| s.current_memory).sum::<f64>() / n,
        })
    }

    /// Peaks over the retained window. Running peaks stored on the samples
    /// may be higher if older samples have been evicted.
    pub fn peak(&self) -> Option<UsageStats> {
        let samples = self.lock();
        if samples.is_empty() {
            return None;
        }
        Some(UsageStats {
            cpu: samples.iter().map(|s| s.current_cpu).fold(0.0, f64::max),
            memory: samples.iter().map(|s| s.current_memory).fold(0.0, f64::max),
        })
    }
}

/// Periodic sampler for one process.
///
/// `stop()` cancels the monitor's token. Anything driven by the same
/// execution (the limit-check loop) waits on `stop_token()` and ends with it.
pub struct ResourceMonitor {
    interval: Duration,
    history: UsageHistory,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn new(interval: Duration, capacity: usize) -> Self {
        Self {
            interval,
            history: UsageHistory::new(capacity),
            token: CancellationToken::new(),
            task: None,
        }
    }

    /// Starts sampling `pid` with `probe`. The first sample is taken
    /// immediately. Calling `start` twice is a no-op.
    pub fn start(&mut self, pid: u32, mut probe: Box<dyn ProcessProbe>) {
        if self.task.is_some() || self.token.is_cancelled() {
            return;
        }
        let history = self.history.clone();
        let token = self.token.clone();
        let interval = self.interval;
        debug!("Monitoring pid {pid} every {}ms", interval.as_millis());

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match probe.sample(pid) {
                    Some(sample) => {
                        let usage = history.record(sample, Utc::now());
                        trace!(
                            "pid {pid}: cpu {:.1}% mem {:.1}MB",
                            usage.current_cpu,
                            usage.current_memory
                        );
                    }
                    None => trace!("pid {pid} not found"),
                }
            }
            debug!("Monitor for pid {pid} stopped");
        }));
    }

    /// Stops sampling and waits for the loop to exit. Samples stay readable.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.token.is_cancelled()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn history(&self) -> UsageHistory {
        self.history.clone()
    }

    pub fn get_usage(&self) -> Vec<ResourceUsage> {
        self.history.snapshot()
    }

    pub fn latest(&self) -> Option<ResourceUsage> {
        self.history.latest()
    }

    pub fn get_average_usage(&self) -> Option<UsageStats> {
        self.history.average()
    }

    pub fn get_peak_usage(&self) -> Option<UsageStats> {
        self.history.peak()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that replays a fixed sequence of memory readings (MB), then
    /// repeats the last one.
    pub(crate) struct ScriptedProbe {
        memory_mb: Vec<f64>,
        cpu: f64,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(memory_mb: Vec<f64>, cpu: f64) -> Self {
            Self {
                memory_mb,
                cpu,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn factory(memory_mb: Vec<f64>, cpu: f64) -> ProbeFactory {
            Arc::new(move || {
                Box::new(ScriptedProbe::new(memory_mb.clone(), cpu)) as Box<dyn ProcessProbe>
            })
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn sample(&mut self, _pid: u32) -> Option<ProcessSample> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let mb = self
                .memory_mb
                .get(i)
                .or(self.memory_mb.last())
                .copied()
                .unwrap_or(0.0);
            Some(ProcessSample {
                cpu_percent: self.cpu,
                memory_bytes: (mb * BYTES_PER_MB) as u64,
                threads: Some(1),
                open_files: Some(3),
            })
        }
    }

    fn sample(cpu: f64, mb: f64) -> ProcessSample {
        ProcessSample {
            cpu_percent: cpu,
            memory_bytes: (mb * BYTES_PER_MB) as u64,
            threads: None,
            open_files: None,
        }
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let history = UsageHistory::new(3);
        for i in 0..5 {
            history.record(sample(i as f64, 10.0), Utc::now());
        }
        let cpus: Vec<f64> = history.snapshot().iter().map(|s| s.current_cpu).collect();
        assert_eq!(cpus, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_running_peaks_and_derived_stats() {
        let history = UsageHistory::new(10);
        history.record(sample(10.0, 100.0), Utc::now());
        history.record(sample(50.0, 300.0), Utc::now());
        let last = history.record(sample(30.0, 200.0), Utc::now());

        assert_eq!(last.peak_cpu, 50.0);
        assert_eq!(last.peak_memory, 300.0);
        let avg = history.average().unwrap();
        assert!((avg.cpu - 30.0).abs() < 1e-9);
        assert!((avg.memory - 200.0).abs() < 1e-6);
        assert_eq!(history.peak().unwrap().memory, 300.0);
    }

    #[test]
    fn test_empty_history_has_no_stats() {
        let history = UsageHistory::new(10);
        assert!(history.average().is_none());
        assert!(history.peak().is_none());
        assert!(history.latest().is_none());
    }

    #[tokio::test]
    async fn test_monitor_samples_until_stopped() {
        let mut monitor = ResourceMonitor::new(Duration::from_millis(10), 100);
        monitor.start(1, Box::new(ScriptedProbe::new(vec![64.0], 5.0)));
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stop = monitor.stop_token();
        monitor.stop().await;
        assert!(stop.is_cancelled());
        assert!(!monitor.is_running());

        let taken = monitor.get_usage().len();
        assert!(taken >= 2, "expected several samples, got {taken}");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.get_usage().len(), taken);
        assert_eq!(monitor.get_peak_usage().unwrap().memory, 64.0);
    }

    #[test]
    fn test_sysinfo_probe_reads_own_process() {
        let mut probe = SysinfoProbe::new();
        let reading = probe.sample(std::process::id()).unwrap();
        assert!(reading.memory_bytes > 0);
        assert!(probe.sample(u32::MAX - 1).is_none());
    }
}
