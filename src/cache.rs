/// Content-hash keyed cache of validated manifests.
///
/// An entry stays valid only while both the stored mtime and the SHA-256
/// of the script file match the live file: mtime alone can be stale after
/// a restore, and the hash alone would mean trusting a single signal.
///
/// Persisted as one JSON object (`{script_id: entry}`), rewritten wholesale
/// on every mutation. A missing or corrupt file loads as an empty cache.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, ScriptError};
use crate::manifest::{Manifest, ScriptInfo};

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub script_info: ScriptInfo,
    pub manifest: Manifest,
    /// File mtime in milliseconds since the Unix epoch
    pub last_modified: i64,
    pub hash: String,
}

/// mtime (ms since epoch) and content hash of a file.
fn fingerprint(path: &Path) -> std::io::Result<(i64, String)> {
    let modified = fs::metadata(path)?.modified()?;
    let millis = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    };
    let bytes = fs::read(path)?;
    Ok((millis, content_hash(&bytes)))
}

pub struct ScriptCache {
    path: Option<PathBuf>,
    /// All reads and writes go through this lock, so a read-modify-persist
    /// for one key can never interleave with another.
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ScriptCache {
    /// Opens the cache file at `path`, degrading to an empty cache if the
    /// file is missing or unreadable.
    pub fn open(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&content) {
                Ok(entries) => {
                    info!("Cache loaded from {} ({} entries)", path.display(), entries.len());
                    entries
                }
                Err(e) => {
                    warn!("Cache file {} is corrupt, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cache file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => {
                warn!("Cannot read cache file {}, starting empty: {e}", path.display());
                HashMap::new()
            }
        };
        Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        }
    }

    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A panic while holding the lock cannot leave a half-written entry
        // (inserts are single operations), so a poisoned map is still usable.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, script_id: &str) -> Option<CacheEntry> {
        self.lock().get(script_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stores an entry fingerprinted from the current state of `file_path`.
    /// If the cache file cannot be written the in-memory map is left as it
    /// was.
    pub fn set(
        &self,
        script_id: &str,
        script_info: ScriptInfo,
        manifest: Manifest,
        file_path: &Path,
    ) -> Result<()> {
        let (last_modified, hash) = fingerprint(file_path).map_err(|e| {
            ScriptError::Cache(format!("cannot fingerprint {}: {e}", file_path.display()))
        })?;
        let mut entries = self.lock();
        let previous = entries.insert(
            script_id.to_string(),
            CacheEntry {
                script_info,
                manifest,
                last_modified,
                hash,
            },
        );
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(entry) => entries.insert(script_id.to_string(), entry),
                None => entries.remove(script_id),
            };
            return Err(e);
        }
        debug!("Cached {script_id}");
        Ok(())
    }

    /// Removes an entry. Returns whether one existed.
    pub fn invalidate(&self, script_id: &str) -> Result<bool> {
        let mut entries = self.lock();
        let Some(removed) = entries.remove(script_id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(script_id.to_string(), removed);
            return Err(e);
        }
        debug!("Invalidated cache entry {script_id}");
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.lock();
        self.persist(&HashMap::new())?;
        entries.clear();
        info!("Cache cleared");
        Ok(())
    }

    /// True iff an entry exists and both its mtime and content hash match
    /// the live file. Any I/O failure counts as invalid.
    pub fn is_valid(&self, script_id: &str, file_path: &Path) -> bool {
        let Some(entry) = self.get(script_id) else {
            return false;
        };
        match fingerprint(file_path) {
            Ok((mtime, hash)) => mtime == entry.last_modified && hash == entry.hash,
            Err(e) => {
                debug!("Cache check for {script_id} failed: {e}");
                false
            }
        }
    }

    /// Writes the whole map through a temp file + rename so readers never
    /// observe a partially written cache.
    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ScriptError::Cache(format!("serialize cache: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ScriptError::Cache(e.to_string()))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| ScriptError::Cache(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| ScriptError::Cache(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}
