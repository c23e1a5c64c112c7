//! ==============================================================================
//! cache.rs - offline ttl cache + connectivity flag
//! ==============================================================================
//!
//! purpose:
//!     keeps the last successful fetches around so a viewer with no network
//!     (or a flaky one) still renders something.
//!
//!     - entries live under `<namespace>:<key>` and expire after the ttl
//!       (24h). expiry is lazy: a stale entry is evicted by the read that
//!       finds it
//!     - `clear()` drops every entry in the namespace (sign-out)
//!     - optionally mirrored to a json file so entries survive restarts
//!
//! connectivity:
//!     a level-triggered online/offline flag. listeners are called
//!     synchronously on every change, and once with the current value when
//!     they subscribe, so a late subscriber never waits for the next edge.
//!
//! relationships:
//!     - used by: agent/mod.rs (cache fallback, offline short-circuit)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::SharedClock;

pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub timestamp: u64,
}

pub struct OfflineCache {
    namespace: String,
    ttl_ms: u64,
    clock: SharedClock,
    entries: Mutex<HashMap<String, CacheEntry<Value>>>,
    file: Option<CacheFile>,
}

/// on-disk mirror; snapshots are numbered so a slow writer never
/// overwrites a newer one
struct CacheFile {
    path: PathBuf,
    next_seq: AtomicU64,
    written: Arc<Mutex<u64>>,
}

impl OfflineCache {
    pub fn new(namespace: impl Into<String>, ttl_ms: u64, clock: SharedClock) -> Self {
        Self {
            namespace: namespace.into(),
            ttl_ms,
            clock,
            entries: Mutex::new(HashMap::new()),
            file: None,
        }
    }

    /// a cache mirrored to `path`; an unreadable file starts empty
    pub fn open(
        namespace: impl Into<String>,
        ttl_ms: u64,
        clock: SharedClock,
        path: impl Into<PathBuf>,
    ) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "discarding unreadable cache file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            namespace: namespace.into(),
            ttl_ms,
            clock,
            entries: Mutex::new(entries),
            file: Some(CacheFile { path, next_seq: AtomicU64::new(0), written: Arc::new(Mutex::new(0)) }),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "value not cacheable");
                return;
            }
        };
        let key = self.namespaced(key);
        let entry = CacheEntry { key: key.clone(), data, timestamp: self.clock.now_ms() };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, entry);
            self.flush(&entries);
        }
    }

    /// the cached value if it is no older than the ttl
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = self.namespaced(key);
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().ok()?;

        let fresh = match entries.get(&key) {
            None => return None,
            Some(entry) => now.saturating_sub(entry.timestamp) <= self.ttl_ms,
        };
        if !fresh {
            debug!(key = %key, "evicting expired cache entry");
            entries.remove(&key);
            self.flush(&entries);
            return None;
        }

        entries
            .get(&key)
            .and_then(|entry| serde_json::from_value(entry.data.clone()).ok())
    }

    pub fn remove(&self, key: &str) {
        let key = self.namespaced(key);
        if let Ok(mut entries) = self.entries.lock() {
            if entries.remove(&key).is_some() {
                self.flush(&entries);
            }
        }
    }

    /// drop every entry in this namespace
    pub fn clear(&self) {
        let prefix = format!("{}:", self.namespace);
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|k, _| !k.starts_with(&prefix));
            self.flush(&entries);
        }
    }

    /// mirror to disk; inside a runtime the write runs on the blocking pool
    fn flush(&self, entries: &HashMap<String, CacheEntry<Value>>) {
        let Some(file) = &self.file else { return };
        let bytes = match serde_json::to_vec(entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to encode cache file");
                return;
            }
        };
        let seq = file.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let path = file.path.clone();
        let written = file.written.clone();
        let job = move || write_snapshot(&path, &written, seq, &bytes);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

fn write_snapshot(path: &Path, written: &Mutex<u64>, seq: u64, bytes: &[u8]) {
    let Ok(mut last) = written.lock() else { return };
    if *last >= seq {
        return;
    }
    let tmp = path.with_extension("tmp");
    let result = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path));
    match result {
        Ok(()) => *last = seq,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            warn!(path = %path.display(), error = %e, "failed to write cache file");
        }
    }
}

// ==============================================================================
// connectivity
// ==============================================================================

pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

pub struct Connectivity {
    online: AtomicBool,
    listeners: Mutex<Vec<(u64, ConnectivityListener)>>,
    next_id: AtomicU64,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// register a listener; it is called right away with the current value
    pub fn subscribe(&self, listener: ConnectivityListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener.clone()));
        }
        listener(self.is_online());
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }

    /// platform hook: record a connectivity change and notify on edges
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        debug!(online, "connectivity changed");
        // listeners may subscribe/unsubscribe from inside the callback
        let snapshot: Vec<ConnectivityListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(online);
        }
    }
}
