//! ==============================================================================
//! store.rs - actuator state store
//! ==============================================================================
//!
//! purpose:
//!     the single source of truth for actuator state. one record per actuator
//!     id, upserted on every accepted write and stamped with a server-side
//!     `updated_at`. serves full snapshots, single keys and delta polls.
//!
//! timestamps:
//!     stamps are strictly increasing, and every stamp issued after a poll is
//!     greater than that poll's `server_time`. a client that always uses the
//!     returned `server_time` as its next cutoff sees every write exactly
//!     once, even when a write lands in the same millisecond as a poll.
//!
//! durability:
//!     optionally mirrored to a json snapshot file, rewritten on every write
//!     (temp file + rename). if the snapshot cannot be written the in-memory
//!     record is rolled back and the write fails with a persistence error.
//!
//! relationships:
//!     - used by: server.rs (rest handlers)
//!     - uses: domain.rs (records, validation), clock.rs
//!
//! ==============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::domain::{self, ActuatorAddress, ActuatorRecord, PollResponse};
use crate::error::{SyncError, SyncResult};

pub struct StateStore {
    records: RwLock<HashMap<String, ActuatorRecord>>,
    /// highest stamp issued or handed out as a poll `server_time`
    high_water: AtomicU64,
    clock: SharedClock,
    snapshot: Option<PathBuf>,
}

impl StateStore {
    /// an in-memory store
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            high_water: AtomicU64::new(0),
            clock,
            snapshot: None,
        }
    }

    /// a store mirrored to `path`, loading whatever snapshot already exists
    pub async fn open(path: impl Into<PathBuf>, clock: SharedClock) -> SyncResult<Self> {
        let path = path.into();
        let records: HashMap<String, ActuatorRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Persistence(format!("corrupt snapshot {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(SyncError::Persistence(format!(
                    "failed to read snapshot {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                SyncError::Persistence(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        let high_water = records.values().map(|r| r.updated_at).max().unwrap_or(0);
        info!(path = %path.display(), records = records.len(), "state snapshot loaded");

        Ok(Self {
            records: RwLock::new(records),
            high_water: AtomicU64::new(high_water),
            clock,
            snapshot: Some(path),
        })
    }

    /// full snapshot, no pagination
    pub async fn get_all(&self) -> BTreeMap<String, Value> {
        let records = self.records.read().await;
        records.iter().map(|(id, r)| (id.clone(), r.state.clone())).collect()
    }

    /// `None` means never written, which is distinct from a stored `false`
    pub async fn get_one(&self, actuator_id: &str) -> Option<Value> {
        self.get_record(actuator_id).await.map(|r| r.state)
    }

    pub async fn get_record(&self, actuator_id: &str) -> Option<ActuatorRecord> {
        self.records.read().await.get(actuator_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// upsert; returns the server-assigned `updated_at`
    pub async fn set_one(&self, actuator_id: &str, state: Value) -> SyncResult<u64> {
        ActuatorAddress::parse(actuator_id)?;
        domain::validate_state(&state)?;

        let mut records = self.records.write().await;
        let updated_at = self.next_stamp();
        let previous = records.insert(
            actuator_id.to_string(),
            ActuatorRecord { state, updated_at },
        );

        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(prev) => records.insert(actuator_id.to_string(), prev),
                None => records.remove(actuator_id),
            };
            return Err(e);
        }

        debug!(actuator_id, updated_at, "actuator state stored");
        Ok(updated_at)
    }

    /// every entry strictly newer than `since`, plus the cutoff to use next
    pub async fn poll_since(&self, since: u64) -> PollResponse {
        let records = self.records.read().await;
        // raised under the read lock so no write can slip between the scan
        // and the returned server_time
        let now = self.clock.now_ms();
        let server_time = self.high_water.fetch_max(now, Ordering::SeqCst).max(now);

        let mut response = PollResponse { server_time, ..Default::default() };
        for (id, record) in records.iter().filter(|(_, r)| r.updated_at > since) {
            response.states.insert(id.clone(), record.state.clone());
            response.updated_at.insert(id.clone(), record.updated_at);
        }
        response
    }

    /// cascading removal of every actuator that belongs to `device_id`
    pub async fn remove_device(&self, device_id: &str) -> SyncResult<usize> {
        let mut records = self.records.write().await;
        let removed: Vec<(String, ActuatorRecord)> = records
            .iter()
            .filter(|(id, _)| domain::device_of(id) == device_id)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        for (id, _) in &removed {
            records.remove(id);
        }

        if let Err(e) = self.persist(&records).await {
            records.extend(removed);
            return Err(e);
        }

        info!(device_id, removed = removed.len(), "device actuators removed");
        Ok(removed.len())
    }

    // only called with the write lock held
    fn next_stamp(&self) -> u64 {
        let now = self.clock.now_ms();
        let stamp = now.max(self.high_water.load(Ordering::SeqCst) + 1);
        self.high_water.store(stamp, Ordering::SeqCst);
        stamp
    }

    async fn persist(&self, records: &HashMap<String, ActuatorRecord>) -> SyncResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let bytes = serde_json::to_vec(records)
            .map_err(|e| SyncError::Persistence(format!("failed to encode snapshot: {}", e)))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::Persistence(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SyncError::Persistence(format!("failed to replace {}: {}", path.display(), e)))?;
        Ok(())
    }
}
