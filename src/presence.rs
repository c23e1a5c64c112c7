//! ==============================================================================
//! presence.rs - device heartbeat state machine
//! ==============================================================================
//!
//! purpose:
//!     infers whether each enclosure is reachable, independent of actuator
//!     traffic.
//!
//!     UNREGISTERED --heartbeat--> ONLINE --sweep (lastSeen too old)--> OFFLINE
//!                                   ^                                    |
//!                                   +------------- heartbeat ------------+
//!
//!     a heartbeat always sets online + lastSeen=now. only the sweep sets
//!     offline. expiry is soft: offline detection lags real silence by up to
//!     sweep interval + timeout.
//!
//! relationships:
//!     - used by: server.rs (heartbeat + presence routes), main.rs (sweeper)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;

pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_OFFLINE_TIMEOUT_MS: u64 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Unregistered,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub device_id: String,
    pub status: PresenceStatus,
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    online: bool,
    last_seen: u64,
}

#[derive(Clone)]
pub struct PresenceTracker {
    devices: Arc<RwLock<HashMap<String, Seen>>>,
    clock: SharedClock,
    timeout_ms: u64,
}

impl PresenceTracker {
    pub fn new(clock: SharedClock, timeout_ms: u64) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            clock,
            timeout_ms,
        }
    }

    /// mark the device online and seen now, from any prior state
    pub async fn heartbeat(&self, device_id: &str) -> PresenceRecord {
        let now = self.clock.now_ms();
        let previous = self
            .devices
            .write()
            .await
            .insert(device_id.to_string(), Seen { online: true, last_seen: now });

        match previous {
            None => info!(device_id, "device came online (first heartbeat)"),
            Some(seen) if !seen.online => info!(device_id, "device back online"),
            Some(_) => debug!(device_id, "heartbeat"),
        }

        PresenceRecord {
            device_id: device_id.to_string(),
            status: PresenceStatus::Online,
            last_seen: Some(now),
        }
    }

    pub async fn status(&self, device_id: &str) -> PresenceRecord {
        let devices = self.devices.read().await;
        match devices.get(device_id) {
            Some(seen) => PresenceRecord {
                device_id: device_id.to_string(),
                status: if seen.online { PresenceStatus::Online } else { PresenceStatus::Offline },
                last_seen: Some(seen.last_seen),
            },
            None => PresenceRecord {
                device_id: device_id.to_string(),
                status: PresenceStatus::Unregistered,
                last_seen: None,
            },
        }
    }

    /// flip every online device whose last heartbeat is at least `timeout`
    /// old; returns the ids that went offline
    pub async fn sweep(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut devices = self.devices.write().await;
        let mut flipped = Vec::new();
        for (id, seen) in devices.iter_mut() {
            if seen.online && now.saturating_sub(seen.last_seen) >= self.timeout_ms {
                seen.online = false;
                flipped.push(id.clone());
            }
        }
        for id in &flipped {
            info!(device_id = %id, "device marked offline (heartbeat timeout)");
        }
        flipped
    }

    pub async fn remove(&self, device_id: &str) -> bool {
        self.devices.write().await.remove(device_id).is_some()
    }
}

/// run `sweep` every `interval` until `cancel` fires
///
/// a sweep that panics or hangs past the interval is abandoned and retried
/// on the next tick; it never takes the process down.
pub fn spawn_sweeper(
    tracker: PresenceTracker,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        warn!("zero presence sweep interval, using the default");
        Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("presence sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let pass = tokio::spawn({
                        let tracker = tracker.clone();
                        async move { tracker.sweep().await }
                    });
                    match tokio::time::timeout(interval, pass).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "presence sweep failed, retrying next tick"),
                        Err(_) => warn!("presence sweep timed out, retrying next tick"),
                    }
                }
            }
        }
    })
}
