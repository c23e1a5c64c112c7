//! ==============================================================================
//! relay.rs - device-scoped real-time fan-out
//! ==============================================================================
//!
//! purpose:
//!     when one viewer changes an actuator, every other viewer of the same
//!     enclosure should see it without waiting for their next poll.
//!
//!     - clients join the room of one device; membership is checked against
//!       the registry on join and again on every fan-out
//!     - a frame is forwarded to everyone in the room except its sender
//!     - delivery is best-effort, at-most-once, unacknowledged. a full or
//!       closed client queue just drops the frame
//!     - nothing here is durable. the rest write is the source of truth
//!
//! relationships:
//!     - used by: server.rs (GET /relay upgrade)
//!     - uses: registry.rs (membership), domain.rs (RelayFrame)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{self, RelayFrame};
use crate::error::{SyncError, SyncResult};
use crate::registry::DeviceRegistry;

const CLIENT_QUEUE: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(25);

pub type ClientId = u64;

struct RoomMember {
    user_id: String,
    tx: mpsc::Sender<RelayFrame>,
}

/// a client's seat in one device room
pub struct RelaySession {
    pub client_id: ClientId,
    pub device_id: String,
    pub user_id: String,
    pub rx: mpsc::Receiver<RelayFrame>,
}

pub struct RelayHub {
    rooms: RwLock<HashMap<String, HashMap<ClientId, RoomMember>>>,
    registry: Arc<DeviceRegistry>,
    next_id: AtomicU64,
}

impl RelayHub {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            registry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn join(&self, device_id: &str, user_id: &str) -> SyncResult<RelaySession> {
        self.registry.check_member(device_id, user_id)?;

        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        self.rooms
            .write()
            .map_err(|_| SyncError::Persistence("relay rooms lock poisoned".into()))?
            .entry(device_id.to_string())
            .or_default()
            .insert(client_id, RoomMember { user_id: user_id.to_string(), tx });

        info!(client_id, device_id, user_id, "relay client joined");
        Ok(RelaySession {
            client_id,
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            rx,
        })
    }

    pub fn leave(&self, device_id: &str, client_id: ClientId) {
        if let Ok(mut rooms) = self.rooms.write() {
            if let Some(room) = rooms.get_mut(device_id) {
                room.remove(&client_id);
                if room.is_empty() {
                    rooms.remove(device_id);
                }
            }
        }
        info!(client_id, device_id, "relay client left");
    }

    /// drop a device's room; member sockets see their queue close
    pub fn close_room(&self, device_id: &str) {
        if let Ok(mut rooms) = self.rooms.write() {
            rooms.remove(device_id);
        }
    }

    pub fn room_size(&self, device_id: &str) -> usize {
        self.rooms
            .read()
            .map(|r| r.get(device_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// forward `frame` to the rest of the room; returns how many clients
    /// accepted it into their queue
    pub fn publish(&self, device_id: &str, origin: ClientId, frame: RelayFrame) -> usize {
        if domain::device_of(&frame.event) != device_id {
            warn!(client_id = origin, device_id, event = %frame.event, "dropping cross-device relay event");
            return 0;
        }

        let rooms = match self.rooms.read() {
            Ok(rooms) => rooms,
            Err(_) => return 0,
        };
        let Some(room) = rooms.get(device_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (client_id, member) in room.iter().filter(|(id, _)| **id != origin) {
            if self.registry.check_member(device_id, &member.user_id).is_err() {
                continue;
            }
            match member.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(client_id, error = %e, "relay frame dropped"),
            }
        }
        debug!(device_id, event = %frame.event, delivered, "relay fan-out");
        delivered
    }
}

/// pump one upgraded socket until either side goes away
pub async fn serve_socket(hub: Arc<RelayHub>, socket: WebSocket, mut session: RelaySession) {
    let client_id = session.client_id;
    let device_id = session.device_id.clone();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(frame) => {
                                hub.publish(&device_id, client_id, frame);
                            }
                            Err(e) => debug!(client_id, error = %e, "ignoring malformed relay frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "relay socket error");
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = session.rx.recv() => {
                let Some(frame) = outgoing else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client_id, error = %e, "failed to encode relay frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.leave(&device_id, client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceEntry;
    use serde_json::json;

    fn hub() -> RelayHub {
        let registry = DeviceRegistry::new(&[
            DeviceEntry { id: "dev1".into(), members: vec!["alice".into(), "bob".into(), "carol".into()] },
            DeviceEntry { id: "dev2".into(), members: vec!["dave".into()] },
        ]);
        RelayHub::new(Arc::new(registry))
    }

    fn fan_frame(value: bool) -> RelayFrame {
        RelayFrame { event: "dev1:drawer1:fan".into(), data: json!(value) }
    }

    #[test]
    fn test_join_fails_when_rooms_are_poisoned() {
        let hub = Arc::new(hub());
        let holder = hub.clone();
        let _ = std::thread::spawn(move || {
            let _rooms = holder.rooms.write().unwrap();
            panic!("poison the rooms lock");
        })
        .join();

        assert!(matches!(hub.join("dev1", "alice"), Err(SyncError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_fan_out_excludes_originator() {
        let hub = hub();
        let mut a = hub.join("dev1", "alice").unwrap();
        let mut b = hub.join("dev1", "bob").unwrap();
        let mut c = hub.join("dev1", "carol").unwrap();

        assert_eq!(hub.publish("dev1", a.client_id, fan_frame(true)), 2);
        assert_eq!(b.rx.recv().await.unwrap(), fan_frame(true));
        assert_eq!(c.rx.recv().await.unwrap(), fan_frame(true));
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_is_scoped_to_device_room() {
        let hub = hub();
        let a = hub.join("dev1", "alice").unwrap();
        let mut d = hub.join("dev2", "dave").unwrap();

        hub.publish("dev1", a.client_id, fan_frame(true));
        assert!(d.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cross_device_event_is_dropped() {
        let hub = hub();
        let mut a = hub.join("dev1", "alice").unwrap();
        let d = hub.join("dev2", "dave").unwrap();

        // dave is in dev2's room and names a dev1 actuator
        assert_eq!(hub.publish("dev2", d.client_id, fan_frame(true)), 0);
        assert!(a.rx.try_recv().is_err());
    }

    #[test]
    fn test_join_requires_membership() {
        let hub = hub();
        assert!(hub.join("dev1", "dave").is_err());
        assert!(hub.join("nope", "alice").is_err());
    }

    #[test]
    fn test_leave_empties_room() {
        let hub = hub();
        let a = hub.join("dev1", "alice").unwrap();
        assert_eq!(hub.room_size("dev1"), 1);
        hub.leave("dev1", a.client_id);
        assert_eq!(hub.room_size("dev1"), 0);
    }

    #[tokio::test]
    async fn test_revoked_member_stops_receiving() {
        let registry = Arc::new(DeviceRegistry::new(&[DeviceEntry {
            id: "dev1".into(),
            members: vec!["alice".into()],
        }]));
        let hub = RelayHub::new(registry.clone());
        let a = hub.join("dev1", "alice").unwrap();
        registry.register("dev1", ["bob".to_string()]);
        let mut b = hub.join("dev1", "bob").unwrap();

        registry.remove("dev1");
        assert_eq!(hub.publish("dev1", a.client_id, fan_frame(false)), 0);
        assert!(b.rx.try_recv().is_err());
    }
}
