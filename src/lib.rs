//! ==============================================================================
//! enclosure-sync - shared actuator state for smart grow enclosures
//! ==============================================================================
//!
//! purpose:
//!     keeps every viewer of an enclosure (phone, tablet, the on-device
//!     screen) looking at the same actuator state.
//!
//!     - hub side: rest store with delta polling, room-scoped websocket relay,
//!       heartbeat-driven device presence
//!     - client side: `SyncAgent`, which applies edits optimistically, pushes
//!       them through the relay, and reconciles by polling
//!
//! layout:
//!
//!     ┌────────────────────────── hub ──────────────────────────┐
//!     │  server.rs ── store.rs      relay.rs      presence.rs    │
//!     │       │          (rest)      (push)       (heartbeats)   │
//!     │       └── registry.rs (tokens, device membership)        │
//!     └────────────────────────────▲─────────────────────────────┘
//!                                  │ http + ws
//!     ┌──────────────────────── agent/ ─────────────────────────┐
//!     │  transport.rs   relay_link.rs   echo.rs   write.rs       │
//!     │  cache.rs (offline ttl cache, connectivity flag)         │
//!     └──────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

pub mod agent;
pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;

pub use agent::{AgentConfig, SyncAgent};
pub use error::{SyncError, SyncResult};
pub use server::HubState;
