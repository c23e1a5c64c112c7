//! ==============================================================================
//! domain.rs - shared actuator types and wire shapes
//! ==============================================================================
//!
//! purpose:
//!     the vocabulary both sides of the sync channel agree on: composite
//!     actuator ids, state payload rules, the structured lifecycle payload,
//!     and the json bodies that travel over rest and the relay.
//!
//! relationships:
//!     - used by: store.rs, server.rs, relay.rs (hub side)
//!     - used by: agent/ (client side)
//!
//! ==============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// id suffix of the per-device composite lifecycle key
pub const LIFECYCLE_KEY: &str = "lifecycle";

// ==============================================================================
// actuator ids
// ==============================================================================

/// where an actuator id points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorTarget {
    /// `device:drawer:actuator`
    Drawer { drawer: String, actuator: String },
    /// `device:lifecycle`
    Lifecycle,
}

/// a parsed composite actuator id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorAddress {
    pub device_id: String,
    pub target: ActuatorTarget,
}

impl ActuatorAddress {
    pub fn parse(id: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = id.split(':').collect();
        if parts.iter().any(|p| p.is_empty() || p.chars().any(char::is_whitespace)) {
            return Err(SyncError::InvalidActuatorId(id.to_string()));
        }
        match parts.as_slice() {
            [device, key] if *key == LIFECYCLE_KEY => Ok(Self {
                device_id: device.to_string(),
                target: ActuatorTarget::Lifecycle,
            }),
            [device, drawer, actuator] => Ok(Self {
                device_id: device.to_string(),
                target: ActuatorTarget::Drawer {
                    drawer: drawer.to_string(),
                    actuator: actuator.to_string(),
                },
            }),
            _ => Err(SyncError::InvalidActuatorId(id.to_string())),
        }
    }
}

/// the device segment of an actuator id, without full validation
pub fn device_of(actuator_id: &str) -> &str {
    actuator_id.split(':').next().unwrap_or_default()
}

pub fn lifecycle_key(device_id: &str) -> String {
    format!("{}:{}", device_id, LIFECYCLE_KEY)
}

/// only booleans and structured values (objects, arrays) are actuator state
pub fn validate_state(state: &Value) -> SyncResult<()> {
    match state {
        Value::Bool(_) | Value::Object(_) | Value::Array(_) => Ok(()),
        Value::Null => Err(SyncError::InvalidState("state is required".into())),
        other => Err(SyncError::InvalidState(format!(
            "expected boolean or structured value, got {}",
            other
        ))),
    }
}

// ==============================================================================
// stored record
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorRecord {
    pub state: Value,
    pub updated_at: u64,
}

// ==============================================================================
// lifecycle payload
// ==============================================================================

/// a running grow-stage timer inside one drawer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTimer {
    pub start_time: u64,
    pub duration: u64,
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawerLifecycle {
    #[serde(default)]
    pub active_timer: Option<ActiveTimer>,
    #[serde(default)]
    pub selected_stage: Option<String>,
}

/// drawer id -> lifecycle, synced as one `device:lifecycle` key
pub type LifecycleState = BTreeMap<String, DrawerLifecycle>;

// ==============================================================================
// wire shapes
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorResponse {
    pub actuator_id: String,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateRequest {
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStateResponse {
    pub actuator_id: String,
    pub state: Value,
    pub updated_at: u64,
}

/// delta poll result; `updated_at` carries the per-key stamps so clients can
/// merge monotonically
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub states: BTreeMap<String, Value>,
    #[serde(default)]
    pub updated_at: BTreeMap<String, u64>,
    pub server_time: u64,
}

/// one relay push: event name is the actuator id, data is the raw state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    pub data: Value,
}
