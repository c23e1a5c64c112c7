//! optimistic write lifecycle.
//!
//! a local edit is visible the moment it is issued (`Pending`), then either
//! confirmed by the hub (`Applied`) or undone (`RolledBack`). the transition
//! is driven only by the outcome of the write request.

use serde_json::Value;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Pending,
    Applied { updated_at: u64 },
    RolledBack { reason: String },
}

#[derive(Debug, Clone)]
pub struct OptimisticWrite {
    pub actuator_id: String,
    /// what the key showed before this edit, `None` if it was never set
    pub previous: Option<Value>,
    pub proposed: Value,
    status: WriteStatus,
}

impl OptimisticWrite {
    pub fn begin(actuator_id: impl Into<String>, previous: Option<Value>, proposed: Value) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            previous,
            proposed,
            status: WriteStatus::Pending,
        }
    }

    pub fn status(&self) -> &WriteStatus {
        &self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == WriteStatus::Pending
    }

    /// apply the request outcome; resolved writes ignore later outcomes
    pub fn resolve(&mut self, outcome: Result<u64, &SyncError>) -> &WriteStatus {
        if self.is_pending() {
            self.status = match outcome {
                Ok(updated_at) => WriteStatus::Applied { updated_at },
                Err(e) => WriteStatus::RolledBack { reason: e.to_string() },
            };
        }
        &self.status
    }

    /// the value the ui should show for this key right now
    pub fn visible(&self) -> Option<&Value> {
        match self.status {
            WriteStatus::Pending | WriteStatus::Applied { .. } => Some(&self.proposed),
            WriteStatus::RolledBack { .. } => self.previous.as_ref(),
        }
    }
}
