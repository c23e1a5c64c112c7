//! ==============================================================================
//! registry.rs - identity and device membership boundary
//! ==============================================================================
//!
//! purpose:
//!     the hub does not issue tokens or run registration workflows. it only
//!     needs two answers from those systems:
//!     - who does this bearer token belong to? (`Authenticator`)
//!     - is this device known, and is that user one of its owners?
//!       (`DeviceRegistry`)
//!
//!     the shipped implementations are seeded from host.toml.
//!
//! ==============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use axum::http::HeaderMap;

use crate::config::{DeviceEntry, TokenEntry};
use crate::error::{SyncError, SyncResult};

/// resolves a bearer token to a user id
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> SyncResult<String>;
}

/// fixed token table standing in for the identity provider
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(entries: &[TokenEntry]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|t| (t.token.clone(), t.user_id.clone()))
                .collect(),
        }
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> SyncResult<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| SyncError::Unauthenticated("unknown or expired token".into()))
    }
}

/// pull the token out of `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> SyncResult<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SyncError::Unauthenticated("missing authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SyncError::Unauthenticated("expected a bearer token".into()))
}

/// known devices and their owners
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new(entries: &[DeviceEntry]) -> Self {
        let registry = Self::default();
        for entry in entries {
            registry.register(&entry.id, entry.members.iter().cloned());
        }
        registry
    }

    pub fn register(&self, device_id: &str, members: impl IntoIterator<Item = String>) {
        if let Ok(mut devices) = self.devices.write() {
            devices.entry(device_id.to_string()).or_default().extend(members);
        }
    }

    pub fn remove(&self, device_id: &str) -> bool {
        self.devices
            .write()
            .map(|mut d| d.remove(device_id).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .map(|d| d.contains_key(device_id))
            .unwrap_or(false)
    }

    /// unknown devices answer `NotFound`, known devices without this user
    /// answer `PermissionDenied`
    pub fn check_member(&self, device_id: &str, user_id: &str) -> SyncResult<()> {
        let devices = self
            .devices
            .read()
            .map_err(|_| SyncError::Persistence("device registry poisoned".into()))?;
        match devices.get(device_id) {
            None => Err(SyncError::NotFound(format!("device {}", device_id))),
            Some(members) if members.contains(user_id) => Ok(()),
            Some(_) => Err(SyncError::PermissionDenied(format!(
                "{} is not a member of {}",
                user_id, device_id
            ))),
        }
    }
}
