//! error taxonomy shared by the hub and the sync agent.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid actuator id: {0}")]
    InvalidActuatorId(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("offline")]
    Offline,

    #[error("request timed out")]
    Timeout,

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn status(&self) -> StatusCode {
        match self {
            SyncError::InvalidActuatorId(_)
            | SyncError::InvalidState(_)
            | SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            SyncError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            SyncError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SyncError::WriteFailed(_) | SyncError::Network(_) | SyncError::Offline => {
                StatusCode::BAD_GATEWAY
            }
            SyncError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// failures the client recovers from by falling back to last known good
    /// state and waiting for the next poll
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Offline | SyncError::Timeout
        )
    }

    /// map a non-success status returned by the hub back into the taxonomy
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => SyncError::InvalidRequest(message),
            401 => SyncError::Unauthenticated(message),
            403 => SyncError::PermissionDenied(message),
            404 => SyncError::NotFound(message),
            500 => SyncError::Persistence(message),
            _ => SyncError::Network(format!("hub returned {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status();
        // storage details stay in the server log
        let message = match &self {
            SyncError::Persistence(detail) => {
                tracing::error!(error = %detail, "persistence failure");
                "storage unavailable, try again later".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_map_to_400() {
        assert_eq!(SyncError::InvalidState("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(SyncError::InvalidRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(SyncError::InvalidActuatorId("x".into()).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_round_trip_for_hub_errors() {
        assert!(matches!(SyncError::from_status(401, String::new()), SyncError::Unauthenticated(_)));
        assert!(matches!(SyncError::from_status(403, String::new()), SyncError::PermissionDenied(_)));
        assert!(matches!(SyncError::from_status(503, String::new()), SyncError::Network(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Timeout.is_transient());
        assert!(SyncError::Offline.is_transient());
        assert!(!SyncError::PermissionDenied("no".into()).is_transient());
    }
}
