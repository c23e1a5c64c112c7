//! ==============================================================================
//! transport.rs - the agent's pull channel to the hub
//! ==============================================================================
//!
//! purpose:
//!     every network call the agent makes over rest goes through
//!     `SyncTransport`, so the agent logic can be exercised without a hub.
//!     `HttpTransport` is the real implementation on top of reqwest.
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{ActuatorResponse, PollResponse, SetStateResponse};
use crate::error::{SyncError, SyncResult};

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn fetch_all(&self) -> SyncResult<BTreeMap<String, Value>>;
    async fn fetch_one(&self, actuator_id: &str) -> SyncResult<Option<Value>>;
    /// authenticated upsert; returns the hub's `updatedAt`
    async fn write(&self, actuator_id: &str, state: &Value, token: &str) -> SyncResult<u64>;
    async fn poll_since(&self, since: u64) -> SyncResult<PollResponse>;
    async fn heartbeat(&self, device_id: &str) -> SyncResult<()>;
}

pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(hub_url: &str, timeout: Duration) -> SyncResult<Self> {
        let base = Url::parse(hub_url)
            .map_err(|e| SyncError::InvalidRequest(format!("bad hub url {:?}: {}", hub_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidRequest(format!("bad hub url {:?}", hub_url)));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// join path segments onto the hub url, escaping each one
    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidRequest("hub url cannot take a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> SyncResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let message = match response.json::<Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
            .to_string(),
        Err(_) => status.to_string(),
    };
    Err(SyncError::from_status(status.as_u16(), message))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_all(&self) -> SyncResult<BTreeMap<String, Value>> {
        let response = self.client.get(self.url(&["actuators"])?).send().await?;
        decode(response).await
    }

    async fn fetch_one(&self, actuator_id: &str) -> SyncResult<Option<Value>> {
        let response = self
            .client
            .get(self.url(&["actuators", actuator_id])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ActuatorResponse = decode(response).await?;
        Ok(body.state)
    }

    async fn write(&self, actuator_id: &str, state: &Value, token: &str) -> SyncResult<u64> {
        let response = self
            .client
            .post(self.url(&["actuators", actuator_id])?)
            .bearer_auth(token)
            .json(&serde_json::json!({ "state": state }))
            .send()
            .await?;
        let body: SetStateResponse = decode(response).await?;
        Ok(body.updated_at)
    }

    async fn poll_since(&self, since: u64) -> SyncResult<PollResponse> {
        let since = since.to_string();
        let response = self
            .client
            .get(self.url(&["actuators", "poll", "since", &since])?)
            .send()
            .await?;
        decode(response).await
    }

    async fn heartbeat(&self, device_id: &str) -> SyncResult<()> {
        let response = self
            .client
            .post(self.url(&["devices", device_id, "heartbeat"])?)
            .send()
            .await?;
        decode::<Value>(response).await.map(|_| ())
    }
}
