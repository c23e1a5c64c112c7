//! ==============================================================================
//! relay_link.rs - the agent's push channel
//! ==============================================================================
//!
//! purpose:
//!     keeps one websocket to the hub's `/relay` room for the session's
//!     device, reconnecting with backoff until cancelled.
//!
//!     - outgoing frames are queued on an mpsc channel. frames queued while
//!       the socket is down are dropped, not replayed: a stale push could
//!       overwrite a fresher edit, and polling heals the gap anyway
//!     - incoming frames are handed to a callback
//!     - the bearer token is fetched fresh for every connection attempt
//!
//! ==============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::RelayFrame;
use crate::error::{SyncError, SyncResult};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub type FrameHandler = Arc<dyn Fn(RelayFrame) + Send + Sync>;

/// `http(s)://hub/` -> `ws(s)://hub/relay?device=<id>`
pub fn relay_url(hub_url: &str, device_id: &str) -> SyncResult<Url> {
    let mut url = Url::parse(hub_url)
        .map_err(|e| SyncError::InvalidRequest(format!("bad hub url {:?}: {}", hub_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidRequest(format!("unsupported hub scheme {:?}", other)))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidRequest("cannot switch hub url to websocket".into()))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidRequest("hub url cannot take a path".into()))?
        .pop_if_empty()
        .push("relay");
    url.query_pairs_mut().clear().append_pair("device", device_id);
    Ok(url)
}

fn map_ws_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) => SyncError::from_status(
            response.status().as_u16(),
            "relay handshake rejected".to_string(),
        ),
        other => SyncError::Network(other.to_string()),
    }
}

/// supervise the relay connection until `cancel` fires
pub async fn run<F, Fut>(
    url: Url,
    get_token: F,
    mut outgoing: mpsc::Receiver<RelayFrame>,
    on_frame: FrameHandler,
    cancel: CancellationToken,
) where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<String>> + Send,
{
    let mut delay = RECONNECT_BASE_DELAY;

    loop {
        // drop anything queued while we were down
        while outgoing.try_recv().is_ok() {}

        let attempt = async {
            let token = get_token().await?;
            connect_and_pump(&url, &token, &mut outgoing, &on_frame, &cancel).await
        };

        match attempt.await {
            Ok(()) => delay = RECONNECT_BASE_DELAY,
            Err(e @ SyncError::PermissionDenied(_)) | Err(e @ SyncError::NotFound(_)) => {
                warn!(error = %e, "relay access refused, giving up");
                return;
            }
            Err(e) => warn!(error = %e, "relay connection lost"),
        }

        if cancel.is_cancelled() {
            return;
        }
        debug!(delay_secs = delay.as_secs(), "relay reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

async fn connect_and_pump(
    url: &Url,
    token: &str,
    outgoing: &mut mpsc::Receiver<RelayFrame>,
    on_frame: &FrameHandler,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    let mut request = url.as_str().into_client_request().map_err(map_ws_error)?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| SyncError::Unauthenticated("token is not a valid header value".into()))?;
    request.headers_mut().insert("Authorization", bearer);

    let (stream, _) = connect_async(request).await.map_err(map_ws_error)?;
    info!(url = %url, "relay connected");
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                let text = serde_json::to_string(&frame)
                    .map_err(|e| SyncError::InvalidState(e.to_string()))?;
                write.send(Message::Text(text)).await.map_err(map_ws_error)?;
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => on_frame(frame),
                        Err(e) => debug!(error = %e, "ignoring malformed relay frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(SyncError::Network("relay closed the connection".into()))
                    }
                    Some(Err(e)) => return Err(map_ws_error(e)),
                    _ => {}
                }
            }
        }
    }
}
