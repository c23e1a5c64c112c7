//! end-to-end: a real hub on a loopback port, driven over http and websocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use enclosure_sync::agent::{AgentConfig, SyncAgent};
use enclosure_sync::cache::{Connectivity, OfflineCache};
use enclosure_sync::clock;
use enclosure_sync::config::HostConfig;
use enclosure_sync::server::{self, HubState};
use enclosure_sync::store::StateStore;
use enclosure_sync::SyncError;

const HOST_TOML: &str = r#"
[[devices]]
id = "dev1"
members = ["alice", "bob", "carol"]

[[devices]]
id = "dev2"
members = ["dave"]

[[tokens]]
token = "tok-alice"
user_id = "alice"

[[tokens]]
token = "tok-bob"
user_id = "bob"

[[tokens]]
token = "tok-carol"
user_id = "carol"

[[tokens]]
token = "tok-dave"
user_id = "dave"
"#;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_hub() -> String {
    let config = HostConfig::parse(HOST_TOML).unwrap();
    let clock = clock::system();
    let store = Arc::new(StateStore::new(clock.clone()));
    let state = HubState::from_config(store, &config, clock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state));
    format!("http://{}", addr)
}

async fn post_state(hub: &str, id: &str, body: Value, token: Option<&str>) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("{}/actuators/{}", hub, id))
        .json(&body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.unwrap()
}

async fn get_json(url: String) -> (StatusCode, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

async fn connect_relay(hub: &str, device: &str, token: &str) -> Result<Socket, tungstenite::Error> {
    let url = format!("{}/relay?device={}", hub.replacen("http", "ws", 1), device);
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
    tokio_tungstenite::connect_async(request).await.map(|(socket, _)| socket)
}

/// next text frame, skipping control frames; None if nothing arrives in time
async fn next_frame(socket: &mut Socket, wait: Duration) -> Option<Value> {
    tokio::time::timeout(wait, async {
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// ==============================================================================
// rest
// ==============================================================================

#[tokio::test]
async fn test_write_read_and_poll() {
    let hub = spawn_hub().await;

    let (status, body) = get_json(format!("{}/actuators/dev1:drawer1:fan", hub)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], Value::Null);

    let response = post_state(&hub, "dev1:drawer1:fan", json!({ "state": true }), Some("tok-alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let written: Value = response.json().await.unwrap();
    let updated_at = written["updatedAt"].as_u64().unwrap();
    assert_eq!(written["state"], json!(true));

    let (_, body) = get_json(format!("{}/actuators/dev1:drawer1:fan", hub)).await;
    assert_eq!(body["state"], json!(true));

    let (_, all) = get_json(format!("{}/actuators", hub)).await;
    assert_eq!(all["dev1:drawer1:fan"], json!(true));

    let (_, delta) = get_json(format!("{}/actuators/poll/since/0", hub)).await;
    assert_eq!(delta["states"]["dev1:drawer1:fan"], json!(true));
    assert_eq!(delta["updatedAt"]["dev1:drawer1:fan"], json!(updated_at));
    assert!(delta["serverTime"].as_u64().unwrap() >= updated_at);

    let (_, delta) = get_json(format!("{}/actuators/poll/since/{}", hub, updated_at)).await;
    assert_eq!(delta["states"], json!({}));
}

#[tokio::test]
async fn test_rejections_map_to_status_codes() {
    let hub = spawn_hub().await;
    let fan = "dev1:drawer1:fan";

    let cases = [
        (fan, json!({ "state": true }), None, StatusCode::UNAUTHORIZED),
        (fan, json!({ "state": true }), Some("tok-unknown"), StatusCode::UNAUTHORIZED),
        (fan, json!({ "state": true }), Some("tok-dave"), StatusCode::FORBIDDEN),
        ("dev9:drawer1:fan", json!({ "state": true }), Some("tok-alice"), StatusCode::NOT_FOUND),
        ("nocolon", json!({ "state": true }), Some("tok-alice"), StatusCode::BAD_REQUEST),
        (fan, json!({ "state": 42 }), Some("tok-alice"), StatusCode::BAD_REQUEST),
        (fan, json!({}), Some("tok-alice"), StatusCode::BAD_REQUEST),
    ];
    for (id, body, token, expected) in cases {
        let response = post_state(&hub, id, body.clone(), token).await;
        assert_eq!(response.status(), expected, "{} {} {:?}", id, body, token);
        let error: Value = response.json().await.unwrap();
        assert!(error["error"].is_string());
    }

    let (status, _) = get_json(format!("{}/actuators/poll/since/yesterday", hub)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // nothing above may have leaked into the store
    let (_, all) = get_json(format!("{}/actuators", hub)).await;
    assert_eq!(all, json!({}));
}

// ==============================================================================
// presence + device removal
// ==============================================================================

#[tokio::test]
async fn test_heartbeat_and_presence() {
    let hub = spawn_hub().await;
    let client = reqwest::Client::new();

    let (status, record) = get_json(format!("{}/devices/dev1/presence", hub)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "unregistered");
    assert_eq!(record["lastSeen"], Value::Null);

    let response = client.post(format!("{}/devices/dev1/heartbeat", hub)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let beat: Value = response.json().await.unwrap();
    assert_eq!(beat["status"], "online");

    let (_, record) = get_json(format!("{}/devices/dev1/presence", hub)).await;
    assert_eq!(record["status"], "online");
    assert_eq!(record["lastSeen"], beat["lastSeen"]);

    let response = client.post(format!("{}/devices/dev9/heartbeat", hub)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_device_removal_cascades() {
    let hub = spawn_hub().await;
    let client = reqwest::Client::new();

    for id in ["dev2:drawer1:fan", "dev2:lifecycle"] {
        let response = post_state(&hub, id, json!({ "state": {} }), Some("tok-dave")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    post_state(&hub, "dev1:drawer1:fan", json!({ "state": false }), Some("tok-bob")).await;

    let response = client
        .delete(format!("{}/devices/dev2", hub))
        .bearer_auth("tok-alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .delete(format!("{}/devices/dev2", hub))
        .bearer_auth("tok-dave")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let removed: Value = response.json().await.unwrap();
    assert_eq!(removed["removedActuators"], 2);

    let (_, all) = get_json(format!("{}/actuators", hub)).await;
    assert_eq!(all, json!({ "dev1:drawer1:fan": false }));

    let (status, _) = get_json(format!("{}/devices/dev2/presence", hub)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ==============================================================================
// relay
// ==============================================================================

#[tokio::test]
async fn test_relay_fans_out_to_other_members_only() {
    let hub = spawn_hub().await;
    let mut alice = connect_relay(&hub, "dev1", "tok-alice").await.unwrap();
    let mut bob = connect_relay(&hub, "dev1", "tok-bob").await.unwrap();
    let mut carol = connect_relay(&hub, "dev1", "tok-carol").await.unwrap();
    let mut dave = connect_relay(&hub, "dev2", "tok-dave").await.unwrap();

    let frame = json!({ "event": "dev1:drawer1:fan", "data": true });
    alice.send(Message::Text(frame.to_string())).await.unwrap();

    let wait = Duration::from_secs(2);
    assert_eq!(next_frame(&mut bob, wait).await, Some(frame.clone()));
    assert_eq!(next_frame(&mut carol, wait).await, Some(frame));

    let quiet = Duration::from_millis(300);
    assert_eq!(next_frame(&mut alice, quiet).await, None);
    assert_eq!(next_frame(&mut dave, quiet).await, None);
}

#[tokio::test]
async fn test_relay_requires_membership() {
    let hub = spawn_hub().await;

    match connect_relay(&hub, "dev1", "tok-dave").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected a 403 handshake, got {:?}", other.map(|_| ())),
    }
    match connect_relay(&hub, "dev1", "tok-nobody").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected a 401 handshake, got {:?}", other.map(|_| ())),
    }
}

// ==============================================================================
// agent against a live hub
// ==============================================================================

fn agent_for(hub: &str, token: &'static str) -> SyncAgent {
    agent_with_poll(hub, token, Duration::from_millis(100))
}

fn agent_with_poll(hub: &str, token: &'static str, poll_interval: Duration) -> SyncAgent {
    let clock = clock::system();
    let config = AgentConfig {
        hub_url: hub.to_string(),
        device_id: "dev1".into(),
        poll_interval,
        echo_window_ms: 3_000,
        request_timeout: Duration::from_secs(2),
    };
    let cache = Arc::new(OfflineCache::new(token, 60_000, clock.clone()));
    let agent = SyncAgent::connect(config, cache, Arc::new(Connectivity::default()), clock).unwrap();
    agent.set_token_getter(move || async move { Ok::<_, SyncError>(token.to_string()) });
    agent
}

#[tokio::test]
async fn test_agents_converge_through_the_hub() {
    let hub = spawn_hub().await;
    let writer = agent_for(&hub, "tok-alice");
    let reader = agent_for(&hub, "tok-bob");

    let updated_at = writer.emit("dev1:drawer2:light", json!({ "on": true })).await.unwrap();
    assert!(updated_at > 0);

    assert_eq!(reader.poll_once().await.unwrap(), 1);
    assert_eq!(reader.local_state("dev1:drawer2:light"), Some(json!({ "on": true })));
    assert!(reader.poll_cursor() >= updated_at);

    // a rejected write is reverted locally
    let outsider = agent_for(&hub, "tok-dave");
    assert!(outsider.emit("dev1:drawer2:light", json!({ "on": false })).await.is_err());
    assert_eq!(outsider.local_state("dev1:drawer2:light"), None);

    let states = reader.get_all_states().await.unwrap();
    assert_eq!(states.get("dev1:drawer2:light"), Some(&json!({ "on": true })));
}

fn started_agent(hub: &str, token: &'static str) -> SyncAgent {
    // a long poll interval leaves the relay as the only way in after the first poll
    let agent = agent_with_poll(hub, token, Duration::from_secs(60));
    agent.start().unwrap();
    agent
}

async fn wait_for_first_poll(agent: &SyncAgent) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while agent.poll_cursor() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("initial poll never completed");
}

#[tokio::test]
async fn test_started_agents_push_through_the_relay() {
    let hub = spawn_hub().await;
    let alice = started_agent(&hub, "tok-alice");
    let bob = started_agent(&hub, "tok-bob");
    wait_for_first_poll(&alice).await;
    wait_for_first_poll(&bob).await;

    let fan = "dev1:drawer1:fan";
    let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
    bob.on(fan, move |value| {
        let _ = tx.send(value.clone());
    });

    // the relay links come up in the background; keep writing until one lands
    let mut delivered = None;
    for attempt in 0..40 {
        alice.emit(fan, json!({ "speed": attempt })).await.unwrap();
        if let Ok(Some(value)) = tokio::time::timeout(Duration::from_millis(250), seen.recv()).await {
            delivered = Some(value);
            break;
        }
    }
    let delivered = delivered.expect("bob never heard alice through the relay");
    assert!(delivered["speed"].is_u64());
    assert_eq!(bob.local_state(fan), Some(delivered));

    // bob's own write opens an echo window that a push from alice cannot break
    let light = "dev1:drawer2:light";
    bob.emit(light, json!("bob")).await.unwrap();
    let (tx, mut light_seen) = tokio::sync::mpsc::unbounded_channel();
    bob.on(light, move |value| {
        let _ = tx.send(value.clone());
    });
    alice.emit(light, json!("alice")).await.unwrap();

    let late = tokio::time::timeout(Duration::from_millis(500), light_seen.recv()).await;
    assert!(late.is_err(), "push inside the echo window reached bob: {:?}", late);
    assert_eq!(bob.local_state(light), Some(json!("bob")));

    alice.dispose();
    bob.dispose();
}
