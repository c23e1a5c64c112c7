//! ==============================================================================
//! main.rs - enclosure-sync node entry point
//! ==============================================================================
//!
//! purpose:
//!     one binary, two roles (picked by `[cluster] role` in host.toml):
//!
//!     - hub:     serves the actuator store, the relay and device presence
//!     - viewer:  a headless sync agent that mirrors one enclosure's state,
//!                e.g. the on-device screen or a kiosk
//!
//! relationships:
//!     - reads: config/host.toml (via config.rs)
//!     - uses: server.rs (hub), agent/ (viewer), presence.rs (sweeper)
//!
//! architecture:
//!
//!     ┌──────────────────────────── hub ───────────────────────────┐
//!     │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐  │
//!     │  │ rest + relay │  │ presence sweep│  │ state snapshot   │  │
//!     │  │ (port 3000)  │  │ (30s cycle)   │  │ (optional file)  │  │
//!     │  └──────────────┘  └───────────────┘  └──────────────────┘  │
//!     └──────────────────────────────▲──────────────────────────────┘
//!                                    │ http poll + ws push
//!     ┌────────────────────────── viewer ───────────────────────────┐
//!     │   sync agent ── offline cache ── (optional) heartbeats       │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use enclosure_sync::agent::{AgentConfig, SyncAgent};
use enclosure_sync::cache::{Connectivity, OfflineCache};
use enclosure_sync::clock;
use enclosure_sync::config::{HostConfig, Role};
use enclosure_sync::logging;
use enclosure_sync::presence;
use enclosure_sync::server::{self, HubState};
use enclosure_sync::store::StateStore;
use enclosure_sync::SyncError;

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration, then logging at the configured level;
    // how the config was found is only logged once the subscriber exists
    let (config, source) = HostConfig::load_or_default();
    logging::init_logging(&config.logging.level);
    source.log();
    config.log_summary();

    match config.cluster.role {
        Role::Hub => run_hub(config).await,
        Role::Viewer => run_viewer(config).await,
    }
}

// ==============================================================================
// hub role
// ==============================================================================

async fn run_hub(config: HostConfig) -> Result<()> {
    let clock = clock::system();

    // step 2: open the store, restoring the snapshot if one is configured
    let store = match &config.server.snapshot_path {
        Some(path) => StateStore::open(path, clock.clone())
            .await
            .with_context(|| format!("failed to open snapshot {}", path.display()))?,
        None => StateStore::new(clock.clone()),
    };
    let state = HubState::from_config(Arc::new(store), &config, clock);

    // step 3: presence sweeper
    let shutdown = CancellationToken::new();
    let sweeper = presence::spawn_sweeper(
        state.presence.clone(),
        Duration::from_millis(config.presence.sweep_interval_ms),
        shutdown.clone(),
    );

    // step 4: serve until ctrl-c
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "hub listening");

    tokio::select! {
        result = server::serve(listener, state) => {
            if let Err(e) = &result {
                error!(error = %format!("{:#}", e), "web server error");
            }
            shutdown.cancel();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
        }
    }

    if let Err(e) = sweeper.await {
        warn!(error = %e, "presence sweeper ended abnormally");
    }
    info!("hub stopped");
    Ok(())
}

// ==============================================================================
// viewer role
// ==============================================================================

async fn run_viewer(config: HostConfig) -> Result<()> {
    if config.sync.device_id.is_empty() {
        anyhow::bail!("viewer role needs [sync] device_id");
    }
    let clock = clock::system();

    let cache = match &config.cache.path {
        Some(path) => OfflineCache::open(&config.cache.namespace, config.cache.ttl_ms, clock.clone(), path),
        None => OfflineCache::new(&config.cache.namespace, config.cache.ttl_ms, clock.clone()),
    };
    let connectivity = Arc::new(Connectivity::default());
    let agent = SyncAgent::connect(
        AgentConfig::from(&config.sync),
        Arc::new(cache),
        connectivity,
        clock,
    )?;

    let token = config.sync.token.clone();
    agent.set_token_getter(move || {
        let token = token.clone();
        async move { Ok::<_, SyncError>(token) }
    });

    // step 2: seed from a full snapshot, then follow every key we saw
    match agent.get_all_states().await {
        Ok(states) => {
            info!(keys = states.len(), "initial state loaded");
            for id in states.keys() {
                let key = id.clone();
                agent.on(id, move |value| info!(actuator_id = %key, state = %value, "state changed"));
            }
        }
        Err(e) => warn!(error = %e, "initial snapshot unavailable, waiting for poll"),
    }
    agent.start()?;

    // step 3: heartbeats for viewers running on the enclosure itself
    let heartbeat = config.sync.send_heartbeats.then(|| {
        let agent = agent.clone();
        let interval = Duration::from_millis(config.sync.poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = agent.send_heartbeat().await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        })
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    if let Some(task) = heartbeat {
        task.abort();
    }
    agent.dispose();
    Ok(())
}
