//! ==============================================================================
//! agent/ - client synchronization agent
//! ==============================================================================
//!
//! purpose:
//!     one `SyncAgent` per signed-in session. every ui consumer of actuator
//!     state shares it by handle (it is `Clone`); nothing here is global.
//!
//!     - `on` / `off`           per-key push listeners
//!     - `emit`                 optimistic write + concurrent relay publish,
//!                              rolled back if the hub does not confirm
//!     - `get_state`            fresh cache entry, else network
//!     - `get_all_states`       one-shot snapshot to seed the ui
//!     - `set_token_getter`     async credential provider, asked per write
//!     - `start` / `dispose`    poll timer + relay link lifetime
//!
//! merge rules:
//!     - incoming pushes and polled values for a key are dropped while the
//!       key is inside its echo window (see echo.rs)
//!     - polled values carry the hub's `updatedAt`; a value is applied only
//!       if it is newer than the last stamp applied for that key
//!     - the poll cursor is always the hub's `serverTime`, never our clock
//!
//! offline policy:
//!     while `Connectivity` says offline, reads come from the cache and no
//!     network call is made. a transient failure while online falls back to
//!     the cache without touching the connectivity flag.
//!
//! relationships:
//!     - uses: transport.rs (rest), relay_link.rs (push), echo.rs, write.rs
//!     - uses: cache.rs (OfflineCache, Connectivity)
//!
//! ==============================================================================

pub mod echo;
pub mod relay_link;
pub mod transport;
pub mod write;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Connectivity, OfflineCache};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::domain::{self, ActuatorAddress, LifecycleState, RelayFrame};
use crate::error::{SyncError, SyncResult};

use self::echo::EchoSuppressor;
use self::transport::{HttpTransport, SyncTransport};
use self::write::{OptimisticWrite, WriteStatus};

const RELAY_QUEUE: usize = 32;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_CACHE_KEY: &str = "actuators";

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ListenerId = u64;
pub type TokenGetter = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub hub_url: String,
    /// the enclosure this session watches; empty means every key
    pub device_id: String,
    pub poll_interval: Duration,
    pub echo_window_ms: u64,
    pub request_timeout: Duration,
}

impl From<&SyncConfig> for AgentConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            hub_url: config.hub_url.clone(),
            device_id: config.device_id.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            echo_window_ms: config.echo_window_ms,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

fn cache_key(actuator_id: &str) -> String {
    format!("actuator:{}", actuator_id)
}

#[derive(Default)]
struct Listeners {
    by_key: HashMap<String, Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    fn for_key(&self, key: &str) -> Vec<Listener> {
        self.by_key
            .get(key)
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

struct LocalView {
    values: HashMap<String, Value>,
    applied_at: HashMap<String, u64>,
    echo: EchoSuppressor,
    cursor: u64,
}

struct AgentInner {
    config: AgentConfig,
    transport: Arc<dyn SyncTransport>,
    cache: Arc<OfflineCache>,
    connectivity: Arc<Connectivity>,
    clock: SharedClock,
    token_getter: RwLock<Option<TokenGetter>>,
    view: Mutex<LocalView>,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
    relay_tx: Mutex<Option<mpsc::Sender<RelayFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// shared handle to one session's sync state
#[derive(Clone)]
pub struct SyncAgent {
    inner: Arc<AgentInner>,
}

impl SyncAgent {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn SyncTransport>,
        cache: Arc<OfflineCache>,
        connectivity: Arc<Connectivity>,
        clock: SharedClock,
    ) -> Self {
        let echo = EchoSuppressor::new(config.echo_window_ms);
        Self {
            inner: Arc::new(AgentInner {
                config,
                transport,
                cache,
                connectivity,
                clock,
                token_getter: RwLock::new(None),
                view: Mutex::new(LocalView {
                    values: HashMap::new(),
                    applied_at: HashMap::new(),
                    echo,
                    cursor: 0,
                }),
                listeners: Mutex::new(Listeners::default()),
                next_listener: AtomicU64::new(1),
                relay_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// an agent talking to a real hub over http
    pub fn connect(
        config: AgentConfig,
        cache: Arc<OfflineCache>,
        connectivity: Arc<Connectivity>,
        clock: SharedClock,
    ) -> SyncResult<Self> {
        let transport = HttpTransport::new(&config.hub_url, config.request_timeout)?;
        Ok(Self::new(config, Arc::new(transport), cache, connectivity, clock))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    // ==========================================================================
    // credentials
    // ==========================================================================

    pub fn set_token_getter<F, Fut>(&self, getter: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<String>> + Send + 'static,
    {
        let boxed: TokenGetter =
            Arc::new(move || -> BoxFuture<'static, SyncResult<String>> { Box::pin(getter()) });
        if let Ok(mut slot) = self.inner.token_getter.write() {
            *slot = Some(boxed);
        }
    }

    async fn token(&self) -> SyncResult<String> {
        self.inner.token().await
    }

    // ==========================================================================
    // listeners
    // ==========================================================================

    pub fn on<F>(&self, actuator_id: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners
                .by_key
                .entry(actuator_id.to_string())
                .or_default()
                .push((id, Arc::new(listener)));
        }
        id
    }

    pub fn off(&self, actuator_id: &str, listener_id: ListenerId) -> bool {
        let Ok(mut listeners) = self.inner.listeners.lock() else {
            return false;
        };
        let Some(entries) = listeners.by_key.get_mut(actuator_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != listener_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.by_key.remove(actuator_id);
        }
        removed
    }

    pub fn listener_count(&self, actuator_id: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .map(|l| l.by_key.get(actuator_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    // ==========================================================================
    // reads
    // ==========================================================================

    /// what this session currently shows for a key
    pub fn local_state(&self, actuator_id: &str) -> Option<Value> {
        self.inner.view.lock().ok()?.values.get(actuator_id).cloned()
    }

    pub fn get_state_cached(&self, actuator_id: &str) -> Option<Value> {
        self.inner.cache.get(&cache_key(actuator_id))
    }

    /// fresh cache entry if there is one, otherwise ask the hub
    pub async fn get_state(&self, actuator_id: &str) -> SyncResult<Option<Value>> {
        if let Some(value) = self.get_state_cached(actuator_id) {
            return Ok(Some(value));
        }
        if !self.inner.connectivity.is_online() {
            return self.local_state(actuator_id).map(Some).ok_or(SyncError::Offline);
        }

        match self
            .inner
            .with_timeout(self.inner.transport.fetch_one(actuator_id))
            .await
        {
            Ok(value) => {
                if let Some(value) = &value {
                    self.inner.cache.set(&cache_key(actuator_id), value);
                }
                Ok(value)
            }
            Err(e) if e.is_transient() => {
                warn!(actuator_id, error = %e, "fetch failed, using last known state");
                self.local_state(actuator_id).map(Some).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// one-shot snapshot used to seed ui state on mount
    pub async fn get_all_states(&self) -> SyncResult<BTreeMap<String, Value>> {
        if !self.inner.connectivity.is_online() {
            return self
                .inner
                .cache
                .get(SNAPSHOT_CACHE_KEY)
                .ok_or(SyncError::Offline);
        }

        match self.inner.with_timeout(self.inner.transport.fetch_all()).await {
            Ok(states) => {
                let states: BTreeMap<String, Value> = states
                    .into_iter()
                    .filter(|(id, _)| self.inner.watches(id))
                    .collect();
                self.inner.cache.set(SNAPSHOT_CACHE_KEY, &states);
                for (id, value) in &states {
                    self.inner.apply_remote(id, value.clone(), None, "snapshot");
                }
                Ok(states)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "snapshot fetch failed, serving cache");
                self.inner.cache.get(SNAPSHOT_CACHE_KEY).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    // ==========================================================================
    // writes
    // ==========================================================================

    /// optimistic write: visible immediately, confirmed or rolled back once
    /// the hub answers. returns the hub's `updatedAt`.
    pub async fn emit(&self, actuator_id: &str, new_state: Value) -> SyncResult<u64> {
        ActuatorAddress::parse(actuator_id)?;
        domain::validate_state(&new_state)?;

        let marked_at = self.inner.clock.now_ms();
        let mut write = {
            let mut view = self
                .inner
                .view
                .lock()
                .map_err(|_| SyncError::WriteFailed("agent state poisoned".into()))?;
            let previous = view.values.insert(actuator_id.to_string(), new_state.clone());
            view.echo.mark(actuator_id, marked_at);
            OptimisticWrite::begin(actuator_id, previous, new_state.clone())
        };
        self.inner.notify(actuator_id, &new_state);

        let outcome = self.send_write(actuator_id, &new_state).await;
        let status = write.resolve(outcome.as_ref().copied()).clone();
        match status {
            WriteStatus::Applied { updated_at } => {
                if let Ok(mut view) = self.inner.view.lock() {
                    let stamp = view.applied_at.entry(actuator_id.to_string()).or_default();
                    *stamp = (*stamp).max(updated_at);
                }
                self.inner.cache.set(&cache_key(actuator_id), &new_state);
                debug!(actuator_id, updated_at, "write confirmed");
                Ok(updated_at)
            }
            WriteStatus::RolledBack { reason } => {
                warn!(actuator_id, error = %reason, "write failed, reverting");
                self.roll_back(&write, marked_at);
                Err(SyncError::WriteFailed(reason))
            }
            WriteStatus::Pending => Err(SyncError::WriteFailed("write left unresolved".into())),
        }
    }

    async fn send_write(&self, actuator_id: &str, state: &Value) -> SyncResult<u64> {
        if !self.inner.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        // the relay publish runs alongside the rest write; it is a latency
        // optimisation only and never fails the write
        self.inner.publish(RelayFrame { event: actuator_id.to_string(), data: state.clone() });

        let token = self.inner.with_timeout(self.token()).await?;
        let first = self
            .inner
            .with_timeout(self.inner.transport.write(actuator_id, state, &token))
            .await;
        match first {
            Err(SyncError::Unauthenticated(reason)) => {
                debug!(actuator_id, reason = %reason, "token rejected, refreshing once");
                let token = self.inner.with_timeout(self.token()).await?;
                self.inner
                    .with_timeout(self.inner.transport.write(actuator_id, state, &token))
                    .await
            }
            other => other,
        }
    }

    fn roll_back(&self, write: &OptimisticWrite, marked_at: u64) {
        let restored = {
            let Ok(mut view) = self.inner.view.lock() else { return };
            // a later emit to the same key keeps its own window
            view.echo.clear_if_marked_at(&write.actuator_id, marked_at);
            // a newer remote value may have landed after the window; keep it
            if view.values.get(&write.actuator_id) != Some(&write.proposed) {
                return;
            }
            match write.visible() {
                Some(previous) => {
                    view.values.insert(write.actuator_id.clone(), previous.clone());
                    previous.clone()
                }
                None => {
                    view.values.remove(&write.actuator_id);
                    Value::Null
                }
            }
        };
        self.inner.notify(&write.actuator_id, &restored);
    }

    // ==========================================================================
    // lifecycle helpers
    // ==========================================================================

    pub fn lifecycle(&self, device_id: &str) -> Option<LifecycleState> {
        self.local_state(&domain::lifecycle_key(device_id))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub async fn emit_lifecycle(&self, device_id: &str, state: &LifecycleState) -> SyncResult<u64> {
        let value = serde_json::to_value(state)
            .map_err(|e| SyncError::InvalidState(e.to_string()))?;
        self.emit(&domain::lifecycle_key(device_id), value).await
    }

    // ==========================================================================
    // reconciliation
    // ==========================================================================

    /// merge a pushed value (no timestamp); false if it was dropped
    pub fn apply_push(&self, actuator_id: &str, value: Value) -> bool {
        self.inner.apply_remote(actuator_id, value, None, "relay")
    }

    /// one delta poll; returns how many keys changed locally
    pub async fn poll_once(&self) -> SyncResult<usize> {
        self.inner.poll_once().await
    }

    pub fn poll_cursor(&self) -> u64 {
        self.inner.view.lock().map(|v| v.cursor).unwrap_or(0)
    }

    /// one heartbeat for the configured device, fire-and-forget semantics
    pub async fn send_heartbeat(&self) -> SyncResult<()> {
        if self.inner.config.device_id.is_empty() || !self.inner.connectivity.is_online() {
            return Ok(());
        }
        self.inner
            .with_timeout(self.inner.transport.heartbeat(&self.inner.config.device_id))
            .await
    }

    // ==========================================================================
    // background tasks
    // ==========================================================================

    /// start the poll timer, and the relay link when a device is configured
    pub fn start(&self) -> SyncResult<()> {
        let mut handles = vec![spawn_poller(
            Arc::downgrade(&self.inner),
            self.inner.config.poll_interval,
            self.inner.cancel.clone(),
        )];

        if !self.inner.config.device_id.is_empty() {
            let url = relay_link::relay_url(&self.inner.config.hub_url, &self.inner.config.device_id)?;
            let (tx, rx) = mpsc::channel(RELAY_QUEUE);
            if let Ok(mut slot) = self.inner.relay_tx.lock() {
                *slot = Some(tx);
            }

            let weak = Arc::downgrade(&self.inner);
            let on_frame: relay_link::FrameHandler = Arc::new(move |frame: RelayFrame| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_remote(&frame.event, frame.data, None, "relay");
                }
            });
            let weak = Arc::downgrade(&self.inner);
            let get_token = move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.token().await,
                        None => Err(SyncError::Unauthenticated("session disposed".into())),
                    }
                }
            };
            let cancel = self.inner.cancel.clone();
            handles.push(tokio::spawn(relay_link::run(url, get_token, rx, on_frame, cancel)));
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.extend(handles);
        }
        info!(device_id = %self.inner.config.device_id, "sync agent started");
        Ok(())
    }

    /// stop background work and drop every listener
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut slot) = self.inner.relay_tx.lock() {
            slot.take();
        }
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.by_key.clear();
        }
        info!("sync agent disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// dispose and forget everything cached for this user
    pub fn sign_out(&self) {
        self.dispose();
        self.inner.cache.clear();
    }
}

impl AgentInner {
    async fn token(&self) -> SyncResult<String> {
        let getter = self
            .token_getter
            .read()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| SyncError::Unauthenticated("no token getter configured".into()))?;
        getter().await
    }

    fn watches(&self, actuator_id: &str) -> bool {
        self.config.device_id.is_empty() || domain::device_of(actuator_id) == self.config.device_id
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .unwrap_or(Err(SyncError::Timeout))
    }

    fn publish(&self, frame: RelayFrame) {
        let tx = self.relay_tx.lock().ok().and_then(|slot| slot.clone());
        if let Some(tx) = tx {
            if let Err(e) = tx.try_send(frame) {
                debug!(error = %e, "relay publish dropped");
            }
        }
    }

    fn notify(&self, actuator_id: &str, value: &Value) {
        // called without holding the view lock so listeners may re-enter
        let listeners = self
            .listeners
            .lock()
            .map(|l| l.for_key(actuator_id))
            .unwrap_or_default();
        for listener in listeners {
            listener(value);
        }
    }

    fn apply_remote(&self, actuator_id: &str, value: Value, updated_at: Option<u64>, source: &str) -> bool {
        if !self.watches(actuator_id) || self.cancel.is_cancelled() {
            return false;
        }

        let now = self.clock.now_ms();
        {
            let Ok(mut view) = self.view.lock() else { return false };
            if view.echo.should_discard(actuator_id, now) {
                debug!(actuator_id, source, "discarding echo inside local write window");
                return false;
            }
            if let Some(stamp) = updated_at {
                if view.applied_at.get(actuator_id).is_some_and(|&seen| seen >= stamp) {
                    return false;
                }
                view.applied_at.insert(actuator_id.to_string(), stamp);
            }
            if view.values.get(actuator_id) == Some(&value) {
                return false;
            }
            view.values.insert(actuator_id.to_string(), value.clone());
        }

        debug!(actuator_id, source, "remote update applied");
        self.cache.set(&cache_key(actuator_id), &value);
        self.notify(actuator_id, &value);
        true
    }

    async fn poll_once(&self) -> SyncResult<usize> {
        if !self.connectivity.is_online() {
            return Ok(0);
        }

        let since = self.view.lock().map(|v| v.cursor).unwrap_or(0);
        let delta = self.with_timeout(self.transport.poll_since(since)).await?;

        let mut changed = 0;
        for (id, value) in delta.states {
            let stamp = delta.updated_at.get(&id).copied();
            if self.apply_remote(&id, value, stamp, "poll") {
                changed += 1;
            }
        }
        if let Ok(mut view) = self.view.lock() {
            view.cursor = view.cursor.max(delta.server_time);
        }
        Ok(changed)
    }
}

fn spawn_poller(inner: Weak<AgentInner>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        warn!("zero poll interval, using the default");
        DEFAULT_POLL_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    match inner.poll_once().await {
                        Ok(0) => {}
                        Ok(changed) => debug!(changed, "poll reconciled"),
                        Err(e) => warn!(error = %e, "poll failed, retrying next interval"),
                    }
                }
            }
        }
    })
}
