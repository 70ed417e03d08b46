//! Process-wide registry of live worker connections, keyed by (user, service).
//!
//! The map lock only guards insert/lookup/evict of slots. Each slot carries
//! its own lock, held while a connection is being launched, so concurrent
//! callers for one key wait for a single spawn while other keys proceed.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::credentials::{CredentialError, CredentialStore};
use crate::core::mcp::{Connector, LaunchParams, ProviderError, ToolProvider};
use crate::core::service::{ServiceRegistry, ServiceTag};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("user '{user}' has no active credentials for service '{service}'")]
    NoCredentials { user: String, service: String },

    #[error("service '{0}' is not configured")]
    UnknownService(String),

    #[error(transparent)]
    Connection(#[from] ProviderError),

    #[error("credential lookup failed: {0}")]
    Storage(String),

    #[error("connection pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub user_id: String,
    pub service: ServiceTag,
}

impl PoolKey {
    fn new(user_id: &str, service: &ServiceTag) -> Self {
        Self {
            user_id: user_id.to_string(),
            service: service.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub per_user: BTreeMap<String, usize>,
}

enum SlotState {
    Vacant,
    Ready(Arc<dyn ToolProvider>),
    /// Removed from the map; whoever still holds the slot must look again.
    Evicted,
}

struct Slot {
    state: Mutex<SlotState>,
    last_used: std::sync::Mutex<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Vacant),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(last)
    }
}

pub struct ConnectionPool {
    credentials: Arc<CredentialStore>,
    services: Arc<ServiceRegistry>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        credentials: Arc<CredentialStore>,
        services: Arc<ServiceRegistry>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            credentials,
            services,
            connector,
            settings,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            reaper: std::sync::Mutex::new(None),
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_shutting_down() {
            Err(PoolError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Return the live connection for (user, service), launching one if needed.
    pub async fn get_connection(
        &self,
        user_id: &str,
        service: &ServiceTag,
    ) -> Result<Arc<dyn ToolProvider>, PoolError> {
        let key = PoolKey::new(user_id, service);

        loop {
            self.ensure_open()?;

            let slot = {
                let mut slots = self.slots.lock().await;
                // Shutdown may have drained the map since the check above.
                self.ensure_open()?;
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .clone()
            };

            let mut state = slot.state.lock().await;
            let dead = match &*state {
                SlotState::Evicted => continue,
                SlotState::Ready(conn) if conn.is_connected() => {
                    slot.touch();
                    return Ok(conn.clone());
                }
                SlotState::Ready(conn) => Some(conn.clone()),
                SlotState::Vacant => None,
            };
            if let Some(conn) = dead {
                warn!(user = %user_id, service = %service, "replacing dead tool worker connection");
                *state = SlotState::Vacant;
                conn.disconnect().await;
            }

            let launched = self.launch(user_id, service).await;
            let outcome = match launched {
                Ok(conn) if self.is_shutting_down() => {
                    conn.disconnect().await;
                    Err(PoolError::ShuttingDown)
                }
                Ok(conn) => {
                    *state = SlotState::Ready(conn.clone());
                    slot.touch();
                    return Ok(conn);
                }
                Err(e) => Err(e),
            };

            // Failed attempts are never cached.
            *state = SlotState::Evicted;
            drop(state);
            self.forget_slot(&key, &slot).await;
            return outcome;
        }
    }

    async fn launch(&self, user_id: &str, service: &ServiceTag) -> Result<Arc<dyn ToolProvider>, PoolError> {
        let definition = self
            .services
            .get(service)
            .ok_or_else(|| PoolError::UnknownService(service.to_string()))?;

        let credential = self
            .credentials
            .get(user_id, service)
            .await
            .map_err(|e| match e {
                CredentialError::NotFound { user, service } => PoolError::NoCredentials { user, service },
                CredentialError::InvalidKey(_) => PoolError::NoCredentials {
                    user: user_id.to_string(),
                    service: service.to_string(),
                },
                CredentialError::Storage(msg) => PoolError::Storage(msg),
                other @ CredentialError::InvalidThreshold(_) => PoolError::Storage(other.to_string()),
            })?;

        let mut env = definition.env.clone();
        env.insert(
            definition.secret_env.clone(),
            credential.secret_path.to_string_lossy().to_string(),
        );

        let params = LaunchParams {
            user_id: user_id.to_string(),
            service: service.clone(),
            command: definition.command.clone(),
            args: definition.args.clone(),
            env,
        };

        let conn = self.connector.connect(params).await?;
        info!(user = %user_id, service = %service, "pooled new tool worker connection");
        Ok(conn)
    }

    async fn forget_slot(&self, key: &PoolKey, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().await;
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    /// Take the slot's connection and mark it evicted. Waits for an in-flight
    /// launch on that slot to finish first.
    async fn retire(slot: Arc<Slot>) -> Option<Arc<dyn ToolProvider>> {
        let mut state = slot.state.lock().await;
        match std::mem::replace(&mut *state, SlotState::Evicted) {
            SlotState::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    pub async fn close_connection(&self, user_id: &str, service: &ServiceTag) {
        let slot = self.slots.lock().await.remove(&PoolKey::new(user_id, service));
        if let Some(slot) = slot
            && let Some(conn) = Self::retire(slot).await
        {
            conn.disconnect().await;
            info!(user = %user_id, service = %service, "closed tool worker connection");
        }
    }

    pub async fn close_all_for_user(&self, user_id: &str) {
        let slots: Vec<Arc<Slot>> = {
            let mut map = self.slots.lock().await;
            let keys: Vec<PoolKey> = map.keys().filter(|k| k.user_id == user_id).cloned().collect();
            keys.iter().filter_map(|k| map.remove(k)).collect()
        };

        let mut closed = 0;
        for slot in slots {
            if let Some(conn) = Self::retire(slot).await {
                conn.disconnect().await;
                closed += 1;
            }
        }
        info!(user = %user_id, closed, "closed all tool worker connections for user");
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        let mut stats = PoolStats::default();
        for (key, slot) in slots.iter() {
            stats.total += 1;
            *stats.per_user.entry(key.user_id.clone()).or_default() += 1;
            if let Ok(state) = slot.state.try_lock()
                && let SlotState::Ready(conn) = &*state
                && conn.is_connected()
            {
                stats.active += 1;
            }
        }
        stats
    }

    /// Evict every idle or dead entry. Slots busy launching are skipped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.settings.idle_timeout;
        let mut victims: Vec<(PoolKey, Arc<dyn ToolProvider>)> = Vec::new();

        {
            let mut slots = self.slots.lock().await;
            slots.retain(|key, slot| {
                let Ok(mut state) = slot.state.try_lock() else {
                    return true;
                };
                let evict = match &*state {
                    SlotState::Ready(conn) => {
                        let expired = slot.idle_for(now) >= idle_timeout || !conn.is_connected();
                        if expired {
                            victims.push((key.clone(), conn.clone()));
                        }
                        expired
                    }
                    // Nobody holds it: a launch that never started, or a leftover.
                    SlotState::Vacant | SlotState::Evicted => true,
                };
                if evict {
                    *state = SlotState::Evicted;
                }
                !evict
            });
        }

        let reaped = victims.len();
        for (key, conn) in victims {
            debug!(user = %key.user_id, service = %key.service, "reaping idle tool worker");
            conn.disconnect().await;
        }
        if reaped > 0 {
            info!(reaped, "idle sweep evicted tool worker connections");
        }
        reaped
    }

    /// Start the periodic idle sweep. The task stops on shutdown or once the
    /// pool is dropped.
    pub fn start_reaper(self: &Arc<Self>) {
        let mut guard = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.settings.sweep_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.sweep().await;
            }
            debug!("connection reaper stopped");
        }));
    }

    /// Disconnect everything. New lookups fail fast from the moment this is
    /// called; launches already in flight are awaited and torn down.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let slots: Vec<Arc<Slot>> = {
            let mut map = self.slots.lock().await;
            map.drain().map(|(_, slot)| slot).collect()
        };

        let mut teardown = JoinSet::new();
        for slot in slots {
            teardown.spawn(async move {
                if let Some(conn) = Self::retire(slot).await {
                    conn.disconnect().await;
                }
            });
        }
        let count = teardown.len();
        while teardown.join_next().await.is_some() {}
        info!(connections = count, "connection pool shut down");
    }
}
