//! Namespace server pool
//!
//! Keeps one pre-warmed idle gateway instance per namespace and the active
//! instance of every session. A new session takes the idle instance (if
//! there is one) and a replacement is built in the background.
//!
//! ```text
//! get_server(session, ns)
//!   active[session]? ---------------------------------> return it
//!   idle[ns]?        --> bind session, mark active -----> return it, rebuild idle
//!   otherwise        --> create, mark active -----------> return it, build idle
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metagate_shared::NamespaceId;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::{GatewayFactory, GatewayInstance};
use crate::session_store::{CleanupFn, SessionStore};

/// Session id prefix for OpenAPI-facing sessions
pub const OPENAPI_SESSION_PREFIX: &str = "openapi:";

pub fn open_api_session_id(namespace_uuid: NamespaceId) -> String {
    format!("{}{}", OPENAPI_SESSION_PREFIX, namespace_uuid)
}

/// Placeholder session id held by an idle instance until it is promoted
fn idle_session_id(namespace_uuid: NamespaceId) -> String {
    let ts = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("idle_{}_{}", namespace_uuid, ts)
}

#[derive(Clone)]
pub struct ActiveSession {
    pub namespace_uuid: NamespaceId,
    pub instance: GatewayInstance,
}

#[derive(Default)]
struct IdleState {
    idle: HashMap<NamespaceId, GatewayInstance>,
    /// Namespaces with an idle build in flight
    building: HashSet<NamespaceId>,
    /// Bumped on every invalidation; builds started under an older value are discarded
    generations: HashMap<NamespaceId, u64>,
    /// Invalidated while a build was in flight; rebuild once it lands
    rebuild_requested: HashSet<NamespaceId>,
}

impl IdleState {
    fn generation(&self, namespace_uuid: NamespaceId) -> u64 {
        self.generations.get(&namespace_uuid).copied().unwrap_or(0)
    }

    fn bump(&mut self, namespace_uuid: NamespaceId) {
        *self.generations.entry(namespace_uuid).or_default() += 1;
    }
}

/// Poll-based pool statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    pub building: usize,
    pub idle_namespaces: Vec<NamespaceId>,
    pub active_sessions: Vec<String>,
}

pub struct NamespaceServerPool {
    factory: Arc<dyn GatewayFactory>,
    state: Mutex<IdleState>,
    sessions: Arc<SessionStore<ActiveSession>>,
    shutting_down: AtomicBool,
}

impl NamespaceServerPool {
    pub fn new(factory: Arc<dyn GatewayFactory>, session_lifetime: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(IdleState::default()),
            sessions: Arc::new(SessionStore::new("gateway-sessions", session_lifetime)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Get the session's gateway instance, creating or promoting one if needed
    pub async fn get_server(
        self: &Arc<Self>,
        session_id: &str,
        namespace_uuid: NamespaceId,
    ) -> GatewayResult<GatewayInstance> {
        if let Some(active) = self.sessions.get(session_id) {
            return Ok(active.instance);
        }

        let instance = self.take_or_create(session_id, namespace_uuid).await?;

        // Another request for the same session won the race
        if let Some(existing) = self.sessions.get(session_id) {
            instance.cleanup().await;
            return Ok(existing.instance);
        }

        self.sessions.add(
            session_id,
            ActiveSession {
                namespace_uuid,
                instance: instance.clone(),
            },
        );
        self.spawn_replenish(namespace_uuid);

        tracing::info!(
            session_id = %session_id,
            namespace_uuid = %namespace_uuid,
            "Gateway session started"
        );
        Ok(instance)
    }

    /// Gateway for the namespace's OpenAPI surface. Never expires.
    pub async fn get_open_api_server(self: &Arc<Self>, namespace_uuid: NamespaceId) -> GatewayResult<GatewayInstance> {
        let session_id = open_api_session_id(namespace_uuid);
        if let Some(active) = self.sessions.get(&session_id) {
            return Ok(active.instance);
        }

        let instance = self.take_or_create(&session_id, namespace_uuid).await?;
        if let Some(existing) = self.sessions.get(&session_id) {
            instance.cleanup().await;
            return Ok(existing.instance);
        }

        self.sessions.add_persistent(
            &session_id,
            ActiveSession {
                namespace_uuid,
                instance: instance.clone(),
            },
        );
        self.replenish(namespace_uuid).await;
        Ok(instance)
    }

    async fn take_or_create(&self, session_id: &str, namespace_uuid: NamespaceId) -> GatewayResult<GatewayInstance> {
        let promoted = self.state.lock().await.idle.remove(&namespace_uuid);
        if let Some(instance) = promoted {
            instance.bind_session(session_id).await;
            tracing::debug!(session_id = %session_id, namespace_uuid = %namespace_uuid, "Promoted idle gateway");
            return Ok(instance);
        }

        self.factory
            .create(namespace_uuid, session_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    session_id = %session_id,
                    namespace_uuid = %namespace_uuid,
                    error = %e,
                    "Failed to create gateway instance"
                );
                GatewayError::Unavailable(format!("namespace {}: {}", namespace_uuid, e))
            })
    }

    fn spawn_replenish(self: &Arc<Self>, namespace_uuid: NamespaceId) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.replenish(namespace_uuid).await;
        });
    }

    /// Build the namespace's idle instance unless one exists or is being built.
    /// Failures are logged and never returned.
    async fn replenish(&self, namespace_uuid: NamespaceId) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }

            let generation = {
                let mut state = self.state.lock().await;
                if state.idle.contains_key(&namespace_uuid) || !state.building.insert(namespace_uuid) {
                    return;
                }
                state.generation(namespace_uuid)
            };

            let result = self
                .factory
                .create(namespace_uuid, &idle_session_id(namespace_uuid))
                .await;

            let mut state = self.state.lock().await;
            state.building.remove(&namespace_uuid);

            let instance = match result {
                Ok(instance) => instance,
                Err(e) => {
                    state.rebuild_requested.remove(&namespace_uuid);
                    tracing::warn!(namespace_uuid = %namespace_uuid, error = %e, "Idle gateway build failed");
                    return;
                }
            };

            let stale = state.generation(namespace_uuid) != generation
                || state.idle.contains_key(&namespace_uuid)
                || self.shutting_down.load(Ordering::Acquire);
            if !stale {
                state.idle.insert(namespace_uuid, instance);
                tracing::debug!(namespace_uuid = %namespace_uuid, "Idle gateway ready");
                return;
            }

            let retry = state.rebuild_requested.remove(&namespace_uuid);
            drop(state);
            instance.cleanup().await;
            tracing::debug!(namespace_uuid = %namespace_uuid, retry, "Discarded stale idle gateway");
            if !retry {
                return;
            }
        }
    }

    /// End a session and release its instance
    pub async fn cleanup_session(self: &Arc<Self>, session_id: &str) -> bool {
        let Some(active) = self.sessions.remove(session_id) else {
            return false;
        };
        active.instance.cleanup().await;
        self.spawn_replenish(active.namespace_uuid);
        tracing::info!(session_id = %session_id, "Gateway session cleaned up");
        true
    }

    /// Tear everything down; no idle instances are rebuilt afterwards
    pub async fn cleanup_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.sessions.stop_cleanup_timer();

        let idle: Vec<GatewayInstance> = {
            let mut state = self.state.lock().await;
            state.rebuild_requested.clear();
            state.idle.drain().map(|(_, i)| i).collect()
        };
        let active = self.sessions.drain();
        let count = idle.len() + active.len();

        futures::future::join_all(
            idle.into_iter()
                .chain(active.into_iter().map(|(_, a)| a.instance))
                .map(|instance| async move { instance.cleanup().await }),
        )
        .await;
        tracing::info!(count, "Gateway pool cleaned up");
    }

    /// Drop the namespace's idle instance and build a fresh one
    pub async fn invalidate_idle(self: &Arc<Self>, namespace_uuid: NamespaceId) {
        let (old, in_flight) = {
            let mut state = self.state.lock().await;
            state.bump(namespace_uuid);
            let in_flight = state.building.contains(&namespace_uuid);
            if in_flight {
                state.rebuild_requested.insert(namespace_uuid);
            }
            (state.idle.remove(&namespace_uuid), in_flight)
        };

        if let Some(instance) = old {
            instance.cleanup().await;
        }
        if !in_flight {
            self.spawn_replenish(namespace_uuid);
        }
        tracing::info!(namespace_uuid = %namespace_uuid, "Idle gateway invalidated");
    }

    pub async fn invalidate_idle_many(self: &Arc<Self>, namespace_uuids: &[NamespaceId]) {
        for namespace_uuid in namespace_uuids {
            self.invalidate_idle(*namespace_uuid).await;
        }
    }

    /// Drop and recreate existing OpenAPI sessions for these namespaces
    pub async fn invalidate_open_api(self: &Arc<Self>, namespace_uuids: &[NamespaceId]) {
        for namespace_uuid in namespace_uuids {
            let Some(active) = self.sessions.remove(&open_api_session_id(*namespace_uuid)) else {
                continue;
            };
            active.instance.cleanup().await;
            if let Err(e) = self.get_open_api_server(*namespace_uuid).await {
                tracing::warn!(namespace_uuid = %namespace_uuid, error = %e, "Failed to recreate OpenAPI gateway");
            }
        }
    }

    /// Drop the idle instance without rebuilding (namespace deleted)
    pub async fn cleanup_idle(&self, namespace_uuid: NamespaceId) {
        let old = {
            let mut state = self.state.lock().await;
            state.bump(namespace_uuid);
            state.rebuild_requested.remove(&namespace_uuid);
            state.idle.remove(&namespace_uuid)
        };
        if let Some(instance) = old {
            instance.cleanup().await;
            tracing::info!(namespace_uuid = %namespace_uuid, "Idle gateway removed");
        }
    }

    /// Warm idle instances for these namespaces, waiting for the builds
    pub async fn ensure_idle_servers(&self, namespace_uuids: &[NamespaceId]) {
        futures::future::join_all(namespace_uuids.iter().map(|ns| self.replenish(*ns))).await;
        tracing::info!(count = namespace_uuids.len(), "Idle gateways warmed");
    }

    pub async fn ensure_idle_for_new_namespace(&self, namespace_uuid: NamespaceId) {
        self.replenish(namespace_uuid).await;
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut active_sessions = self.sessions.ids();
        active_sessions.sort();
        PoolStatus {
            idle: state.idle.len(),
            active: active_sessions.len(),
            building: state.building.len(),
            idle_namespaces: state.idle.keys().copied().collect(),
            active_sessions,
        }
    }

    pub fn instance(&self, session_id: &str) -> Option<GatewayInstance> {
        self.sessions.get(session_id).map(|a| a.instance)
    }

    pub fn session_age(&self, session_id: &str) -> Option<Duration> {
        self.sessions.age(session_id)
    }

    pub fn is_session_expired(&self, session_id: &str) -> bool {
        self.sessions.is_expired(session_id)
    }

    pub fn set_session_lifetime(&self, lifetime: Option<Duration>) {
        self.sessions.set_lifetime(lifetime);
    }

    /// Run one expiry pass now
    pub async fn cleanup_expired_sessions(self: &Arc<Self>) -> usize {
        self.sessions.cleanup_expired(&self.expiry_cleanup()).await
    }

    pub fn start_expiry_sweep(self: &Arc<Self>, interval: Duration) {
        self.sessions.start_cleanup_timer(interval, self.expiry_cleanup());
        tracing::info!(interval_ms = interval.as_millis() as u64, "Session expiry sweep started");
    }

    pub fn stop_expiry_sweep(&self) {
        self.sessions.stop_cleanup_timer();
    }

    fn expiry_cleanup(self: &Arc<Self>) -> CleanupFn<ActiveSession> {
        let pool: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |session_id, active: ActiveSession| {
            let pool = pool.clone();
            Box::pin(async move {
                active.instance.cleanup().await;
                if let Some(pool) = pool.upgrade() {
                    pool.spawn_replenish(active.namespace_uuid);
                }
                tracing::info!(session_id = %session_id, "Expired gateway session cleaned up");
                Ok(())
            })
        })
    }
}
