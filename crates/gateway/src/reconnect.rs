//! Downstream reconnection coordinator
//!
//! A per-server state machine driving reconnection attempts with
//! exponential backoff.
//!
//! ```text
//! IDLE -> PENDING -> RECONNECTING -> SUCCEEDED
//!            ^            |
//!            +--(retry)---+--------> MAX_RETRIES_EXCEEDED
//! PENDING | RECONNECTING -> CANCELLED
//! ```
//!
//! At most one attempt sequence runs per server. Scheduling while a sequence
//! is pending or running is a no-op.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metagate_shared::{ServerId, ServerRepository};
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crash::CrashTracker;
use crate::health::HealthProbe;
use crate::mcp::connection_pool::{ConnectionPool, CrashSignal};

/// Wait before `trigger_reconnection` reports back
pub const TRIGGER_GRACE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectionStatus {
    Idle,
    Pending,
    Reconnecting,
    Succeeded,
    Failed,
    Cancelled,
    MaxRetriesExceeded,
}

impl ReconnectionStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, ReconnectionStatus::Pending | ReconnectionStatus::Reconnecting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    Crash,
    HealthFailure,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionState {
    pub server_uuid: ServerId,
    pub server_name: String,
    pub status: ReconnectionStatus,
    pub reason: Option<ReconnectReason>,
    pub current_attempt: u32,
    pub max_attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub total_attempts: u64,
    pub successful_reconnections: u64,
}

impl ReconnectionState {
    fn new(server_uuid: ServerId, server_name: &str, max_attempts: u32) -> Self {
        Self {
            server_uuid,
            server_name: server_name.to_string(),
            status: ReconnectionStatus::Idle,
            reason: None,
            current_attempt: 0,
            max_attempts,
            next_retry_at: None,
            last_attempt_at: None,
            last_error: None,
            total_attempts: 0,
            successful_reconnections: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub auto_reconnect_on_crash: bool,
    pub auto_reconnect_on_health_failure: bool,
}

impl ReconnectConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.reconnect_enabled,
            max_attempts: config.reconnect_max_attempts,
            base_delay_ms: config.reconnect_base_delay_ms,
            max_delay_ms: config.reconnect_max_delay_ms,
            jitter_factor: config.reconnect_jitter_factor,
            auto_reconnect_on_crash: config.auto_reconnect_on_crash,
            auto_reconnect_on_health_failure: config.auto_reconnect_on_health_failure,
        }
    }

    fn allows(&self, reason: ReconnectReason) -> bool {
        match reason {
            ReconnectReason::Crash => self.auto_reconnect_on_crash,
            ReconnectReason::HealthFailure => self.auto_reconnect_on_health_failure,
            ReconnectReason::Manual => true,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Delay before attempt `attempt + 1`, without jitter: `min(base * 2^(attempt-1), max)`
pub fn backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let delay = base_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_delay_ms))
}

/// Stretch a delay by up to `jitter_factor`. `sample` is in `[0, 1)`.
pub fn with_jitter(delay: Duration, jitter_factor: f64, sample: f64) -> Duration {
    delay.mul_f64(1.0 + jitter_factor.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0))
}

/// Entry point for components that want a server reconnected
#[async_trait]
pub trait ReconnectScheduler: Send + Sync {
    async fn schedule_reconnection(&self, server_uuid: ServerId, server_name: &str, reason: ReconnectReason);
}

pub type StateListener = Arc<dyn Fn(&ReconnectionState) + Send + Sync>;
pub type FailureListener = Arc<dyn Fn(&ReconnectionState, &str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    success: Vec<StateListener>,
    failure: Vec<FailureListener>,
    max_retries: Vec<StateListener>,
}

/// Result of a manual reconnection trigger
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub success: bool,
    pub error: Option<String>,
    pub state: Option<ReconnectionState>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectSummary {
    pub total: usize,
    pub idle: usize,
    pub pending: usize,
    pub reconnecting: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_retries_exceeded: usize,
}

struct AttemptTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Entry {
    state: ReconnectionState,
    task: Option<AttemptTask>,
}

impl Entry {
    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel.cancel();
        }
    }
}

enum Step {
    Done,
    RetryAfter(Duration),
}

pub struct ReconnectCoordinator {
    this: Weak<Self>,
    config: RwLock<ReconnectConfig>,
    entries: Mutex<HashMap<ServerId, Entry>>,
    listeners: RwLock<Listeners>,
    servers: Arc<dyn ServerRepository>,
    connections: Arc<ConnectionPool>,
    crash_tracker: Arc<dyn CrashTracker>,
    health: Arc<dyn HealthProbe>,
    crash_listener: Mutex<Option<AttemptTask>>,
}

impl ReconnectCoordinator {
    pub fn new(
        config: ReconnectConfig,
        servers: Arc<dyn ServerRepository>,
        connections: Arc<ConnectionPool>,
        crash_tracker: Arc<dyn CrashTracker>,
        health: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config: RwLock::new(config),
            entries: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Listeners::default()),
            servers,
            connections,
            crash_tracker,
            health,
            crash_listener: Mutex::new(None),
        })
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ServerId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> ReconnectConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn configure(&self, config: ReconnectConfig) {
        let enabled = config.enabled;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        if !enabled {
            self.cancel_all_reconnections();
        }
    }

    /// Disabling also cancels every running sequence
    pub fn set_enabled(&self, enabled: bool) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled = enabled;
        if !enabled {
            self.cancel_all_reconnections();
        }
        tracing::info!(enabled, "Reconnection toggled");
    }

    /// Start an attempt sequence unless one is already pending or running
    pub fn schedule_reconnection(&self, server_uuid: ServerId, server_name: &str, reason: ReconnectReason) {
        let config = self.config();
        if !config.enabled || !config.allows(reason) {
            tracing::debug!(server_uuid = %server_uuid, ?reason, "Reconnection disabled, not scheduling");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let mut entries = self.entries();
        let entry = entries.entry(server_uuid).or_insert_with(|| Entry {
            state: ReconnectionState::new(server_uuid, server_name, config.max_attempts),
            task: None,
        });
        if entry.state.status.is_in_progress() {
            tracing::debug!(
                server_uuid = %server_uuid,
                status = ?entry.state.status,
                "Reconnection already in progress"
            );
            return;
        }

        entry.stop_task();
        entry.state.server_name = server_name.to_string();
        entry.state.status = ReconnectionStatus::Pending;
        entry.state.reason = Some(reason);
        entry.state.current_attempt = 0;
        entry.state.max_attempts = config.max_attempts;
        entry.state.next_retry_at = None;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(this.run_sequence(server_uuid, cancel.clone()));
        entry.task = Some(AttemptTask { cancel, handle });

        tracing::info!(
            server_uuid = %server_uuid,
            server = %server_name,
            ?reason,
            "Reconnection scheduled"
        );
    }

    async fn run_sequence(self: Arc<Self>, server_uuid: ServerId, cancel: CancellationToken) {
        loop {
            match self.attempt(server_uuid, &cancel).await {
                Step::Done => return,
                Step::RetryAfter(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Apply `update` unless this sequence was cancelled or replaced
    fn update_state<F>(&self, server_uuid: ServerId, cancel: &CancellationToken, update: F) -> Option<ReconnectionState>
    where
        F: FnOnce(&mut ReconnectionState),
    {
        let mut entries = self.entries();
        if cancel.is_cancelled() {
            return None;
        }
        let entry = entries.get_mut(&server_uuid)?;
        update(&mut entry.state);
        if !entry.state.status.is_in_progress() {
            entry.task = None;
        }
        Some(entry.state.clone())
    }

    /// One reconnection try: resolve the server, drop its stale connections, probe it
    async fn reconnect_once(&self, server_uuid: ServerId) -> Result<(), String> {
        match self.servers.find_by_uuid(server_uuid).await {
            Ok(Some(server)) => {
                if server.to_params().is_none() {
                    return Err(format!("Invalid server parameters for {}", server.name));
                }
            }
            Ok(None) => return Err("Server not found".to_string()),
            Err(e) => tracing::warn!(server_uuid = %server_uuid, error = %e, "Registry lookup failed"),
        }

        self.crash_tracker.reset(server_uuid).await;
        self.connections.invalidate_server(server_uuid).await;
        let health = self.health.probe_server(server_uuid).await;

        if health.is_healthy() {
            Ok(())
        } else {
            Err(health
                .error_message
                .unwrap_or_else(|| "Health check failed".to_string()))
        }
    }

    async fn attempt(&self, server_uuid: ServerId, cancel: &CancellationToken) -> Step {
        let mut exhausted = false;
        let Some(started) = self.update_state(server_uuid, cancel, |state| {
            if state.current_attempt >= state.max_attempts {
                state.status = ReconnectionStatus::MaxRetriesExceeded;
                exhausted = true;
                return;
            }
            state.current_attempt += 1;
            state.total_attempts += 1;
            state.status = ReconnectionStatus::Reconnecting;
            state.last_attempt_at = Some(OffsetDateTime::now_utc());
            state.next_retry_at = None;
        }) else {
            return Step::Done;
        };

        if exhausted {
            tracing::warn!(server_uuid = %server_uuid, "Reconnection attempts exhausted");
            self.notify_max_retries(&started);
            return Step::Done;
        }

        tracing::info!(
            server_uuid = %server_uuid,
            server = %started.server_name,
            attempt = started.current_attempt,
            max_attempts = started.max_attempts,
            "Attempting reconnection"
        );

        let error = match self.reconnect_once(server_uuid).await {
            Ok(()) => {
                let Some(state) = self.update_state(server_uuid, cancel, |state| {
                    state.status = ReconnectionStatus::Succeeded;
                    state.current_attempt = 0;
                    state.successful_reconnections += 1;
                    state.last_error = None;
                }) else {
                    return Step::Done;
                };
                tracing::info!(
                    server_uuid = %server_uuid,
                    server = %state.server_name,
                    attempts = started.current_attempt,
                    "Reconnection succeeded"
                );
                self.notify_success(&state);
                return Step::Done;
            }
            Err(error) => error,
        };

        let config = self.config();
        let delay = with_jitter(
            backoff_delay(started.current_attempt, config.base_delay_ms, config.max_delay_ms),
            config.jitter_factor,
            rand::thread_rng().gen::<f64>(),
        );

        let Some(state) = self.update_state(server_uuid, cancel, |state| {
            state.last_error = Some(error.clone());
            if state.current_attempt < state.max_attempts {
                state.status = ReconnectionStatus::Pending;
                state.next_retry_at = Some(OffsetDateTime::now_utc() + delay);
            } else {
                state.status = ReconnectionStatus::MaxRetriesExceeded;
            }
        }) else {
            return Step::Done;
        };

        self.notify_failure(&state, &error);
        if state.status == ReconnectionStatus::MaxRetriesExceeded {
            tracing::error!(
                server_uuid = %server_uuid,
                server = %state.server_name,
                attempts = state.current_attempt,
                error = %error,
                "Reconnection failed, max retries exceeded"
            );
            self.notify_max_retries(&state);
            return Step::Done;
        }

        tracing::warn!(
            server_uuid = %server_uuid,
            server = %state.server_name,
            attempt = state.current_attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Reconnection attempt failed, retrying"
        );
        Step::RetryAfter(delay)
    }

    /// Manual reconnection. Returns the state shortly after scheduling; the
    /// attempt may still be running.
    pub async fn trigger_reconnection(&self, server_uuid: ServerId) -> TriggerResult {
        let server = match self.servers.find_by_uuid(server_uuid).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                return TriggerResult {
                    success: false,
                    error: Some("Server not found".to_string()),
                    state: None,
                }
            }
            Err(e) => {
                return TriggerResult {
                    success: false,
                    error: Some(e.to_string()),
                    state: None,
                }
            }
        };

        if !self.config().enabled {
            return TriggerResult {
                success: false,
                error: Some("Reconnection is disabled".to_string()),
                state: self.state(server_uuid),
            };
        }

        self.cancel_reconnection(server_uuid);
        self.schedule_reconnection(server_uuid, &server.name, ReconnectReason::Manual);
        tokio::time::sleep(TRIGGER_GRACE_PERIOD).await;

        let state = self.state(server_uuid);
        let failed = state.as_ref().is_some_and(|s| {
            matches!(
                s.status,
                ReconnectionStatus::Failed | ReconnectionStatus::MaxRetriesExceeded
            )
        });
        TriggerResult {
            success: !failed,
            error: state
                .as_ref()
                .filter(|_| failed)
                .and_then(|s| s.last_error.clone()),
            state,
        }
    }

    /// Cancel a pending or running sequence. Counters are kept.
    pub fn cancel_reconnection(&self, server_uuid: ServerId) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&server_uuid) else {
            return false;
        };
        entry.stop_task();
        if !entry.state.status.is_in_progress() {
            return false;
        }
        entry.state.status = ReconnectionStatus::Cancelled;
        entry.state.next_retry_at = None;
        tracing::info!(server_uuid = %server_uuid, "Reconnection cancelled");
        true
    }

    pub fn cancel_all_reconnections(&self) -> usize {
        let mut entries = self.entries();
        let mut cancelled = 0;
        for entry in entries.values_mut() {
            entry.stop_task();
            if entry.state.status.is_in_progress() {
                entry.state.status = ReconnectionStatus::Cancelled;
                entry.state.next_retry_at = None;
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(count = cancelled, "Cancelled all reconnections");
        }
        cancelled
    }

    /// Forget a server's state entirely
    pub fn reset_reconnection_state(&self, server_uuid: ServerId) {
        if let Some(mut entry) = self.entries().remove(&server_uuid) {
            entry.stop_task();
        }
    }

    pub fn clear_all_states(&self) {
        let mut entries = self.entries();
        for entry in entries.values_mut() {
            entry.stop_task();
        }
        entries.clear();
    }

    pub fn on_success(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .success
            .push(listener);
    }

    pub fn on_failure(&self, listener: FailureListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .failure
            .push(listener);
    }

    pub fn on_max_retries_exceeded(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .max_retries
            .push(listener);
    }

    fn notify_success(&self, state: &ReconnectionState) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .success
            .clone();
        for listener in listeners {
            guarded("success", state.server_uuid, || listener(state));
        }
    }

    fn notify_failure(&self, state: &ReconnectionState, error: &str) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failure
            .clone();
        for listener in listeners {
            guarded("failure", state.server_uuid, || listener(state, error));
        }
    }

    fn notify_max_retries(&self, state: &ReconnectionState) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .max_retries
            .clone();
        for listener in listeners {
            guarded("max_retries", state.server_uuid, || listener(state));
        }
    }

    /// Schedule a crash reconnection for every signal on the pool's crash feed
    pub fn start_crash_listener(&self, mut crashes: broadcast::Receiver<CrashSignal>) {
        self.stop_crash_listener();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let coordinator = self.this.clone();

        let handle = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = token.cancelled() => break,
                    received = crashes.recv() => match received {
                        Ok(signal) => signal,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Crash listener lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let Some(coordinator) = coordinator.upgrade() else { break };
                coordinator.schedule_reconnection(signal.server_uuid, &signal.server_name, ReconnectReason::Crash);
            }
            tracing::debug!("Crash listener stopped");
        });

        *self
            .crash_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(AttemptTask { cancel, handle });
    }

    pub fn stop_crash_listener(&self) {
        let task = self
            .crash_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    pub fn state(&self, server_uuid: ServerId) -> Option<ReconnectionState> {
        self.entries().get(&server_uuid).map(|e| e.state.clone())
    }

    pub fn all_states(&self) -> Vec<ReconnectionState> {
        self.entries().values().map(|e| e.state.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|e| e.state.status.is_in_progress())
            .count()
    }

    pub fn summary(&self) -> ReconnectSummary {
        let entries = self.entries();
        let mut summary = ReconnectSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.state.status {
                ReconnectionStatus::Idle => summary.idle += 1,
                ReconnectionStatus::Pending => summary.pending += 1,
                ReconnectionStatus::Reconnecting => summary.reconnecting += 1,
                ReconnectionStatus::Succeeded => summary.succeeded += 1,
                ReconnectionStatus::Failed => summary.failed += 1,
                ReconnectionStatus::Cancelled => summary.cancelled += 1,
                ReconnectionStatus::MaxRetriesExceeded => summary.max_retries_exceeded += 1,
            }
        }
        summary
    }
}

fn guarded<F: FnOnce()>(kind: &str, server_uuid: ServerId, listener: F) {
    if catch_unwind(AssertUnwindSafe(listener)).is_err() {
        tracing::error!(server_uuid = %server_uuid, listener = kind, "Reconnection listener panicked");
    }
}

#[async_trait]
impl ReconnectScheduler for ReconnectCoordinator {
    async fn schedule_reconnection(&self, server_uuid: ServerId, server_name: &str, reason: ReconnectReason) {
        ReconnectCoordinator::schedule_reconnection(self, server_uuid, server_name, reason);
    }
}
