//! Downstream health monitoring
//!
//! Probes each registered server by connecting and listing its tools. A
//! server is only marked unhealthy after `threshold` consecutive failures;
//! the probe that crosses the threshold asks the reconnect coordinator for a
//! reconnection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metagate_shared::{ServerId, ServerParams, ServerRepository};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crash::CrashTracker;
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::client::{CallOptions, Connector};
use crate::reconnect::{ReconnectReason, ReconnectScheduler};

/// Upper bound on a single probe
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
    Checking,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub server_uuid: ServerId,
    pub server_name: Option<String>,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_healthy: Option<OffsetDateTime>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub tool_count: Option<usize>,
}

impl HealthState {
    fn new(server_uuid: ServerId) -> Self {
        Self {
            server_uuid,
            server_name: None,
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_checked: None,
            last_healthy: None,
            response_time_ms: None,
            error_message: None,
            tool_count: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub checking: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_batch_at: Option<OffsetDateTime>,
}

/// One-shot health probe used by the reconnect coordinator
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe_server(&self, server_uuid: ServerId) -> HealthState;
}

struct LoopTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    servers: Arc<dyn ServerRepository>,
    connector: Arc<dyn Connector>,
    crash_tracker: Arc<dyn CrashTracker>,
    probe_timeout: Duration,
    threshold: u32,
    interval: Duration,
    states: RwLock<HashMap<ServerId, HealthState>>,
    last_batch_at: RwLock<Option<OffsetDateTime>>,
    reconnect: OnceLock<Weak<dyn ReconnectScheduler>>,
    periodic: Mutex<Option<LoopTask>>,
}

impl HealthMonitor {
    pub fn new(
        config: &Config,
        servers: Arc<dyn ServerRepository>,
        connector: Arc<dyn Connector>,
        crash_tracker: Arc<dyn CrashTracker>,
    ) -> Self {
        Self {
            servers,
            connector,
            crash_tracker,
            probe_timeout: Duration::from_millis(config.mcp_timeout_ms).min(MAX_PROBE_TIMEOUT),
            threshold: config.health_unhealthy_threshold.max(1),
            interval: Duration::from_millis(config.health_check_interval_ms),
            states: RwLock::new(HashMap::new()),
            last_batch_at: RwLock::new(None),
            reconnect: OnceLock::new(),
            periodic: Mutex::new(None),
        }
    }

    /// Install the reconnect scheduler. Can only be done once.
    pub fn set_reconnect_scheduler(&self, scheduler: &Arc<dyn ReconnectScheduler>) -> GatewayResult<()> {
        self.reconnect
            .set(Arc::downgrade(scheduler))
            .map_err(|_| GatewayError::Internal("Reconnect scheduler installed twice".to_string()))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Probe one server and record the outcome
    pub async fn check_server_health(&self, server_uuid: ServerId) -> HealthState {
        let server = match self.servers.find_by_uuid(server_uuid).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                // Nothing to track for a server that is gone
                self.states.write().await.remove(&server_uuid);
                let mut state = HealthState::new(server_uuid);
                state.error_message = Some("Server not found".to_string());
                return state;
            }
            Err(e) => {
                return self
                    .record_failure(server_uuid, None, format!("Registry lookup failed: {}", e), None)
                    .await;
            }
        };

        let Some(params) = server.to_params() else {
            return self
                .record_failure(
                    server_uuid,
                    Some(server.name),
                    "Invalid server parameters".to_string(),
                    None,
                )
                .await;
        };

        if self.crash_tracker.is_in_error_state(server_uuid).await {
            return self
                .record_failure(
                    server_uuid,
                    Some(server.name),
                    "Server is in error state after repeated crashes".to_string(),
                    None,
                )
                .await;
        }

        self.mark_checking(server_uuid, &server.name).await;

        let started = Instant::now();
        let result = self.probe(&params).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(tool_count) => self.record_success(server_uuid, server.name, elapsed_ms, tool_count).await,
            Err(e) => {
                self.record_failure(server_uuid, Some(server.name), e.to_string(), Some(elapsed_ms))
                    .await
            }
        }
    }

    /// Connect and list tools within the probe timeout. Returns the tool count.
    async fn probe(&self, params: &ServerParams) -> GatewayResult<usize> {
        let cancel = CancellationToken::new();
        // Fires on every exit path, including a timeout
        let _guard = cancel.clone().drop_guard();
        let options = CallOptions::with_cancel(self.probe_timeout, cancel.clone());

        let work = async {
            let client = self.connector.connect(params, &cancel).await?;
            let listed = client.list_tools(None, &options).await;
            client.close().await;
            Ok(listed?.tools.len())
        };

        match tokio::time::timeout(self.probe_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(params.name.clone())),
        }
    }

    async fn mark_checking(&self, server_uuid: ServerId, server_name: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(server_uuid)
            .or_insert_with(|| HealthState::new(server_uuid));
        state.server_name = Some(server_name.to_string());
        state.status = HealthStatus::Checking;
    }

    async fn record_success(
        &self,
        server_uuid: ServerId,
        server_name: String,
        response_time_ms: u64,
        tool_count: usize,
    ) -> HealthState {
        let now = OffsetDateTime::now_utc();
        let mut states = self.states.write().await;
        let state = states
            .entry(server_uuid)
            .or_insert_with(|| HealthState::new(server_uuid));

        if state.consecutive_failures > 0 {
            tracing::info!(
                server_uuid = %server_uuid,
                server = %server_name,
                previous_failures = state.consecutive_failures,
                "Server recovered"
            );
        }

        state.server_name = Some(server_name);
        state.status = HealthStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_checked = Some(now);
        state.last_healthy = Some(now);
        state.response_time_ms = Some(response_time_ms);
        state.error_message = None;
        state.tool_count = Some(tool_count);
        state.clone()
    }

    async fn record_failure(
        &self,
        server_uuid: ServerId,
        server_name: Option<String>,
        error: String,
        response_time_ms: Option<u64>,
    ) -> HealthState {
        let (crossed, snapshot) = {
            let mut states = self.states.write().await;
            let state = states
                .entry(server_uuid)
                .or_insert_with(|| HealthState::new(server_uuid));

            if server_name.is_some() {
                state.server_name = server_name;
            }
            state.consecutive_failures += 1;
            state.last_checked = Some(OffsetDateTime::now_utc());
            state.response_time_ms = response_time_ms;
            state.error_message = Some(error);
            state.status = if state.consecutive_failures >= self.threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Unknown
            };

            (state.consecutive_failures == self.threshold, state.clone())
        };

        if crossed {
            tracing::warn!(
                server_uuid = %server_uuid,
                failures = snapshot.consecutive_failures,
                error = ?snapshot.error_message,
                "Server marked unhealthy"
            );
            self.request_reconnection(&snapshot).await;
        } else {
            tracing::debug!(
                server_uuid = %server_uuid,
                failures = snapshot.consecutive_failures,
                threshold = self.threshold,
                "Health check failed"
            );
        }
        snapshot
    }

    async fn request_reconnection(&self, state: &HealthState) {
        let Some(scheduler) = self.reconnect.get().and_then(Weak::upgrade) else {
            tracing::debug!(server_uuid = %state.server_uuid, "No reconnect scheduler installed");
            return;
        };
        let name = state
            .server_name
            .clone()
            .unwrap_or_else(|| state.server_uuid.to_string());
        scheduler
            .schedule_reconnection(state.server_uuid, &name, ReconnectReason::HealthFailure)
            .await;
    }

    /// Probe many servers concurrently, each on its own task. `None` checks
    /// every active registered server.
    pub async fn check_multiple_servers(self: &Arc<Self>, server_uuids: Option<Vec<ServerId>>) -> Vec<HealthState> {
        let uuids = match server_uuids {
            Some(uuids) => uuids,
            None => match self.servers.find_all().await {
                Ok(servers) => servers
                    .into_iter()
                    .filter(|s| s.status.is_active())
                    .map(|s| s.uuid)
                    .collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load servers for health check");
                    return Vec::new();
                }
            },
        };

        let handles: Vec<_> = uuids
            .into_iter()
            .map(|uuid| {
                let monitor = self.clone();
                tokio::spawn(async move { monitor.check_server_health(uuid).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(state) => results.push(state),
                Err(e) => tracing::error!(error = %e, "Health probe task failed"),
            }
        }

        *self.last_batch_at.write().await = Some(OffsetDateTime::now_utc());
        let healthy = results.iter().filter(|s| s.is_healthy()).count();
        tracing::info!(checked = results.len(), healthy, "Health check batch completed");
        results
    }

    /// Start the periodic loop. The first full check runs immediately.
    pub fn start_periodic_checks(self: &Arc<Self>) {
        let mut periodic = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        if periodic.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor: Weak<Self> = Arc::downgrade(self);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check_multiple_servers(None).await;
                    }
                }
            }
            tracing::debug!("Health check loop stopped");
        });

        *periodic = Some(LoopTask { cancel, handle });
        tracing::info!(interval_ms = interval.as_millis() as u64, "Health check loop started");
    }

    pub fn stop_periodic_checks(&self) {
        let task = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn health(&self, server_uuid: ServerId) -> Option<HealthState> {
        self.states.read().await.get(&server_uuid).cloned()
    }

    pub async fn all_health(&self) -> Vec<HealthState> {
        self.states.read().await.values().cloned().collect()
    }

    pub async fn summary(&self) -> HealthSummary {
        let states = self.states.read().await;
        let mut summary = HealthSummary {
            total: states.len(),
            last_batch_at: *self.last_batch_at.read().await,
            ..Default::default()
        };
        for state in states.values() {
            match state.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
                HealthStatus::Checking => summary.checking += 1,
            }
        }
        summary
    }

    pub async fn clear_health_state(&self, server_uuid: ServerId) -> bool {
        self.states.write().await.remove(&server_uuid).is_some()
    }

    pub async fn clear_all(&self) {
        self.states.write().await.clear();
        *self.last_batch_at.write().await = None;
    }
}

#[async_trait]
impl HealthProbe for HealthMonitor {
    async fn probe_server(&self, server_uuid: ServerId) -> HealthState {
        self.check_server_health(server_uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::ServerErrorTracker;
    use crate::mcp::client::DownstreamClient;
    use crate::mcp::types::*;
    use metagate_shared::{ActivationStatus, InMemoryStore, McpServer, McpTransport};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ListingClient {
        tools: usize,
        fail: bool,
    }

    #[async_trait]
    impl DownstreamClient for ListingClient {
        fn server_info(&self) -> ServerInfo {
            ServerInfo::default()
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn list_tools(&self, _cursor: Option<String>, _options: &CallOptions) -> GatewayResult<ToolsListResult> {
            if self.fail {
                return Err(GatewayError::Downstream("list failed".to_string()));
            }
            let tools = (0..self.tools)
                .map(|i| Tool::new(format!("t{}", i), "", serde_json::json!({"type": "object"})))
                .collect();
            Ok(ToolsListResult {
                tools,
                next_cursor: None,
            })
        }

        async fn call_tool(&self, _params: ToolCallParams, _options: &CallOptions) -> GatewayResult<ToolCallResult> {
            Ok(ToolCallResult::text("ok"))
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeConnector {
        fail: AtomicBool,
        hang: AtomicBool,
        connects: AtomicUsize,
        last_cancel: std::sync::Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _params: &ServerParams,
            cancel: &CancellationToken,
        ) -> GatewayResult<Arc<dyn DownstreamClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_cancel.lock().unwrap() = Some(cancel.clone());
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(Arc::new(ListingClient {
                tools: 2,
                fail: self.fail.load(Ordering::SeqCst),
            }))
        }
    }

    #[derive(Default)]
    struct CountingScheduler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReconnectScheduler for CountingScheduler {
        async fn schedule_reconnection(&self, _server_uuid: ServerId, _server_name: &str, reason: ReconnectReason) {
            assert_eq!(reason, ReconnectReason::HealthFailure);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        monitor: Arc<HealthMonitor>,
        connector: Arc<FakeConnector>,
        tracker: Arc<ServerErrorTracker>,
        scheduler: Arc<CountingScheduler>,
        // Keeps the weak handle alive
        _scheduler_dyn: Arc<dyn ReconnectScheduler>,
        server: ServerId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let server = McpServer {
            uuid: ServerId::new(),
            name: "fs".to_string(),
            description: None,
            transport: McpTransport::Stdio {
                command: "mcp-fs".to_string(),
                args: vec![],
                env: Default::default(),
            },
            status: ActivationStatus::Active,
        };
        let uuid = server.uuid;
        store.insert_server(server).await;

        let connector = Arc::new(FakeConnector::default());
        let tracker = Arc::new(ServerErrorTracker::new(1));
        let monitor = Arc::new(HealthMonitor::new(
            &Config::default(),
            store,
            connector.clone(),
            tracker.clone(),
        ));
        let scheduler = Arc::new(CountingScheduler::default());
        let scheduler_dyn: Arc<dyn ReconnectScheduler> = scheduler.clone();
        monitor.set_reconnect_scheduler(&scheduler_dyn).unwrap();

        Fixture {
            monitor,
            connector,
            tracker,
            scheduler,
            _scheduler_dyn: scheduler_dyn,
            server: uuid,
        }
    }

    #[tokio::test]
    async fn test_healthy_probe_records_tool_count() {
        let f = fixture().await;
        let state = f.monitor.check_server_health(f.server).await;

        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.tool_count, Some(2));
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_healthy.is_some());
    }

    #[tokio::test]
    async fn test_threshold_crossing_schedules_one_reconnection() {
        let f = fixture().await;
        f.connector.fail.store(true, Ordering::SeqCst);

        assert_eq!(f.monitor.check_server_health(f.server).await.status, HealthStatus::Unknown);
        assert_eq!(f.monitor.check_server_health(f.server).await.status, HealthStatus::Unknown);
        assert_eq!(f.scheduler.calls.load(Ordering::SeqCst), 0);

        let third = f.monitor.check_server_health(f.server).await;
        assert_eq!(third.status, HealthStatus::Unhealthy);
        assert_eq!(third.consecutive_failures, 3);
        assert_eq!(f.scheduler.calls.load(Ordering::SeqCst), 1);

        f.monitor.check_server_health(f.server).await;
        assert_eq!(f.scheduler.calls.load(Ordering::SeqCst), 1);

        f.connector.fail.store(false, Ordering::SeqCst);
        let recovered = f.monitor.check_server_health(f.server).await;
        assert_eq!(recovered.status, HealthStatus::Healthy);
        assert_eq!(recovered.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_crash_error_state_skips_probe() {
        let f = fixture().await;
        f.tracker.record_crash(f.server).await;

        let state = f.monitor.check_server_health(f.server).await;
        assert_eq!(state.status, HealthStatus::Unknown);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_server_is_not_tracked() {
        let f = fixture().await;
        let state = f.monitor.check_server_health(ServerId::new()).await;

        assert_eq!(state.error_message.as_deref(), Some("Server not found"));
        assert_eq!(f.monitor.summary().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_probe_is_cancelled() {
        let f = fixture().await;
        f.connector.hang.store(true, Ordering::SeqCst);

        let state = f.monitor.check_server_health(f.server).await;
        assert_eq!(state.status, HealthStatus::Unknown);
        assert!(state.error_message.unwrap().contains("timed out"));

        let token = f.connector.last_cancel.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_batch_defaults_to_registry_and_summarizes() {
        let f = fixture().await;
        let results = f.monitor.check_multiple_servers(None).await;
        assert_eq!(results.len(), 1);

        let summary = f.monitor.summary().await;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.healthy, 1);
        assert!(summary.last_batch_at.is_some());

        assert!(f.monitor.clear_health_state(f.server).await);
        assert_eq!(f.monitor.summary().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loop_is_idempotent() {
        let f = fixture().await;
        f.monitor.start_periodic_checks();
        f.monitor.start_periodic_checks();
        assert!(f.monitor.is_running());

        // Immediate first run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 2);

        f.monitor.stop_periodic_checks();
        f.monitor.stop_periodic_checks();
        assert!(!f.monitor.is_running());
    }
}
