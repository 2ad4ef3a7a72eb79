//! Runtime assembly
//!
//! Builds every engine component from a [`Config`] and a set of repositories,
//! wires the cross-component handles, and owns the background tasks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metagate_shared::{
    NamespaceRepository, PolicyRepository, RateLimitRuleRepository, ServerRepository,
    ToolCallLogRepository, ToolOverrideRepository, ToolRepository,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crash::{CrashTracker, ServerErrorTracker};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{ChangeFeed, ChangeListener, InvalidationTargets};
use crate::health::HealthMonitor;
use crate::mcp::client::{Connector, McpConnector};
use crate::mcp::connection_pool::ConnectionPool;
use crate::middleware::ToolStatusFilter;
use crate::overrides::ToolOverrides;
use crate::policy::PolicyEvaluator;
use crate::pool::NamespaceServerPool;
use crate::proxy::{AgentRunner, CodeExecutor, GatewayDeps, MetaToolProvider, NamespaceGatewayFactory};
use crate::rate_limit::{FixedWindowLimiter, RateLimitRules};
use crate::reconnect::{ReconnectConfig, ReconnectCoordinator, ReconnectScheduler};
use crate::sync_cache::ToolsSyncCache;

/// How often expired rate-limit windows and override cache entries are dropped
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Repository handles consumed by the engine
#[derive(Clone)]
pub struct Repositories {
    pub servers: Arc<dyn ServerRepository>,
    pub namespaces: Arc<dyn NamespaceRepository>,
    pub overrides: Arc<dyn ToolOverrideRepository>,
    pub tools: Arc<dyn ToolRepository>,
    pub rate_limit_rules: Arc<dyn RateLimitRuleRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub call_logs: Option<Arc<dyn ToolCallLogRepository>>,
}

impl Repositories {
    /// Use one store for every repository
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ServerRepository
            + NamespaceRepository
            + ToolOverrideRepository
            + ToolRepository
            + RateLimitRuleRepository
            + PolicyRepository
            + ToolCallLogRepository
            + 'static,
    {
        Self {
            servers: store.clone(),
            namespaces: store.clone(),
            overrides: store.clone(),
            tools: store.clone(),
            rate_limit_rules: store.clone(),
            policies: store.clone(),
            call_logs: Some(store),
        }
    }
}

pub struct GatewayBuilder {
    config: Config,
    repositories: Repositories,
    connector: Option<Arc<dyn Connector>>,
    meta_tools: Option<Arc<dyn MetaToolProvider>>,
    code_executor: Option<Arc<dyn CodeExecutor>>,
    agent_runner: Option<Arc<dyn AgentRunner>>,
}

impl GatewayBuilder {
    /// Replace the default MCP transport connector
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn meta_tools(mut self, provider: Arc<dyn MetaToolProvider>) -> Self {
        self.meta_tools = Some(provider);
        self
    }

    pub fn code_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.code_executor = Some(executor);
        self
    }

    pub fn agent_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.agent_runner = Some(runner);
        self
    }

    pub fn build(self) -> GatewayResult<Gateway> {
        let config = Arc::new(self.config);
        let repos = self.repositories;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                McpConnector::new(config.call_timeout())
                    .map_err(|e| GatewayError::Internal(format!("MCP connector: {}", e)))?,
            ),
        };

        let crash_tracker: Arc<dyn CrashTracker> = Arc::new(ServerErrorTracker::new(config.mcp_max_attempts));
        let connections = Arc::new(ConnectionPool::new(connector.clone(), crash_tracker.clone()));

        let health = Arc::new(HealthMonitor::new(
            &config,
            repos.servers.clone(),
            connector,
            crash_tracker.clone(),
        ));
        let reconnect = ReconnectCoordinator::new(
            ReconnectConfig::from_config(&config),
            repos.servers.clone(),
            connections.clone(),
            crash_tracker.clone(),
            health.clone(),
        );
        let scheduler: Arc<dyn ReconnectScheduler> = reconnect.clone();
        health.set_reconnect_scheduler(&scheduler)?;
        reconnect.start_crash_listener(connections.subscribe_crashes());

        let overrides = Arc::new(ToolOverrides::new(
            repos.overrides.clone(),
            Duration::from_millis(config.tool_override_cache_ttl_ms),
        ));
        let tool_status = Arc::new(ToolStatusFilter::new(repos.namespaces.clone()));
        let rate_limit_rules = Arc::new(RateLimitRules::new(repos.rate_limit_rules.clone()));
        let limiter = Arc::new(FixedWindowLimiter::new());
        let sync_cache = Arc::new(ToolsSyncCache::new());

        let deps = GatewayDeps {
            config: config.clone(),
            namespaces: repos.namespaces.clone(),
            tool_repository: repos.tools.clone(),
            connections: connections.clone(),
            sync_cache: sync_cache.clone(),
            overrides: overrides.clone(),
            policies: Arc::new(PolicyEvaluator::new(repos.policies.clone())),
            rate_limit_rules: rate_limit_rules.clone(),
            limiter: limiter.clone(),
            tool_status: tool_status.clone(),
            call_logs: repos.call_logs.clone(),
            meta_tools: self.meta_tools,
            code_executor: self.code_executor,
            agent_runner: self.agent_runner,
        };
        let pool = NamespaceServerPool::new(
            Arc::new(NamespaceGatewayFactory::new(deps)),
            config.session_lifetime(),
        );

        Ok(Gateway {
            config,
            repositories: repos,
            crash_tracker,
            connections,
            health,
            reconnect,
            pool,
            overrides,
            tool_status,
            rate_limit_rules,
            limiter,
            sync_cache,
            changes: Arc::new(ChangeFeed::default()),
            listener: tokio::sync::Mutex::new(None),
            janitor: Mutex::new(None),
        })
    }
}

struct Janitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The assembled engine
pub struct Gateway {
    pub config: Arc<Config>,
    pub repositories: Repositories,
    pub crash_tracker: Arc<dyn CrashTracker>,
    pub connections: Arc<ConnectionPool>,
    pub health: Arc<HealthMonitor>,
    pub reconnect: Arc<ReconnectCoordinator>,
    pub pool: Arc<NamespaceServerPool>,
    pub overrides: Arc<ToolOverrides>,
    pub tool_status: Arc<ToolStatusFilter>,
    pub rate_limit_rules: Arc<RateLimitRules>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub sync_cache: Arc<ToolsSyncCache>,
    pub changes: Arc<ChangeFeed>,
    listener: tokio::sync::Mutex<Option<ChangeListener>>,
    janitor: Mutex<Option<Janitor>>,
}

impl Gateway {
    pub fn builder(config: Config, repositories: Repositories) -> GatewayBuilder {
        GatewayBuilder {
            config,
            repositories,
            connector: None,
            meta_tools: None,
            code_executor: None,
            agent_runner: None,
        }
    }

    fn invalidation_targets(&self) -> InvalidationTargets {
        InvalidationTargets {
            pool: self.pool.clone(),
            overrides: self.overrides.clone(),
            tool_status: self.tool_status.clone(),
            rate_limit_rules: self.rate_limit_rules.clone(),
        }
    }

    /// Start background work and warm one idle gateway per namespace
    pub async fn start(&self) {
        {
            let mut listener = self.listener.lock().await;
            if listener.is_none() {
                *listener = Some(ChangeListener::spawn(
                    self.invalidation_targets(),
                    self.changes.subscribe(),
                ));
            }
        }

        self.health.start_periodic_checks();
        self.pool
            .start_expiry_sweep(Duration::from_millis(self.config.session_sweep_interval_ms));
        self.start_janitor();

        match self.repositories.namespaces.list_namespaces().await {
            Ok(namespaces) => {
                let uuids: Vec<_> = namespaces.iter().map(|n| n.uuid).collect();
                self.pool.ensure_idle_servers(&uuids).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list namespaces for warm-up"),
        }

        tracing::info!("Gateway runtime started");
    }

    fn start_janitor(&self) {
        let mut janitor = self.janitor.lock().unwrap_or_else(PoisonError::into_inner);
        if janitor.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let limiter = self.limiter.clone();
        let overrides = self.overrides.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let windows = limiter.cleanup().await;
                        overrides.cache().cleanup();
                        if windows > 0 {
                            tracing::debug!(windows, "Expired rate limit windows dropped");
                        }
                    }
                }
            }
        });

        *janitor = Some(Janitor { cancel, handle });
    }

    /// Stop background work and close every gateway and connection
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(janitor) = janitor {
            janitor.cancel.cancel();
            janitor.handle.abort();
        }

        self.health.stop_periodic_checks();
        self.reconnect.stop_crash_listener();
        self.reconnect.cancel_all_reconnections();
        self.pool.cleanup_all().await;
        self.connections.cleanup_all().await;

        tracing::info!("Gateway runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::DownstreamClient;
    use metagate_shared::{InMemoryStore, Namespace, NamespaceId, ServerParams};

    struct RefusingConnector;

    #[async_trait::async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            params: &ServerParams,
            _cancel: &CancellationToken,
        ) -> GatewayResult<Arc<dyn DownstreamClient>> {
            Err(GatewayError::connection(&params.name, "refused"))
        }
    }

    #[tokio::test]
    async fn test_start_warms_namespaces_and_shutdown_drains() {
        let store = Arc::new(InMemoryStore::new());
        let ns = NamespaceId::new();
        store
            .insert_namespace(Namespace {
                uuid: ns,
                name: "default".to_string(),
                user_id: None,
            })
            .await;

        let gateway = Gateway::builder(Config::default(), Repositories::from_store(store))
            .connector(Arc::new(RefusingConnector))
            .build()
            .unwrap();

        gateway.start().await;
        let status = gateway.pool.status().await;
        assert_eq!(status.idle_namespaces, vec![ns]);
        assert!(gateway.health.is_running());

        gateway.shutdown().await;
        assert_eq!(gateway.pool.status().await.idle, 0);
        assert!(!gateway.health.is_running());
    }
}
