//! Gateway configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Lowest accepted health check interval
pub const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;

/// Gateway configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub registry_file: Option<String>,

    // Downstream calls
    pub mcp_timeout_ms: u64,
    pub mcp_max_total_timeout_ms: u64,
    pub mcp_max_attempts: u32, // crashes before a server is hard-errored

    // Sessions
    pub session_lifetime_ms: Option<u64>, // None keeps sessions forever
    pub session_sweep_interval_ms: u64,

    // Health monitoring
    pub health_check_interval_ms: u64,
    pub health_unhealthy_threshold: u32,

    // Reconnection
    pub reconnect_enabled: bool,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter_factor: f64,
    pub auto_reconnect_on_crash: bool,
    pub auto_reconnect_on_health_failure: bool,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_default_max_requests: u32,
    pub rate_limit_default_window_ms: u64,

    // Tool catalog
    pub tool_override_cache_ttl_ms: u64,
    pub deferred_tool_loading: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3100".to_string(),
            registry_file: None,
            mcp_timeout_ms: 60_000,
            mcp_max_total_timeout_ms: 60_000,
            mcp_max_attempts: 1,
            session_lifetime_ms: None,
            session_sweep_interval_ms: 300_000,
            health_check_interval_ms: 60_000,
            health_unhealthy_threshold: 3,
            reconnect_enabled: true,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_jitter_factor: 0.2,
            auto_reconnect_on_crash: true,
            auto_reconnect_on_health_failure: true,
            rate_limit_enabled: false,
            rate_limit_default_max_requests: 60,
            rate_limit_default_window_ms: 60_000,
            tool_override_cache_ttl_ms: 1_000,
            deferred_tool_loading: true,
        }
    }
}

/// Parse an env var, falling back to the default when unset or malformed
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            registry_file: env::var("METAGATE_REGISTRY_FILE")
                .ok()
                .filter(|v| !v.is_empty()),

            // Downstream calls
            mcp_timeout_ms: env_or("MCP_TIMEOUT_MS", defaults.mcp_timeout_ms),
            mcp_max_total_timeout_ms: env_or(
                "MCP_MAX_TOTAL_TIMEOUT_MS",
                defaults.mcp_max_total_timeout_ms,
            ),
            mcp_max_attempts: env_or("MCP_MAX_ATTEMPTS", defaults.mcp_max_attempts),

            // Sessions
            session_lifetime_ms: env::var("SESSION_LIFETIME_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|ms: &u64| *ms > 0),
            session_sweep_interval_ms: env_or(
                "SESSION_SWEEP_INTERVAL_MS",
                defaults.session_sweep_interval_ms,
            ),

            // Health monitoring
            health_check_interval_ms: {
                let interval = env_or(
                    "HEALTH_CHECK_INTERVAL_MS",
                    defaults.health_check_interval_ms,
                );
                // Below the floor falls back to the default
                if interval < MIN_HEALTH_CHECK_INTERVAL_MS {
                    defaults.health_check_interval_ms
                } else {
                    interval
                }
            },
            health_unhealthy_threshold: env_or(
                "HEALTH_UNHEALTHY_THRESHOLD",
                defaults.health_unhealthy_threshold,
            ),

            // Reconnection
            reconnect_enabled: env_or("RECONNECT_ENABLED", defaults.reconnect_enabled),
            reconnect_max_attempts: env_or(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            ),
            reconnect_base_delay_ms: env_or(
                "RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
            reconnect_max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay_ms),
            reconnect_jitter_factor: env_or(
                "RECONNECT_JITTER_FACTOR",
                defaults.reconnect_jitter_factor,
            ),
            auto_reconnect_on_crash: env_or(
                "AUTO_RECONNECT_ON_CRASH",
                defaults.auto_reconnect_on_crash,
            ),
            auto_reconnect_on_health_failure: env_or(
                "AUTO_RECONNECT_ON_HEALTH_FAILURE",
                defaults.auto_reconnect_on_health_failure,
            ),

            // Rate limiting
            rate_limit_enabled: env_or("RATE_LIMIT_ENABLED", defaults.rate_limit_enabled),
            rate_limit_default_max_requests: env_or(
                "RATE_LIMIT_DEFAULT_MAX_REQUESTS",
                defaults.rate_limit_default_max_requests,
            ),
            rate_limit_default_window_ms: env_or(
                "RATE_LIMIT_DEFAULT_WINDOW_MS",
                defaults.rate_limit_default_window_ms,
            ),

            // Tool catalog
            tool_override_cache_ttl_ms: env_or(
                "TOOL_OVERRIDE_CACHE_TTL_MS",
                defaults.tool_override_cache_ttl_ms,
            ),
            deferred_tool_loading: env_or(
                "DEFERRED_TOOL_LOADING",
                defaults.deferred_tool_loading,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the reconnect and health state machines
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.reconnect_jitter_factor) {
            return Err(ConfigError::OutOfRange(
                "RECONNECT_JITTER_FACTOR must be between 0 and 1",
            ));
        }
        if self.health_unhealthy_threshold == 0 {
            return Err(ConfigError::OutOfRange(
                "HEALTH_UNHEALTHY_THRESHOLD must be at least 1",
            ));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::OutOfRange(
                "RECONNECT_BASE_DELAY_MS must not exceed RECONNECT_MAX_DELAY_MS",
            ));
        }
        if self.mcp_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange("MCP_TIMEOUT_MS must be positive"));
        }
        Ok(())
    }

    /// Per-call timeout, capped by the max total timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.mcp_timeout_ms.min(self.mcp_max_total_timeout_ms.max(1)))
    }

    pub fn session_lifetime(&self) -> Option<Duration> {
        self.session_lifetime_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration value out of range: {0}")]
    OutOfRange(&'static str),
}
