//! MetaGate Gateway Library
//!
//! The proxy and pooling engine: per-namespace virtual MCP servers, the tool
//! request middleware pipeline, downstream health monitoring and
//! reconnection, and the status HTTP surface.

pub mod config;
pub mod crash;
pub mod error;
pub mod events;
pub mod health;
pub mod mcp;
pub mod middleware;
pub mod overrides;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod rate_limit;
pub mod reconnect;
pub mod routes;
pub mod runtime;
pub mod session_store;
pub mod sync_cache;

pub use config::{Config, ConfigError};
pub use error::{GatewayError, GatewayResult};
pub use events::{ChangeFeed, RegistryChange};
pub use pool::NamespaceServerPool;
pub use proxy::{GatewayFactory, GatewayInstance, GatewayServer};
pub use runtime::{Gateway, GatewayBuilder, Repositories};
