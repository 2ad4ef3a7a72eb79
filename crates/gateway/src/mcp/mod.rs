//! Downstream MCP Module
//!
//! Everything the gateway needs to talk to downstream tool servers.
//!
//! # Architecture
//!
//! ```text
//! Gateway instance --> ConnectionPool --(session, server)--> McpConnection --> stdio child
//!                                                                        \--> HTTP/SSE endpoint
//! ```
//!
//! # Features
//!
//! - Tool namespacing: `{server_name}__{tool_name}` to prevent conflicts
//! - Lazy per-session connections with crash reporting
//! - HTTP, SSE and Stdio transport support

pub mod client;
pub mod connection_pool;
pub mod tool_name;
pub mod types;

pub use client::{CallOptions, Connector, DownstreamClient, McpConnector};
pub use connection_pool::{ConnectionPool, ConnectionPoolStatus, CrashSignal};
pub use tool_name::{parse_tool_name, prefix_tool_name, ParsedToolName};
pub use types::*;
