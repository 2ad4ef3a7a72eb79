//! MCP Client for Downstream Connections
//!
//! Handles HTTP and Stdio connections to downstream MCP servers. A
//! [`Connector`] opens one [`DownstreamClient`] per (session, server); the
//! connection pool and the health monitor only see the traits.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metagate_shared::{McpAuth, McpTransport, ServerParams};
use reqwest::Client;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::types::*;
use crate::error::{GatewayError, GatewayResult};

/// Protocol version announced during initialize
const PROTOCOL_VERSION: &str = "2025-06-18";

/// Maximum number of retry attempts for transient HTTP failures
const MAX_RETRIES: usize = 3;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (5 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Grace period for a stdio process to exit after stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Error type for MCP client operations
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("MCP server returned error: {0}")]
    McpError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Process spawn failed: {0}")]
    ProcessError(String),
}

impl McpClientError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            // Retry network-related errors and timeouts
            McpClientError::HttpError(_) => true,
            McpClientError::Timeout => true,
            McpClientError::IoError(_) => true,

            // Don't retry permanent errors
            McpClientError::Cancelled => false,
            McpClientError::McpError(_) => false,
            McpClientError::ConnectionClosed => false,
            McpClientError::InvalidResponse => false,
            McpClientError::ProcessError(_) => false,
            McpClientError::JsonError(_) => false,
        }
    }

    /// Convert into a gateway error, keeping the server name for context
    pub fn into_gateway(self, server_name: &str) -> GatewayError {
        match self {
            McpClientError::Timeout => GatewayError::Timeout(server_name.to_string()),
            McpClientError::Cancelled => GatewayError::Cancelled,
            McpClientError::McpError(message) => GatewayError::Downstream(message),
            other => GatewayError::connection(server_name, other.to_string()),
        }
    }
}

/// Result type for MCP client operations
pub type McpResult<T> = Result<T, McpClientError>;

/// Per-request limits for a downstream call
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// A live connection to one downstream server
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    /// Server info announced during the handshake
    fn server_info(&self) -> ServerInfo;

    /// Whether the server advertised the tools capability
    fn supports_tools(&self) -> bool;

    async fn list_tools(
        &self,
        cursor: Option<String>,
        options: &CallOptions,
    ) -> GatewayResult<ToolsListResult>;

    async fn call_tool(
        &self,
        params: ToolCallParams,
        options: &CallOptions,
    ) -> GatewayResult<ToolCallResult>;

    /// Release the underlying transport. Safe to call more than once.
    async fn close(&self);
}

/// Opens downstream connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        params: &ServerParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<Arc<dyn DownstreamClient>>;
}

/// Parse response body handling both JSON and SSE (Server-Sent Events) formats
fn parse_response_body(body: &str) -> McpResult<JsonRpcResponse> {
    let trimmed = body.trim();

    if trimmed.starts_with("event:") || trimmed.starts_with("data:") {
        // Keep the last JSON-RPC response in the stream
        let mut last: Option<JsonRpcResponse> = None;
        for line in trimmed.lines() {
            if let Some(json_str) = line.trim().strip_prefix("data:") {
                let json_str = json_str.trim();
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(json_str) {
                    last = Some(parsed);
                }
            }
        }
        return last.ok_or(McpClientError::InvalidResponse);
    }

    serde_json::from_str(trimmed).map_err(McpClientError::from)
}

fn apply_auth(builder: reqwest::RequestBuilder, auth: &McpAuth) -> reqwest::RequestBuilder {
    match auth {
        McpAuth::None => builder,
        McpAuth::Bearer { token } => builder.bearer_auth(token),
        McpAuth::ApiKey { header, value } => builder.header(header.as_str(), value.as_str()),
        McpAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
    }
}

// =============================================================================
// Transports
// =============================================================================

struct HttpTransport {
    client: Client,
    endpoint_url: String,
    auth: McpAuth,
    session_id: std::sync::RwLock<Option<String>>,
}

impl HttpTransport {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    async fn send_once(&self, request: &JsonRpcRequest) -> McpResult<Option<JsonRpcResponse>> {
        let mut builder = apply_auth(self.client.post(&self.endpoint_url), &self.auth);
        if let Some(session_id) = self.session_id() {
            builder = builder.header("Mcp-Session-Id", session_id);
        }

        let response = builder
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(request)
            .send()
            .await?;

        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.write() {
                *slot = Some(session_id.to_string());
            }
        }

        if response.status() == reqwest::StatusCode::NOT_FOUND && self.session_id().is_some() {
            // The server dropped our session
            return Err(McpClientError::ConnectionClosed);
        }
        let response = response.error_for_status()?;

        // Notifications get 202 with an empty body
        if request.id.is_none() {
            return Ok(None);
        }

        let body = response.text().await?;
        parse_response_body(&body).map(Some)
    }

    /// Send with exponential backoff on transient failures
    async fn send(&self, request: &JsonRpcRequest) -> McpResult<Option<JsonRpcResponse>> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.send_once(request).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        endpoint = %self.endpoint_url,
                        error = %e,
                        "Transient error - will retry"
                    );
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    async fn close(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let builder = apply_auth(self.client.delete(&self.endpoint_url), &self.auth);
        if let Err(e) = builder.header("Mcp-Session-Id", session_id).send().await {
            tracing::debug!(endpoint = %self.endpoint_url, error = %e, "Session delete failed");
        }
    }
}

struct StdioProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

struct StdioTransport {
    server_name: String,
    process: Mutex<StdioProcess>,
    closed: AtomicBool,
}

impl StdioTransport {
    fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> McpResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpClientError::ProcessError(format!("Failed to spawn {}: {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stderr".to_string()))?;

        let server = server_name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if trimmed.contains("ERROR") || trimmed.contains("FATAL") {
                            tracing::error!(server = %server, stderr = %trimmed);
                        } else if trimmed.contains("WARN") {
                            tracing::warn!(server = %server, stderr = %trimmed);
                        } else {
                            tracing::debug!(server = %server, stderr = %trimmed);
                        }
                    }
                    Err(e) => {
                        tracing::error!(server = %server, error = %e, "Failed to read stderr");
                        break;
                    }
                }
            }

            tracing::debug!(server = %server, "stderr reader task exiting");
        });

        Ok(Self {
            server_name: server_name.to_string(),
            process: Mutex::new(StdioProcess {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, request: &JsonRpcRequest) -> McpResult<Option<JsonRpcResponse>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpClientError::ConnectionClosed);
        }

        let mut process = self.process.lock().await;
        let result = Self::exchange(&mut process, request).await;

        if let Err(McpClientError::IoError(_) | McpClientError::ConnectionClosed) = &result {
            tracing::error!(server = %self.server_name, "Stdio process died");
            self.closed.store(true, Ordering::Release);
            let _ = process.child.kill().await;
        }
        result
    }

    async fn exchange(
        process: &mut StdioProcess,
        request: &JsonRpcRequest,
    ) -> McpResult<Option<JsonRpcResponse>> {
        let stdin = process
            .stdin
            .as_mut()
            .ok_or(McpClientError::ConnectionClosed)?;

        let mut request_json = serde_json::to_string(request)?;
        request_json.push('\n');
        stdin.write_all(request_json.as_bytes()).await?;
        stdin.flush().await?;

        let Some(id) = &request.id else {
            return Ok(None);
        };

        // Skip server notifications and log lines until our response shows up
        let mut line = String::new();
        loop {
            line.clear();
            if process.stdout.read_line(&mut line).await? == 0 {
                return Err(McpClientError::ConnectionClosed);
            }
            match serde_json::from_str::<JsonRpcResponse>(line.trim()) {
                Ok(response) if response.id.as_ref() == Some(id) => return Ok(Some(response)),
                Ok(_) => continue,
                Err(_) => {
                    tracing::trace!(line = %line.trim(), "Ignoring non-response stdout line");
                }
            }
        }
    }

    /// Mark the transport dead after a timed-out read left the stream mid-message
    async fn abandon(&self) {
        self.closed.store(true, Ordering::Release);
        let mut process = self.process.lock().await;
        let _ = process.child.kill().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut process = self.process.lock().await;

        // Try graceful shutdown by closing stdin
        drop(process.stdin.take());

        match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server_name, ?status, "Process exited gracefully");
            }
            Ok(Err(e)) => {
                tracing::error!(server = %self.server_name, error = %e, "Error waiting for process");
            }
            Err(_) => {
                tracing::warn!(server = %self.server_name, "Killing unresponsive process");
                let _ = process.child.kill().await;
            }
        }
    }
}

enum Transport {
    Http(HttpTransport),
    Stdio(StdioTransport),
}

// =============================================================================
// Connection
// =============================================================================

/// Initialized connection to one downstream server
pub struct McpConnection {
    params: ServerParams,
    transport: Transport,
    init: std::sync::OnceLock<InitializeResult>,
    next_id: AtomicI64,
}

impl McpConnection {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let send = async {
            match &self.transport {
                Transport::Http(http) => http.send(&request).await,
                Transport::Stdio(stdio) => stdio.send(&request).await,
            }
        };

        let response = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => Err(McpClientError::Cancelled),
            result = tokio::time::timeout(options.timeout, send) => {
                result.unwrap_or(Err(McpClientError::Timeout))
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(err @ (McpClientError::Timeout | McpClientError::Cancelled)) => {
                if let Transport::Stdio(stdio) = &self.transport {
                    stdio.abandon().await;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let response = response.ok_or(McpClientError::InvalidResponse)?;
        if let Some(error) = response.error {
            return Err(McpClientError::McpError(error.message));
        }
        response.result.ok_or(McpClientError::InvalidResponse)
    }

    async fn notify(&self, method: &str) {
        let notification = JsonRpcRequest::notification(method);
        let result = match &self.transport {
            Transport::Http(http) => http.send(&notification).await,
            Transport::Stdio(stdio) => stdio.send(&notification).await,
        };
        if let Err(e) = result {
            tracing::debug!(server = %self.params.name, error = %e, method, "Notification failed");
        }
    }

    async fn initialize(&self, options: &CallOptions) -> McpResult<()> {
        let params = serde_json::to_value(InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::default(),
            client_info: ClientInfo {
                name: "metagate".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })?;

        let result: InitializeResult =
            serde_json::from_value(self.request("initialize", Some(params), options).await?)?;
        let _ = self.init.set(result);

        self.notify("notifications/initialized").await;
        Ok(())
    }
}

#[async_trait]
impl DownstreamClient for McpConnection {
    fn server_info(&self) -> ServerInfo {
        self.init
            .get()
            .map(|i| i.server_info.clone())
            .unwrap_or_default()
    }

    fn supports_tools(&self) -> bool {
        self.init
            .get()
            .map(|i| i.capabilities.tools.is_some())
            .unwrap_or(false)
    }

    async fn list_tools(
        &self,
        cursor: Option<String>,
        options: &CallOptions,
    ) -> GatewayResult<ToolsListResult> {
        let params = match cursor {
            Some(cursor) => serde_json::json!({ "cursor": cursor }),
            None => serde_json::json!({}),
        };
        let value = self
            .request("tools/list", Some(params), options)
            .await
            .map_err(|e| e.into_gateway(&self.params.name))?;
        serde_json::from_value(value)
            .map_err(|e| McpClientError::from(e).into_gateway(&self.params.name))
    }

    async fn call_tool(
        &self,
        params: ToolCallParams,
        options: &CallOptions,
    ) -> GatewayResult<ToolCallResult> {
        let params = serde_json::to_value(params)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let value = self
            .request("tools/call", Some(params), options)
            .await
            .map_err(|e| e.into_gateway(&self.params.name))?;
        serde_json::from_value(value)
            .map_err(|e| McpClientError::from(e).into_gateway(&self.params.name))
    }

    async fn close(&self) {
        match &self.transport {
            Transport::Http(http) => http.close().await,
            Transport::Stdio(stdio) => stdio.close().await,
        }
    }
}

/// Opens HTTP, SSE and stdio connections
pub struct McpConnector {
    http_client: Client,
    handshake_timeout: Duration,
}

impl McpConnector {
    pub fn new(handshake_timeout: Duration) -> McpResult<Self> {
        let http_client = Client::builder().pool_max_idle_per_host(10).build()?;
        Ok(Self {
            http_client,
            handshake_timeout,
        })
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn connect(
        &self,
        params: &ServerParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<Arc<dyn DownstreamClient>> {
        let transport = match &params.transport {
            // SSE endpoints accept the same POST-based exchange
            McpTransport::Http { endpoint_url, auth } | McpTransport::Sse { endpoint_url, auth } => {
                Transport::Http(HttpTransport {
                    client: self.http_client.clone(),
                    endpoint_url: endpoint_url.clone(),
                    auth: auth.clone(),
                    session_id: std::sync::RwLock::new(None),
                })
            }
            McpTransport::Stdio { command, args, env } => Transport::Stdio(
                StdioTransport::spawn(&params.name, command, args, env)
                    .map_err(|e| e.into_gateway(&params.name))?,
            ),
        };

        let connection = McpConnection {
            params: params.clone(),
            transport,
            init: std::sync::OnceLock::new(),
            next_id: AtomicI64::new(0),
        };

        let options = CallOptions::with_cancel(self.handshake_timeout, cancel.child_token());
        if let Err(e) = connection.initialize(&options).await {
            connection.close().await;
            return Err(e.into_gateway(&params.name));
        }

        tracing::info!(
            server = %params.name,
            transport = params.transport.kind(),
            "Connected to downstream MCP"
        );
        Ok(Arc::new(connection))
    }
}
