//! Gateway error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metagate_shared::RepositoryError;
use serde_json::json;

/// Gateway error type
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    // Downstream errors
    #[error("Connection to {server} failed: {message}")]
    ConnectionFailure { server: String, message: String },
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Server {0} is in error state after repeated crashes")]
    CrashErrorState(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Downstream error: {0}")]
    Downstream(String),

    // Sandboxed execution
    #[error("Recursive call to {0} is not allowed from sandboxed execution")]
    RecursiveExecution(String),

    // Pool errors
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    // Collaborator errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::ConnectionFailure {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error means the downstream transport is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, GatewayError::ConnectionFailure { .. })
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::InvalidToolName(_) => "INVALID_TOOL_NAME",
            GatewayError::ConnectionFailure { .. } => "CONNECTION_FAILURE",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::CrashErrorState(_) => "CRASH_ERROR_STATE",
            GatewayError::Cancelled => "CANCELLED",
            GatewayError::Downstream(_) => "DOWNSTREAM_ERROR",
            GatewayError::RecursiveExecution(_) => "RECURSIVE_EXECUTION",
            GatewayError::Unavailable(_) => "UNAVAILABLE",
            GatewayError::Repository(_) => "REPOSITORY_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidToolName(_) => StatusCode::BAD_REQUEST,
            GatewayError::RecursiveExecution(_) => StatusCode::FORBIDDEN,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectionFailure { .. }
            | GatewayError::CrashErrorState(_)
            | GatewayError::Downstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Cancelled => StatusCode::CONFLICT,
            GatewayError::Repository(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Repository details stay in the logs
        let message = match &self {
            GatewayError::Repository(err) => {
                tracing::error!(error = %err, "Repository error");
                "Repository error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (status, body) = render(GatewayError::RecursiveExecution("run_code".to_string())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "RECURSIVE_EXECUTION");

        let (status, body) = render(GatewayError::connection("fs", "EOF")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "CONNECTION_FAILURE");

        let (status, body) = render(GatewayError::Unavailable("ns".to_string())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_repository_details_are_hidden() {
        let err = GatewayError::from(RepositoryError::Unavailable("db password rejected".to_string()));
        let (status, body) = render(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "REPOSITORY_ERROR");
        assert_eq!(body["error"]["message"], "Repository error");
    }
}
