use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// Unified error type shared by every crate in the workspace.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PdfChatError {
    // === request errors ===
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("forbidden: {operation}")]
    Unauthorized { operation: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("quota exceeded: {resource} is limited to {limit}")]
    QuotaExceeded { resource: String, limit: String },

    #[error("payload too large: {size} bytes exceeds {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    // === backend errors ===
    #[error("database error: {message}")]
    Database {
        message: String,
        #[serde(skip)]
        context: Option<DatabaseContext>,
    },

    #[error("object storage error: {operation} failed")]
    ObjectStorage { operation: String, message: String },

    #[error("vector store error: {operation} failed")]
    VectorStore { operation: String, message: String },

    #[error("llm service error ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<Duration>,
    },

    #[error("embedding service error ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<Duration>,
    },

    #[error("service unavailable: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<Duration>,
    },

    #[error("document parse error: {message}")]
    DocumentParse { message: String },

    // === system errors ===
    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("configuration error: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("serialization error: {format}")]
    Serialization { format: String, message: String },

    #[error("network error: {operation}")]
    Network { operation: String, message: String },

    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("concurrency error: {operation}")]
    Concurrency { operation: String, message: String },
}

/// Extra context attached to database failures.
#[derive(Debug, Clone, Default)]
pub struct DatabaseContext {
    pub query: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // expected request errors
    Medium,   // degraded dependency, request can be retried
    High,     // a backend failed
    Critical, // misconfiguration or broken invariant
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl PdfChatError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PdfChatError::NotFound { .. }
            | PdfChatError::InvalidRequest { .. }
            | PdfChatError::PayloadTooLarge { .. } => ErrorSeverity::Low,
            PdfChatError::Unauthorized { .. }
            | PdfChatError::Authentication { .. }
            | PdfChatError::QuotaExceeded { .. }
            | PdfChatError::DocumentParse { .. } => ErrorSeverity::Medium,
            PdfChatError::LlmService { .. }
            | PdfChatError::EmbeddingService { .. }
            | PdfChatError::ServiceUnavailable { .. }
            | PdfChatError::Network { .. }
            | PdfChatError::Timeout { .. } => ErrorSeverity::Medium,
            PdfChatError::Database { .. }
            | PdfChatError::ObjectStorage { .. }
            | PdfChatError::VectorStore { .. }
            | PdfChatError::Serialization { .. }
            | PdfChatError::Concurrency { .. } => ErrorSeverity::High,
            PdfChatError::Internal { .. } | PdfChatError::Configuration { .. } => {
                ErrorSeverity::Critical
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PdfChatError::ServiceUnavailable { retry_after, .. }
            | PdfChatError::LlmService { retry_after, .. }
            | PdfChatError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            PdfChatError::Network { .. }
            | PdfChatError::Timeout { .. }
            | PdfChatError::Concurrency { .. } => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PdfChatError::ServiceUnavailable { retry_after, .. }
            | PdfChatError::LlmService { retry_after, .. }
            | PdfChatError::EmbeddingService { retry_after, .. } => *retry_after,
            PdfChatError::Network { .. } => Some(Duration::from_millis(500)),
            PdfChatError::Timeout { .. } => Some(Duration::from_millis(1000)),
            PdfChatError::Concurrency { .. } => Some(Duration::from_millis(100)),
            _ => None,
        }
    }

    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    document_id = ?metadata.document_id,
                    error = %self,
                    "request rejected"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    document_id = ?metadata.document_id,
                    error = %self,
                    context = ?metadata.context,
                    "operation failed"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    document_id = ?metadata.document_id,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "backend failure"
                );
            }
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            PdfChatError::NotFound { .. } => 404,
            PdfChatError::InvalidRequest { .. } | PdfChatError::DocumentParse { .. } => 400,
            PdfChatError::Authentication { .. } => 401,
            PdfChatError::Unauthorized { .. } => 403,
            PdfChatError::PayloadTooLarge { .. } => 413,
            PdfChatError::QuotaExceeded { .. } => 429,
            PdfChatError::LlmService { .. } | PdfChatError::EmbeddingService { .. } => 502,
            PdfChatError::ServiceUnavailable { .. } => 503,
            PdfChatError::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            PdfChatError::NotFound { .. } => "The requested resource does not exist".to_string(),
            PdfChatError::InvalidRequest { reason } => format!("Invalid request: {}", reason),
            PdfChatError::DocumentParse { .. } => {
                "The document could not be read as a PDF".to_string()
            }
            PdfChatError::Authentication { .. } => "Please sign in again".to_string(),
            PdfChatError::Unauthorized { .. } => {
                "You are not allowed to perform this action".to_string()
            }
            PdfChatError::QuotaExceeded { resource, limit } => format!(
                "You have reached the limit of {} {} on your plan, upgrade to continue",
                limit, resource
            ),
            PdfChatError::PayloadTooLarge { limit, .. } => {
                format!("Files may be at most {} bytes", limit)
            }
            PdfChatError::LlmService { .. } | PdfChatError::EmbeddingService { .. } => {
                "Whoops... the assistant is having trouble answering right now".to_string()
            }
            PdfChatError::ServiceUnavailable { .. } | PdfChatError::Timeout { .. } => {
                "The service is temporarily unavailable, please retry".to_string()
            }
            _ => "Something went wrong on our side".to_string(),
        }
    }
}

pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                user_id: None,
                document_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.metadata.user_id = Some(user_id.to_string());
        self
    }

    pub fn document_id(mut self, document_id: &str) -> Self {
        self.metadata.document_id = Some(document_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &PdfChatError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, PdfChatError>;

// === conversions ===

impl From<serde_json::Error> for PdfChatError {
    fn from(err: serde_json::Error) -> Self {
        PdfChatError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PdfChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PdfChatError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000,
            }
        } else if err.is_connect() {
            PdfChatError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            PdfChatError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for PdfChatError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => PdfChatError::NotFound {
                resource: err.to_string(),
            },
            _ => PdfChatError::ObjectStorage {
                operation: "io".to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl From<tokio::task::JoinError> for PdfChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        PdfChatError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<qdrant_client::QdrantError> for PdfChatError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        PdfChatError::VectorStore {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for PdfChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PdfChatError::NotFound {
                resource: "row".to_string(),
            },
            other => PdfChatError::Database {
                message: other.to_string(),
                context: None,
            },
        }
    }
}

impl From<anyhow::Error> for PdfChatError {
    fn from(err: anyhow::Error) -> Self {
        PdfChatError::Internal {
            message: err.to_string(),
            details: None,
        }
    }
}

#[cfg(feature = "axum")]
impl IntoResponse for PdfChatError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}
