use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// API Error with rich context and automatic error trait implementations
///
/// Design: Uses thiserror for ergonomic error handling with context.
/// Each variant carries meaningful context to help with debugging.
#[derive(Error, Debug)]
pub enum ApiError {
    // Validation errors 1xxx
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    // Policy errors 2xxx
    #[error("Query rejected by policy: {0}")]
    PolicyRejection(String),

    // Budget errors 3xxx
    #[error("Insufficient privacy budget: remaining {remaining:.4}, requested {requested:.4}")]
    BudgetExhausted { remaining: f64, requested: f64 },

    // Rate limiting 4xxx
    #[error("Rate limit exceeded, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("Could not acquire budget lock for user {user_id}")]
    LockTimeout { user_id: String },

    // Execution errors 5xxx
    #[error("Executor error: {0}")]
    ExecutorError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_sql(message: impl Into<String>) -> Self {
        Self::InvalidSql(message.into())
    }

    pub fn policy_rejection(message: impl Into<String>) -> Self {
        Self::PolicyRejection(message.into())
    }

    pub fn budget_exhausted(remaining: f64, requested: f64) -> Self {
        Self::BudgetExhausted {
            remaining,
            requested,
        }
    }

    pub fn rate_limited(retry_after_secs: f64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    pub fn lock_timeout(user_id: impl Into<String>) -> Self {
        Self::LockTimeout {
            user_id: user_id.into(),
        }
    }

    pub fn executor_error(message: impl Into<String>) -> Self {
        Self::ExecutorError(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::ResourceNotFound(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Stable numeric code; ranges map to HTTP statuses.
    pub fn error_code(&self) -> i32 {
        match self {
            // Validation errors 1xxx
            Self::ValidationError(_) => 1001,
            Self::InvalidInput(_) => 1002,
            Self::InvalidSql(_) => 1003,

            // Policy errors 2xxx
            Self::PolicyRejection(_) => 2001,

            // Budget errors 3xxx
            Self::BudgetExhausted { .. } => 3001,

            // Rate limiting 4xxx
            Self::RateLimited { .. } => 4001,
            Self::LockTimeout { .. } => 4002,

            // Execution / system errors 5xxx
            Self::ExecutorError(_) => 5001,
            Self::ResourceNotFound(_) => 5404,
            Self::InternalError(_) => 5002,
            Self::Other(_) => 5002,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let message = self.to_string();

        let status = match &self {
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::InvalidSql(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PolicyRejection(_) => StatusCode::FORBIDDEN,
            Self::BudgetExhausted { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::ExecutorError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let retry_after = match &self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let response = ApiErrorResponse {
            code,
            message,
            retry_after,
        };
        (status, Json(response)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal_error(format!("JSON serialization error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
