// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy for the storefront and its HTTP rendering.
//
// ERROR HANDLING PHILOSOPHY:
// - Validation and state errors carry a stable reason code and a readable
//   message the buyer can act on
// - Upstream, storage and configuration failures are logged in full but
//   rendered with a generic message
// - The underlying text rides along as a response extension; the router's
//   `attach_details` layer puts it in the body as `details` only when the
//   app state says diagnostics are on (non-production)
// =============================================================================

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // REQUESTER ERRORS
    // -------------------------------------------------------------------------
    /// Missing or invalid identity
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Order/product/coupon absent, or not owned by the requester
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or malformed input fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Webhook callback failed authenticity checks
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // -------------------------------------------------------------------------
    // BUSINESS RULE ERRORS
    // -------------------------------------------------------------------------
    /// Transition not permitted from the current status
    #[error("{message}")]
    InvalidState { code: &'static str, message: String },

    /// Ledger cannot cover the requested quantity
    #[error("Insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    // -------------------------------------------------------------------------
    // DEPENDENCY ERRORS
    // -------------------------------------------------------------------------
    /// Payment processor call failed or returned an unexpected shape
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Required secret or key is missing
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn already_paid() -> Self {
        AppError::InvalidState {
            code: "ALREADY_PAID",
            message: "Order already paid".to_string(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        AppError::InvalidState {
            code: "INVALID_STATE",
            message: message.into(),
        }
    }

    /// Stable reason code rendered as `error` in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidSignature(_) => "INVALID_SIGNATURE",
            AppError::InvalidState { code, .. } => code,
            AppError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Cache(_) => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState { .. } | AppError::InsufficientStock { .. } => {
                StatusCode::CONFLICT
            }
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_)
            | AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Buyer-facing message; dependency failures never leak their text here.
    fn public_message(&self) -> String {
        match self {
            AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::InvalidSignature(msg) => msg.clone(),
            AppError::InvalidState { message, .. } => message.clone(),
            AppError::InsufficientStock { available, requested } => {
                format!("Available: {}, Requested: {}", available, requested)
            }
            AppError::Upstream(_) => "Payment provider request failed".to_string(),
            AppError::Configuration(_) => "Service is not configured".to_string(),
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Cache(_) => "A cache error occurred".to_string(),
            AppError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    fn is_server_side(&self) -> bool {
        self.status().is_server_error()
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.public_message();

        if self.is_server_side() {
            tracing::error!(error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code, message = %message, "Request rejected");
        }

        let body = ErrorResponse::new(error_code, message);
        let detailed = self
            .is_server_side()
            .then(|| DiagnosticBody(body.clone().with_details(Some(self.to_string()))));

        let mut response = (status, Json(body)).into_response();
        if let Some(detailed) = detailed {
            response.extensions_mut().insert(detailed);
        }
        response
    }
}

/// Error body including the underlying error text, carried on server-side
/// error responses for [`attach_details`].
#[derive(Debug, Clone)]
pub struct DiagnosticBody(pub ErrorResponse);

/// Swap in the detailed error body when `diagnostics` is on; otherwise the
/// generic body goes out untouched.
pub async fn attach_details(State(diagnostics): State<bool>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    match response.extensions_mut().remove::<DiagnosticBody>() {
        Some(DiagnosticBody(body)) if diagnostics => (response.status(), Json(body)).into_response(),
        _ => response,
    }
}

pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}
