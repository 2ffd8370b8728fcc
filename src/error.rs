use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    TokenExpired,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid webhook signature")]
    InvalidWebhookSignature,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("resource already exists")]
    ResourceAlreadyExists,
    #[error("resource conflict: {0}")]
    ResourceConflict(String),
    #[error("resource gone")]
    ResourceGone,
    #[error("upstream error: {status} {message}")]
    UpstreamError { status: u16, message: String },
    #[error("upstream rate limited, retry after {retry_after_secs}s")]
    UpstreamRateLimited { retry_after_secs: u64 },
    #[error("upstream unavailable")]
    UpstreamUnavailable,
    #[error("installation not found")]
    InstallationNotFound,
    #[error("workflow cannot rerun: {0}")]
    WorkflowCannotRerun(String),
    #[error("check-run action not supported: {0}")]
    CheckRunActionNotSupported(String),
    #[error("artifact expired")]
    ArtifactExpired,
    #[error("timeout")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::InvalidToken(_) => "invalid_token",
            AppError::TokenExpired => "token_expired",
            AppError::ValidationError(_) => "validation_error",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::InvalidWebhookSignature => "invalid_webhook_signature",
            AppError::ResourceNotFound => "resource_not_found",
            AppError::ResourceAlreadyExists => "resource_already_exists",
            AppError::ResourceConflict(_) => "resource_conflict",
            AppError::ResourceGone => "resource_gone",
            AppError::UpstreamError { .. } => "upstream_error",
            AppError::UpstreamRateLimited { .. } => "upstream_rate_limited",
            AppError::UpstreamUnavailable => "upstream_unavailable",
            AppError::InstallationNotFound => "installation_not_found",
            AppError::WorkflowCannotRerun(_) => "workflow_cannot_rerun",
            AppError::CheckRunActionNotSupported(_) => "check_run_action_not_supported",
            AppError::ArtifactExpired => "artifact_expired",
            AppError::Timeout => "timeout",
            AppError::Internal(_) => "internal",
        }
    }

    /// Status→HTTP mapping (spec §6).
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized
            | AppError::InvalidToken(_)
            | AppError::TokenExpired
            | AppError::InvalidWebhookSignature => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::InstallationNotFound => StatusCode::FORBIDDEN,
            AppError::ResourceNotFound => StatusCode::NOT_FOUND,
            AppError::ResourceAlreadyExists | AppError::ResourceConflict(_) => StatusCode::CONFLICT,
            AppError::ResourceGone | AppError::ArtifactExpired => StatusCode::GONE,
            AppError::CheckRunActionNotSupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::WorkflowCannotRerun(_) => StatusCode::CONFLICT,
            AppError::UpstreamError { .. } | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    timestamp: chrono::DateTime<Utc>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::error!(error = %self, code = self.code(), "request failed");
        let body = json!({
            "success": false,
            "error": ErrorBody {
                code: self.code(),
                message: self.to_string(),
                details: None,
                timestamp: Utc::now(),
            },
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout
        } else if let Some(status) = err.status() {
            AppError::UpstreamError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            AppError::UpstreamUnavailable
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AppError::InvalidToken(err.to_string())
    }
}

/// Envelope every control-API response is wrapped in (spec §6).
#[derive(Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
        })
    }
}
