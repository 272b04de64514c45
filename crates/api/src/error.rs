//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use frontdesk_core::CoreError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Gone(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal detail stays in the logs, not the response body.
            if let ApiError::Internal(detail) = &self {
                tracing::error!(detail = %detail, "Internal error");
            }
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(msg) => ApiError::BadRequest(msg),
            CoreError::PassNotFound => ApiError::NotFound("booking link not found".to_string()),
            CoreError::PassAlreadyUsed => {
                ApiError::Conflict("booking link already used".to_string())
            }
            CoreError::PassExpired => ApiError::Gone("booking link expired".to_string()),
            CoreError::MemberNotFound(id) => ApiError::NotFound(format!("member {id} not found")),
            CoreError::WaiverNotFound(id) => ApiError::NotFound(format!("waiver {id} not found")),
            CoreError::IssueNotFound(id) => {
                ApiError::NotFound(format!("booking issue {id} not found"))
            }
            CoreError::InsufficientCredits {
                balance, requested, ..
            } => ApiError::Conflict(format!(
                "insufficient credits: balance {balance}, requested {requested}"
            )),
            CoreError::AlreadyProcessed(what) => {
                ApiError::Conflict(format!("already processed: {what}"))
            }
            CoreError::WebhookSignatureInvalid => ApiError::Unauthorized,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn pass_errors_map_to_link_statuses() {
        assert_eq!(
            ApiError::from(CoreError::PassNotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(CoreError::PassAlreadyUsed).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(CoreError::PassExpired).status(),
            StatusCode::GONE
        );
    }

    #[test]
    fn database_errors_hide_detail() {
        let err = ApiError::from(CoreError::Database("connection reset".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "internal error");
    }
}
