//! Core error types

use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the reconciliation core.
///
/// Business outcomes (`InsufficientCredits`, `AlreadyProcessed`) are modeled
/// as errors so callers cannot forget to handle them, but webhook handlers
/// convert them into acknowledged no-ops rather than failure responses.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("insufficient credits for member {member_id}: balance {balance}, requested {requested}")]
    InsufficientCredits {
        member_id: Uuid,
        balance: i64,
        requested: i64,
    },

    #[error("event already processed: {0}")]
    AlreadyProcessed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("booking pass not found")]
    PassNotFound,

    #[error("booking pass already used")]
    PassAlreadyUsed,

    #[error("booking pass expired")]
    PassExpired,

    #[error("member not found: {0}")]
    MemberNotFound(Uuid),

    #[error("waiver not found: {0}")]
    WaiverNotFound(Uuid),

    #[error("booking issue not found: {0}")]
    IssueNotFound(Uuid),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("external provider error: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Provider(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_message_includes_context() {
        let member_id = Uuid::nil();
        let err = CoreError::InsufficientCredits {
            member_id,
            balance: 0,
            requested: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("balance 0"));
        assert!(msg.contains("requested 1"));
    }

    #[test]
    fn sqlx_errors_map_to_database_variant() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::Database(_)));
    }
}
