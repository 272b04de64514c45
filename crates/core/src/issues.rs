//! Booking issues
//!
//! Operator-visible records of failed automated credit redemptions. Keyed by
//! the scheduling provider's invitee URI so retried webhook deliveries update
//! the existing row instead of duplicating it. Resolution changes append to
//! an immutable history sub-ledger; the issue row itself is "current state".

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Closed set of error codes an issue can carry.
pub const ERROR_INSUFFICIENT_CREDITS: &str = "INSUFFICIENT_CREDITS";

/// Resolution state of a booking issue. Issues never auto-resolve; every
/// transition is an operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueResolution {
    Open,
    ContactedCustomer,
    SentPayLink,
    Canceled,
    ResolvedOther,
}

impl IssueResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueResolution::Open => "open",
            IssueResolution::ContactedCustomer => "contacted_customer",
            IssueResolution::SentPayLink => "sent_pay_link",
            IssueResolution::Canceled => "canceled",
            IssueResolution::ResolvedOther => "resolved_other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IssueResolution::Open),
            "contacted_customer" => Some(IssueResolution::ContactedCustomer),
            "sent_pay_link" => Some(IssueResolution::SentPayLink),
            "canceled" => Some(IssueResolution::Canceled),
            "resolved_other" => Some(IssueResolution::ResolvedOther),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingIssue {
    pub id: Uuid,
    pub invitee_uri: String,
    pub invitee_email: String,
    pub member_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub error_code: String,
    pub error_message: String,
    pub resolution: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub handled_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IssueHistoryEntry {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub resolution: String,
    pub actor: Option<Uuid>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const ISSUE_COLUMNS: &str = "id, invitee_uri, invitee_email, member_id, start_time, end_time, \
     error_code, error_message, resolution, handled_at, notes, created_at";

#[derive(Clone)]
pub struct BookingIssueService {
    pool: PgPool,
}

impl BookingIssueService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record (or refresh) an insufficient-credits issue for a booking.
    ///
    /// Upsert keyed by invitee URI: a retried webhook delivery updates the
    /// existing row. An already-linked member id is preserved if the retry
    /// arrives without one.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_insufficient_credits(
        &self,
        invitee_uri: &str,
        invitee_email: &str,
        member_id: Option<Uuid>,
        start_time: Option<OffsetDateTime>,
        end_time: Option<OffsetDateTime>,
        error_message: &str,
    ) -> CoreResult<BookingIssue> {
        let issue: BookingIssue = sqlx::query_as(&format!(
            r#"
            INSERT INTO booking_issues
                (invitee_uri, invitee_email, member_id, start_time, end_time, error_code, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (invitee_uri) DO UPDATE SET
                invitee_email = EXCLUDED.invitee_email,
                member_id = COALESCE(EXCLUDED.member_id, booking_issues.member_id),
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            RETURNING {ISSUE_COLUMNS}
            "#
        ))
        .bind(invitee_uri)
        .bind(invitee_email)
        .bind(member_id)
        .bind(start_time)
        .bind(end_time)
        .bind(ERROR_INSUFFICIENT_CREDITS)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            issue_id = %issue.id,
            invitee_uri = invitee_uri,
            invitee_email = invitee_email,
            "Booking issue recorded: insufficient credits"
        );

        Ok(issue)
    }

    /// List issues, optionally filtered by resolution state, newest first.
    pub async fn list(
        &self,
        resolution: Option<IssueResolution>,
        limit: i64,
    ) -> CoreResult<Vec<BookingIssue>> {
        let issues: Vec<BookingIssue> = match resolution {
            Some(r) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {ISSUE_COLUMNS} FROM booking_issues
                    WHERE resolution = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#
                ))
                .bind(r.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {ISSUE_COLUMNS} FROM booking_issues
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(issues)
    }

    pub async fn find_by_id(&self, issue_id: Uuid) -> CoreResult<Option<BookingIssue>> {
        let issue: Option<BookingIssue> = sqlx::query_as(&format!(
            "SELECT {ISSUE_COLUMNS} FROM booking_issues WHERE id = $1"
        ))
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(issue)
    }

    /// Transition an issue's resolution state and append to the history
    /// sub-ledger in one transaction.
    pub async fn update_resolution(
        &self,
        issue_id: Uuid,
        resolution: IssueResolution,
        actor: Option<Uuid>,
        notes: Option<&str>,
    ) -> CoreResult<BookingIssue> {
        let mut tx = self.pool.begin().await?;

        let issue: Option<BookingIssue> = sqlx::query_as(&format!(
            r#"
            UPDATE booking_issues
            SET resolution = $2,
                handled_at = NOW(),
                notes = COALESCE($3, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ISSUE_COLUMNS}
            "#
        ))
        .bind(issue_id)
        .bind(resolution.as_str())
        .bind(notes)
        .fetch_optional(&mut *tx)
        .await?;

        let issue = issue.ok_or(CoreError::IssueNotFound(issue_id))?;

        sqlx::query(
            r#"
            INSERT INTO booking_issue_history (issue_id, resolution, actor, notes)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(issue_id)
        .bind(resolution.as_str())
        .bind(actor)
        .bind(notes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            issue_id = %issue_id,
            resolution = resolution.as_str(),
            "Booking issue resolution updated"
        );

        Ok(issue)
    }

    /// Full resolution history for an issue, oldest first.
    pub async fn history(&self, issue_id: Uuid) -> CoreResult<Vec<IssueHistoryEntry>> {
        let entries: Vec<IssueHistoryEntry> = sqlx::query_as(
            r#"
            SELECT id, issue_id, resolution, actor, notes, created_at
            FROM booking_issue_history
            WHERE issue_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_round_trips_through_strings() {
        for r in [
            IssueResolution::Open,
            IssueResolution::ContactedCustomer,
            IssueResolution::SentPayLink,
            IssueResolution::Canceled,
            IssueResolution::ResolvedOther,
        ] {
            assert_eq!(IssueResolution::parse(r.as_str()), Some(r));
        }
        assert_eq!(IssueResolution::parse("escalated"), None);
    }

    #[test]
    fn resolution_serde_uses_snake_case() {
        let json = serde_json::to_string(&IssueResolution::SentPayLink).unwrap_or_default();
        assert_eq!(json, "\"sent_pay_link\"");
    }
}
