//! Member registry
//!
//! Members are the identity anchor: created on first payment or first booking
//! by normalized email, never deleted. Names arrive lazily from the scheduling
//! provider since Stripe checkouts only carry an email.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CoreResult;

/// Normalize an email address for identity matching.
///
/// All lookups and inserts go through this so that `Jane@Example.COM ` and
/// `jane@example.com` resolve to the same member row.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Member {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub is_admin: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const MEMBER_COLUMNS: &str =
    "id, email, first_name, last_name, phone, is_admin, created_at";

#[derive(Clone)]
pub struct MemberService {
    pool: PgPool,
}

impl MemberService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get or create a member by normalized email.
    ///
    /// Uses an upsert so two concurrent callers for the same new email both
    /// receive the single row that wins the unique constraint.
    pub async fn get_or_create(&self, email: &str) -> CoreResult<Member> {
        let email = normalize_email(email);

        let member: Member = sqlx::query_as(&format!(
            r#"
            INSERT INTO members (email)
            VALUES ($1)
            ON CONFLICT (email) DO UPDATE SET updated_at = NOW()
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(&email)
        .fetch_one(&self.pool)
        .await?;

        Ok(member)
    }

    pub async fn find_by_email(&self, email: &str) -> CoreResult<Option<Member>> {
        let email = normalize_email(email);

        let member: Option<Member> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE email = $1"
        ))
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(member)
    }

    pub async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Member>> {
        let member: Option<Member> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(member)
    }

    /// Backfill first/last name from a scheduling invitee's display name.
    ///
    /// Only fills empty columns; an operator-entered name is never clobbered
    /// by webhook data.
    pub async fn backfill_name(&self, member_id: Uuid, full_name: &str) -> CoreResult<()> {
        let (first, last) = split_name(full_name);
        if first.is_none() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE members
            SET first_name = COALESCE(first_name, $2),
                last_name = COALESCE(last_name, $3),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(member_id)
        .bind(first)
        .bind(last)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Split a display name into (first, last) on the first whitespace.
fn split_name(full_name: &str) -> (Option<String>, Option<String>) {
    let trimmed = full_name.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first.to_string()), Some(rest.trim().to_string())),
        None => (Some(trimmed.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email("  Jane@Example.COM "), "jane@example.com");
        assert_eq!(normalize_email("plain@host"), "plain@host");
    }

    #[test]
    fn split_name_handles_single_and_multi_word() {
        assert_eq!(split_name("Jane"), (Some("Jane".into()), None));
        assert_eq!(
            split_name("Jane Q Doe"),
            (Some("Jane".into()), Some("Q Doe".into()))
        );
        assert_eq!(split_name("   "), (None, None));
    }
}
