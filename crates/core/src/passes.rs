//! Booking passes
//!
//! Single-use capability tokens bridging a completed purchase to a scheduling
//! action. The raw token is returned exactly once at mint time; only a keyed
//! HMAC-SHA256 hash is persisted, so a leaked database cannot be replayed
//! into bookings.
//!
//! The pass decouples "who paid" from "who attends": credit redemption
//! charges the pass's stored email even when a different invitee appears on
//! the calendar booking.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::members::normalize_email;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingPass {
    pub id: Uuid,
    pub email: String,
    pub member_id: Option<Uuid>,
    pub stripe_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of minting: carries the raw token, which cannot be recovered later.
#[derive(Debug, Clone)]
pub struct MintedPass {
    pub id: Uuid,
    pub email: String,
    pub raw_token: String,
    pub expires_at: OffsetDateTime,
}

/// Generate a URL-safe random token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Keyed hash of a raw token for storage and lookup.
///
/// HMAC rather than a bare digest so token hashes cannot be precomputed
/// without the server secret.
pub fn hash_token(secret: &[u8], raw_token: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(raw_token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Clone)]
pub struct BookingPassService {
    pool: PgPool,
    secret: Vec<u8>,
    ttl: Duration,
}

impl BookingPassService {
    pub fn new(pool: PgPool, secret: impl Into<Vec<u8>>, ttl_days: i64) -> Self {
        Self {
            pool,
            secret: secret.into(),
            ttl: Duration::days(ttl_days),
        }
    }

    /// Mint a new pass for an email, soft-revoking any prior unused passes so
    /// at most one live pass exists per email.
    ///
    /// The returned raw token must be delivered immediately; only its hash is
    /// stored.
    pub async fn mint(
        &self,
        email: &str,
        stripe_session_id: Option<&str>,
    ) -> CoreResult<MintedPass> {
        let email = normalize_email(email);
        let raw_token = generate_token();
        let token_hash = hash_token(&self.secret, &raw_token);
        let expires_at = OffsetDateTime::now_utc() + self.ttl;

        let mut tx = self.pool.begin().await?;

        let revoked = sqlx::query(
            "UPDATE booking_passes SET used_at = NOW() WHERE email = $1 AND used_at IS NULL",
        )
        .bind(&email)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() > 0 {
            tracing::info!(
                email = %email,
                revoked = revoked.rows_affected(),
                "Soft-revoked prior unused booking passes"
            );
        }

        let member_id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM members WHERE email = $1")
                .bind(&email)
                .fetch_optional(&mut *tx)
                .await?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO booking_passes (token_hash, email, member_id, stripe_session_id, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&token_hash)
        .bind(&email)
        .bind(member_id)
        .bind(stripe_session_id)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(pass_id = %id, email = %email, "Booking pass minted");

        Ok(MintedPass {
            id,
            email,
            raw_token,
            expires_at,
        })
    }

    /// Look up a pass by Stripe checkout session id, for idempotent re-mint
    /// detection when an event slips past intake dedup.
    pub async fn find_by_session(&self, stripe_session_id: &str) -> CoreResult<Option<BookingPass>> {
        let pass: Option<BookingPass> = sqlx::query_as(
            r#"
            SELECT id, email, member_id, stripe_session_id, expires_at, used_at, created_at
            FROM booking_passes
            WHERE stripe_session_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(stripe_session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pass)
    }

    /// Plain lookup by raw token, no liveness checks.
    ///
    /// Used by the redemption protocol for payer attribution: by the time the
    /// booking webhook arrives the pass has usually been consumed by the link
    /// click, and that must not break attribution.
    pub async fn find_by_token(&self, raw_token: &str) -> CoreResult<Option<BookingPass>> {
        let token_hash = hash_token(&self.secret, raw_token);

        let pass: Option<BookingPass> = sqlx::query_as(
            r#"
            SELECT id, email, member_id, stripe_session_id, expires_at, used_at, created_at
            FROM booking_passes
            WHERE token_hash = $1
            "#,
        )
        .bind(&token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pass)
    }

    /// Non-consuming lookup by raw token, validating liveness.
    pub async fn peek(&self, raw_token: &str) -> CoreResult<BookingPass> {
        let pass = self
            .find_by_token(raw_token)
            .await?
            .ok_or(CoreError::PassNotFound)?;
        if pass.used_at.is_some() {
            return Err(CoreError::PassAlreadyUsed);
        }
        if OffsetDateTime::now_utc() > pass.expires_at {
            return Err(CoreError::PassExpired);
        }
        Ok(pass)
    }

    /// Consume a pass: `minted -> consumed`, exactly once.
    ///
    /// The update is conditioned on `used_at IS NULL`; losing the race is
    /// reported as `PassAlreadyUsed` so exactly one concurrent redeemer wins.
    pub async fn redeem(&self, raw_token: &str) -> CoreResult<BookingPass> {
        let pass = self.peek(raw_token).await?;
        self.consume(pass.id).await?;
        // Re-read not needed: consumption only sets used_at.
        Ok(pass)
    }

    /// Conditionally mark a pass consumed. Errors with `PassAlreadyUsed` if
    /// another caller got there first.
    pub async fn consume(&self, pass_id: Uuid) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE booking_passes SET used_at = NOW() WHERE id = $1 AND used_at IS NULL",
        )
        .bind(pass_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::PassAlreadyUsed);
        }

        tracing::info!(pass_id = %pass_id, "Booking pass consumed");
        Ok(())
    }

    /// Link unattributed passes to a member created after mint time.
    pub async fn backfill_member(&self, email: &str, member_id: Uuid) -> CoreResult<u64> {
        let email = normalize_email(email);
        let result = sqlx::query(
            "UPDATE booking_passes SET member_id = $2 WHERE email = $1 AND member_id IS NULL",
        )
        .bind(&email)
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Passes for a member's email, newest first (admin detail view).
    pub async fn list_for_email(&self, email: &str) -> CoreResult<Vec<BookingPass>> {
        let email = normalize_email(email);
        let passes: Vec<BookingPass> = sqlx::query_as(
            r#"
            SELECT id, email, member_id, stripe_session_id, expires_at, used_at, created_at
            FROM booking_passes
            WHERE email = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(&email)
        .fetch_all(&self.pool)
        .await?;

        Ok(passes)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_unique_and_url_safe() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let token = generate_token();
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert!(seen.insert(token), "token collision");
        }
    }

    #[test]
    fn hash_is_deterministic_per_secret() {
        let h1 = hash_token(b"secret-a", "tok");
        let h2 = hash_token(b"secret-a", "tok");
        let h3 = hash_token(b"secret-b", "tok");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn hash_differs_per_token() {
        assert_ne!(hash_token(b"s", "tok-1"), hash_token(b"s", "tok-2"));
    }

    #[test]
    fn hash_output_is_hex_sha256() {
        let h = hash_token(b"s", "tok");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
