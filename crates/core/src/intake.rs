//! Idempotent event intake
//!
//! Dedups inbound webhook deliveries by provider event id. The dedup is a
//! unique constraint race: concurrent deliveries of the same id all attempt
//! the insert and exactly one wins.
//!
//! Semantics are at-most-once: a handler that crashes after claiming but
//! before finishing its side effects leaves the event permanently claimed.
//! Operators replay such events through the admin ledger/pass primitives,
//! never by deleting the claim row.

use sqlx::PgPool;

use crate::error::CoreResult;

#[derive(Clone)]
pub struct EventIntake {
    pool: PgPool,
}

impl EventIntake {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim an external event for processing.
    ///
    /// Returns `true` exactly once per (provider, event_id), `false` on every
    /// subsequent call, including concurrent ones. Callers must claim before
    /// any mutating side effect and skip all processing on `false`.
    pub async fn claim(
        &self,
        provider: &str,
        event_id: &str,
        event_type: Option<&str>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (provider, event_id, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, event_id) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            tracing::info!(
                provider = provider,
                event_id = event_id,
                "Duplicate webhook event - already claimed"
            );
        }
        Ok(claimed)
    }

    /// Delete claim rows older than the retention horizon.
    ///
    /// Dedup only matters within the provider's retry window, so old claims
    /// are safe to drop. Returns the number of rows deleted.
    pub async fn purge_older_than_days(&self, days: i32) -> CoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE claimed_at < NOW() - ($1 || ' days')::INTERVAL",
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
