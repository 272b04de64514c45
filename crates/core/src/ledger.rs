//! Credit ledger
//!
//! Append-only store of credit-affecting events. Balance is always derived
//! from the sum of signed entry deltas, never kept in a counter column, so
//! "sum of entries == reported balance" holds by construction.
//!
//! Redeems serialize per member via `SELECT ... FOR UPDATE` on the member
//! row: two concurrent redeems against a balance-1 member cannot both pass
//! the balance check.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Kind of ledger entry. Grants and refunds add credits, redeems subtract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Grant,
    Redeem,
    Refund,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Grant => "grant",
            EntryType::Redeem => "redeem",
            EntryType::Refund => "refund",
        }
    }

    /// Signed contribution of one unit of this entry type to the balance.
    pub fn sign(&self) -> i64 {
        match self {
            EntryType::Grant | EntryType::Refund => 1,
            EntryType::Redeem => -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub member_id: Uuid,
    pub entry_type: String,
    pub quantity: i32,
    pub reason: String,
    pub created_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Derived balance over a list of (type, quantity) pairs.
///
/// The SQL aggregate in [`LedgerService::balance`] computes the same sum;
/// this form exists so the arithmetic is unit-testable.
pub fn balance_of(entries: &[(EntryType, i64)]) -> i64 {
    entries.iter().map(|(t, q)| t.sign() * q).sum()
}

const BALANCE_SQL: &str = r#"
    SELECT COALESCE(SUM(
        CASE entry_type WHEN 'redeem' THEN -quantity ELSE quantity END
    ), 0)::BIGINT
    FROM ledger_entries
    WHERE member_id = $1
"#;

#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a credit grant. Quantity must be positive.
    pub async fn grant(
        &self,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        self.insert_entry(EntryType::Grant, member_id, quantity, reason, created_by)
            .await
    }

    /// Record a compensating refund (e.g. a canceled booking).
    pub async fn refund(
        &self,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        self.insert_entry(EntryType::Refund, member_id, quantity, reason, created_by)
            .await
    }

    /// Atomically redeem credits, failing with `InsufficientCredits` if the
    /// balance would go negative.
    pub async fn redeem(
        &self,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = self
            .redeem_in_tx(&mut tx, member_id, quantity, reason, created_by)
            .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Redeem inside a caller-owned transaction.
    ///
    /// Used by the redemption protocol so the redemption record and the
    /// ledger entry commit or roll back together. Locks the member row for
    /// the duration of the transaction.
    pub async fn redeem_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        validate_quantity(quantity)?;

        // Serialize concurrent redeems for this member.
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM members WHERE id = $1 FOR UPDATE")
                .bind(member_id)
                .fetch_optional(&mut **tx)
                .await?;

        if locked.is_none() {
            return Err(CoreError::MemberNotFound(member_id));
        }

        let (balance,): (i64,) = sqlx::query_as(BALANCE_SQL)
            .bind(member_id)
            .fetch_one(&mut **tx)
            .await?;

        if balance < quantity {
            return Err(CoreError::InsufficientCredits {
                member_id,
                balance,
                requested: quantity,
            });
        }

        let entry: LedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO ledger_entries (member_id, entry_type, quantity, reason, created_by)
            VALUES ($1, 'redeem', $2, $3, $4)
            RETURNING id, member_id, entry_type, quantity, reason, created_by, created_at
            "#,
        )
        .bind(member_id)
        .bind(quantity as i32)
        .bind(reason)
        .bind(created_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Refund inside a caller-owned transaction.
    ///
    /// Used by the cancellation path so the `redeemed -> canceled` status
    /// flip and its compensating entry commit or roll back together. A
    /// refund that fails mid-flight must leave the redemption row untouched,
    /// otherwise the provider's retry finds nothing left to cancel.
    pub async fn refund_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        validate_quantity(quantity)?;

        let entry: LedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO ledger_entries (member_id, entry_type, quantity, reason, created_by)
            VALUES ($1, 'refund', $2, $3, $4)
            RETURNING id, member_id, entry_type, quantity, reason, created_by, created_at
            "#,
        )
        .bind(member_id)
        .bind(quantity as i32)
        .bind(reason)
        .bind(created_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Derived balance: sum(grant) + sum(refund) - sum(redeem).
    pub async fn balance(&self, member_id: Uuid) -> CoreResult<i64> {
        let (balance,): (i64,) = sqlx::query_as(BALANCE_SQL)
            .bind(member_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(balance)
    }

    /// Full ledger for a member, newest first.
    pub async fn entries(&self, member_id: Uuid) -> CoreResult<Vec<LedgerEntry>> {
        let entries: Vec<LedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, member_id, entry_type, quantity, reason, created_by, created_at
            FROM ledger_entries
            WHERE member_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn insert_entry(
        &self,
        entry_type: EntryType,
        member_id: Uuid,
        quantity: i64,
        reason: &str,
        created_by: Option<Uuid>,
    ) -> CoreResult<LedgerEntry> {
        validate_quantity(quantity)?;

        let entry: LedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO ledger_entries (member_id, entry_type, quantity, reason, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, member_id, entry_type, quantity, reason, created_by, created_at
            "#,
        )
        .bind(member_id)
        .bind(entry_type.as_str())
        .bind(quantity as i32)
        .bind(reason)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            member_id = %member_id,
            entry_type = entry_type.as_str(),
            quantity = quantity,
            reason = reason,
            "Ledger entry recorded"
        );

        Ok(entry)
    }
}

fn validate_quantity(quantity: i64) -> CoreResult<()> {
    if quantity <= 0 || quantity > i32::MAX as i64 {
        return Err(CoreError::InvalidInput(format!(
            "ledger quantity must be a positive integer, got {quantity}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_is_grants_plus_refunds_minus_redeems() {
        let entries = vec![
            (EntryType::Grant, 5),
            (EntryType::Redeem, 2),
            (EntryType::Refund, 1),
            (EntryType::Redeem, 1),
        ];
        assert_eq!(balance_of(&entries), 3);
    }

    #[test]
    fn cancellation_refund_restores_balance() {
        let entries = vec![
            (EntryType::Grant, 1),
            (EntryType::Redeem, 1),
            (EntryType::Refund, 1),
        ];
        assert_eq!(balance_of(&entries), 1);
    }

    #[test]
    fn balance_of_empty_ledger_is_zero() {
        assert_eq!(balance_of(&[]), 0);
    }

    #[test]
    fn entry_type_signs() {
        assert_eq!(EntryType::Grant.sign(), 1);
        assert_eq!(EntryType::Refund.sign(), 1);
        assert_eq!(EntryType::Redeem.sign(), -1);
    }

    #[test]
    fn quantity_must_be_positive() {
        assert!(validate_quantity(1).is_ok());
        assert!(matches!(
            validate_quantity(0),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_quantity(-3),
            Err(CoreError::InvalidInput(_))
        ));
    }
}
