//! Credit redemption protocol
//!
//! Invoked when a "booking created" event arrives from the scheduling
//! provider. Resolves the paying identity (booking pass first, invitee email
//! as fallback), atomically decrements one credit, and on shortfall records
//! an operator-visible issue instead of failing the webhook.
//!
//! Idempotency is structural: a unique constraint ties one redemption to one
//! invitee URI, independent of event-id dedup, because the provider's webhook
//! id differs from its invitee id across redeliveries.

use sqlx::PgPool;
use uuid::Uuid;

use crate::calendly::BookingCreated;
use crate::error::{CoreError, CoreResult};
use crate::issues::BookingIssueService;
use crate::ledger::LedgerService;
use crate::members::{normalize_email, MemberService};
use crate::passes::{BookingPass, BookingPassService};
use crate::waivers::{WaiverKey, WaiverService};

/// What the protocol did with a booking event.
#[derive(Debug)]
pub enum RedemptionOutcome {
    /// One credit redeemed and recorded against the invitee URI.
    Redeemed {
        member_id: Uuid,
        redemption_id: Uuid,
    },
    /// This invitee URI was already redeemed (duplicate delivery).
    AlreadyProcessed,
    /// No credits available; surfaced as a booking issue.
    InsufficientCredits { issue_id: Uuid },
    /// Cancellation refunded the earlier redemption.
    Refunded { member_id: Uuid },
    /// Nothing to do (e.g. cancellation with no matching redemption).
    Ignored,
}

#[derive(Clone)]
pub struct RedemptionService {
    pool: PgPool,
    passes: BookingPassService,
    waivers: WaiverService,
}

impl RedemptionService {
    pub fn new(pool: PgPool, passes: BookingPassService, waivers: WaiverService) -> Self {
        Self {
            pool,
            passes,
            waivers,
        }
    }

    /// Handle an `invitee.created` event.
    ///
    /// Never returns the business failures as errors: duplicates and credit
    /// shortfalls are outcomes, so webhook callers can always acknowledge.
    pub async fn handle_invitee_created(
        &self,
        booking: &BookingCreated,
    ) -> CoreResult<RedemptionOutcome> {
        let members = MemberService::new(self.pool.clone());
        let ledger = LedgerService::new(self.pool.clone());
        let issues = BookingIssueService::new(self.pool.clone());

        // Resolve the redeeming identity. A live pass charges the purchaser,
        // not whoever's name is on the calendar.
        let pass = self.resolve_pass(booking).await;
        let redeeming_email = pass
            .as_ref()
            .map(|p| p.email.clone())
            .unwrap_or_else(|| normalize_email(&booking.invitee_email));

        let member = members.get_or_create(&redeeming_email).await?;
        if redeeming_email == normalize_email(&booking.invitee_email) {
            if let Some(name) = &booking.invitee_name {
                if let Err(e) = members.backfill_name(member.id, name).await {
                    tracing::warn!(member_id = %member.id, error = %e, "Name backfill failed");
                }
            }
        }

        // Redemption record and ledger debit commit or roll back together.
        let mut tx = self.pool.begin().await?;

        let redemption_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO booking_redemptions
                (invitee_uri, event_uri, member_id, invitee_email, pass_id, start_time, end_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (invitee_uri) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&booking.invitee_uri)
        .bind(&booking.event_uri)
        .bind(member.id)
        // The record reflects the actual attendee even when the payer differs.
        .bind(normalize_email(&booking.invitee_email))
        .bind(pass.as_ref().map(|p| p.id))
        .bind(booking.start_time)
        .bind(booking.end_time)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(redemption_id) = redemption_id else {
            tracing::info!(
                invitee_uri = %booking.invitee_uri,
                "Booking already redeemed - duplicate delivery"
            );
            return Ok(RedemptionOutcome::AlreadyProcessed);
        };

        let reason = format!("calendly booking {}", booking.invitee_uri);
        match ledger
            .redeem_in_tx(&mut tx, member.id, 1, &reason, None)
            .await
        {
            Ok(_) => {
                tx.commit().await?;
            }
            Err(CoreError::InsufficientCredits { balance, .. }) => {
                drop(tx); // roll back the redemption row

                let issue = issues
                    .upsert_insufficient_credits(
                        &booking.invitee_uri,
                        &normalize_email(&booking.invitee_email),
                        Some(member.id),
                        booking.start_time,
                        booking.end_time,
                        &format!(
                            "Booking by {} requires 1 credit; balance is {balance}",
                            redeeming_email
                        ),
                    )
                    .await?;

                return Ok(RedemptionOutcome::InsufficientCredits { issue_id: issue.id });
            }
            Err(e) => {
                drop(tx);
                return Err(e);
            }
        }

        tracing::info!(
            member_id = %member.id,
            invitee_uri = %booking.invitee_uri,
            redemption_id = %redemption_id,
            via_pass = pass.is_some(),
            "Credit redeemed for booking"
        );

        // Post-commit side effects are best-effort: the redemption is the
        // source of truth and each of these is independently retryable.
        if let Some(pass) = &pass {
            match self.passes.consume(pass.id).await {
                Ok(()) => {}
                Err(CoreError::PassAlreadyUsed) => {}
                Err(e) => {
                    tracing::warn!(pass_id = %pass.id, error = %e, "Pass consumption failed")
                }
            }
        }

        if let Err(e) = self.passes.backfill_member(&redeeming_email, member.id).await {
            tracing::warn!(member_id = %member.id, error = %e, "Pass member backfill failed");
        }

        let waiver_key = WaiverKey::Invitee {
            invitee_uri: booking.invitee_uri.clone(),
        };
        if let Err(e) = self.waivers.send(waiver_key, &redeeming_email).await {
            tracing::warn!(
                invitee_uri = %booking.invitee_uri,
                error = %e,
                "Waiver dispatch failed after redemption - retry via admin console"
            );
        }

        Ok(RedemptionOutcome::Redeemed {
            member_id: member.id,
            redemption_id,
        })
    }

    /// Handle an `invitee.canceled` event: compensating refund, exactly once.
    ///
    /// The `redeemed -> canceled` transition is a conditional update, so a
    /// repeated cancellation (or one arriving before its creation) is a
    /// graceful no-op. The status flip and the refund entry share one
    /// transaction, mirroring the creation path: if the refund insert fails,
    /// the row stays `redeemed` and the provider's retry gets another shot.
    /// Waiver state is deliberately untouched.
    pub async fn handle_invitee_canceled(
        &self,
        invitee_uri: &str,
    ) -> CoreResult<RedemptionOutcome> {
        let ledger = LedgerService::new(self.pool.clone());

        let mut tx = self.pool.begin().await?;

        let canceled: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE booking_redemptions
            SET status = 'canceled', canceled_at = NOW()
            WHERE invitee_uri = $1 AND status = 'redeemed'
            RETURNING id, member_id
            "#,
        )
        .bind(invitee_uri)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((redemption_id, member_id)) = canceled else {
            tracing::info!(
                invitee_uri = %invitee_uri,
                "Cancellation with no redeemed booking - no-op"
            );
            return Ok(RedemptionOutcome::Ignored);
        };

        let reason = format!("calendly cancellation {invitee_uri}");
        ledger
            .refund_in_tx(&mut tx, member_id, 1, &reason, None)
            .await?;

        tx.commit().await?;

        tracing::info!(
            member_id = %member_id,
            redemption_id = %redemption_id,
            invitee_uri = %invitee_uri,
            "Booking canceled - credit refunded"
        );

        Ok(RedemptionOutcome::Refunded { member_id })
    }

    /// Look up the booking pass referenced by the event's tracking token.
    ///
    /// The lookup deliberately ignores `used_at`: the link click consumed the
    /// pass before the scheduler page loaded, and that consumption must not
    /// break payer attribution. An unknown token falls back to the invitee
    /// email rather than failing the booking.
    async fn resolve_pass(&self, booking: &BookingCreated) -> Option<BookingPass> {
        let token = booking.pass_token.as_deref()?;
        match self.passes.find_by_token(token).await {
            Ok(Some(pass)) => Some(pass),
            Ok(None) => {
                tracing::warn!(
                    invitee_uri = %booking.invitee_uri,
                    "Booking carried an unknown pass token - falling back to invitee email"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    invitee_uri = %booking.invitee_uri,
                    error = %e,
                    "Pass lookup failed - falling back to invitee email"
                );
                None
            }
        }
    }
}
