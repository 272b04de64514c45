//! Waiver lifecycle tracker
//!
//! Per-member-per-year (or per-booking-invitee) signature state machine:
//! `missing -> sent -> signed`, where `missing` is implicit absence and
//! `signed` is terminal. There is no declined state; a non-response stays
//! `sent` until an operator resolves it.
//!
//! Two keying schemes coexist: `(member_id, year)` for annual renewals and
//! `invitee_uri` for ad-hoc guest bookings. Which applies is decided by
//! whether a scheduling-invitee context exists at send time.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::EmailService;
use crate::error::{CoreError, CoreResult};
use crate::members::normalize_email;
use crate::signnow::SignNowClient;

pub const STATUS_SENT: &str = "sent";
pub const STATUS_SIGNED: &str = "signed";

/// How a waiver row is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiverKey {
    /// Annual-renewal flow: one waiver per member per calendar year (UTC).
    MemberYear { member_id: Uuid, year: i32 },
    /// Guest-booking flow: one waiver per scheduling invitee.
    Invitee { invitee_uri: String },
}

impl WaiverKey {
    /// Key for the current UTC year.
    pub fn annual(member_id: Uuid) -> Self {
        WaiverKey::MemberYear {
            member_id,
            year: OffsetDateTime::now_utc().year(),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Waiver {
    pub id: Uuid,
    pub member_id: Option<Uuid>,
    pub year: Option<i32>,
    pub invitee_uri: Option<String>,
    pub recipient_email: String,
    pub status: String,
    pub document_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub signed_at: Option<OffsetDateTime>,
}

const WAIVER_COLUMNS: &str =
    "id, member_id, year, invitee_uri, recipient_email, status, document_id, sent_at, signed_at";

/// Which extraction strategy concluded a document is complete.
///
/// The priority order is a contract: explicit invite fulfillment beats
/// boolean flags beats per-signer arrays beats the top-level status string.
/// The provider's response shape is not guaranteed to be consistent, so this
/// is a designed tolerance layer, not ad hoc sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    InvitesFulfilled,
    CompletionFlag,
    SignerStatuses,
    StatusString,
}

/// Canonical "does this document look signed" check.
///
/// Applies the ordered strategies and stops at the first that yields a
/// verdict. Returns `None` when no strategy finds completion.
pub fn completion_signal(doc: &Value) -> Option<CompletionSignal> {
    // Tier 1: field invites with explicit fulfillment status.
    if let Some(invites) = doc.get("field_invites").and_then(Value::as_array) {
        if !invites.is_empty()
            && invites.iter().all(|invite| {
                invite
                    .get("status")
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.eq_ignore_ascii_case("fulfilled"))
            })
        {
            return Some(CompletionSignal::InvitesFulfilled);
        }
    }

    // Tier 2: boolean completion flags.
    for flag in ["is_completed", "completed", "fulfilled"] {
        if doc.get(flag).and_then(Value::as_bool) == Some(true) {
            return Some(CompletionSignal::CompletionFlag);
        }
    }

    // Tier 3: per-signer / recipient status arrays.
    for key in ["signatures", "signers", "recipients"] {
        if let Some(entries) = doc.get(key).and_then(Value::as_array) {
            if !entries.is_empty()
                && entries.iter().all(|entry| {
                    entry
                        .get("status")
                        .and_then(Value::as_str)
                        .is_some_and(status_means_complete)
                })
            {
                return Some(CompletionSignal::SignerStatuses);
            }
        }
    }

    // Tier 4: top-level document status string.
    if doc
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(status_means_complete)
    {
        return Some(CompletionSignal::StatusString);
    }

    None
}

fn status_means_complete(status: &str) -> bool {
    let status = status.to_ascii_lowercase();
    status.contains("completed") || status.contains("signed") || status.contains("fulfilled")
}

/// Outcome summary of one reconciliation sweep.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub newly_signed: usize,
    pub errors: Vec<ReconcileError>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileError {
    pub waiver_id: Uuid,
    pub error: String,
}

#[derive(Clone)]
pub struct WaiverService {
    pool: PgPool,
    signnow: SignNowClient,
    email: EmailService,
}

impl WaiverService {
    pub fn new(pool: PgPool, signnow: SignNowClient, email: EmailService) -> Self {
        Self {
            pool,
            signnow,
            email,
        }
    }

    pub async fn find_by_key(&self, key: &WaiverKey) -> CoreResult<Option<Waiver>> {
        let waiver: Option<Waiver> = match key {
            WaiverKey::MemberYear { member_id, year } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {WAIVER_COLUMNS} FROM waivers
                    WHERE member_id = $1 AND year = $2 AND invitee_uri IS NULL
                    "#
                ))
                .bind(member_id)
                .bind(year)
                .fetch_optional(&self.pool)
                .await?
            }
            WaiverKey::Invitee { invitee_uri } => {
                sqlx::query_as(&format!(
                    "SELECT {WAIVER_COLUMNS} FROM waivers WHERE invitee_uri = $1"
                ))
                .bind(invitee_uri)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(waiver)
    }

    pub async fn find_by_id(&self, waiver_id: Uuid) -> CoreResult<Option<Waiver>> {
        let waiver: Option<Waiver> =
            sqlx::query_as(&format!("SELECT {WAIVER_COLUMNS} FROM waivers WHERE id = $1"))
                .bind(waiver_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(waiver)
    }

    /// Transition `missing -> sent`, or re-send an outstanding waiver.
    ///
    /// A recorded document id is never replaced: re-sends deliver a signing
    /// link for the existing document instead of minting a new one, because
    /// the provider rejects duplicate invites on the same document and a new
    /// document would orphan the signed-status tracking.
    pub async fn send(&self, key: WaiverKey, recipient_email: &str) -> CoreResult<Waiver> {
        let recipient = normalize_email(recipient_email);

        if let Some(existing) = self.find_by_key(&key).await? {
            if existing.status == STATUS_SIGNED {
                return Ok(existing);
            }
            if let Some(document_id) = &existing.document_id {
                let link = self.signnow.create_signing_link(document_id).await?;
                self.email
                    .send(
                        &recipient,
                        "Reminder: please sign your waiver",
                        &format!("<p><a href=\"{link}\">Sign your waiver</a></p>"),
                    )
                    .await?;

                let updated: Waiver = sqlx::query_as(&format!(
                    r#"
                    UPDATE waivers SET sent_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    RETURNING {WAIVER_COLUMNS}
                    "#
                ))
                .bind(existing.id)
                .fetch_one(&self.pool)
                .await?;

                tracing::info!(waiver_id = %existing.id, "Waiver re-sent via signing link");
                return Ok(updated);
            }
        }

        // Fresh send: copy the template, invite, record the document id.
        let document_name = match &key {
            WaiverKey::MemberYear { year, .. } => format!("Waiver {year} - {recipient}"),
            WaiverKey::Invitee { invitee_uri } => format!("Waiver - {recipient} - {invitee_uri}"),
        };
        let document_id = self.signnow.copy_template(&document_name).await?;
        self.signnow.send_invite(&document_id, &recipient).await?;

        let waiver: Waiver = match &key {
            WaiverKey::MemberYear { member_id, year } => {
                sqlx::query_as(&format!(
                    r#"
                    INSERT INTO waivers (member_id, year, recipient_email, status, document_id, sent_at)
                    VALUES ($1, $2, $3, 'sent', $4, NOW())
                    ON CONFLICT (member_id, year) WHERE invitee_uri IS NULL DO UPDATE SET
                        document_id = COALESCE(waivers.document_id, EXCLUDED.document_id),
                        sent_at = NOW(),
                        updated_at = NOW()
                    RETURNING {WAIVER_COLUMNS}
                    "#
                ))
                .bind(member_id)
                .bind(year)
                .bind(&recipient)
                .bind(&document_id)
                .fetch_one(&self.pool)
                .await?
            }
            WaiverKey::Invitee { invitee_uri } => {
                sqlx::query_as(&format!(
                    r#"
                    INSERT INTO waivers (invitee_uri, recipient_email, status, document_id, sent_at)
                    VALUES ($1, $2, 'sent', $3, NOW())
                    ON CONFLICT (invitee_uri) WHERE invitee_uri IS NOT NULL DO UPDATE SET
                        document_id = COALESCE(waivers.document_id, EXCLUDED.document_id),
                        sent_at = NOW(),
                        updated_at = NOW()
                    RETURNING {WAIVER_COLUMNS}
                    "#
                ))
                .bind(invitee_uri)
                .bind(&recipient)
                .bind(&document_id)
                .fetch_one(&self.pool)
                .await?
            }
        };

        tracing::info!(
            waiver_id = %waiver.id,
            document_id = %document_id,
            recipient = %recipient,
            "Waiver sent"
        );

        Ok(waiver)
    }

    /// Transition `sent -> signed`. Idempotent; `signed` never regresses.
    pub async fn mark_signed(&self, waiver_id: Uuid) -> CoreResult<Waiver> {
        let updated: Option<Waiver> = sqlx::query_as(&format!(
            r#"
            UPDATE waivers
            SET status = 'signed',
                signed_at = COALESCE(signed_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status != 'signed'
            RETURNING {WAIVER_COLUMNS}
            "#
        ))
        .bind(waiver_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(waiver) => {
                tracing::info!(waiver_id = %waiver_id, "Waiver marked signed");
                Ok(waiver)
            }
            // Zero rows: either already signed (fine) or missing.
            None => self
                .find_by_id(waiver_id)
                .await?
                .ok_or(CoreError::WaiverNotFound(waiver_id)),
        }
    }

    /// Poll the provider for one waiver and mark signed if complete.
    pub async fn check_one(&self, waiver_id: Uuid) -> CoreResult<bool> {
        let waiver = self
            .find_by_id(waiver_id)
            .await?
            .ok_or(CoreError::WaiverNotFound(waiver_id))?;

        if waiver.status == STATUS_SIGNED {
            return Ok(false);
        }
        let document_id = waiver.document_id.ok_or_else(|| {
            CoreError::InvalidInput(format!("waiver {waiver_id} has no document id"))
        })?;

        let doc = self.signnow.get_document(&document_id).await?;
        if let Some(signal) = completion_signal(&doc) {
            tracing::info!(waiver_id = %waiver_id, signal = ?signal, "Waiver completion detected");
            self.mark_signed(waiver_id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reconciliation sweep over every sent-and-unsigned waiver.
    ///
    /// One document's poll failing must not abort the rest: errors are
    /// accumulated per item and the sweep continues.
    pub async fn reconcile_pending(&self, limit: i64) -> CoreResult<ReconcileSummary> {
        let pending: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, document_id FROM waivers
            WHERE status = 'sent' AND document_id IS NOT NULL
            ORDER BY sent_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReconcileSummary::default();

        for (waiver_id, document_id) in pending {
            summary.checked += 1;
            match self.signnow.get_document(&document_id).await {
                Ok(doc) => {
                    if completion_signal(&doc).is_some() {
                        match self.mark_signed(waiver_id).await {
                            Ok(_) => summary.newly_signed += 1,
                            Err(e) => summary.errors.push(ReconcileError {
                                waiver_id,
                                error: e.to_string(),
                            }),
                        }
                    }
                }
                Err(e) => summary.errors.push(ReconcileError {
                    waiver_id,
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            checked = summary.checked,
            newly_signed = summary.newly_signed,
            errors = summary.errors.len(),
            "Waiver reconciliation sweep complete"
        );

        Ok(summary)
    }

    /// Waivers linked to a member (annual) for the admin detail view.
    pub async fn list_for_member(&self, member_id: Uuid) -> CoreResult<Vec<Waiver>> {
        let waivers: Vec<Waiver> = sqlx::query_as(&format!(
            r#"
            SELECT {WAIVER_COLUMNS} FROM waivers
            WHERE member_id = $1
            ORDER BY year DESC NULLS LAST, sent_at DESC
            "#
        ))
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(waivers)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn tier1_fulfilled_invites_win() {
        let doc = json!({
            "field_invites": [
                { "status": "fulfilled" },
                { "status": "Fulfilled" }
            ],
            "status": "pending"
        });
        assert_eq!(
            completion_signal(&doc),
            Some(CompletionSignal::InvitesFulfilled)
        );
    }

    #[test]
    fn unfulfilled_invites_fall_through_to_lower_tiers() {
        let doc = json!({
            "field_invites": [
                { "status": "fulfilled" },
                { "status": "pending" }
            ],
            "is_completed": true
        });
        // Mixed invite statuses do not count; the boolean flag decides.
        assert_eq!(
            completion_signal(&doc),
            Some(CompletionSignal::CompletionFlag)
        );
    }

    #[test]
    fn tier2_boolean_flags() {
        for flag in ["is_completed", "completed", "fulfilled"] {
            let doc = json!({ flag: true });
            assert_eq!(
                completion_signal(&doc),
                Some(CompletionSignal::CompletionFlag),
                "flag {flag}"
            );
        }
        let doc = json!({ "completed": false });
        assert_eq!(completion_signal(&doc), None);
    }

    #[test]
    fn tier3_signer_status_arrays() {
        let doc = json!({
            "signers": [
                { "status": "signed" },
                { "status": "document_completed" }
            ]
        });
        assert_eq!(
            completion_signal(&doc),
            Some(CompletionSignal::SignerStatuses)
        );

        let doc = json!({ "signers": [{ "status": "signed" }, { "status": "waiting" }] });
        assert_eq!(completion_signal(&doc), None);
    }

    #[test]
    fn empty_arrays_never_count_as_complete() {
        assert_eq!(completion_signal(&json!({ "field_invites": [] })), None);
        assert_eq!(completion_signal(&json!({ "signers": [] })), None);
    }

    #[test]
    fn tier4_status_string_is_last_resort() {
        let doc = json!({ "status": "document-completed" });
        assert_eq!(
            completion_signal(&doc),
            Some(CompletionSignal::StatusString)
        );
        let doc = json!({ "status": "pending" });
        assert_eq!(completion_signal(&doc), None);
    }

    #[test]
    fn no_signal_on_empty_document() {
        assert_eq!(completion_signal(&json!({})), None);
        assert_eq!(completion_signal(&Value::Null), None);
    }

    #[test]
    fn annual_key_uses_current_utc_year() {
        let member_id = Uuid::new_v4();
        match WaiverKey::annual(member_id) {
            WaiverKey::MemberYear { member_id: m, year } => {
                assert_eq!(m, member_id);
                assert_eq!(year, OffsetDateTime::now_utc().year());
            }
            other => panic!("unexpected key: {other:?}"),
        }
    }
}
