//! Stripe webhook handling
//!
//! Verifies and processes payment events: one-time checkouts and subscription
//! invoices both land here and drive credit grants plus booking-pass minting.
//! Every handler claims the event id through the intake layer before any side
//! effect, so redelivered events grant at most once.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{CheckoutSession, Event, EventObject, EventType, Invoice, Webhook};

use crate::email::{booking_link, EmailService};
use crate::error::{CoreError, CoreResult};
use crate::intake::EventIntake;
use crate::ledger::LedgerService;
use crate::members::MemberService;
use crate::passes::BookingPassService;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (seconds).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Fixed mapping from Stripe price ids to credits granted per unit.
///
/// Parsed from `STRIPE_PRICE_CREDITS`, e.g. `price_single=1,price_ten=10`.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    credits: HashMap<String, i64>,
}

impl PriceTable {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("STRIPE_PRICE_CREDITS").unwrap_or_default())
    }

    pub fn parse(raw: &str) -> Self {
        let mut credits = HashMap::new();
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((price_id, count)) = pair.split_once('=') {
                if let Ok(count) = count.trim().parse::<i64>() {
                    if count > 0 {
                        credits.insert(price_id.trim().to_string(), count);
                        continue;
                    }
                }
            }
            tracing::warn!(entry = pair, "Ignoring malformed STRIPE_PRICE_CREDITS entry");
        }
        Self { credits }
    }

    pub fn credits_for(&self, price_id: &str) -> Option<i64> {
        self.credits.get(price_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }
}

/// Parse a `Stripe-Signature` header into (timestamp, v1 signature).
pub fn parse_signature_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    Some((timestamp?, v1_signature?))
}

/// Expected v1 signature for a payload: HMAC-SHA256 over `{timestamp}.{payload}`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> String {
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(signed_payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Manual signature verification with timestamp tolerance, evaluated against
/// an injected `now` so the check is unit-testable.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> CoreResult<()> {
    let (timestamp, v1_signature) =
        parse_signature_header(header).ok_or(CoreError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(CoreError::WebhookSignatureInvalid);
    }

    let computed = compute_signature(secret, timestamp, payload);
    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(CoreError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events.
pub struct StripeWebhookHandler {
    pool: PgPool,
    intake: EventIntake,
    passes: BookingPassService,
    email: EmailService,
    prices: PriceTable,
    webhook_secret: String,
    /// Public base URL used to build `/book/{token}` links.
    booking_base_url: String,
}

impl StripeWebhookHandler {
    pub fn new(
        pool: PgPool,
        passes: BookingPassService,
        email: EmailService,
        prices: PriceTable,
        webhook_secret: String,
        booking_base_url: String,
    ) -> Self {
        let intake = EventIntake::new(pool.clone());
        Self {
            pool,
            intake,
            passes,
            email,
            prices,
            webhook_secret,
            booking_base_url,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verifier first, then falls back to manual HMAC
    /// verification to tolerate Stripe API versions newer than the library's
    /// pinned one.
    pub fn verify_event(&self, payload: &str, signature: &str) -> CoreResult<Event> {
        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| CoreError::WebhookSignatureInvalid)?
            .as_secs() as i64;

        verify_signature(payload, signature, &self.webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            CoreError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Claims the event id atomically before any side effect; duplicate
    /// deliveries are acknowledged as successes.
    pub async fn handle_event(&self, event: Event) -> CoreResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if !self
            .intake
            .claim("stripe", &event_id, Some(&event_type))
            .await?
        {
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let session = extract_checkout_session(event)?;
                self.handle_checkout_completed(session).await
            }
            EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                self.handle_invoice_paid(invoice).await
            }
            _ => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event_id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    /// One-time purchase: grant credits and mint a booking pass.
    ///
    /// Subscription checkouts are skipped here; their `invoice.paid` events
    /// carry the credit grant.
    async fn handle_checkout_completed(&self, session: CheckoutSession) -> CoreResult<()> {
        let session_id = session.id.to_string();

        if session.subscription.is_some() {
            tracing::info!(
                session_id = %session_id,
                "Subscription checkout - credits granted via invoice.paid"
            );
            return Ok(());
        }

        if session.payment_status != stripe::CheckoutSessionPaymentStatus::Paid {
            tracing::info!(
                session_id = %session_id,
                payment_status = ?session.payment_status,
                "Checkout not paid - skipping"
            );
            return Ok(());
        }

        let Some(email) = checkout_email(&session) else {
            // Missing required data is acknowledged and dropped; retries
            // would carry the same payload.
            tracing::warn!(session_id = %session_id, "Checkout without customer email - dropping");
            return Ok(());
        };

        let line_items = session
            .line_items
            .as_ref()
            .map(|l| {
                l.data
                    .iter()
                    .map(|item| {
                        (
                            item.price.as_ref().map(|p| p.id.to_string()),
                            item.quantity.unwrap_or(1) as i64,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let credits = checkout_credits(session.metadata.as_ref(), &line_items, &self.prices);
        if credits <= 0 {
            tracing::warn!(session_id = %session_id, "Checkout resolved to zero credits - dropping");
            return Ok(());
        }

        let members = MemberService::new(self.pool.clone());
        let ledger = LedgerService::new(self.pool.clone());

        let member = members.get_or_create(&email).await?;
        let reason = format!("stripe checkout {session_id}");
        ledger.grant(member.id, credits, &reason, None).await?;

        self.mint_and_deliver(&email, &session_id).await;

        tracing::info!(
            member_id = %member.id,
            session_id = %session_id,
            credits = credits,
            "Checkout completed - credits granted"
        );

        Ok(())
    }

    /// Subscription renewal: grant credits per the fixed price table.
    async fn handle_invoice_paid(&self, invoice: Invoice) -> CoreResult<()> {
        let invoice_id = invoice.id.to_string();

        let Some(email) = invoice.customer_email.clone() else {
            tracing::warn!(invoice_id = %invoice_id, "Invoice without customer email - dropping");
            return Ok(());
        };

        let lines = invoice
            .lines
            .as_ref()
            .map(|l| {
                l.data
                    .iter()
                    .map(|line| {
                        (
                            line.price.as_ref().map(|p| p.id.to_string()),
                            line.quantity.unwrap_or(1) as i64,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let credits = invoice_credits(&lines, &self.prices);
        if credits == 0 {
            tracing::info!(
                invoice_id = %invoice_id,
                "Invoice has no credit-bearing line items - skipping"
            );
            return Ok(());
        }

        let members = MemberService::new(self.pool.clone());
        let ledger = LedgerService::new(self.pool.clone());

        let member = members.get_or_create(&email).await?;
        let reason = format!("stripe invoice {invoice_id}");
        ledger.grant(member.id, credits, &reason, None).await?;

        self.mint_and_deliver(&email, &invoice_id).await;

        tracing::info!(
            member_id = %member.id,
            invoice_id = %invoice_id,
            credits = credits,
            "Invoice paid - credits granted"
        );

        Ok(())
    }

    /// Mint a booking pass (idempotent per session/invoice id) and email the
    /// link. Delivery failure never fails the grant: the token is gone, but
    /// an operator can resend a fresh link from the admin console.
    async fn mint_and_deliver(&self, email: &str, session_id: &str) {
        match self.passes.find_by_session(session_id).await {
            Ok(Some(_)) => {
                tracing::info!(session_id = %session_id, "Pass already minted for session");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Pass lookup failed");
                return;
            }
        }

        let minted = match self.passes.mint(email, Some(session_id)).await {
            Ok(minted) => minted,
            Err(e) => {
                tracing::error!(email = %email, error = %e, "Booking pass mint failed");
                return;
            }
        };

        let link = booking_link(&self.booking_base_url, &minted.raw_token);
        if let Err(e) = self.email.send_booking_link(email, &link).await {
            tracing::error!(
                email = %email,
                pass_id = %minted.id,
                error = %e,
                "Booking link email failed - resend via admin console"
            );
        }
    }
}

/// Customer email from a checkout session, preferring the collected details.
fn checkout_email(session: &CheckoutSession) -> Option<String> {
    session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or_else(|| session.customer_email.clone())
        .filter(|e| !e.is_empty())
}

/// Credits for a one-time checkout.
///
/// Metadata wins when present (`credits=N` set at session creation).
/// Otherwise line items are summed through the price table; with a table
/// configured, unmapped prices grant nothing, so merch sharing a cart with a
/// session never inflates the grant. Without a table every unit counts as
/// one credit.
pub fn checkout_credits(
    metadata: Option<&HashMap<String, String>>,
    line_items: &[(Option<String>, i64)],
    prices: &PriceTable,
) -> i64 {
    if let Some(count) = metadata
        .and_then(|m| m.get("credits"))
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|c| *c > 0)
    {
        return count;
    }

    if line_items.is_empty() {
        // A paid checkout with no visible line items is a single session.
        return 1;
    }

    if prices.is_empty() {
        return line_items.iter().map(|(_, qty)| *qty.max(&1)).sum();
    }

    invoice_credits(line_items, prices)
}

/// Credits for a subscription invoice: only price-table lines count, so
/// unrelated charges on the same invoice never grant sessions.
pub fn invoice_credits(line_items: &[(Option<String>, i64)], prices: &PriceTable) -> i64 {
    line_items
        .iter()
        .filter_map(|(price_id, qty)| {
            price_id
                .as_deref()
                .and_then(|p| prices.credits_for(p))
                .map(|per_unit| per_unit * qty.max(&1))
        })
        .sum()
}

fn extract_checkout_session(event: Event) -> CoreResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(CoreError::InvalidInput(
            "expected CheckoutSession object".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> CoreResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(CoreError::InvalidInput("expected Invoice object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn signature_header_parses_timestamp_and_v1() {
        let header = "t=1700000000,v1=abc123,v0=legacy";
        assert_eq!(
            parse_signature_header(header),
            Some((1_700_000_000, "abc123".to_string()))
        );
        assert_eq!(parse_signature_header("v1=abc"), None);
        assert_eq!(parse_signature_header("t=123"), None);
        assert_eq!(parse_signature_header("garbage"), None);
    }

    #[test]
    fn computed_signature_verifies() {
        let payload = r#"{"id":"evt_1"}"#;
        let timestamp = 1_700_000_000;
        let sig = compute_signature(SECRET, timestamp, payload);
        let header = format!("t={timestamp},v1={sig}");

        assert!(verify_signature(payload, &header, SECRET, timestamp + 10).is_ok());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let timestamp = 1_700_000_000;
        let sig = compute_signature(SECRET, timestamp, r#"{"id":"evt_1"}"#);
        let header = format!("t={timestamp},v1={sig}");

        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, timestamp);
        assert!(matches!(result, Err(CoreError::WebhookSignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_fails_verification() {
        let payload = "{}";
        let timestamp = 1_700_000_000;
        let sig = compute_signature(SECRET, timestamp, payload);
        let header = format!("t={timestamp},v1={sig}");

        let result = verify_signature(payload, &header, SECRET, timestamp + 301);
        assert!(matches!(result, Err(CoreError::WebhookSignatureInvalid)));
    }

    #[test]
    fn price_table_parses_and_skips_malformed_entries() {
        let table = PriceTable::parse("price_single=1, price_ten=10, bogus, price_neg=-2");
        assert_eq!(table.credits_for("price_single"), Some(1));
        assert_eq!(table.credits_for("price_ten"), Some(10));
        assert_eq!(table.credits_for("price_neg"), None);
        assert_eq!(table.credits_for("unknown"), None);
    }

    #[test]
    fn empty_price_table() {
        let table = PriceTable::parse("");
        assert!(table.is_empty());
    }

    #[test]
    fn checkout_metadata_credits_take_priority() {
        let mut metadata = HashMap::new();
        metadata.insert("credits".to_string(), "3".to_string());
        let lines = vec![(Some("price_ten".to_string()), 1)];
        let prices = PriceTable::parse("price_ten=10");

        assert_eq!(checkout_credits(Some(&metadata), &lines, &prices), 3);
    }

    #[test]
    fn checkout_line_items_map_through_price_table() {
        let prices = PriceTable::parse("price_ten=10");
        let lines = vec![(Some("price_ten".to_string()), 2)];
        assert_eq!(checkout_credits(None, &lines, &prices), 20);
    }

    #[test]
    fn unmapped_checkout_lines_grant_nothing_when_table_is_configured() {
        let prices = PriceTable::parse("price_single=1");
        // A session plus two merch items: only the session counts.
        let lines = vec![
            (Some("price_single".to_string()), 1),
            (Some("price_tshirt".to_string()), 2),
        ];
        assert_eq!(checkout_credits(None, &lines, &prices), 1);

        // Merch-only carts grant nothing at all.
        let merch_only = vec![(Some("price_tshirt".to_string()), 2)];
        assert_eq!(checkout_credits(None, &merch_only, &prices), 0);
    }

    #[test]
    fn unconfigured_table_counts_one_credit_per_unit() {
        let prices = PriceTable::default();
        let lines = vec![(Some("price_anything".to_string()), 3), (None, 1)];
        assert_eq!(checkout_credits(None, &lines, &prices), 4);
    }

    #[test]
    fn checkout_without_line_items_defaults_to_one_credit() {
        let prices = PriceTable::default();
        assert_eq!(checkout_credits(None, &[], &prices), 1);
    }

    #[test]
    fn invoice_credits_ignore_unmapped_lines() {
        let prices = PriceTable::parse("price_monthly=4");
        let lines = vec![
            (Some("price_monthly".to_string()), 1),
            (Some("price_late_fee".to_string()), 1),
            (None, 2),
        ];
        assert_eq!(invoice_credits(&lines, &prices), 4);
    }

    #[test]
    fn invoice_with_no_mapped_lines_grants_nothing() {
        let prices = PriceTable::parse("price_monthly=4");
        let lines = vec![(Some("price_other".to_string()), 1)];
        assert_eq!(invoice_credits(&lines, &prices), 0);
    }
}
