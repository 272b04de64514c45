//! Frontdesk core: membership credits, booking passes, and waiver tracking.
//!
//! Everything that mutates money-adjacent state lives here, behind services
//! that the API and worker crates share. The ledger is append-only and
//! balances are always derived; external events pass through an at-most-once
//! intake claim before any side effect.

pub mod calendly;
pub mod email;
pub mod error;
pub mod intake;
pub mod issues;
pub mod ledger;
pub mod members;
pub mod passes;
pub mod redemption;
pub mod signnow;
pub mod stripe_webhooks;
pub mod waivers;

pub use calendly::{BookingCreated, CalendlyWebhook};
pub use email::{booking_link, EmailConfig, EmailService};
pub use error::{CoreError, CoreResult};
pub use intake::EventIntake;
pub use issues::{BookingIssue, BookingIssueService, IssueResolution};
pub use ledger::{EntryType, LedgerEntry, LedgerService};
pub use members::{normalize_email, Member, MemberService};
pub use passes::{BookingPass, BookingPassService, MintedPass};
pub use redemption::{RedemptionOutcome, RedemptionService};
pub use signnow::{SignNowClient, SignNowConfig};
pub use stripe_webhooks::{PriceTable, StripeWebhookHandler};
pub use waivers::{Waiver, WaiverKey, WaiverService};

use sqlx::PgPool;

/// Aggregate of all core services, wired once at startup and shared.
#[derive(Clone)]
pub struct CoreServices {
    pub members: MemberService,
    pub ledger: LedgerService,
    pub intake: EventIntake,
    pub passes: BookingPassService,
    pub issues: BookingIssueService,
    pub waivers: WaiverService,
    pub redemption: RedemptionService,
    pub email: EmailService,
    pub stripe: std::sync::Arc<StripeWebhookHandler>,
    /// Public base URL used to build `/book/{token}` links.
    pub booking_base_url: String,
}

impl CoreServices {
    /// Build the full service graph from environment configuration.
    ///
    /// Required: `PASS_TOKEN_SECRET`, `STRIPE_WEBHOOK_SECRET`,
    /// `BOOKING_BASE_URL`. Optional: `PASS_TTL_DAYS` (default 30),
    /// `STRIPE_PRICE_CREDITS`, plus the SignNow and Resend variables read by
    /// their configs.
    pub fn from_env(pool: PgPool) -> CoreResult<Self> {
        let pass_secret = require_env("PASS_TOKEN_SECRET")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let booking_base_url = require_env("BOOKING_BASE_URL")?;

        let pass_ttl_days = std::env::var("PASS_TTL_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(30);

        let email = EmailService::from_env();
        let signnow = SignNowClient::from_env();
        let passes = BookingPassService::new(pool.clone(), pass_secret, pass_ttl_days);
        let waivers = WaiverService::new(pool.clone(), signnow, email.clone());

        let stripe = StripeWebhookHandler::new(
            pool.clone(),
            passes.clone(),
            email.clone(),
            PriceTable::from_env(),
            webhook_secret,
            booking_base_url.clone(),
        );

        Ok(Self {
            members: MemberService::new(pool.clone()),
            ledger: LedgerService::new(pool.clone()),
            intake: EventIntake::new(pool.clone()),
            passes: passes.clone(),
            issues: BookingIssueService::new(pool.clone()),
            waivers: waivers.clone(),
            redemption: RedemptionService::new(pool, passes, waivers),
            email,
            stripe: std::sync::Arc::new(stripe),
            booking_base_url,
        })
    }
}

fn require_env(name: &str) -> CoreResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::Internal(format!("{name} must be set")))
}
