//! Outbound email
//!
//! Thin wrapper over the Resend HTTP API. Email is always a best-effort side
//! effect here: callers that must not fail on delivery problems (webhook
//! handlers, the redemption protocol) log and swallow errors themselves.
//! Runs in disabled mode when no API key is configured.

use std::time::Duration;

use serde_json::json;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::error::{CoreError, CoreResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
    /// Override endpoint, for tests.
    pub api_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Frontdesk <bookings@frontdesk.example>".to_string()),
            api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| RESEND_API_URL.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct EmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    /// Send one email, retrying transient failures with exponential backoff.
    ///
    /// Only transport errors and retryable statuses (5xx, 429) are retried;
    /// a 4xx response means the request itself is wrong and repeating it
    /// cannot succeed. Disabled mode logs and reports success so email never
    /// blocks a ledger mutation in environments without a key.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> CoreResult<()> {
        if !self.is_enabled() {
            tracing::info!(to = %to, subject = %subject, "Email disabled - skipping send");
            return Ok(());
        }

        let strategy = ExponentialBackoff::from_millis(200).factor(2).take(3);

        RetryIf::spawn(
            strategy,
            || async {
                let response = self
                    .http
                    .post(&self.config.api_url)
                    .bearer_auth(&self.config.api_key)
                    .json(&json!({
                        "from": self.config.from,
                        "to": [to],
                        "subject": subject,
                        "html": html,
                    }))
                    .send()
                    .await
                    .map_err(|e| SendAttemptError {
                        retryable: true,
                        inner: e.into(),
                    })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(to = %to, status = %status, body = %body, "Email send attempt failed");
                    return Err(SendAttemptError {
                        retryable: retryable_status(status.as_u16()),
                        inner: CoreError::Provider(format!(
                            "email send failed ({status}): {body}"
                        )),
                    });
                }
                Ok(())
            },
            |e: &SendAttemptError| e.retryable,
        )
        .await
        .map_err(|e| e.inner)?;

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }

    /// Deliver a freshly minted booking link. The raw token cannot be
    /// recovered later, so this is the one chance to hand it over.
    pub async fn send_booking_link(&self, to: &str, booking_url: &str) -> CoreResult<()> {
        let html = booking_link_html(booking_url);
        self.send(to, "Your session booking link", &html).await
    }

    /// Operator-triggered payment link for an insufficient-credits issue.
    pub async fn send_pay_link(&self, to: &str, pay_url: &str) -> CoreResult<()> {
        let html = format!(
            "<p>Your recent booking could not be covered by your session credits.</p>\
             <p><a href=\"{pay_url}\">Purchase a session credit</a> to keep your booking.</p>"
        );
        self.send(to, "Action needed: session credit required", &html)
            .await
    }
}

/// One failed send attempt, tagged with whether retrying can help.
struct SendAttemptError {
    retryable: bool,
    inner: CoreError,
}

/// Server-side failures and rate limiting are worth retrying; any other 4xx
/// is a permanent rejection of this exact request.
fn retryable_status(status: u16) -> bool {
    status >= 500 || status == 429
}

/// Construct the single-use booking URL for a raw pass token.
pub fn booking_link(base_url: &str, raw_token: &str) -> String {
    format!("{}/book/{}", base_url.trim_end_matches('/'), raw_token)
}

fn booking_link_html(booking_url: &str) -> String {
    format!(
        "<p>Thanks for your purchase! Your session credit is ready.</p>\
         <p><a href=\"{booking_url}\">Click here to schedule your session</a>.</p>\
         <p>This link is single-use; once you book, it cannot be used again.</p>"
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn booking_link_joins_cleanly() {
        assert_eq!(
            booking_link("https://fd.example/", "tok_a"),
            "https://fd.example/book/tok_a"
        );
        assert_eq!(
            booking_link("https://fd.example", "tok_a"),
            "https://fd.example/book/tok_a"
        );
    }

    #[tokio::test]
    async fn disabled_service_reports_success_without_sending() {
        let service = EmailService::new(EmailConfig {
            api_key: String::new(),
            from: "x@example.com".to_string(),
            api_url: RESEND_API_URL.to_string(),
        });
        assert!(!service.is_enabled());
        assert!(service.send("a@b.c", "s", "<p>h</p>").await.is_ok());
    }

    #[test]
    fn only_server_errors_and_rate_limits_are_retryable() {
        assert!(retryable_status(500));
        assert!(retryable_status(503));
        assert!(retryable_status(429));
        assert!(!retryable_status(400));
        assert!(!retryable_status(401));
        assert!(!retryable_status(422));
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid from address"}"#)
            .expect(1)
            .create_async()
            .await;

        let service = EmailService::new(EmailConfig {
            api_key: "re_test".to_string(),
            from: "not-an-address".to_string(),
            api_url: format!("{}/emails", server.url()),
        });

        let result = service.send("a@b.c", "s", "<p>h</p>").await;
        assert!(matches!(result, Err(CoreError::Provider(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_posts_to_resend_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = EmailService::new(EmailConfig {
            api_key: "re_test".to_string(),
            from: "Frontdesk <b@fd.example>".to_string(),
            api_url: format!("{}/emails", server.url()),
        });

        service
            .send_booking_link("member@example.com", "https://fd.example/book/tok")
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
