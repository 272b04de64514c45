//! SignNow client
//!
//! Thin wrapper over the SignNow REST API for the waiver lifecycle:
//! copy-template-to-document, send-invite, get-document-status, and
//! create-signing-link. Constructed explicitly with credentials; no
//! process-wide singleton. All calls carry a bounded timeout so a slow
//! provider can never hold a webhook request open.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::error::{CoreError, CoreResult};

const DEFAULT_API_BASE: &str = "https://api.signnow.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SignNowConfig {
    pub api_base: String,
    pub access_token: String,
    /// Template the waiver document is copied from for each signer.
    pub template_id: String,
    /// Sender address SignNow attributes invites to.
    pub from_email: String,
}

impl SignNowConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("SIGNNOW_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            access_token: std::env::var("SIGNNOW_ACCESS_TOKEN").unwrap_or_default(),
            template_id: std::env::var("SIGNNOW_TEMPLATE_ID").unwrap_or_default(),
            from_email: std::env::var("SIGNNOW_FROM_EMAIL").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CopyTemplateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SigningLinkResponse {
    url: Option<String>,
    url_no_signup: Option<String>,
}

#[derive(Clone)]
pub struct SignNowClient {
    http: reqwest::Client,
    config: SignNowConfig,
}

impl SignNowClient {
    pub fn new(config: SignNowConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    pub fn from_env() -> Self {
        Self::new(SignNowConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.access_token.is_empty() && !self.config.template_id.is_empty()
    }

    fn require_enabled(&self) -> CoreResult<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(CoreError::Provider(
                "SignNow not configured (missing SIGNNOW_ACCESS_TOKEN or SIGNNOW_TEMPLATE_ID)"
                    .to_string(),
            ))
        }
    }

    /// Copy the waiver template into a fresh document and return its id.
    ///
    /// Each signer gets their own document; document ids are never reused
    /// across waivers.
    pub async fn copy_template(&self, document_name: &str) -> CoreResult<String> {
        self.require_enabled()?;

        let url = format!(
            "{}/template/{}/copy",
            self.config.api_base, self.config.template_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "document_name": document_name }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "SignNow copy template failed ({status}): {body}"
            )));
        }

        let copied: CopyTemplateResponse = response.json().await?;
        tracing::info!(document_id = %copied.id, "SignNow document created from template");
        Ok(copied.id)
    }

    /// Send a signature invite for a document.
    ///
    /// SignNow rejects a second invite on the same document for the same
    /// sender/recipient pair; re-sends must go through a signing link.
    pub async fn send_invite(&self, document_id: &str, to_email: &str) -> CoreResult<()> {
        self.require_enabled()?;

        let url = format!("{}/document/{}/invite", self.config.api_base, document_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&json!({
                "from": self.config.from_email,
                "to": to_email,
                "subject": "Please sign your liability waiver",
                "message": "Sign the attached waiver before your first session.",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "SignNow invite failed ({status}): {body}"
            )));
        }

        tracing::info!(document_id = %document_id, to = %to_email, "SignNow invite sent");
        Ok(())
    }

    /// Fetch the full document status payload.
    ///
    /// Returned as raw JSON: the response shape is not guaranteed to be
    /// consistent, and completion detection applies a tiered fallback over it
    /// (see `waivers::completion_signal`).
    pub async fn get_document(&self, document_id: &str) -> CoreResult<serde_json::Value> {
        self.require_enabled()?;

        let url = format!("{}/document/{}", self.config.api_base, document_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "SignNow get document failed ({status}): {body}"
            )));
        }

        Ok(response.json().await?)
    }

    /// Create a signing link for a document, used for re-sends where a
    /// duplicate invite would be rejected.
    pub async fn create_signing_link(&self, document_id: &str) -> CoreResult<String> {
        self.require_enabled()?;

        let url = format!("{}/link", self.config.api_base);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "document_id": document_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "SignNow signing link failed ({status}): {body}"
            )));
        }

        let link: SigningLinkResponse = response.json().await?;
        link.url_no_signup
            .or(link.url)
            .ok_or_else(|| CoreError::Provider("SignNow signing link response had no url".into()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn test_client(api_base: String) -> SignNowClient {
        SignNowClient::new(SignNowConfig {
            api_base,
            access_token: "tok_test".to_string(),
            template_id: "tmpl_1".to_string(),
            from_email: "waivers@example.com".to_string(),
        })
    }

    #[test]
    fn disabled_client_errors_instead_of_calling_out() {
        let client = SignNowClient::new(SignNowConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            access_token: String::new(),
            template_id: String::new(),
            from_email: String::new(),
        });
        assert!(!client.is_enabled());
        assert!(matches!(
            client.require_enabled(),
            Err(CoreError::Provider(_))
        ));
    }

    #[tokio::test]
    async fn copy_template_returns_document_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/template/tmpl_1/copy")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"doc_123","document_name":"Waiver"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let id = client.copy_template("Waiver").await.unwrap();
        assert_eq!(id, "doc_123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn provider_error_bodies_are_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/document/doc_9/invite")
            .with_status(409)
            .with_body(r#"{"error":"duplicate invite"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client
            .send_invite("doc_9", "guest@example.com")
            .await
            .unwrap_err();
        match err {
            CoreError::Provider(msg) => assert!(msg.contains("duplicate invite")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signing_link_prefers_no_signup_url() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/link")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"url":"https://l/a","url_no_signup":"https://l/b"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let link = client.create_signing_link("doc_1").await.unwrap();
        assert_eq!(link, "https://l/b");
    }
}
