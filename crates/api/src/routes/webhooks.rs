//! Provider webhook endpoints
//!
//! Acknowledgement policy: a non-2xx response is reserved for requests we
//! could not authenticate or parse. Business-level failures (duplicates,
//! insufficient credits) are real outcomes and get a 200 so the provider
//! stops retrying a delivery we have already dealt with.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use frontdesk_core::calendly::{EVENT_INVITEE_CANCELED, EVENT_INVITEE_CREATED};
use frontdesk_core::{CalendlyWebhook, CoreError, RedemptionOutcome};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/stripe
pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Stripe-Signature header".to_string()))?;

    let event = state
        .core
        .stripe
        .verify_event(&body, signature)
        .map_err(|_| ApiError::Unauthorized)?;

    state.core.stripe.handle_event(event).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

/// POST /webhooks/calendly
///
/// Calendly's webhook id differs across redeliveries of the same booking, so
/// the dedup key is derived from the event kind and invitee URI instead.
pub async fn calendly(
    State(state): State<AppState>,
    Json(hook): Json<CalendlyWebhook>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if let Some(booking) = hook.as_invitee_created() {
        let dedup_key = format!("{EVENT_INVITEE_CREATED}:{}", booking.invitee_uri);
        if !claim(&state, &dedup_key, EVENT_INVITEE_CREATED).await? {
            return Ok(ack("duplicate"));
        }

        let outcome = state.core.redemption.handle_invitee_created(&booking).await?;
        return Ok(ack_outcome(outcome));
    }

    if let Some(invitee_uri) = hook.as_invitee_canceled() {
        let dedup_key = format!("{EVENT_INVITEE_CANCELED}:{invitee_uri}");
        if !claim(&state, &dedup_key, EVENT_INVITEE_CANCELED).await? {
            return Ok(ack("duplicate"));
        }

        let outcome = state
            .core
            .redemption
            .handle_invitee_canceled(&invitee_uri)
            .await?;
        return Ok(ack_outcome(outcome));
    }

    // Unknown kinds and payloads missing required fields are acknowledged;
    // redelivery would carry the same payload.
    tracing::info!(event = ?hook.event, "Ignoring Calendly delivery");
    Ok(ack("ignored"))
}

async fn claim(state: &AppState, dedup_key: &str, event_type: &str) -> Result<bool, CoreError> {
    state
        .core
        .intake
        .claim("calendly", dedup_key, Some(event_type))
        .await
}

fn ack(status: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": status })))
}

fn ack_outcome(outcome: RedemptionOutcome) -> (StatusCode, Json<serde_json::Value>) {
    let status = match outcome {
        RedemptionOutcome::Redeemed { .. } => "redeemed",
        RedemptionOutcome::AlreadyProcessed => "duplicate",
        RedemptionOutcome::InsufficientCredits { .. } => "issue_recorded",
        RedemptionOutcome::Refunded { .. } => "refunded",
        RedemptionOutcome::Ignored => "ignored",
    };
    ack(status)
}
