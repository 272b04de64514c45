//! Calendly webhook payload model
//!
//! Only the fields the redemption protocol depends on are modeled. Everything
//! is optional at the serde layer: malformed or irrelevant deliveries are
//! expected background noise and are screened out by the extraction helpers,
//! never treated as errors.

use serde::Deserialize;
use time::OffsetDateTime;

pub const EVENT_INVITEE_CREATED: &str = "invitee.created";
pub const EVENT_INVITEE_CANCELED: &str = "invitee.canceled";

/// The UTM parameter that carries a booking-pass token through the
/// scheduling link.
pub const PASS_TRACKING_PARAM: &str = "utm_content";

#[derive(Debug, Clone, Deserialize)]
pub struct CalendlyWebhook {
    /// Event kind, e.g. "invitee.created".
    pub event: Option<String>,
    pub payload: Option<InviteePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InviteePayload {
    pub email: Option<String>,
    pub name: Option<String>,
    /// Unique per booking; the structural idempotency key for redemption.
    pub uri: Option<String>,
    pub scheduled_event: Option<ScheduledEvent>,
    pub tracking: Option<Tracking>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledEvent {
    pub uri: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tracking {
    pub utm_source: Option<String>,
    pub utm_content: Option<String>,
}

/// A validated "booking created" event with every field the protocol needs.
#[derive(Debug, Clone)]
pub struct BookingCreated {
    pub invitee_email: String,
    pub invitee_name: Option<String>,
    pub invitee_uri: String,
    pub event_uri: String,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    /// Raw booking-pass token propagated via the tracking parameter.
    pub pass_token: Option<String>,
}

impl CalendlyWebhook {
    /// Extract a booking-created event, or `None` if this delivery is not an
    /// `invitee.created` or is missing a required field.
    pub fn as_invitee_created(&self) -> Option<BookingCreated> {
        if self.event.as_deref() != Some(EVENT_INVITEE_CREATED) {
            return None;
        }
        let payload = self.payload.as_ref()?;
        let scheduled = payload.scheduled_event.as_ref()?;

        let pass_token = payload
            .tracking
            .as_ref()
            .and_then(|t| t.utm_content.clone())
            .filter(|t| !t.is_empty());

        Some(BookingCreated {
            invitee_email: payload.email.clone().filter(|e| !e.is_empty())?,
            invitee_name: payload.name.clone().filter(|n| !n.is_empty()),
            invitee_uri: payload.uri.clone().filter(|u| !u.is_empty())?,
            event_uri: scheduled.uri.clone().filter(|u| !u.is_empty())?,
            start_time: scheduled.start_time,
            end_time: scheduled.end_time,
            pass_token,
        })
    }

    /// Extract the invitee URI of an `invitee.canceled` event, if present.
    pub fn as_invitee_canceled(&self) -> Option<String> {
        if self.event.as_deref() != Some(EVENT_INVITEE_CANCELED) {
            return None;
        }
        self.payload
            .as_ref()?
            .uri
            .clone()
            .filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn created_json() -> serde_json::Value {
        serde_json::json!({
            "event": "invitee.created",
            "payload": {
                "email": "guest@example.com",
                "name": "Guest Person",
                "uri": "https://api.calendly.com/scheduled_events/ev_1/invitees/inv_1",
                "scheduled_event": {
                    "uri": "https://api.calendly.com/scheduled_events/ev_1",
                    "start_time": "2026-03-01T10:00:00Z",
                    "end_time": "2026-03-01T11:00:00Z"
                },
                "tracking": {
                    "utm_source": "frontdesk",
                    "utm_content": "tok_abc"
                }
            }
        })
    }

    #[test]
    fn parses_invitee_created_with_pass_token() {
        let hook: CalendlyWebhook = serde_json::from_value(created_json()).unwrap();
        let booking = hook.as_invitee_created().unwrap();
        assert_eq!(booking.invitee_email, "guest@example.com");
        assert!(booking.invitee_uri.ends_with("inv_1"));
        assert_eq!(booking.pass_token.as_deref(), Some("tok_abc"));
        assert!(booking.start_time.is_some());
    }

    #[test]
    fn missing_required_field_is_screened_out() {
        let mut json = created_json();
        json["payload"]["email"] = serde_json::Value::Null;
        let hook: CalendlyWebhook = serde_json::from_value(json).unwrap();
        assert!(hook.as_invitee_created().is_none());
    }

    #[test]
    fn missing_scheduled_event_is_screened_out() {
        let mut json = created_json();
        json["payload"]["scheduled_event"] = serde_json::Value::Null;
        let hook: CalendlyWebhook = serde_json::from_value(json).unwrap();
        assert!(hook.as_invitee_created().is_none());
    }

    #[test]
    fn empty_tracking_token_is_none() {
        let mut json = created_json();
        json["payload"]["tracking"]["utm_content"] = serde_json::json!("");
        let hook: CalendlyWebhook = serde_json::from_value(json).unwrap();
        let booking = hook.as_invitee_created().unwrap();
        assert!(booking.pass_token.is_none());
    }

    #[test]
    fn canceled_event_yields_invitee_uri() {
        let json = serde_json::json!({
            "event": "invitee.canceled",
            "payload": { "uri": "https://api.calendly.com/scheduled_events/ev_1/invitees/inv_1" }
        });
        let hook: CalendlyWebhook = serde_json::from_value(json).unwrap();
        assert!(hook.as_invitee_canceled().unwrap().ends_with("inv_1"));
        assert!(hook.as_invitee_created().is_none());
    }

    #[test]
    fn wrong_event_kind_is_ignored() {
        let json = serde_json::json!({ "event": "routing_form_submission.created", "payload": {} });
        let hook: CalendlyWebhook = serde_json::from_value(json).unwrap();
        assert!(hook.as_invitee_created().is_none());
        assert!(hook.as_invitee_canceled().is_none());
    }
}
