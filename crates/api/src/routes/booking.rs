//! Booking-link redemption
//!
//! A purchaser lands here from the emailed `/book/{token}` link. The pass is
//! consumed (single-use, conditional on `used_at IS NULL`) and the visitor is
//! forwarded to the scheduling page with the token threaded through UTM
//! tracking, so the booking webhook can attribute the resulting booking back
//! to the pass.

use axum::extract::{Path, State};
use axum::response::Redirect;
use frontdesk_core::calendly::PASS_TRACKING_PARAM;

use crate::error::ApiResult;
use crate::state::AppState;

/// GET /book/{token}
pub async fn redeem_booking_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Redirect> {
    let pass = state.core.passes.redeem(&token).await?;

    tracing::info!(pass_id = %pass.id, "Booking link consumed - forwarding to scheduler");

    let target = scheduling_url(&state.config.calendly_event_url, &token);
    Ok(Redirect::to(&target))
}

fn scheduling_url(event_url: &str, token: &str) -> String {
    let separator = if event_url.contains('?') { '&' } else { '?' };
    format!("{event_url}{separator}utm_source=frontdesk&{PASS_TRACKING_PARAM}={token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_threaded_through_utm_content() {
        let url = scheduling_url("https://calendly.com/studio/session", "tok_a");
        assert_eq!(
            url,
            "https://calendly.com/studio/session?utm_source=frontdesk&utm_content=tok_a"
        );
    }

    #[test]
    fn existing_query_string_is_preserved() {
        let url = scheduling_url("https://calendly.com/studio/session?month=2026-03", "tok_a");
        assert!(url.starts_with("https://calendly.com/studio/session?month=2026-03&"));
        assert!(url.ends_with("utm_content=tok_a"));
    }
}
