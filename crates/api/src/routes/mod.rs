//! Route definitions

mod admin;
mod booking;
mod webhooks;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;

use crate::auth::require_admin;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/overview", get(admin::overview))
        .route("/members", get(admin::list_members))
        .route("/members/{id}", get(admin::member_detail))
        .route("/members/{id}/credits", post(admin::adjust_credits))
        .route(
            "/members/{id}/resend-booking-link",
            post(admin::resend_booking_link),
        )
        .route("/issues", get(admin::list_issues))
        .route("/issues/{id}", get(admin::issue_detail))
        .route("/issues/{id}/resolution", post(admin::update_issue_resolution))
        .route("/issues/{id}/send-pay-link", post(admin::send_pay_link))
        .route("/waivers/send", post(admin::send_waiver))
        .route("/waivers/reconcile", post(admin::reconcile_waivers))
        .route("/waivers/{id}/check", post(admin::check_waiver))
        .route("/waivers/{id}/mark-signed", post(admin::mark_waiver_signed))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe))
        .route("/webhooks/calendly", post(webhooks::calendly))
        .route("/book/{token}", get(booking::redeem_booking_link))
        .nest("/admin", admin_routes)
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
