//! Admin console endpoints
//!
//! Everything here sits behind the bearer-token middleware. Manual ledger
//! adjustments, booking-link re-sends, issue triage, and waiver operations
//! all go through the same core services the webhooks use, so the invariants
//! (append-only ledger, derived balances, single-use passes) hold regardless
//! of who initiated the change.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use frontdesk_core::{booking_link, CoreError, IssueResolution, WaiverKey};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn default_limit() -> i64 {
    50
}

/// GET /admin/overview
pub async fn overview(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let (members, outstanding_credits): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM members),
            (SELECT COALESCE(SUM(
                CASE entry_type WHEN 'redeem' THEN -quantity ELSE quantity END
            ), 0)::BIGINT FROM ledger_entries)
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(CoreError::from)?;

    let (open_issues, pending_waivers, live_passes): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM booking_issues WHERE resolution = 'open'),
            (SELECT COUNT(*) FROM waivers WHERE status = 'sent'),
            (SELECT COUNT(*) FROM booking_passes
             WHERE used_at IS NULL AND expires_at > NOW())
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(json!({
        "members": members,
        "outstanding_credits": outstanding_credits,
        "open_issues": open_issues,
        "pending_waivers": pending_waivers,
        "live_passes": live_passes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MemberListQuery {
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct MemberSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const MEMBER_SUMMARY_SQL: &str = r#"
    SELECT m.id, m.email, m.first_name, m.last_name, m.created_at,
        COALESCE((
            SELECT SUM(CASE entry_type WHEN 'redeem' THEN -quantity ELSE quantity END)
            FROM ledger_entries WHERE member_id = m.id
        ), 0)::BIGINT AS balance
    FROM members m
"#;

/// GET /admin/members
pub async fn list_members(
    State(state): State<AppState>,
    Query(query): Query<MemberListQuery>,
) -> ApiResult<Json<Vec<MemberSummary>>> {
    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);

    let members: Vec<MemberSummary> = match &query.search {
        Some(term) if !term.trim().is_empty() => {
            let pattern = format!("%{}%", term.trim());
            sqlx::query_as(&format!(
                r#"{MEMBER_SUMMARY_SQL}
                WHERE m.email ILIKE $1
                    OR m.first_name ILIKE $1
                    OR m.last_name ILIKE $1
                ORDER BY m.created_at DESC
                LIMIT $2 OFFSET $3
                "#
            ))
            .bind(&pattern)
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.pool)
            .await
        }
        _ => {
            sqlx::query_as(&format!(
                "{MEMBER_SUMMARY_SQL} ORDER BY m.created_at DESC LIMIT $1 OFFSET $2"
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.pool)
            .await
        }
    }
    .map_err(CoreError::from)?;

    Ok(Json(members))
}

/// GET /admin/members/{id}
pub async fn member_detail(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let member = state
        .core
        .members
        .find_by_id(member_id)
        .await?
        .ok_or(CoreError::MemberNotFound(member_id))?;

    let balance = state.core.ledger.balance(member_id).await?;
    let entries = state.core.ledger.entries(member_id).await?;
    let passes = state.core.passes.list_for_email(&member.email).await?;
    let waivers = state.core.waivers.list_for_member(member_id).await?;

    Ok(Json(json!({
        "member": member,
        "balance": balance,
        "ledger": entries,
        "passes": passes,
        "waivers": waivers,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreditAdjustment {
    /// "grant", "redeem", or "refund".
    pub action: String,
    pub quantity: i64,
    pub reason: String,
    pub actor: Option<Uuid>,
}

/// POST /admin/members/{id}/credits
pub async fn adjust_credits(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
    Json(body): Json<CreditAdjustment>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state
        .core
        .members
        .find_by_id(member_id)
        .await?
        .ok_or(CoreError::MemberNotFound(member_id))?;

    if body.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".to_string()));
    }

    let ledger = &state.core.ledger;
    let entry = match body.action.as_str() {
        "grant" => {
            ledger
                .grant(member_id, body.quantity, body.reason.trim(), body.actor)
                .await?
        }
        "redeem" => {
            ledger
                .redeem(member_id, body.quantity, body.reason.trim(), body.actor)
                .await?
        }
        "refund" => {
            ledger
                .refund(member_id, body.quantity, body.reason.trim(), body.actor)
                .await?
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown action '{other}' (expected grant, redeem, or refund)"
            )))
        }
    };

    let balance = ledger.balance(member_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "entry": entry, "balance": balance })),
    ))
}

/// POST /admin/members/{id}/resend-booking-link
///
/// Mints a fresh pass (soft-revoking any live one) and emails the link. Used
/// when the original purchase email was lost or expired.
pub async fn resend_booking_link(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let member = state
        .core
        .members
        .find_by_id(member_id)
        .await?
        .ok_or(CoreError::MemberNotFound(member_id))?;

    let minted = state.core.passes.mint(&member.email, None).await?;
    let link = booking_link(&state.core.booking_base_url, &minted.raw_token);
    state.core.email.send_booking_link(&member.email, &link).await?;

    tracing::info!(
        member_id = %member_id,
        pass_id = %minted.id,
        "Booking link re-sent"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({ "pass_id": minted.id, "expires_at": minted.expires_at.to_string() })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct IssueListQuery {
    pub resolution: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// GET /admin/issues
pub async fn list_issues(
    State(state): State<AppState>,
    Query(query): Query<IssueListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let resolution = match &query.resolution {
        Some(raw) => Some(
            IssueResolution::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown resolution '{raw}'")))?,
        ),
        None => None,
    };

    let issues = state
        .core
        .issues
        .list(resolution, query.limit.clamp(1, 500))
        .await?;

    Ok(Json(json!({ "issues": issues })))
}

/// GET /admin/issues/{id}
pub async fn issue_detail(
    State(state): State<AppState>,
    Path(issue_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let issue = state
        .core
        .issues
        .find_by_id(issue_id)
        .await?
        .ok_or(CoreError::IssueNotFound(issue_id))?;
    let history = state.core.issues.history(issue_id).await?;

    Ok(Json(json!({ "issue": issue, "history": history })))
}

#[derive(Debug, Deserialize)]
pub struct ResolutionUpdate {
    pub resolution: IssueResolution,
    pub actor: Option<Uuid>,
    pub notes: Option<String>,
}

/// POST /admin/issues/{id}/resolution
pub async fn update_issue_resolution(
    State(state): State<AppState>,
    Path(issue_id): Path<Uuid>,
    Json(body): Json<ResolutionUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let issue = state
        .core
        .issues
        .update_resolution(issue_id, body.resolution, body.actor, body.notes.as_deref())
        .await?;

    Ok(Json(json!({ "issue": issue })))
}

#[derive(Debug, Deserialize)]
pub struct PayLinkRequest {
    pub pay_url: String,
    pub actor: Option<Uuid>,
}

/// POST /admin/issues/{id}/send-pay-link
///
/// Emails the customer a payment link and records the `sent_pay_link`
/// transition in the issue history.
pub async fn send_pay_link(
    State(state): State<AppState>,
    Path(issue_id): Path<Uuid>,
    Json(body): Json<PayLinkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.pay_url.trim().is_empty() {
        return Err(ApiError::BadRequest("pay_url is required".to_string()));
    }

    let issue = state
        .core
        .issues
        .find_by_id(issue_id)
        .await?
        .ok_or(CoreError::IssueNotFound(issue_id))?;

    state
        .core
        .email
        .send_pay_link(&issue.invitee_email, body.pay_url.trim())
        .await?;

    let issue = state
        .core
        .issues
        .update_resolution(
            issue_id,
            IssueResolution::SentPayLink,
            body.actor,
            Some(&format!("pay link sent to {}", issue.invitee_email)),
        )
        .await?;

    Ok(Json(json!({ "issue": issue })))
}

#[derive(Debug, Deserialize)]
pub struct SendWaiverRequest {
    pub member_id: Uuid,
}

/// POST /admin/waivers/send
///
/// Sends (or re-sends) the member's annual waiver for the current year.
pub async fn send_waiver(
    State(state): State<AppState>,
    Json(body): Json<SendWaiverRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let member = state
        .core
        .members
        .find_by_id(body.member_id)
        .await?
        .ok_or(CoreError::MemberNotFound(body.member_id))?;

    let waiver = state
        .core
        .waivers
        .send(WaiverKey::annual(member.id), &member.email)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "waiver": waiver }))))
}

/// POST /admin/waivers/{id}/check
///
/// On-demand reconciliation of a single waiver against the signature
/// provider.
pub async fn check_waiver(
    State(state): State<AppState>,
    Path(waiver_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let newly_signed = state.core.waivers.check_one(waiver_id).await?;
    Ok(Json(json!({ "newly_signed": newly_signed })))
}

/// POST /admin/waivers/{id}/mark-signed
///
/// Manual override for waivers signed out of band (paper, in person).
pub async fn mark_waiver_signed(
    State(state): State<AppState>,
    Path(waiver_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let waiver = state.core.waivers.mark_signed(waiver_id).await?;
    Ok(Json(json!({ "waiver": waiver })))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReconcileRequest {
    pub limit: Option<i64>,
}

/// POST /admin/waivers/reconcile
pub async fn reconcile_waivers(
    State(state): State<AppState>,
    body: Option<Json<ReconcileRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = body
        .and_then(|Json(b)| b.limit)
        .unwrap_or(50)
        .clamp(1, 500);

    let summary = state.core.waivers.reconcile_pending(limit).await?;
    Ok(Json(json!({ "summary": summary })))
}
