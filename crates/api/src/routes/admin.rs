//! Admin routes
//!
//! Every route here sits behind `require_auth` + `require_admin`. Every
//! mutation writes an `admin_audit_log` row.

use axum::{
    extract::{Extension, Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_billing::{
    BillingEvent, CancelActor, CancellationResult, InvariantCheckSummary, RefundOutcome,
    RefundRecord, RefundRequest, WebhookEventRecord, WebhookReplayResult,
};
use mindscore_shared::{SiteConfigEntry, SubscriptionStatus, User};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::{auth::ProfileResponse, extract_client_ip},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

mod action {
    pub const REFUND_ISSUED: &str = "refund_issued";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription_canceled";
    pub const CONFIG_UPDATED: &str = "config_updated";
    pub const CONFIG_DELETED: &str = "config_deleted";
    pub const WEBHOOK_REPLAYED: &str = "webhook_replayed";
    pub const WEBHOOKS_BULK_REPLAYED: &str = "webhooks_bulk_replayed";
}

mod target {
    pub const USER: &str = "user";
    pub const SITE_CONFIG: &str = "site_config";
    pub const WEBHOOK_EVENT: &str = "webhook_event";
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub search: Option<String>,
    pub status: Option<SubscriptionStatus>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AdminUserSummary {
    pub id: Uuid,
    pub email: String,
    pub user_name: Option<String>,
    pub subscription_status: String,
    pub payment_provider: Option<String>,
    pub subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct AdminUserListResponse {
    pub users: Vec<AdminUserSummary>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct AdminUserDetailResponse {
    #[serde(flatten)]
    pub profile: ProfileResponse,
    pub subscription_id: Option<String>,
    pub customer_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub status_changed_at: Option<OffsetDateTime>,
    pub results_count: i64,
    pub refunds: Vec<RefundRecord>,
    pub billing_events: Vec<BillingEvent>,
}

#[derive(Debug, Deserialize)]
pub struct CancelUserRequest {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayFailedRequest {
    pub max_events: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkReplayResponse {
    pub attempted: usize,
    pub succeeded: usize,
    pub results: Vec<WebhookReplayResult>,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// `(page, limit, offset)` with the page clamped to >= 1 and the limit to 1..=100.
fn paginate(page: Option<i64>, limit: Option<i64>) -> (i64, i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, limit, (page - 1).saturating_mul(limit))
}

/// Ledger states an admin can filter on.
fn is_webhook_status(status: &str) -> bool {
    matches!(status, "processing" | "replaying" | "success" | "error")
}

struct AuditContext {
    ip_address: Option<String>,
    user_agent: Option<String>,
}

fn extract_audit_context(headers: &HeaderMap) -> AuditContext {
    AuditContext {
        ip_address: extract_client_ip(headers),
        user_agent: headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
    }
}

/// Replace credential-like fields before they reach the audit table.
fn sanitize_details(mut details: serde_json::Value) -> serde_json::Value {
    const SENSITIVE_KEYS: [&str; 7] = [
        "password",
        "password_hash",
        "token",
        "api_key",
        "secret",
        "app_secret",
        "merchant_key",
    ];

    if let Some(obj) = details.as_object_mut() {
        for key in SENSITIVE_KEYS {
            if obj.contains_key(key) {
                obj.insert(key.to_string(), serde_json::json!("[REDACTED]"));
            }
        }
    }
    details
}

async fn log_admin_action(
    state: &AppState,
    admin: &AuthUser,
    action: &str,
    target_type: &str,
    target_id: Option<String>,
    details: serde_json::Value,
    context: &AuditContext,
) -> ApiResult<()> {
    sqlx::query(
        r#"
        INSERT INTO admin_audit_log (
            admin_user_id, action, target_type, target_id, details, ip_address, user_agent
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(admin.user_id)
    .bind(action)
    .bind(target_type)
    .bind(target_id)
    .bind(sanitize_details(details))
    .bind(&context.ip_address)
    .bind(&context.user_agent)
    .execute(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(
            error = %e,
            action = %action,
            admin_user_id = %admin.user_id,
            "Failed to write admin audit log"
        );
        ApiError::Internal
    })?;

    Ok(())
}

/// For actions whose vendor side effect already happened: a failed audit
/// write must not turn a completed refund into an error response.
async fn log_admin_action_after_vendor_call(
    state: &AppState,
    admin: &AuthUser,
    action: &str,
    target_id: Uuid,
    details: serde_json::Value,
    context: &AuditContext,
) {
    let _ = log_admin_action(
        state,
        admin,
        action,
        target::USER,
        Some(target_id.to_string()),
        details,
        context,
    )
    .await;
}

async fn load_user(state: &AppState, user_id: Uuid) -> ApiResult<User> {
    User::find_by_id(&state.pool, user_id)
        .await?
        .ok_or(ApiError::NotFound)
}

// =============================================================================
// Users
// =============================================================================

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
) -> ApiResult<Json<AdminUserListResponse>> {
    let (page, limit, offset) = paginate(query.page, query.limit);
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let status = query.status.map(|s| s.as_str());

    let users: Vec<AdminUserSummary> = sqlx::query_as(
        r#"
        SELECT id, email, user_name, subscription_status, payment_provider,
               subscription_id, trial_end_date, created_at
        FROM users
        WHERE ($3::TEXT IS NULL OR email ILIKE '%' || $3 || '%' OR user_name ILIKE '%' || $3 || '%')
          AND ($4::TEXT IS NULL OR subscription_status = $4)
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .bind(search)
    .bind(status)
    .fetch_all(&state.pool)
    .await?;

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM users
        WHERE ($1::TEXT IS NULL OR email ILIKE '%' || $1 || '%' OR user_name ILIKE '%' || $1 || '%')
          AND ($2::TEXT IS NULL OR subscription_status = $2)
        "#,
    )
    .bind(search)
    .bind(status)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(AdminUserListResponse {
        users,
        total,
        page,
        limit,
    }))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<AdminUserDetailResponse>> {
    let user = load_user(&state, user_id).await?;

    let results_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM test_results WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&state.pool)
            .await?;

    let refunds = state.billing.refund.get_refund_history(user_id).await?;
    let billing_events = state.billing.events.history_for_user(user_id, 50).await?;

    Ok(Json(AdminUserDetailResponse {
        profile: ProfileResponse::from(&user),
        subscription_id: user.subscription_id.clone(),
        customer_ref: user.customer_ref.clone(),
        status_changed_at: user.status_changed_at,
        results_count,
        refunds,
        billing_events,
    }))
}

pub async fn refund_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundOutcome>> {
    let user = load_user(&state, user_id).await?;
    let context = extract_audit_context(&headers);

    tracing::info!(
        admin_user_id = %admin.user_id,
        user_id = %user_id,
        amount_cents = ?req.amount_cents,
        cancel = req.cancel,
        "Admin refund requested"
    );

    let outcome = state
        .billing
        .refund
        .issue_refund(&user, admin.user_id, &req)
        .await?;

    log_admin_action_after_vendor_call(
        &state,
        &admin,
        action::REFUND_ISSUED,
        user_id,
        serde_json::json!({
            "refund_id": outcome.refund.id,
            "provider": outcome.refund.provider,
            "amount_cents": outcome.refund.amount_cents,
            "status": outcome.refund.status,
            "reason": req.reason,
            "canceled": outcome.cancellation.is_some(),
            "cancellation_error": outcome.cancellation_error,
        }),
        &context,
    )
    .await;

    Ok(Json(outcome))
}

pub async fn cancel_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CancelUserRequest>,
) -> ApiResult<Json<CancellationResult>> {
    let user = load_user(&state, user_id).await?;
    let context = extract_audit_context(&headers);

    let result = state
        .billing
        .subscriptions
        .cancel(&user, req.immediate, CancelActor::Admin(admin.user_id))
        .await?;

    log_admin_action_after_vendor_call(
        &state,
        &admin,
        action::SUBSCRIPTION_CANCELED,
        user_id,
        serde_json::json!({
            "provider": result.provider,
            "subscription_id": result.subscription_id,
            "immediate": result.immediate,
            "status": result.status,
        }),
        &context,
    )
    .await;

    Ok(Json(result))
}

// =============================================================================
// Site config
// =============================================================================

/// Secret values are masked.
pub async fn list_config(State(state): State<AppState>) -> ApiResult<Json<Vec<SiteConfigEntry>>> {
    let entries = state.site_config.list().await?;
    Ok(Json(entries.iter().map(SiteConfigEntry::redacted).collect()))
}

pub async fn set_config(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(req): Json<SetConfigRequest>,
) -> ApiResult<Json<SiteConfigEntry>> {
    let entry = state
        .site_config
        .set(&key, req.value.trim(), admin.user_id)
        .await?
        .redacted();

    log_admin_action(
        &state,
        &admin,
        action::CONFIG_UPDATED,
        target::SITE_CONFIG,
        Some(key.clone()),
        serde_json::json!({ "key": key, "value": entry.value }),
        &extract_audit_context(&headers),
    )
    .await?;

    Ok(Json(entry))
}

pub async fn delete_config(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.site_config.delete(&key).await? {
        return Err(ApiError::NotFound);
    }

    log_admin_action(
        &state,
        &admin,
        action::CONFIG_DELETED,
        target::SITE_CONFIG,
        Some(key.clone()),
        serde_json::json!({ "key": key }),
        &extract_audit_context(&headers),
    )
    .await?;

    Ok(Json(serde_json::json!({ "deleted": key })))
}

// =============================================================================
// Webhooks
// =============================================================================

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    if let Some(status) = query.status.as_deref() {
        if !is_webhook_status(status) {
            return Err(ApiError::Validation(format!("unknown webhook status '{status}'")));
        }
    }
    let (_, limit, offset) = paginate(query.page, query.limit);

    let records = state
        .billing
        .webhooks
        .ledger()
        .list(query.status.as_deref(), limit, offset)
        .await?;

    Ok(Json(records))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let result = state.billing.webhooks.replay_webhook(record_id).await?;

    log_admin_action(
        &state,
        &admin,
        action::WEBHOOK_REPLAYED,
        target::WEBHOOK_EVENT,
        Some(record_id.to_string()),
        serde_json::json!({
            "provider": result.provider,
            "event_id": result.event_id,
            "previous_status": result.previous_status,
            "new_status": result.new_status,
        }),
        &extract_audit_context(&headers),
    )
    .await?;

    Ok(Json(result))
}

pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    headers: HeaderMap,
    body: Option<Json<ReplayFailedRequest>>,
) -> ApiResult<Json<BulkReplayResponse>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let max_events = req.max_events.map(|m| m.clamp(1, 500));

    let results = state.billing.webhooks.replay_all_failed(max_events).await?;
    let succeeded = results.iter().filter(|r| r.success).count();

    log_admin_action(
        &state,
        &admin,
        action::WEBHOOKS_BULK_REPLAYED,
        target::WEBHOOK_EVENT,
        None,
        serde_json::json!({ "attempted": results.len(), "succeeded": succeeded }),
        &extract_audit_context(&headers),
    )
    .await?;

    Ok(Json(BulkReplayResponse {
        attempted: results.len(),
        succeeded,
        results,
    }))
}

// =============================================================================
// Invariants
// =============================================================================

pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.violations.is_empty() {
        tracing::warn!(
            violations = summary.violations.len(),
            worst = ?summary.worst_severity(),
            "Billing invariant violations found"
        );
    }
    Ok(Json(summary))
}
