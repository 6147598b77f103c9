//! Billing invariants
//!
//! Read-only consistency checks over users and the webhook ledger. They are
//! run hourly by the worker and on demand from the admin API, typically after
//! a webhook replay.
//!
//! Each check is one SQL query whose rows become [`InvariantViolation`]s
//! carrying enough context to find the affected users.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::PROCESSING_TIMEOUT_MINUTES;

/// Hours past `trial_end_date` before a trial counts as missing its renewal.
pub const TRIAL_OVERDUE_HOURS: i32 = 48;

const CHECKS: [&str; 5] = [
    "live_user_has_subscription",
    "trial_not_overdue",
    "subscription_unique_per_user",
    "refunded_user_not_active",
    "no_stuck_webhooks",
];

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected; empty for ledger-level checks
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be charged or served incorrectly
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    /// Build a summary; violations are ordered most severe first.
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        mut violations: Vec<InvariantViolation>,
    ) -> Self {
        violations.sort_by_key(|v| v.severity);
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations.iter().map(|v| v.severity).min()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserStatusRow {
    id: Uuid,
    email: String,
    subscription_status: String,
    payment_provider: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverdueTrialRow {
    id: Uuid,
    email: String,
    payment_provider: Option<String>,
    subscription_id: Option<String>,
    trial_end_date: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedSubscriptionRow {
    payment_provider: String,
    subscription_id: String,
    user_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundedActiveRow {
    id: Uuid,
    email: String,
    refunded_at: OffsetDateTime,
    amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    id: Uuid,
    provider: String,
    event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_live_user_has_subscription().await?);
        violations.extend(self.check_trial_not_overdue().await?);
        violations.extend(self.check_subscription_unique_per_user().await?);
        violations.extend(self.check_refunded_user_not_active().await?);
        violations.extend(self.check_no_stuck_webhooks().await?);

        Ok(InvariantCheckSummary::from_violations(now, CHECKS.len(), violations))
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "live_user_has_subscription" => self.check_live_user_has_subscription().await,
            "trial_not_overdue" => self.check_trial_not_overdue().await,
            "subscription_unique_per_user" => self.check_subscription_unique_per_user().await,
            "refunded_user_not_active" => self.check_refunded_user_not_active().await,
            "no_stuck_webhooks" => self.check_no_stuck_webhooks().await,
            other => Err(BillingError::NotFound(format!("invariant '{other}'"))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Users with access must point at a vendor subscription, otherwise no
    /// webhook can ever move them and they keep access for free.
    async fn check_live_user_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UserStatusRow> = sqlx::query_as(
            r#"
            SELECT id, email, subscription_status, payment_provider
            FROM users
            WHERE role = 'user'
              AND subscription_status IN ('trial', 'active', 'past_due')
              AND subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "live_user_has_subscription".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "User {} is '{}' but has no subscription reference",
                    row.email, row.subscription_status
                ),
                context: serde_json::json!({
                    "status": row.subscription_status,
                    "provider": row.payment_provider,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A trial far past its end means the renewal or cancel webhook was lost.
    async fn check_trial_not_overdue(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdueTrialRow> = sqlx::query_as(
            r#"
            SELECT id, email, payment_provider, subscription_id, trial_end_date
            FROM users
            WHERE subscription_status = 'trial'
              AND trial_end_date IS NOT NULL
              AND trial_end_date < NOW() - ($1 || ' hours')::INTERVAL
            "#,
        )
        .bind(TRIAL_OVERDUE_HOURS.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_not_overdue".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "Trial for {} ended at {} with no renewal or cancellation recorded",
                    row.email, row.trial_end_date
                ),
                context: serde_json::json!({
                    "provider": row.payment_provider,
                    "subscription_id": row.subscription_id,
                    "trial_end": row.trial_end_date.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Two users on one vendor subscription means one of them is not paying.
    async fn check_subscription_unique_per_user(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT payment_provider, subscription_id, ARRAY_AGG(id ORDER BY created_at) AS user_ids
            FROM users
            WHERE subscription_id IS NOT NULL AND payment_provider IS NOT NULL
            GROUP BY payment_provider, subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_unique_per_user".to_string(),
                description: format!(
                    "{} subscription {} is attached to {} users",
                    row.payment_provider,
                    row.subscription_id,
                    row.user_ids.len()
                ),
                context: serde_json::json!({
                    "provider": row.payment_provider,
                    "subscription_id": row.subscription_id,
                }),
                user_ids: row.user_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Refunded buyers who are still active and have had no payment since.
    async fn check_refunded_user_not_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundedActiveRow> = sqlx::query_as(
            r#"
            SELECT u.id, u.email, r.completed_at AS refunded_at, r.amount_cents
            FROM users u
            JOIN LATERAL (
                SELECT completed_at, amount_cents FROM refunds
                WHERE user_id = u.id AND status = 'completed' AND completed_at IS NOT NULL
                ORDER BY completed_at DESC
                LIMIT 1
            ) r ON TRUE
            WHERE u.subscription_status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM billing_events e
                  WHERE e.user_id = u.id
                    AND e.event_type = 'payment_succeeded'
                    AND e.created_at > r.completed_at
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunded_user_not_active".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "User {} was refunded at {} and is still active",
                    row.email, row.refunded_at
                ),
                context: serde_json::json!({
                    "refunded_at": row.refunded_at.unix_timestamp(),
                    "amount_cents": row.amount_cents,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_no_stuck_webhooks(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT id, provider, event_id, event_type, processing_started_at
            FROM webhook_events
            WHERE processing_result IN ('processing', 'replaying')
              AND processing_started_at < NOW() - ($1 || ' minutes')::INTERVAL
            ORDER BY processing_started_at ASC
            LIMIT 100
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhooks".to_string(),
                user_ids: vec![],
                description: format!(
                    "{} event {} ({}) stuck in processing",
                    row.provider, row.event_id, row.event_type
                ),
                context: serde_json::json!({
                    "record_id": row.id,
                    "started_at": row.processing_started_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
