//! Append-only billing event log
//!
//! Every lifecycle change lands in `billing_events` so support can answer
//! "why is this user canceled" without reading vendor dashboards. Logging
//! is best effort: callers warn on failure and carry on.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::PaymentProvider;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    UserProvisioned,
    SubscriptionAttached,
    StatusChanged,
    TransitionRejected,
    StaleEventIgnored,
    PaymentSucceeded,
    PaymentFailed,
    TrialEnding,
    SubscriptionCanceled,
    RefundIssued,
    RefundFailed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::UserProvisioned => "user_provisioned",
            BillingEventType::SubscriptionAttached => "subscription_attached",
            BillingEventType::StatusChanged => "status_changed",
            BillingEventType::TransitionRejected => "transition_rejected",
            BillingEventType::StaleEventIgnored => "stale_event_ignored",
            BillingEventType::PaymentSucceeded => "payment_succeeded",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::TrialEnding => "trial_ending",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::RefundIssued => "refund_issued",
            BillingEventType::RefundFailed => "refund_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Vendor,
    Admin,
    User,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Vendor => "vendor",
            ActorType::Admin => "admin",
            ActorType::User => "user",
            ActorType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub provider: Option<String>,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub vendor_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Option<Uuid>,
    event_type: BillingEventType,
    provider: Option<PaymentProvider>,
    data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
    vendor_event_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(user_id: Option<Uuid>, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            provider: None,
            data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
            vendor_event_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn provider(mut self, provider: PaymentProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn vendor_event(mut self, event_id: impl Into<String>) -> Self {
        self.vendor_event_id = Some(event_id.into());
        self
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events
                (user_id, event_type, provider, event_data, actor_id, actor_type, vendor_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.provider.map(|p| p.as_str()))
        .bind(&event.data)
        .bind(event.actor_id)
        .bind(event.actor_type.as_str())
        .bind(&event.vendor_event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Log and swallow failures; the caller's work already succeeded.
    pub async fn log_best_effort(&self, event: BillingEventBuilder) {
        let event_type = event.event_type;
        if let Err(e) = self.log_event(event).await {
            tracing::warn!(
                event_type = event_type.as_str(),
                error = %e,
                "Failed to write billing event"
            );
        }
    }

    pub async fn history_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        let rows = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT id, user_id, event_type, provider, event_data, actor_id,
                   actor_type, vendor_event_id, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
