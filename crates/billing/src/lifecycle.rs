//! Subscription lifecycle
//!
//! Vendor parsers (Stripe, FastSpring, Sipay) translate their payloads into
//! [`VendorEvent`]s. This module applies them to the user row:
//!
//! - status changes follow [`SubscriptionStatus::can_transition_to`]; an
//!   illegal step is logged and dropped, never an error, since vendors
//!   retry and reorder deliveries
//! - an event older than the user's `status_changed_at` never changes status
//! - the guarded UPDATE re-checks ordering in SQL so two concurrent
//!   deliveries cannot interleave

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::{PaymentProvider, SiteConfigStore, SubscriptionStatus, TransitionTrigger, User};

use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provisioning::{self, CheckoutDetails};

/// Provider-agnostic billing event.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    /// First payment captured; provisions or re-attaches the buyer.
    CheckoutCompleted(CheckoutDetails),
    /// Vendor reports the subscription live. Trial if `trial_end` is ahead.
    SubscriptionActivated {
        subscription_id: String,
        trial_end: Option<OffsetDateTime>,
    },
    /// Vendor reports an explicit status (Stripe `customer.subscription.updated`).
    StatusSync {
        subscription_id: String,
        status: SubscriptionStatus,
        trial_end: Option<OffsetDateTime>,
    },
    RenewalPaid {
        subscription_id: String,
        amount_cents: Option<i64>,
    },
    PaymentFailed {
        subscription_id: String,
        reason: Option<String>,
    },
    SubscriptionCanceled {
        subscription_id: String,
    },
    TrialEnding {
        subscription_id: String,
        trial_end: Option<OffsetDateTime>,
    },
    /// Refund made on the vendor side. Recorded, status untouched.
    Refunded {
        subscription_id: Option<String>,
        customer_ref: Option<String>,
        amount_cents: Option<i64>,
    },
    Ignored {
        event_type: String,
    },
}

impl PaymentEvent {
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            PaymentEvent::CheckoutCompleted(d) => d.subscription_id.as_deref(),
            PaymentEvent::SubscriptionActivated { subscription_id, .. }
            | PaymentEvent::StatusSync { subscription_id, .. }
            | PaymentEvent::RenewalPaid { subscription_id, .. }
            | PaymentEvent::PaymentFailed { subscription_id, .. }
            | PaymentEvent::SubscriptionCanceled { subscription_id }
            | PaymentEvent::TrialEnding { subscription_id, .. } => Some(subscription_id),
            PaymentEvent::Refunded { subscription_id, .. } => subscription_id.as_deref(),
            PaymentEvent::Ignored { .. } => None,
        }
    }

    /// Target status for events that move the lifecycle.
    pub fn target_status(&self, now: OffsetDateTime) -> Option<SubscriptionStatus> {
        match self {
            PaymentEvent::SubscriptionActivated { trial_end, .. } => Some(match trial_end {
                Some(end) if *end > now => SubscriptionStatus::Trial,
                _ => SubscriptionStatus::Active,
            }),
            PaymentEvent::StatusSync { status, .. } => Some(*status),
            PaymentEvent::RenewalPaid { .. } => Some(SubscriptionStatus::Active),
            PaymentEvent::PaymentFailed { .. } => Some(SubscriptionStatus::PastDue),
            PaymentEvent::SubscriptionCanceled { .. } => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

/// A parsed vendor event with the metadata needed for ordering and audit.
#[derive(Debug, Clone)]
pub struct VendorEvent {
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub event: PaymentEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleOutcome {
    Provisioned { user_id: Uuid, created: bool },
    StatusChanged { user_id: Uuid, from: SubscriptionStatus, to: SubscriptionStatus },
    Unchanged { user_id: Uuid },
    Rejected { user_id: Uuid, from: SubscriptionStatus, to: SubscriptionStatus },
    Stale { user_id: Uuid },
    UserNotFound,
    Ignored,
}

/// Decision for a single status change, computed without touching the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Apply,
    Unchanged,
    Reject,
    Stale,
}

pub fn plan_transition(
    current: SubscriptionStatus,
    status_changed_at: Option<OffsetDateTime>,
    target: SubscriptionStatus,
    occurred_at: OffsetDateTime,
    trigger: TransitionTrigger,
) -> TransitionPlan {
    if let Some(changed_at) = status_changed_at {
        if occurred_at < changed_at {
            return TransitionPlan::Stale;
        }
    }
    if current == target {
        return TransitionPlan::Unchanged;
    }
    if current.can_transition_to(target, trigger) {
        TransitionPlan::Apply
    } else {
        TransitionPlan::Reject
    }
}

#[derive(Clone)]
pub struct LifecycleService {
    pool: PgPool,
    email: BillingEmailService,
    events: BillingEventLogger,
    site_config: SiteConfigStore,
    default_trial_days: u32,
}

impl LifecycleService {
    pub fn new(pool: PgPool, email: BillingEmailService, default_trial_days: u32) -> Self {
        Self {
            events: BillingEventLogger::new(pool.clone()),
            site_config: SiteConfigStore::new(pool.clone()),
            pool,
            email,
            default_trial_days,
        }
    }

    pub async fn apply(&self, vendor_event: &VendorEvent) -> BillingResult<LifecycleOutcome> {
        match &vendor_event.event {
            PaymentEvent::CheckoutCompleted(details) => {
                let trial_days = self.site_config.trial_days(self.default_trial_days).await?;
                provisioning::provision(
                    &self.pool,
                    &self.email,
                    &self.events,
                    vendor_event,
                    details,
                    trial_days,
                )
                .await
            }
            PaymentEvent::Ignored { event_type } => {
                tracing::debug!(
                    provider = %vendor_event.provider,
                    event_type = %event_type,
                    "Ignoring unhandled vendor event"
                );
                Ok(LifecycleOutcome::Ignored)
            }
            PaymentEvent::Refunded {
                subscription_id,
                customer_ref,
                amount_cents,
            } => {
                self.record_vendor_refund(
                    vendor_event,
                    subscription_id.as_deref(),
                    customer_ref.as_deref(),
                    *amount_cents,
                )
                .await
            }
            PaymentEvent::TrialEnding {
                subscription_id,
                trial_end,
            } => self.trial_ending(vendor_event, subscription_id, *trial_end).await,
            event => {
                let Some(subscription_id) = event.subscription_id() else {
                    return Ok(LifecycleOutcome::Ignored);
                };
                let Some(target) = event.target_status(OffsetDateTime::now_utc()) else {
                    return Ok(LifecycleOutcome::Ignored);
                };
                self.transition(vendor_event, subscription_id, target, TransitionTrigger::Vendor)
                    .await
            }
        }
    }

    /// Move the user owning `subscription_id` to `target`.
    pub async fn transition(
        &self,
        vendor_event: &VendorEvent,
        subscription_id: &str,
        target: SubscriptionStatus,
        trigger: TransitionTrigger,
    ) -> BillingResult<LifecycleOutcome> {
        let provider = vendor_event.provider;
        let Some(user) = User::find_by_subscription(&self.pool, provider, subscription_id).await?
        else {
            tracing::warn!(
                provider = %provider,
                subscription_id = %subscription_id,
                event_type = %vendor_event.event_type,
                "No user for subscription, event dropped"
            );
            return Ok(LifecycleOutcome::UserNotFound);
        };

        let trial_end = match &vendor_event.event {
            PaymentEvent::SubscriptionActivated { trial_end, .. }
            | PaymentEvent::StatusSync { trial_end, .. } => *trial_end,
            _ => None,
        };

        let plan = plan_transition(
            user.subscription_status,
            user.status_changed_at,
            target,
            vendor_event.occurred_at,
            trigger,
        );

        let outcome = match plan {
            TransitionPlan::Stale => {
                self.log(&user, vendor_event, BillingEventType::StaleEventIgnored, serde_json::json!({
                    "current_status": user.subscription_status,
                    "target_status": target,
                    "status_changed_at": user.status_changed_at.map(|t| t.unix_timestamp()),
                    "event_at": vendor_event.occurred_at.unix_timestamp(),
                }))
                .await;
                tracing::info!(
                    user_id = %user.id,
                    event_id = %vendor_event.event_id,
                    "Stale vendor event ignored"
                );
                LifecycleOutcome::Stale { user_id: user.id }
            }
            TransitionPlan::Reject => {
                tracing::warn!(
                    user_id = %user.id,
                    from = %user.subscription_status,
                    to = %target,
                    event_type = %vendor_event.event_type,
                    "Rejected illegal subscription transition"
                );
                self.log(&user, vendor_event, BillingEventType::TransitionRejected, serde_json::json!({
                    "from": user.subscription_status,
                    "to": target,
                }))
                .await;
                LifecycleOutcome::Rejected {
                    user_id: user.id,
                    from: user.subscription_status,
                    to: target,
                }
            }
            TransitionPlan::Unchanged => {
                if trial_end.is_some() {
                    self.update_trial_end(user.id, trial_end).await?;
                }
                LifecycleOutcome::Unchanged { user_id: user.id }
            }
            TransitionPlan::Apply => {
                let updated = sqlx::query(
                    r#"
                    UPDATE users
                    SET subscription_status = $2,
                        status_changed_at = $3,
                        trial_end_date = COALESCE($4, trial_end_date),
                        updated_at = NOW()
                    WHERE id = $1
                      AND subscription_status = $5
                      AND (status_changed_at IS NULL OR status_changed_at <= $3)
                    "#,
                )
                .bind(user.id)
                .bind(target.as_str())
                .bind(vendor_event.occurred_at)
                .bind(trial_end)
                .bind(user.subscription_status.as_str())
                .execute(&self.pool)
                .await?;

                if updated.rows_affected() == 0 {
                    tracing::info!(
                        user_id = %user.id,
                        event_id = %vendor_event.event_id,
                        "User changed concurrently, treating event as stale"
                    );
                    return Ok(LifecycleOutcome::Stale { user_id: user.id });
                }

                tracing::info!(
                    user_id = %user.id,
                    provider = %provider,
                    from = %user.subscription_status,
                    to = %target,
                    "Subscription status changed"
                );
                self.log(&user, vendor_event, BillingEventType::StatusChanged, serde_json::json!({
                    "from": user.subscription_status,
                    "to": target,
                }))
                .await;

                LifecycleOutcome::StatusChanged {
                    user_id: user.id,
                    from: user.subscription_status,
                    to: target,
                }
            }
        };

        self.after_vendor_event(&user, vendor_event, &outcome).await;
        Ok(outcome)
    }

    /// Payment bookkeeping and customer emails that follow an applied event.
    async fn after_vendor_event(&self, user: &User, vendor_event: &VendorEvent, outcome: &LifecycleOutcome) {
        let applied = matches!(
            outcome,
            LifecycleOutcome::StatusChanged { .. } | LifecycleOutcome::Unchanged { .. }
        );
        if !applied {
            return;
        }

        match &vendor_event.event {
            PaymentEvent::RenewalPaid { amount_cents, .. } => {
                self.log(user, vendor_event, BillingEventType::PaymentSucceeded, serde_json::json!({
                    "amount_cents": amount_cents,
                }))
                .await;
            }
            PaymentEvent::PaymentFailed { reason, .. } => {
                self.log(user, vendor_event, BillingEventType::PaymentFailed, serde_json::json!({
                    "reason": reason,
                }))
                .await;
                if let Err(e) = self.email.send_payment_failed(&user.email, reason.as_deref()).await {
                    tracing::error!(user_id = %user.id, error = %e, "Failed to send payment failed email");
                }
            }
            PaymentEvent::SubscriptionCanceled { .. } => {
                if matches!(outcome, LifecycleOutcome::StatusChanged { .. }) {
                    self.log(user, vendor_event, BillingEventType::SubscriptionCanceled, serde_json::json!({}))
                        .await;
                    if let Err(e) = self.email.send_canceled(&user.email).await {
                        tracing::error!(user_id = %user.id, error = %e, "Failed to send cancellation email");
                    }
                }
            }
            _ => {}
        }
    }

    async fn trial_ending(
        &self,
        vendor_event: &VendorEvent,
        subscription_id: &str,
        trial_end: Option<OffsetDateTime>,
    ) -> BillingResult<LifecycleOutcome> {
        let Some(user) =
            User::find_by_subscription(&self.pool, vendor_event.provider, subscription_id).await?
        else {
            return Ok(LifecycleOutcome::UserNotFound);
        };

        if user.subscription_status != SubscriptionStatus::Trial {
            tracing::debug!(user_id = %user.id, status = %user.subscription_status, "Trial reminder for non-trial user skipped");
            return Ok(LifecycleOutcome::Unchanged { user_id: user.id });
        }

        if trial_end.is_some() {
            self.update_trial_end(user.id, trial_end).await?;
        }

        let end = trial_end.or(user.trial_end_date);
        let days_remaining = end
            .map(|end| (end - OffsetDateTime::now_utc()).whole_days().max(0))
            .unwrap_or(0);

        self.log(&user, vendor_event, BillingEventType::TrialEnding, serde_json::json!({
            "trial_end": end.map(|t| t.unix_timestamp()),
            "days_remaining": days_remaining,
        }))
        .await;

        if let Err(e) = self.email.send_trial_ending(&user.email, days_remaining).await {
            tracing::error!(user_id = %user.id, error = %e, "Failed to send trial ending email");
        }

        Ok(LifecycleOutcome::Unchanged { user_id: user.id })
    }

    async fn record_vendor_refund(
        &self,
        vendor_event: &VendorEvent,
        subscription_id: Option<&str>,
        customer_ref: Option<&str>,
        amount_cents: Option<i64>,
    ) -> BillingResult<LifecycleOutcome> {
        let provider = vendor_event.provider;
        let user = match (subscription_id, customer_ref) {
            (Some(sub), _) => User::find_by_subscription(&self.pool, provider, sub).await?,
            (None, Some(customer)) => User::find_by_customer(&self.pool, provider, customer).await?,
            (None, None) => None,
        };

        let Some(user) = user else {
            tracing::warn!(provider = %provider, event_id = %vendor_event.event_id, "Refund for unknown user");
            return Ok(LifecycleOutcome::UserNotFound);
        };

        self.log(&user, vendor_event, BillingEventType::RefundIssued, serde_json::json!({
            "amount_cents": amount_cents,
            "source": "vendor",
        }))
        .await;

        Ok(LifecycleOutcome::Unchanged { user_id: user.id })
    }

    async fn update_trial_end(&self, user_id: Uuid, trial_end: Option<OffsetDateTime>) -> BillingResult<()> {
        sqlx::query("UPDATE users SET trial_end_date = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(trial_end)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log(&self, user: &User, vendor_event: &VendorEvent, event_type: BillingEventType, data: serde_json::Value) {
        self.events
            .log_best_effort(
                BillingEventBuilder::new(Some(user.id), event_type)
                    .provider(vendor_event.provider)
                    .vendor_event(&vendor_event.event_id)
                    .actor_type(ActorType::Vendor)
                    .data(data),
            )
            .await;
    }
}
