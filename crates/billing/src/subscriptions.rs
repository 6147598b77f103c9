//! Subscription cancellation and Stripe trial reconciliation

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CancelSubscription, Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus,
    UpdateSubscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::{
    PaymentProvider, SiteConfigStore, SubscriptionStatus, TransitionTrigger, User,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::fastspring::FastSpringClient;
use crate::lifecycle::{LifecycleOutcome, LifecycleService, PaymentEvent, VendorEvent};
use crate::sipay::SipayClient;
use crate::webhooks::timestamp_or_now;

/// Stripe status to local status. `paused` has no local counterpart; it
/// keeps access like `past_due` until Stripe resolves it.
pub fn map_stripe_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Trialing => SubscriptionStatus::Trial,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue
        | StripeSubStatus::Unpaid
        | StripeSubStatus::Incomplete
        | StripeSubStatus::Paused => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy)]
pub enum CancelActor {
    Admin(Uuid),
    User(Uuid),
}

impl CancelActor {
    fn actor_id(&self) -> Uuid {
        match self {
            CancelActor::Admin(id) | CancelActor::User(id) => *id,
        }
    }

    fn actor_type(&self) -> ActorType {
        match self {
            CancelActor::Admin(_) => ActorType::Admin,
            CancelActor::User(_) => ActorType::User,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub user_id: Uuid,
    pub provider: PaymentProvider,
    pub subscription_id: String,
    pub immediate: bool,
    /// Local status after the call. Unchanged for period-end cancellation;
    /// the vendor's cancel webhook moves it later.
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    stripe: Option<StripeClient>,
    site_config: SiteConfigStore,
    lifecycle: LifecycleService,
    events: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, stripe: Option<StripeClient>, lifecycle: LifecycleService) -> Self {
        Self {
            site_config: SiteConfigStore::new(pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            pool,
            stripe,
            lifecycle,
        }
    }

    fn stripe(&self) -> BillingResult<&StripeClient> {
        self.stripe
            .as_ref()
            .ok_or_else(|| BillingError::ProviderNotConfigured("stripe".into()))
    }

    /// Cancel at the vendor, then (when immediate) mark the user canceled.
    pub async fn cancel(
        &self,
        user: &User,
        immediate: bool,
        actor: CancelActor,
    ) -> BillingResult<CancellationResult> {
        let (Some(provider), Some(subscription_id)) = (user.provider(), user.subscription_id.clone())
        else {
            return Err(BillingError::NoSubscription);
        };

        if user.subscription_status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidInput("subscription is already canceled".into()));
        }

        match provider {
            PaymentProvider::Stripe => self.cancel_stripe(&subscription_id, immediate).await?,
            PaymentProvider::FastSpring => {
                FastSpringClient::from_site_config(&self.site_config)
                    .await?
                    .cancel_subscription(&subscription_id, immediate)
                    .await?
            }
            // MDWR has no period-end variant; the recurring plan stops now and
            // access runs until Sipay's cancel notification arrives.
            PaymentProvider::Sipay => {
                SipayClient::from_site_config(&self.site_config)
                    .await?
                    .cancel_recurring(&subscription_id)
                    .await?
            }
        }

        self.events
            .log_best_effort(
                BillingEventBuilder::new(Some(user.id), BillingEventType::SubscriptionCanceled)
                    .provider(provider)
                    .actor(actor.actor_id())
                    .actor_type(actor.actor_type())
                    .data(serde_json::json!({
                        "subscription_id": subscription_id,
                        "immediate": immediate,
                    })),
            )
            .await;

        let mut status = user.subscription_status;
        if immediate {
            let event = VendorEvent {
                provider,
                event_id: format!("cancel:{}", Uuid::new_v4()),
                event_type: "subscription.canceled_by_request".to_string(),
                occurred_at: OffsetDateTime::now_utc(),
                event: PaymentEvent::SubscriptionCanceled {
                    subscription_id: subscription_id.clone(),
                },
            };
            let trigger = match actor {
                CancelActor::Admin(_) => TransitionTrigger::Admin,
                CancelActor::User(_) => TransitionTrigger::Vendor,
            };
            if let LifecycleOutcome::StatusChanged { to, .. } = self
                .lifecycle
                .transition(&event, &subscription_id, SubscriptionStatus::Canceled, trigger)
                .await?
            {
                status = to;
            }
        }

        tracing::info!(
            user_id = %user.id,
            provider = %provider,
            subscription_id = %subscription_id,
            immediate,
            "Subscription cancellation requested"
        );

        Ok(CancellationResult {
            user_id: user.id,
            provider,
            subscription_id,
            immediate,
            status,
        })
    }

    async fn cancel_stripe(&self, subscription_id: &str, immediate: bool) -> BillingResult<()> {
        let stripe = self.stripe()?;
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let result = if immediate {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            Subscription::cancel(stripe.inner(), &sub_id, params).await
        } else {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            Subscription::update(stripe.inner(), &sub_id, params).await
        };

        result.map(|_| ()).map_err(|e| {
            tracing::error!(subscription_id = %subscription_id, error = %e, "Stripe cancellation failed");
            BillingError::CancellationFailed(format!("stripe: {e}"))
        })
    }

    /// Sync Stripe trials whose end date passed without a webhook moving them.
    pub async fn reconcile_stale_trials(&self, limit: i64) -> BillingResult<ReconcileSummary> {
        let stripe = self.stripe()?;
        let stale: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id FROM users
            WHERE payment_provider = 'stripe'
              AND subscription_status = 'trial'
              AND subscription_id IS NOT NULL
              AND trial_end_date < NOW()
            ORDER BY trial_end_date ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReconcileSummary {
            checked: stale.len(),
            ..Default::default()
        };

        for (user_id, subscription_id) in stale {
            match self.reconcile_one(stripe, &subscription_id).await {
                Ok(LifecycleOutcome::StatusChanged { from, to, .. }) => {
                    summary.changed += 1;
                    tracing::info!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        from = %from,
                        to = %to,
                        "Reconciled stale trial"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to reconcile stale trial"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        stripe: &StripeClient,
        subscription_id: &str,
    ) -> BillingResult<LifecycleOutcome> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
        let subscription = Subscription::retrieve(stripe.inner(), &sub_id, &[]).await?;
        let status = map_stripe_status(subscription.status);
        let now = OffsetDateTime::now_utc();

        let event = VendorEvent {
            provider: PaymentProvider::Stripe,
            event_id: format!("reconcile:{}:{}", subscription_id, now.unix_timestamp()),
            event_type: "reconcile.trial".to_string(),
            occurred_at: now,
            event: PaymentEvent::StatusSync {
                subscription_id: subscription_id.to_string(),
                status,
                trial_end: subscription.trial_end.map(timestamp_or_now),
            },
        };

        self.lifecycle
            .transition(&event, subscription_id, status, TransitionTrigger::Vendor)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_status_mapping() {
        assert_eq!(map_stripe_status(StripeSubStatus::Trialing), SubscriptionStatus::Trial);
        assert_eq!(map_stripe_status(StripeSubStatus::Active), SubscriptionStatus::Active);
        assert_eq!(map_stripe_status(StripeSubStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(StripeSubStatus::Unpaid), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(StripeSubStatus::Paused), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(StripeSubStatus::Canceled), SubscriptionStatus::Canceled);
        assert_eq!(
            map_stripe_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_cancel_actor_roles() {
        let id = Uuid::new_v4();
        assert!(matches!(CancelActor::Admin(id).actor_type(), ActorType::Admin));
        assert!(matches!(CancelActor::User(id).actor_type(), ActorType::User));
        assert_eq!(CancelActor::User(id).actor_id(), id);
    }
}
