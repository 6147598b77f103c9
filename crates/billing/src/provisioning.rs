//! Account provisioning from a completed checkout
//!
//! A buyer has no account until the first payment webhook arrives. The user
//! row and its subscription reference are written in one transaction; the
//! welcome email goes out only after commit and its failure never fails the
//! webhook, since the money is already captured.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use mindscore_shared::{
    generate_password, hash_password, SubscriptionStatus, TransitionTrigger, User,
};

use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::lifecycle::{LifecycleOutcome, VendorEvent};

/// Buyer details carried by a checkout/order completion event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckoutDetails {
    pub email: String,
    pub user_name: Option<String>,
    pub iq: Option<i32>,
    pub subscription_id: Option<String>,
    pub customer_ref: Option<String>,
    pub trial_end: Option<OffsetDateTime>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

/// Status and trial end for a fresh subscription. A vendor-supplied trial end
/// wins; otherwise the configured trial length applies when positive.
pub fn initial_status(
    trial_end: Option<OffsetDateTime>,
    trial_days: u32,
    occurred_at: OffsetDateTime,
) -> (SubscriptionStatus, Option<OffsetDateTime>) {
    match trial_end {
        Some(end) if end > occurred_at => (SubscriptionStatus::Trial, Some(end)),
        Some(_) => (SubscriptionStatus::Active, None),
        None if trial_days > 0 => (
            SubscriptionStatus::Trial,
            Some(occurred_at + Duration::days(i64::from(trial_days))),
        ),
        None => (SubscriptionStatus::Active, None),
    }
}

pub(crate) async fn provision(
    pool: &PgPool,
    email_service: &BillingEmailService,
    events: &BillingEventLogger,
    vendor_event: &VendorEvent,
    details: &CheckoutDetails,
    trial_days: u32,
) -> BillingResult<LifecycleOutcome> {
    let email = details.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(BillingError::InvalidInput(format!(
            "checkout {} has no usable email",
            vendor_event.event_id
        )));
    }

    let provider = vendor_event.provider;
    let (status, trial_end) = initial_status(details.trial_end, trial_days, vendor_event.occurred_at);

    let mut tx = pool.begin().await?;
    let existing = User::find_by_email(&mut *tx, &email).await?;

    let (user_id, generated_password, event_type) = match existing {
        None => {
            let password = generate_password();
            let password_hash = hash_password(&password)?;

            let (user_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO users (
                    email, password_hash, user_name, iq, subscription_status,
                    payment_provider, subscription_id, customer_ref,
                    trial_end_date, status_changed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
            )
            .bind(&email)
            .bind(&password_hash)
            .bind(&details.user_name)
            .bind(details.iq)
            .bind(status.as_str())
            .bind(provider.as_str())
            .bind(&details.subscription_id)
            .bind(&details.customer_ref)
            .bind(trial_end)
            .bind(vendor_event.occurred_at)
            .fetch_one(&mut *tx)
            .await?;

            (user_id, Some(password), BillingEventType::UserProvisioned)
        }
        Some(user)
            if user.provider() == Some(provider)
                && user.subscription_id.is_some()
                && user.subscription_id == details.subscription_id =>
        {
            tx.rollback().await?;
            tracing::info!(
                user_id = %user.id,
                event_id = %vendor_event.event_id,
                "Checkout already provisioned, nothing to do"
            );
            return Ok(LifecycleOutcome::Unchanged { user_id: user.id });
        }
        Some(user) => {
            let next_status = if user
                .subscription_status
                .can_transition_to(status, TransitionTrigger::Checkout)
            {
                status
            } else {
                user.subscription_status
            };

            sqlx::query(
                r#"
                UPDATE users
                SET subscription_status = $2,
                    payment_provider = $3,
                    subscription_id = COALESCE($4, subscription_id),
                    customer_ref = COALESCE($5, customer_ref),
                    trial_end_date = CASE WHEN $2 = 'trial' THEN $6 ELSE trial_end_date END,
                    status_changed_at = $7,
                    user_name = COALESCE(user_name, $8),
                    iq = COALESCE($9, iq),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(user.id)
            .bind(next_status.as_str())
            .bind(provider.as_str())
            .bind(&details.subscription_id)
            .bind(&details.customer_ref)
            .bind(trial_end)
            .bind(vendor_event.occurred_at)
            .bind(&details.user_name)
            .bind(details.iq)
            .execute(&mut *tx)
            .await?;

            if next_status != status {
                tracing::warn!(
                    user_id = %user.id,
                    current = %user.subscription_status,
                    requested = %status,
                    "Checkout for live subscriber, keeping current status"
                );
            }

            (user.id, None, BillingEventType::SubscriptionAttached)
        }
    };

    tx.commit().await?;

    events
        .log_best_effort(
            BillingEventBuilder::new(Some(user_id), event_type)
                .provider(provider)
                .vendor_event(&vendor_event.event_id)
                .actor_type(ActorType::Vendor)
                .data(serde_json::json!({
                    "subscription_id": details.subscription_id,
                    "status": status,
                    "trial_end": trial_end.map(|t| t.unix_timestamp()),
                    "amount_cents": details.amount_cents,
                    "currency": details.currency,
                })),
        )
        .await;

    let created = generated_password.is_some();
    if let Some(password) = generated_password {
        if let Err(e) = email_service
            .send_welcome(&email, details.user_name.as_deref(), &password)
            .await
        {
            tracing::error!(
                user_id = %user_id,
                error = %e,
                "Welcome email failed after provisioning"
            );
        }
    }

    tracing::info!(
        user_id = %user_id,
        provider = %provider,
        created = created,
        status = %status,
        "Checkout provisioned"
    );

    Ok(LifecycleOutcome::Provisioned { user_id, created })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_trial_end_wins() {
        let at = OffsetDateTime::now_utc();
        let end = at + Duration::days(7);
        assert_eq!(
            initial_status(Some(end), 3, at),
            (SubscriptionStatus::Trial, Some(end))
        );
    }

    #[test]
    fn test_configured_trial_length_applies() {
        let at = OffsetDateTime::now_utc();
        let (status, end) = initial_status(None, 3, at);
        assert_eq!(status, SubscriptionStatus::Trial);
        assert_eq!(end, Some(at + Duration::days(3)));
    }

    #[test]
    fn test_zero_trial_days_starts_active() {
        let at = OffsetDateTime::now_utc();
        assert_eq!(initial_status(None, 0, at), (SubscriptionStatus::Active, None));
    }

    #[test]
    fn test_elapsed_vendor_trial_starts_active() {
        let at = OffsetDateTime::now_utc();
        let (status, end) = initial_status(Some(at - Duration::hours(1)), 3, at);
        assert_eq!(status, SubscriptionStatus::Active);
        assert!(end.is_none());
    }
}
