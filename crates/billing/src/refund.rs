//! Admin-initiated refunds
//!
//! Every refund gets a `refunds` row before the vendor is called (`pending`)
//! and is completed or failed afterwards, so a crash mid-call leaves a trace.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use stripe::{CreateRefund, Invoice, Refund, RefundReasonFilter};
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::{config_keys, PaymentProvider, SiteConfigStore, User};

use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::fastspring::FastSpringClient;
use crate::sipay::SipayClient;
use crate::subscriptions::{CancelActor, CancellationResult, SubscriptionService};

/// Stripe refuses refunds on charges older than this.
pub const REFUND_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    /// Defaults to the full charge.
    #[serde(default)]
    pub amount_cents: Option<i64>,
    pub reason: String,
    /// Cancel the subscription immediately after refunding.
    #[serde(default)]
    pub cancel: bool,
}

/// The charge a refund applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundableCharge {
    pub charge_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub admin_user_id: Uuid,
    pub provider: String,
    pub vendor_refund_id: Option<String>,
    pub vendor_charge_id: Option<String>,
    pub amount_cents: i64,
    pub reason: String,
    pub status: String,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub refund: RefundRecord,
    pub cancellation: Option<CancellationResult>,
    /// Set when the refund went through but the follow-up cancel did not.
    pub cancellation_error: Option<String>,
}

/// Validate an explicit amount against the charge; `None` means full refund.
pub fn resolve_amount(requested: Option<i64>, charged: i64) -> BillingResult<i64> {
    match requested {
        None if charged > 0 => Ok(charged),
        None => Err(BillingError::NoRefundableCharge),
        Some(amount) if amount <= 0 => Err(BillingError::InvalidInput(
            "refund amount must be positive".into(),
        )),
        Some(amount) if amount > charged => Err(BillingError::InvalidInput(format!(
            "refund amount {amount} exceeds charged amount {charged}"
        ))),
        Some(amount) => Ok(amount),
    }
}

/// True when a charge made at `created_at` can still be refunded at `now`.
pub fn within_refund_window(created_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    (now - created_at).whole_days() <= REFUND_WINDOW_DAYS
}

#[derive(Clone)]
pub struct RefundService {
    pool: PgPool,
    stripe: Option<StripeClient>,
    site_config: SiteConfigStore,
    subscriptions: SubscriptionService,
    email: BillingEmailService,
    events: BillingEventLogger,
}

impl RefundService {
    pub fn new(
        pool: PgPool,
        stripe: Option<StripeClient>,
        subscriptions: SubscriptionService,
        email: BillingEmailService,
    ) -> Self {
        Self {
            site_config: SiteConfigStore::new(pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            pool,
            stripe,
            subscriptions,
            email,
        }
    }

    pub async fn issue_refund(
        &self,
        user: &User,
        admin_user_id: Uuid,
        request: &RefundRequest,
    ) -> BillingResult<RefundOutcome> {
        if request.reason.trim().is_empty() {
            return Err(BillingError::InvalidInput("refund reason is required".into()));
        }
        let (Some(provider), Some(subscription_id)) = (user.provider(), user.subscription_id.as_deref())
        else {
            return Err(BillingError::NoSubscription);
        };

        let refund = match provider {
            PaymentProvider::Stripe => {
                self.refund_stripe(user, admin_user_id, subscription_id, request).await?
            }
            PaymentProvider::FastSpring => {
                self.refund_fastspring(user, admin_user_id, subscription_id, request).await?
            }
            PaymentProvider::Sipay => self.refund_sipay(user, admin_user_id, request).await?,
        };

        let (cancellation, cancellation_error) = if request.cancel {
            match self
                .subscriptions
                .cancel(user, true, CancelActor::Admin(admin_user_id))
                .await
            {
                Ok(result) => (Some(result), None),
                Err(e) => {
                    tracing::error!(
                        user_id = %user.id,
                        refund_id = %refund.id,
                        error = %e,
                        "Refund issued but cancellation failed"
                    );
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(RefundOutcome {
            refund,
            cancellation,
            cancellation_error,
        })
    }

    async fn refund_stripe(
        &self,
        user: &User,
        admin_user_id: Uuid,
        subscription_id: &str,
        request: &RefundRequest,
    ) -> BillingResult<RefundRecord> {
        let stripe = self
            .stripe
            .as_ref()
            .ok_or_else(|| BillingError::ProviderNotConfigured("stripe".into()))?;
        let charge = self.get_refundable_charge(stripe, subscription_id).await?;
        let amount_cents = resolve_amount(request.amount_cents, charge.amount_cents)?;

        let charge_id: stripe::ChargeId = charge
            .charge_id
            .parse()
            .map_err(|e| BillingError::RefundFailed(format!("Invalid charge ID: {}", e)))?;

        let record_id = self
            .create_refund_record(user, admin_user_id, PaymentProvider::Stripe, &charge.charge_id, amount_cents, &request.reason)
            .await?;

        let mut params = CreateRefund::new();
        params.charge = Some(charge_id);
        params.amount = Some(amount_cents);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("admin_refund".to_string(), "true".to_string());
        metadata.insert("admin_user_id".to_string(), admin_user_id.to_string());
        metadata.insert("user_id".to_string(), user.id.to_string());
        metadata.insert("reason".to_string(), request.reason.clone());
        params.metadata = Some(metadata);

        let result = Refund::create(stripe.inner(), params)
            .await
            .map(|refund| refund.id.to_string())
            .map_err(|e| BillingError::RefundFailed(e.to_string()));

        self.finish(user, admin_user_id, PaymentProvider::Stripe, record_id, &charge.currency, result).await
    }

    async fn refund_fastspring(
        &self,
        user: &User,
        admin_user_id: Uuid,
        subscription_id: &str,
        request: &RefundRequest,
    ) -> BillingResult<RefundRecord> {
        let client = FastSpringClient::from_site_config(&self.site_config).await?;
        let order_id = client.initial_order_id(subscription_id).await?;
        let order = client.order(&order_id).await?;

        // Returns are created for whole orders.
        if request.amount_cents.is_some_and(|a| a != order.amount_cents) {
            return Err(BillingError::InvalidInput(
                "FastSpring refunds cover the full order; omit amount_cents".into(),
            ));
        }
        let amount_cents = resolve_amount(None, order.amount_cents)?;

        let record_id = self
            .create_refund_record(user, admin_user_id, PaymentProvider::FastSpring, &order_id, amount_cents, &request.reason)
            .await?;
        let result = client.create_return(&order_id, &request.reason).await;
        let currency = match order.currency {
            Some(c) => c,
            None => self.default_currency().await,
        };

        self.finish(user, admin_user_id, PaymentProvider::FastSpring, record_id, &currency, result).await
    }

    async fn refund_sipay(
        &self,
        user: &User,
        admin_user_id: Uuid,
        request: &RefundRequest,
    ) -> BillingResult<RefundRecord> {
        let payment_id = user
            .customer_ref
            .as_deref()
            .ok_or(BillingError::NoRefundableCharge)?;
        let client = SipayClient::from_site_config(&self.site_config).await?;
        let payment = client.payment_status(payment_id).await?;
        let amount_cents = resolve_amount(request.amount_cents, payment.amount_cents.unwrap_or(0))?;

        let record_id = self
            .create_refund_record(user, admin_user_id, PaymentProvider::Sipay, payment_id, amount_cents, &request.reason)
            .await?;
        let result = client
            .refund(payment_id, Some(amount_cents), &request.reason)
            .await
            .map(|r| r.refund_id);
        let currency = self.default_currency().await;

        self.finish(user, admin_user_id, PaymentProvider::Sipay, record_id, &currency, result).await
    }

    /// Close the audit row and notify; the vendor result decides the status.
    async fn finish(
        &self,
        user: &User,
        admin_user_id: Uuid,
        provider: PaymentProvider,
        record_id: Uuid,
        currency: &str,
        result: BillingResult<String>,
    ) -> BillingResult<RefundRecord> {
        match result {
            Ok(vendor_refund_id) => {
                let record = self
                    .complete_refund_record(record_id, Some(&vendor_refund_id), "completed", None)
                    .await?;

                self.events
                    .log_best_effort(
                        BillingEventBuilder::new(Some(user.id), BillingEventType::RefundIssued)
                            .provider(provider)
                            .actor(admin_user_id)
                            .actor_type(ActorType::Admin)
                            .data(serde_json::json!({
                                "refund_id": record.id,
                                "vendor_refund_id": vendor_refund_id,
                                "amount_cents": record.amount_cents,
                                "reason": record.reason,
                            })),
                    )
                    .await;

                if let Err(e) = self
                    .email
                    .send_refund_issued(&user.email, record.amount_cents, currency)
                    .await
                {
                    tracing::warn!(user_id = %user.id, error = %e, "Refund email failed");
                }

                tracing::info!(
                    user_id = %user.id,
                    admin_user_id = %admin_user_id,
                    refund_id = %vendor_refund_id,
                    amount_cents = record.amount_cents,
                    "Issued refund"
                );
                Ok(record)
            }
            Err(e) => {
                let error_msg = e.to_string();
                self.complete_refund_record(record_id, None, "failed", Some(&error_msg))
                    .await?;

                self.events
                    .log_best_effort(
                        BillingEventBuilder::new(Some(user.id), BillingEventType::RefundFailed)
                            .provider(provider)
                            .actor(admin_user_id)
                            .actor_type(ActorType::Admin)
                            .data(serde_json::json!({ "refund_id": record_id, "error": error_msg })),
                    )
                    .await;

                tracing::error!(
                    user_id = %user.id,
                    refund_id = %record_id,
                    error = %error_msg,
                    "Failed to issue refund"
                );

                Err(match e {
                    BillingError::RefundFailed(_) => e,
                    other => BillingError::RefundFailed(other.to_string()),
                })
            }
        }
    }

    async fn default_currency(&self) -> String {
        self.site_config
            .get_or_env(config_keys::CURRENCY)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "USD".to_string())
    }

    /// Latest paid invoice of the subscription, if still inside the refund window.
    pub async fn get_refundable_charge(
        &self,
        stripe: &StripeClient,
        subscription_id: &str,
    ) -> BillingResult<RefundableCharge> {
        let mut params = stripe::ListInvoices::new();
        params.subscription =
            Some(subscription_id.parse().map_err(|e| {
                BillingError::RefundFailed(format!("Invalid subscription ID: {}", e))
            })?);
        params.status = Some(stripe::InvoiceStatus::Paid);
        params.limit = Some(1);

        let invoices = Invoice::list(stripe.inner(), &params).await?;

        let invoice = invoices
            .data
            .into_iter()
            .next()
            .ok_or(BillingError::NoRefundableCharge)?;

        let charge_id = invoice
            .charge
            .as_ref()
            .map(|c| c.id().to_string())
            .ok_or(BillingError::NoRefundableCharge)?;

        let created_at = invoice
            .created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        if let Some(created) = created_at {
            if !within_refund_window(created, OffsetDateTime::now_utc()) {
                return Err(BillingError::ChargeExpiredForRefund);
            }
        }

        Ok(RefundableCharge {
            charge_id,
            amount_cents: invoice.amount_paid.unwrap_or(0),
            currency: invoice
                .currency
                .map(|c| c.to_string().to_ascii_uppercase())
                .unwrap_or_else(|| "USD".to_string()),
            created_at,
        })
    }

    async fn create_refund_record(
        &self,
        user: &User,
        admin_user_id: Uuid,
        provider: PaymentProvider,
        charge_id: &str,
        amount_cents: i64,
        reason: &str,
    ) -> BillingResult<Uuid> {
        let record: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO refunds (
                user_id, admin_user_id, provider, vendor_charge_id,
                amount_cents, reason, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING id
            "#,
        )
        .bind(user.id)
        .bind(admin_user_id)
        .bind(provider.as_str())
        .bind(charge_id)
        .bind(amount_cents)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(record.0)
    }

    async fn complete_refund_record(
        &self,
        record_id: Uuid,
        vendor_refund_id: Option<&str>,
        status: &str,
        error_message: Option<&str>,
    ) -> BillingResult<RefundRecord> {
        let record = sqlx::query_as::<_, RefundRecord>(
            r#"
            UPDATE refunds
            SET vendor_refund_id = $2,
                status = $3,
                error_message = $4,
                completed_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, admin_user_id, provider, vendor_refund_id, vendor_charge_id,
                      amount_cents, reason, status, error_message, created_at, completed_at
            "#,
        )
        .bind(record_id)
        .bind(vendor_refund_id)
        .bind(status)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_refund_history(&self, user_id: Uuid) -> BillingResult<Vec<RefundRecord>> {
        let records = sqlx::query_as::<_, RefundRecord>(
            r#"
            SELECT id, user_id, admin_user_id, provider, vendor_refund_id, vendor_charge_id,
                   amount_cents, reason, status, error_message, created_at, completed_at
            FROM refunds
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
