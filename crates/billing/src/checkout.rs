//! Checkout session creation
//!
//! Nothing is written locally here: the account is provisioned when the
//! vendor's completion webhook arrives. Buyer details ride along as vendor
//! metadata so the webhook can create the user.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData,
};
use uuid::Uuid;

use mindscore_shared::{config_keys, models::test_result::IQ_RANGE, SiteConfigStore};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::sipay::{CreatePaymentRequest, SipayClient};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub email: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub iq: Option<i32>,
    #[serde(default)]
    pub test_kind: Option<String>,
}

impl CheckoutRequest {
    /// Normalized email, or an error when it cannot be a mailbox.
    pub fn validated_email(&self) -> BillingResult<String> {
        let email = self.email.trim().to_ascii_lowercase();
        let valid = email.len() <= 254
            && email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(BillingError::InvalidInput("a valid email is required".into()));
        }
        if let Some(iq) = self.iq {
            if !IQ_RANGE.contains(&iq) {
                return Err(BillingError::InvalidInput(format!("iq {iq} out of range")));
            }
        }
        Ok(email)
    }

    /// Metadata copied onto the vendor session.
    pub fn metadata(&self, email: &str) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("email".to_string(), email.to_string());
        if let Some(name) = self.user_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            metadata.insert("user_name".to_string(), name.to_string());
        }
        if let Some(iq) = self.iq {
            metadata.insert("iq".to_string(), iq.to_string());
        }
        if let Some(kind) = &self.test_kind {
            metadata.insert("test_kind".to_string(), kind.clone());
        }
        metadata
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StripeCheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SipayCheckoutResponse {
    pub payment_id: String,
    pub redirect_url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: Option<StripeClient>,
    site_config: SiteConfigStore,
    default_trial_days: u32,
    public_url: String,
}

impl CheckoutService {
    pub fn new(
        pool: PgPool,
        stripe: Option<StripeClient>,
        default_trial_days: u32,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            stripe,
            site_config: SiteConfigStore::new(pool),
            default_trial_days,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Subscription-mode session: the one-time trial fee plus the recurring
    /// price, with the trial length taken from site config.
    pub async fn create_stripe_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<StripeCheckoutResponse> {
        let stripe = self
            .stripe
            .as_ref()
            .ok_or_else(|| BillingError::ProviderNotConfigured("stripe".into()))?;
        let email = request.validated_email()?;
        let trial_days = self.site_config.trial_days(self.default_trial_days).await?;
        let config = stripe.config();
        let metadata = request.metadata(&email);

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&config.success_url);
        params.cancel_url = Some(&config.cancel_url);
        params.customer_email = Some(&email);
        params.line_items = Some(vec![
            CreateCheckoutSessionLineItems {
                price: Some(config.trial_fee_price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            },
            CreateCheckoutSessionLineItems {
                price: Some(config.subscription_price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            },
        ]);
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            trial_period_days: (trial_days > 0).then_some(trial_days),
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(stripe.inner(), params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("checkout session has no url".into()))?;

        tracing::info!(
            session_id = %session.id,
            trial_days,
            "Created Stripe checkout session"
        );

        Ok(StripeCheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }

    /// MDWR payment for the trial fee with recurring billing enabled.
    pub async fn create_sipay_payment(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<SipayCheckoutResponse> {
        let email = request.validated_email()?;
        let amount_cents: u32 = self
            .site_config
            .get_parsed(config_keys::TRIAL_FEE_CENTS)
            .await?
            .ok_or_else(|| BillingError::MissingConfig(config_keys::TRIAL_FEE_CENTS.into()))?;
        let currency = self
            .site_config
            .get_or_env(config_keys::CURRENCY)
            .await?
            .unwrap_or_else(|| "USD".to_string());

        let client = SipayClient::from_site_config(&self.site_config).await?;
        let order_ref = format!("ms_{}", Uuid::new_v4().simple());

        let created = client
            .create_payment(&CreatePaymentRequest {
                order_ref: order_ref.clone(),
                email: email.clone(),
                amount_cents: i64::from(amount_cents),
                currency,
                recurring: true,
                recurring_plan: client.config().recurring_plan.clone(),
                return_url: format!("{}/results?order={order_ref}", self.public_url),
                cancel_url: format!("{}/checkout?canceled=1", self.public_url),
                metadata: request.metadata(&email),
            })
            .await?;

        Ok(SipayCheckoutResponse {
            payment_id: created.payment_id,
            redirect_url: created.redirect_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(email: &str, iq: Option<i32>) -> CheckoutRequest {
        CheckoutRequest {
            email: email.to_string(),
            user_name: Some("  Ada ".into()),
            iq,
            test_kind: Some("iq".into()),
        }
    }

    #[test]
    fn test_email_is_normalized() {
        assert_eq!(
            request(" Buyer@Example.COM ", None).validated_email().unwrap(),
            "buyer@example.com"
        );
    }

    #[test]
    fn test_invalid_emails_rejected() {
        for email in ["", "buyer", "@example.com", "buyer@localhost"] {
            assert!(request(email, None).validated_email().is_err(), "{email}");
        }
    }

    #[test]
    fn test_iq_range_checked() {
        assert!(request("a@b.co", Some(IQ_RANGE.start() - 1)).validated_email().is_err());
        assert!(request("a@b.co", Some(*IQ_RANGE.start())).validated_email().is_ok());
        assert!(request("a@b.co", Some(*IQ_RANGE.end())).validated_email().is_ok());
        assert!(request("a@b.co", Some(IQ_RANGE.end() + 1)).validated_email().is_err());
    }

    #[test]
    fn test_metadata_carries_buyer() {
        let metadata = request("a@b.co", Some(120)).metadata("a@b.co");
        assert_eq!(metadata.get("email").map(String::as_str), Some("a@b.co"));
        assert_eq!(metadata.get("user_name").map(String::as_str), Some("Ada"));
        assert_eq!(metadata.get("iq").map(String::as_str), Some("120"));
        assert_eq!(metadata.get("test_kind").map(String::as_str), Some("iq"));
    }
}
