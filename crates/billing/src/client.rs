//! Stripe client wrapper and environment configuration

use std::env;

use crate::error::{BillingError, BillingResult};

/// Default trial length when neither site config nor env sets one.
pub const DEFAULT_TRIAL_DAYS: u32 = 3;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// One-time price charged when the trial starts.
    pub trial_fee_price_id: String,
    /// Recurring price billed after the trial.
    pub subscription_price_id: String,
    pub trial_days: u32,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required("STRIPE_SECRET_KEY")?;
        let webhook_secret = required("STRIPE_WEBHOOK_SECRET")?;
        let trial_fee_price_id = required("STRIPE_TRIAL_FEE_PRICE_ID")?;
        let subscription_price_id = required("STRIPE_SUBSCRIPTION_PRICE_ID")?;

        let trial_days = match env::var("TRIAL_DAYS") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                BillingError::MissingConfig(format!("TRIAL_DAYS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_TRIAL_DAYS,
        };

        let public_url =
            env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            trial_fee_price_id,
            subscription_price_id,
            trial_days,
            success_url: format!("{public_url}/results?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{public_url}/checkout?canceled=1"),
        })
    }
}

fn required(name: &str) -> BillingResult<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::MissingConfig(name.to_string()))
}

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
