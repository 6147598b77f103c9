// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::VendorApi carries the vendor's message
#![allow(clippy::field_reassign_with_default)] // Used for conditional Stripe param fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MindScore Billing Module
//!
//! Payments for the trial-then-subscription funnel across three vendors.
//!
//! ## Features
//!
//! - **Checkout**: Stripe subscription sessions and Sipay MDWR payments
//! - **Webhooks**: Stripe, FastSpring and Sipay deliveries, deduplicated in a ledger
//! - **Lifecycle**: One state machine for trial, active, past-due and canceled
//! - **Provisioning**: Accounts created from the first successful payment
//! - **Cancellation & Refunds**: Admin actions dispatched to the right vendor
//! - **Invariants**: Consistency checks between users, refunds and webhooks
//! - **Email Notifications**: Welcome, trial ending, payment failed, canceled, refunded

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod fastspring;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod provisioning;
pub mod refund;
pub mod sipay;
pub mod stripe_webhook;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutRequest, CheckoutService, SipayCheckoutResponse, StripeCheckoutResponse};

// Client
pub use client::{StripeClient, StripeConfig, DEFAULT_TRIAL_DAYS};

// Email
pub use email::{BillingEmailService, EmailConfig, EmailSendResult};

// Error
pub use error::{BillingError, BillingResult};

// Vendors
pub use fastspring::{FastSpringClient, FastSpringWebhookParser};
pub use sipay::{SipayClient, SipayConfig, SipayWebhookParser};
pub use stripe_webhook::StripeWebhookParser;

// Lifecycle
pub use lifecycle::{LifecycleOutcome, LifecycleService, PaymentEvent, VendorEvent};
pub use provisioning::CheckoutDetails;

// Refund
pub use refund::{RefundOutcome, RefundRecord, RefundRequest, RefundService, RefundableCharge};

// Subscriptions
pub use subscriptions::{CancelActor, CancellationResult, ReconcileSummary, SubscriptionService};

// Webhooks
pub use ledger::{WebhookEventRecord, WebhookLedger, WebhookReplayResult};
pub use webhooks::{WebhookHandler, WebhookParser, WebhookReport};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub email: BillingEmailService,
    pub events: BillingEventLogger,
    pub invariants: InvariantChecker,
    pub lifecycle: LifecycleService,
    pub refund: RefundService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables.
    ///
    /// Stripe is optional: without `STRIPE_SECRET_KEY` the Stripe paths
    /// return `ProviderNotConfigured` while FastSpring and Sipay keep working.
    pub fn from_env(pool: PgPool, public_url: &str) -> BillingResult<Self> {
        let stripe = match StripeClient::from_env() {
            Ok(client) => Some(client),
            Err(BillingError::MissingConfig(name)) => {
                tracing::warn!(missing = %name, "Stripe not configured, Stripe billing disabled");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new(pool, stripe, BillingEmailService::from_env(), public_url))
    }

    /// Create a billing service with explicit clients
    pub fn new(
        pool: PgPool,
        stripe: Option<StripeClient>,
        email: BillingEmailService,
        public_url: &str,
    ) -> Self {
        let trial_days = stripe
            .as_ref()
            .map(|s| s.config().trial_days)
            .unwrap_or(DEFAULT_TRIAL_DAYS);
        let webhook_secret = stripe.as_ref().map(|s| s.config().webhook_secret.clone());

        let lifecycle = LifecycleService::new(pool.clone(), email.clone(), trial_days);
        let subscriptions = SubscriptionService::new(pool.clone(), stripe.clone(), lifecycle.clone());

        Self {
            checkout: CheckoutService::new(pool.clone(), stripe.clone(), trial_days, public_url),
            refund: RefundService::new(pool.clone(), stripe, subscriptions.clone(), email.clone()),
            webhooks: WebhookHandler::new(pool.clone(), lifecycle.clone(), webhook_secret),
            events: BillingEventLogger::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
            subscriptions,
            lifecycle,
            email,
        }
    }
}
