//! Billing error types

use mindscore_shared::SharedError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("{provider} API error (status {status:?}): {message}")]
    VendorApi {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload malformed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Payment provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("User has no subscription")]
    NoSubscription,

    #[error("No refundable charge found")]
    NoRefundableCharge,

    #[error("Charge is older than the refund window")]
    ChargeExpiredForRefund,

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Cancellation failed: {0}")]
    CancellationFailed(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors a vendor should not retry: the same delivery will fail again.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid
                | BillingError::WebhookPayloadInvalid(_)
                | BillingError::WebhookEventNotSupported(_)
                | BillingError::InvalidInput(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Database(e) => BillingError::Database(e.to_string()),
            SharedError::Validation(msg) => BillingError::InvalidInput(msg),
            SharedError::InvalidConfigValue { key, value } => {
                BillingError::MissingConfig(format!("{key} has invalid value '{value}'"))
            }
            other => BillingError::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::VendorApi {
            provider: "http",
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(err.to_string())
    }
}
