//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mindscore_billing::BillingError;
use mindscore_shared::SharedError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Full results require an access-granting subscription.
    #[error("Payment required")]
    PaymentRequired,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A payment vendor rejected or failed the call.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidSignature => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show clients. Database details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Database(_) | ApiError::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": self.public_message(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<SharedError> for ApiError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Validation(msg) => ApiError::Validation(msg),
            SharedError::UnknownVariant { kind, value } => {
                ApiError::Validation(format!("unknown {kind}: {value}"))
            }
            // The value may be a credential; keep it out of the response.
            SharedError::InvalidConfigValue { key, .. } => {
                ApiError::Validation(format!("invalid value for {key}"))
            }
            SharedError::Database(e) => e.into(),
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::WebhookPayloadInvalid(msg) | BillingError::InvalidInput(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::NoSubscription
            | BillingError::NoRefundableCharge
            | BillingError::ChargeExpiredForRefund => ApiError::Conflict(err.to_string()),
            BillingError::UserNotFound(_) | BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::ProviderNotConfigured(_) | BillingError::MissingConfig(_) => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            BillingError::StripeApi(_)
            | BillingError::VendorApi { .. }
            | BillingError::RefundFailed(_)
            | BillingError::CancellationFailed(_) => ApiError::Upstream(err.to_string()),
            BillingError::Database(msg) => ApiError::Database(msg),
            other => {
                tracing::error!(error = %other, "Unhandled billing error");
                ApiError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(BillingError::WebhookPayloadInvalid("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BillingError::NoSubscription).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(BillingError::ProviderNotConfigured("sipay".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(BillingError::RefundFailed("declined".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(BillingError::Database("timeout".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_database_details_are_hidden() {
        let err = ApiError::Database("relation users does not exist".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(ApiError::PaymentRequired.public_message(), "Payment required");
    }

    #[test]
    fn test_shared_validation_maps_to_bad_request() {
        let err: ApiError = SharedError::Validation("scores must be an object".into()).into();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
