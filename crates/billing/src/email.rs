//! Transactional billing emails sent through the Resend API
//!
//! Delivery is disabled when `RESEND_API_KEY` is unset; sends are then
//! logged and reported as skipped so local development needs no mail setup.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const MAX_SEND_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from_address: String,
    pub app_name: String,
    pub login_url: String,
    pub api_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let public_url =
            std::env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        Self {
            api_key: std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Mindscore <billing@mindscore.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Mindscore".to_string()),
            login_url: format!("{public_url}/login"),
            api_url: RESEND_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSendResult {
    Sent,
    Disabled,
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http: Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Welcome mail for accounts created by a payment webhook. Carries the
    /// generated password since the buyer never chose one.
    pub async fn send_welcome(
        &self,
        to: &str,
        user_name: Option<&str>,
        password: &str,
    ) -> BillingResult<EmailSendResult> {
        let app = &self.config.app_name;
        let greeting = user_name.unwrap_or("there");
        let body = format!(
            "Hi {greeting},\n\nThanks for your purchase. Your {app} account is ready.\n\n\
             Login: {}\nEmail: {to}\nPassword: {password}\n\n\
             Please change your password after signing in.",
            self.config.login_url
        );
        self.send(to, format!("Your {app} results are unlocked"), body)
            .await
    }

    pub async fn send_trial_ending(&self, to: &str, days_remaining: i64) -> BillingResult<EmailSendResult> {
        let app = &self.config.app_name;
        let body = format!(
            "Your {app} trial ends in {days_remaining} day(s). Your subscription will renew \
             automatically unless you cancel from your account page."
        );
        self.send(to, format!("Your {app} trial is ending soon"), body)
            .await
    }

    pub async fn send_payment_failed(&self, to: &str, reason: Option<&str>) -> BillingResult<EmailSendResult> {
        let app = &self.config.app_name;
        let reason = reason.unwrap_or("the charge was declined");
        let body = format!(
            "We could not renew your {app} subscription because {reason}. \
             We will retry automatically; you keep access in the meantime."
        );
        self.send(to, format!("{app}: payment failed"), body).await
    }

    pub async fn send_canceled(&self, to: &str) -> BillingResult<EmailSendResult> {
        let app = &self.config.app_name;
        let body = format!("Your {app} subscription has been canceled. You will not be charged again.");
        self.send(to, format!("{app}: subscription canceled"), body)
            .await
    }

    pub async fn send_refund_issued(&self, to: &str, amount_cents: i64, currency: &str) -> BillingResult<EmailSendResult> {
        let app = &self.config.app_name;
        let body = format!(
            "A refund of {} {} has been issued to your original payment method. \
             It may take 5-10 business days to appear.",
            format_amount(amount_cents),
            currency.to_ascii_uppercase()
        );
        self.send(to, format!("{app}: refund issued"), body).await
    }

    async fn send(&self, to: &str, subject: String, text: String) -> BillingResult<EmailSendResult> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::info!(to = %to, subject = %subject, "Email delivery disabled, skipping send");
            return Ok(EmailSendResult::Disabled);
        };

        let request = ResendEmailRequest {
            from: &self.config.from_address,
            to: vec![to],
            subject,
            text,
        };

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(500)
            .max_delay(Duration::from_secs(16))
            .map(jitter)
            .take(MAX_SEND_ATTEMPTS - 1);

        let http = &self.http;
        let url = self.config.api_url.as_str();
        let request_ref = &request;

        RetryIf::spawn(
            strategy,
            || async move {
                let response = http
                    .post(url)
                    .bearer_auth(api_key)
                    .json(request_ref)
                    .send()
                    .await
                    .map_err(|e| (true, e.to_string()))?;

                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                Err((status.is_server_error() || status.as_u16() == 429, format!("{status}: {body}")))
            },
            |(retryable, _): &(bool, String)| *retryable,
        )
        .await
        .map_err(|(_, message)| {
            tracing::error!(to = %to, error = %message, "Failed to send billing email");
            BillingError::Email(message)
        })?;

        tracing::info!(to = %to, subject = %request.subject, "Billing email sent");
        Ok(EmailSendResult::Sent)
    }
}

/// 1999 -> "19.99"
pub fn format_amount(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}
