//! Application state

use sqlx::PgPool;

use mindscore_billing::BillingService;
#[cfg(test)]
use mindscore_billing::{BillingEmailService, EmailConfig};
use mindscore_shared::SiteConfigStore;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: BillingService,
    pub site_config: SiteConfigStore,
}

impl AppState {
    /// Build state from the environment. Stripe is optional; without it the
    /// Stripe routes answer 503 and the other vendors keep working.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone(), &config.public_url)?;

        if billing.email.is_enabled() {
            tracing::info!("Billing email notifications enabled");
        } else {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }

        Ok(Self::with_billing(pool, config, billing))
    }

    pub fn with_billing(pool: PgPool, config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        Self {
            site_config: SiteConfigStore::new(pool.clone()),
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    /// State without Stripe or email delivery.
    #[cfg(test)]
    pub(crate) fn for_tests(pool: PgPool, config: Config) -> Self {
        let email = BillingEmailService::new(EmailConfig {
            api_key: None,
            from_address: "test@mindscore.app".into(),
            app_name: "Mindscore".into(),
            login_url: format!("{}/login", config.public_url),
            api_url: "http://127.0.0.1:9/emails".into(),
        });
        let billing = BillingService::new(pool.clone(), None, email, &config.public_url);
        Self::with_billing(pool, config, billing)
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }
}
