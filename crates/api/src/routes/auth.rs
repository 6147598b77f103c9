//! Login, profile and self-service cancellation

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_billing::{CancelActor, CancellationResult};
use mindscore_shared::{verify_login, SubscriptionStatus, User};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: ProfileResponse,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub email: String,
    pub user_name: Option<String>,
    pub iq: Option<i32>,
    pub role: String,
    pub subscription_status: SubscriptionStatus,
    pub has_access: bool,
    pub payment_provider: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&User> for ProfileResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            user_name: user.user_name.clone(),
            iq: user.iq,
            role: user.role.as_str().to_string(),
            subscription_status: user.subscription_status,
            has_access: user.subscription_status.grants_access(),
            payment_provider: user.payment_provider.clone(),
            trial_end_date: user.trial_end_date,
            created_at: user.created_at,
        }
    }
}

/// Exchange email and password for a JWT.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation("email and password are required".into()));
    }

    let user = User::find_by_email(&state.pool, &req.email).await?;
    let verified = verify_login(&req.password, user.as_ref().map(|u| u.password_hash.as_str()));

    // Same response and cost for unknown email and wrong password.
    let Some(user) = user.filter(|_| verified) else {
        tracing::info!("Login rejected");
        return Err(ApiError::Unauthorized);
    };

    let (access_token, jti) = state
        .jwt_manager
        .generate_access_token(user.id, user.role.as_str(), &user.email)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to sign access token");
            ApiError::Internal
        })?;

    tracing::info!(user_id = %user.id, jti = %jti, "User logged in");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.jwt_manager.expiry_hours() * 3600,
        user: ProfileResponse::from(&user),
    }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = User::find_by_id(&state.pool, auth_user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(ProfileResponse::from(&user)))
}

/// Cancel the caller's subscription at the end of the paid period.
pub async fn cancel_own_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancellationResult>> {
    let user = User::find_by_id(&state.pool, auth_user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let result = state
        .billing
        .subscriptions
        .cancel(&user, false, CancelActor::User(user.id))
        .await?;

    Ok(Json(result))
}
