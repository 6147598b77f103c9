//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use mindscore_shared::{SubscriptionStatus, User, UserRole};

use super::jwt::{JwtError, JwtManager};

/// Cookie set by the frontend after login.
pub const AUTH_COOKIE: &str = "mindscore_auth_token";

/// Authenticated user attached to the request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub subscription_status: SubscriptionStatus,
    /// `jti` of the token used, for audit records.
    pub token_id: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

/// Bearer token from the `Authorization` header, falling back to the auth cookie.
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix(AUTH_COOKIE).and_then(|rest| rest.strip_prefix('=')))
                .filter(|t| !t.is_empty())
                .map(String::from)
        })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token).await {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role.as_str(),
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires an admin. Must run after [`require_auth`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<AuthUser>() {
        Some(user) if user.is_admin() => next.run(request).await,
        Some(user) => {
            tracing::warn!(
                user_id = %user.user_id,
                path = %request.uri().path(),
                "Unauthorized admin access attempt"
            );
            AuthError::InsufficientPermissions.into_response()
        }
        None => AuthError::MissingAuth.into_response(),
    }
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_token(token)
        .map_err(|e| match e {
            JwtError::Expired => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        })?;

    // Role and status come from the row, not the token, so demotions and
    // cancellations apply to tokens already issued.
    let user = User::find_by_id(&auth_state.pool, claims.sub)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %claims.sub, error = %e, "User lookup failed during auth");
            AuthError::DatabaseError
        })?
        .ok_or_else(|| {
            tracing::warn!(user_id = %claims.sub, "JWT subject no longer exists");
            AuthError::InvalidToken
        })?;

    Ok(AuthUser {
        user_id: user.id,
        email: user.email,
        role: user.role,
        subscription_status: user.subscription_status,
        token_id: claims.jti,
    })
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::ExpiredToken => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: Option<(&str, &str)>) -> Request {
        let mut builder = Request::builder().uri("/api/v1/me");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_header() {
        let req = request_with(Some(("authorization", "Bearer abc.def.ghi")));
        assert_eq!(extract_bearer_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_cookie_fallback() {
        let req = request_with(Some(("cookie", "theme=dark; mindscore_auth_token=tok123; x=1")));
        assert_eq!(extract_bearer_token(&req).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_similar_cookie_name_ignored() {
        let req = request_with(Some(("cookie", "mindscore_auth_token_old=stale")));
        assert_eq!(extract_bearer_token(&req), None);
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let req = request_with(Some(("authorization", "Basic dXNlcjpwYXNz")));
        assert_eq!(extract_bearer_token(&req), None);
        assert_eq!(extract_bearer_token(&request_with(None)), None);
    }

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(AuthError::MissingAuth.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::InsufficientPermissions.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::DatabaseError.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
