//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Token extraction failures short-circuit before any database access
//! - Admin gate ordering
//! - End-to-end JWT authentication against Postgres (ignored without a database)

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware::{from_fn, from_fn_with_state},
        routing::get,
        Extension, Router,
    };
    use sqlx::PgPool;
    use tower::ServiceExt;
    use uuid::Uuid;

    const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only";

    /// Pool that never connects unless a query runs.
    fn lazy_pool() -> PgPool {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/mindscore_test".to_string());
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(&database_url)
            .expect("Failed to build lazy pool")
    }

    fn auth_state(pool: PgPool) -> AuthState {
        AuthState {
            jwt_manager: JwtManager::new(JWT_SECRET, 24),
            pool,
        }
    }

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.email
    }

    fn app(state: AuthState) -> Router {
        let admin = Router::new()
            .route("/admin/ping", get(|| async { "pong" }))
            .route_layer(from_fn(require_admin));

        Router::new()
            .route("/me", get(whoami))
            .merge(admin)
            .route_layer(from_fn_with_state(state, require_auth))
    }

    async fn status_for(app: Router, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri(uri);
        if let Some(value) = auth {
            req = req.header("authorization", value);
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = app(auth_state(lazy_pool()));
        assert_eq!(status_for(app, "/me", None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_garbage_token_is_unauthorized() {
        let app = app(auth_state(lazy_pool()));
        assert_eq!(
            status_for(app, "/me", Some("Bearer not.a.jwt")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_token_from_other_secret_is_unauthorized() {
        let (token, _) = JwtManager::new("another-secret-another-secret-123", 24)
            .generate_access_token(Uuid::new_v4(), "admin", "a@b.co")
            .unwrap();
        let app = app(auth_state(lazy_pool()));
        assert_eq!(
            status_for(app, "/admin/ping", Some(&format!("Bearer {token}"))).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_admin_gate_without_auth_user() {
        let app = Router::new()
            .route("/admin/ping", get(|| async { "pong" }))
            .route_layer(from_fn(require_admin));
        assert_eq!(status_for(app, "/admin/ping", None).await, StatusCode::UNAUTHORIZED);
    }

    async fn insert_user(pool: &PgPool, role: &str) -> (Uuid, String) {
        let email = format!("auth-{}@example.com", Uuid::new_v4());
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO users (email, password_hash, role) VALUES ($1, 'TEST_HASH', $2) RETURNING id",
        )
        .bind(&email)
        .bind(role)
        .fetch_one(pool)
        .await
        .expect("Failed to create test user");
        (id, email)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_valid_token_reaches_handler_and_admin_gate_applies() {
        let pool = lazy_pool();
        let (user_id, email) = insert_user(&pool, "user").await;
        let jwt = JwtManager::new(JWT_SECRET, 24);
        let (token, _) = jwt.generate_access_token(user_id, "admin", &email).unwrap();
        let bearer = format!("Bearer {token}");

        let app = app(auth_state(pool.clone()));
        assert_eq!(status_for(app.clone(), "/me", Some(&bearer)).await, StatusCode::OK);
        // Role claim says admin but the row says user.
        assert_eq!(
            status_for(app, "/admin/ping", Some(&bearer)).await,
            StatusCode::FORBIDDEN
        );

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&pool)
            .await
            .ok();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_deleted_user_token_rejected() {
        let pool = lazy_pool();
        let (user_id, email) = insert_user(&pool, "admin").await;
        let (token, _) = JwtManager::new(JWT_SECRET, 24)
            .generate_access_token(user_id, "admin", &email)
            .unwrap();
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&pool)
            .await
            .unwrap();

        let app = app(auth_state(pool));
        assert_eq!(
            status_for(app, "/me", Some(&format!("Bearer {token}"))).await,
            StatusCode::UNAUTHORIZED
        );
    }
}
