// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Authentication
//!
//! Boundary conditions in JWT handling: expiry leeway, tampering,
//! algorithm confusion and issuer checks.

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;
    use uuid::Uuid;

    const TEST_SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn claims(exp_offset: i64, iss: &str) -> Claims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Claims {
            sub: Uuid::new_v4(),
            email: "buyer@example.com".into(),
            role: "user".into(),
            jti: Uuid::new_v4().to_string(),
            iss: iss.into(),
            iat: now - 10,
            exp: now + exp_offset,
        }
    }

    fn sign(claims: &Claims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    // =========================================================================
    // Token expired 30s ago is still inside the leeway
    // =========================================================================
    #[test]
    fn test_recently_expired_token_within_leeway() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        assert!(jwt.validate_token(&sign(&claims(-30, "mindscore"))).is_ok());
    }

    // =========================================================================
    // Token expired well past the leeway is rejected as expired
    // =========================================================================
    #[test]
    fn test_token_past_leeway_is_expired() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let token = sign(&claims(-(LEEWAY_SECS as i64) - 120, "mindscore"));
        assert!(matches!(jwt.validate_token(&token), Err(JwtError::Expired)));
    }

    // =========================================================================
    // Token minted by another issuer with the same secret is rejected
    // =========================================================================
    #[test]
    fn test_foreign_issuer_rejected() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        assert!(jwt.validate_token(&sign(&claims(3600, "someone-else"))).is_err());
    }

    // =========================================================================
    // Payload edited to claim admin breaks the signature
    // =========================================================================
    #[test]
    fn test_tampered_role_rejected() {
        let jwt = JwtManager::new(TEST_SECRET, 24);
        let (token, _) = jwt
            .generate_access_token(Uuid::new_v4(), "user", "buyer@example.com")
            .unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload = String::from_utf8(engine.decode(parts[1]).unwrap()).unwrap();
        let forged = engine.encode(payload.replace("\"role\":\"user\"", "\"role\":\"admin\""));
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert!(jwt.validate_token(&tampered).is_err());
    }

    // =========================================================================
    // Unsigned token (alg "none") is never accepted
    // =========================================================================
    #[test]
    fn test_alg_none_rejected() {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let body = engine.encode(serde_json::to_vec(&claims(3600, "mindscore")).unwrap());
        let jwt = JwtManager::new(TEST_SECRET, 24);
        assert!(jwt.validate_token(&format!("{header}.{body}.")).is_err());
    }

    // =========================================================================
    // Each login gets a distinct jti
    // =========================================================================
    #[test]
    fn test_jti_unique_per_token() {
        let jwt = JwtManager::new(TEST_SECRET, 1);
        let user = Uuid::new_v4();
        let (_, a) = jwt.generate_access_token(user, "user", "x@y.co").unwrap();
        let (_, b) = jwt.generate_access_token(user, "user", "x@y.co").unwrap();
        assert_ne!(a, b);
    }
}
