//! Password generation and hashing

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::sync::OnceLock;

use argon2::Argon2;
use rand::distr::{Alphanumeric, SampleString};

use crate::error::{SharedError, SharedResult};

/// Length of passwords generated for accounts created by a payment webhook.
pub const GENERATED_PASSWORD_LEN: usize = 12;

pub fn generate_password() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), GENERATED_PASSWORD_LEN)
}

pub fn hash_password(password: &str) -> SharedResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SharedError::PasswordHash(e.to_string()))
}

/// Returns false for a wrong password and for a malformed stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        tracing::warn!("Stored password hash could not be parsed");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Hash checked when no account exists, so unknown emails cost the same
/// argon2 work as wrong passwords.
fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash_password(&generate_password()).ok())
        .as_deref()
}

/// Login check. `stored_hash` is `None` for an unknown email; the result is
/// then always false, after the same amount of hashing work.
pub fn verify_login(password: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            if let Some(hash) = dummy_hash() {
                let _ = verify_password(password, hash);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.len(), GENERATED_PASSWORD_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pw, generate_password());
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret-Pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret-Pass", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_verify_login_unknown_account_is_rejected() {
        assert!(dummy_hash().is_some());
        assert!(!verify_login("anything", None));
        assert!(!verify_login("", None));
    }

    #[test]
    fn test_verify_login_checks_stored_hash() {
        let hash = hash_password("s3cret-Pass").unwrap();
        assert!(verify_login("s3cret-Pass", Some(&hash)));
        assert!(!verify_login("wrong", Some(&hash)));
    }
}
