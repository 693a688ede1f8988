//! Accounts for the HTTP surface: password hashing, bearer tokens,
//! registration checks and per-user request quotas

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use thiserror::Error;
use tracing::debug;

pub const JWT_KEY_VAR: &str = "JWT_KEY";

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0} is not set")]
    MissingKey(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Registration payload
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), AuthError> {
        check_length("username", &self.username, 3, 40)?;
        check_length("email", &self.email, 5, 40)?;
        check_length("password", &self.password, 5, 40)?;

        if !EMAIL_RE.is_match(&self.email) {
            return Err(AuthError::Invalid("email is not a valid address".to_string()));
        }
        if self.username.chars().any(char::is_whitespace) {
            return Err(AuthError::Invalid("username must not contain whitespace".to_string()));
        }
        Ok(())
    }
}

fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), AuthError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AuthError::Invalid(format!(
            "{} must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks bearer tokens
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_minutes: i64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_minutes,
        }
    }

    /// Signing key from `JWT_KEY`
    pub fn from_env(ttl_minutes: i64) -> Result<Self, AuthError> {
        match std::env::var(JWT_KEY_VAR) {
            Ok(secret) if !secret.is_empty() => Ok(Self::new(&secret, ttl_minutes)),
            _ => Err(AuthError::MissingKey(JWT_KEY_VAR)),
        }
    }

    pub fn issue(&self, user_id: i64, username: &str) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + self.ttl_minutes * 60,
        };
        debug!("Issuing token for {}", username);
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }
}

/// Request quota per authenticated user
pub struct UserRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl UserRateLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// True if `user` may make another request now
    pub fn check(&self, user: &str) -> bool {
        self.limiter.check_key(&user.to_string()).is_ok()
    }
}
