//! Builder for connection bearer tokens.

use chrono::{Duration, Utc};
use common::jwt::UserClaims;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{Map, Value};

/// HS256 secret accepted by test gates (32 bytes).
pub const TEST_JWT_SECRET: &str = "switchyard-test-secret-0123456789";

/// Builder for signed test tokens
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .for_user("alice")
///     .with_user_type("member")
///     .expires_in(3600)
///     .sign(TEST_JWT_SECRET);
/// ```
pub struct TestTokenBuilder {
    sub: String,
    user_type: Option<String>,
    exp: i64,
    iat: i64,
    extra: Map<String, Value>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults (valid for one hour)
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            sub: "test-user".to_string(),
            user_type: None,
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: now.timestamp(),
            extra: Map::new(),
        }
    }

    /// Set the subject (user id)
    pub fn for_user(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    pub fn with_user_type(mut self, user_type: &str) -> Self {
        self.user_type = Some(user_type.to_string());
        self
    }

    /// Add an application-specific claim
    pub fn with_claim(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.iat = timestamp;
        self
    }

    pub fn claims(self) -> UserClaims {
        UserClaims {
            sub: self.sub,
            exp: self.exp,
            iat: self.iat,
            user_type: self.user_type,
            extra: self.extra,
        }
    }

    /// Sign with HS256
    pub fn sign(self, secret: &str) -> String {
        encode(
            &Header::default(),
            &self.claims(),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("test token encoding should not fail")
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}
