//! Bearer-token gate for new connections.
//!
//! The token travels in a query parameter of the connection URL (browsers
//! cannot set headers on a WebSocket handshake). It is an HS256 JWT verified
//! with `common::jwt`:
//! - size-checked before parsing
//! - signature and `exp` validated
//! - `iat` validated against the configured clock skew

use common::jwt::{verify_hs256, JwtValidationError, UserClaims};
use common::secret::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Base used to resolve path-only connection URLs (`/ws?token=...`).
const RELATIVE_URL_BASE: &str = "http://localhost";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// No token and anonymous connections are not allowed.
    #[error("authentication required")]
    MissingToken,

    /// Token present but invalid or expired.
    #[error("invalid token: {0}")]
    InvalidToken(#[from] JwtValidationError),

    /// Connection URL could not be parsed.
    #[error("malformed connection URL")]
    MalformedUrl,
}

/// Identity established by a valid token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub user_type: Option<String>,
    pub claims: UserClaims,
}

pub struct AuthGate {
    enabled: bool,
    secret: Option<SecretString>,
    query_param: String,
    clock_skew: Duration,
    allow_anonymous: bool,
}

impl AuthGate {
    /// Gate that verifies tokens signed with `secret`.
    pub fn new(
        secret: SecretString,
        query_param: impl Into<String>,
        clock_skew: Duration,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            enabled: true,
            secret: Some(secret),
            query_param: query_param.into(),
            clock_skew,
            allow_anonymous,
        }
    }

    /// Gate that admits every connection anonymously.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            secret: None,
            query_param: "token".to_string(),
            clock_skew: common::jwt::DEFAULT_CLOCK_SKEW,
            allow_anonymous: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate the token carried by `connection_url`, if any.
    ///
    /// Returns `Ok(None)` when no token is present (or the gate is disabled).
    ///
    /// # Errors
    ///
    /// `InvalidToken` for a present but invalid or expired token.
    pub fn validate(
        &self,
        connection_url: &str,
    ) -> Result<Option<AuthContext>, AuthenticationError> {
        let Some(secret) = self.secret.as_ref().filter(|_| self.enabled) else {
            return Ok(None);
        };
        let Some(token) = extract_token(connection_url, &self.query_param)? else {
            return Ok(None);
        };

        let claims = verify_hs256(&token, secret.expose_secret().as_bytes(), self.clock_skew)
            .map_err(|e| {
                debug!(target: "sy.auth", error = ?e, "Token rejected");
                AuthenticationError::InvalidToken(e)
            })?;

        Ok(Some(AuthContext {
            user_id: claims.sub.clone(),
            user_type: claims.user_type.clone(),
            claims,
        }))
    }

    /// Apply [`AuthGate::validate`] and the anonymous-connection policy.
    ///
    /// # Errors
    ///
    /// Everything `validate` rejects, plus `MissingToken` when no token was
    /// sent and anonymous connections are not allowed.
    pub fn admit(&self, connection_url: &str) -> Result<Option<AuthContext>, AuthenticationError> {
        match self.validate(connection_url)? {
            Some(context) => Ok(Some(context)),
            None if !self.enabled || self.allow_anonymous => Ok(None),
            None => Err(AuthenticationError::MissingToken),
        }
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.enabled)
            .field("query_param", &self.query_param)
            .field("clock_skew", &self.clock_skew)
            .field("allow_anonymous", &self.allow_anonymous)
            .finish_non_exhaustive()
    }
}

/// Read `param` from the query of `connection_url`. Empty values count as
/// absent.
fn extract_token(connection_url: &str, param: &str) -> Result<Option<String>, AuthenticationError> {
    let url = match Url::parse(connection_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(RELATIVE_URL_BASE)
            .and_then(|base| base.join(connection_url))
            .map_err(|_| AuthenticationError::MalformedUrl)?,
        Err(_) => return Err(AuthenticationError::MalformedUrl),
    };

    Ok(url
        .query_pairs()
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn token(sub: &str, secret: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut claims = UserClaims::new(sub.to_string(), now, now + exp_offset);
        claims.user_type = Some("member".to_string());
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn gate(allow_anonymous: bool) -> AuthGate {
        AuthGate::new(
            SecretString::from(SECRET),
            "token",
            common::jwt::DEFAULT_CLOCK_SKEW,
            allow_anonymous,
        )
    }

    #[test]
    fn test_valid_token_yields_context() {
        let url = format!("/ws?token={}", token("user-1", SECRET, 3600));
        let context = gate(false).validate(&url).unwrap().unwrap();

        assert_eq!(context.user_id, "user-1");
        assert_eq!(context.user_type.as_deref(), Some("member"));
    }

    #[test]
    fn test_absolute_url_is_accepted() {
        let url = format!(
            "ws://chat.example.com/ws?room=lobby&token={}",
            token("user-2", SECRET, 3600)
        );
        assert!(gate(false).validate(&url).unwrap().is_some());
    }

    #[test]
    fn test_no_token_validates_to_none() {
        assert!(gate(false).validate("/ws").unwrap().is_none());
        assert!(gate(false).validate("/ws?token=").unwrap().is_none());
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let other = "ffffffffffffffffffffffffffffffff";
        let url = format!("/ws?token={}", token("user-1", other, 3600));

        assert!(matches!(
            gate(true).validate(&url),
            Err(AuthenticationError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let url = format!("/ws?token={}", token("user-1", SECRET, -3600));

        assert_eq!(
            gate(true).validate(&url).unwrap_err(),
            AuthenticationError::InvalidToken(JwtValidationError::Expired)
        );
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(gate(true).validate("/ws?token=not.a.jwt").is_err());
    }

    #[test]
    fn test_custom_query_param() {
        let gate = AuthGate::new(
            SecretString::from(SECRET),
            "access_token",
            common::jwt::DEFAULT_CLOCK_SKEW,
            false,
        );
        let url = format!("/ws?access_token={}", token("user-3", SECRET, 60));
        assert!(gate.validate(&url).unwrap().is_some());
        assert!(gate.validate(&format!("/ws?token={}", token("u", SECRET, 60))).unwrap().is_none());
    }

    #[test]
    fn test_admit_applies_anonymous_policy() {
        assert_eq!(
            gate(false).admit("/ws").unwrap_err(),
            AuthenticationError::MissingToken
        );
        assert!(gate(true).admit("/ws").unwrap().is_none());
    }

    #[test]
    fn test_disabled_gate_admits_everyone() {
        let gate = AuthGate::disabled();
        assert!(!gate.is_enabled());
        assert!(gate.admit("/ws?token=garbage").unwrap().is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let debug = format!("{:?}", gate(false));
        assert!(!debug.contains(SECRET));
    }
}
