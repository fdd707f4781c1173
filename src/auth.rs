//! Identity boundary.
//!
//! Token issuance lives elsewhere; this module only verifies already-issued
//! tokens and turns them into an [`Identity`] the hub and the terminal
//! registry can carry around.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::LiveError;

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Identities without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token provided")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

impl From<AuthError> for LiveError {
    fn from(err: AuthError) -> Self {
        LiveError::AuthFailed(err.to_string())
    }
}

/// `verify(token) -> identity | Invalid | Expired`, with no side effects.
pub trait TokenValidator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claims signed by the dashboard. Older tokens carry `id`, newer ones `userId`.
#[derive(Debug, Deserialize)]
struct DashboardClaims {
    #[serde(rename = "userId", default)]
    user_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    exp: Option<i64>,
}

fn claim_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// HS256 validator sharing the dashboard's signing secret.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims::<&str>(&[]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<DashboardClaims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            },
        )?;

        let claims = data.claims;
        let user_id = claims
            .user_id
            .as_ref()
            .and_then(claim_to_string)
            .or_else(|| claims.id.as_ref().and_then(claim_to_string))
            .ok_or_else(|| AuthError::Invalid("missing userId claim".to_string()))?;

        let expires_at = claims
            .exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());

        Ok(Identity {
            user_id,
            expires_at,
        })
    }
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}


#[cfg(test)]
mod tests {
    use super::test_tokens::*;
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn valid_token_yields_identity_with_expiry() {
        let validator = JwtValidator::new(SECRET);
        let identity = validator.verify(&valid_token("42")).unwrap();
        assert_eq!(identity.user_id, "42");
        assert!(identity.expires_at.is_some());
        assert!(!identity.is_expired(Utc::now()));
    }

    #[test]
    fn expired_token_is_distinguished() {
        let validator = JwtValidator::new(SECRET);
        let token = token_for("42", Utc::now().timestamp() - 10);
        assert_eq!(validator.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let validator = JwtValidator::new("another-secret");
        let result = validator.verify(&valid_token("42"));
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[test]
    fn empty_token_is_missing() {
        let validator = JwtValidator::new(SECRET);
        assert_eq!(validator.verify("  "), Err(AuthError::Missing));
    }

    #[test]
    fn legacy_numeric_id_claim_is_accepted() {
        let token = encode(
            &Header::default(),
            &json!({ "id": 7 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let identity = JwtValidator::new(SECRET).verify(&token).unwrap();
        assert_eq!(identity.user_id, "7");
        assert!(identity.expires_at.is_none());
    }

    #[test]
    fn identity_without_expiry_never_expires() {
        let identity = Identity::new("u");
        assert!(!identity.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer   ")), None);
        assert_eq!(bearer_token(None), None);
    }
}
