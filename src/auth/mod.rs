//! Bearer-token authentication
//!
//! The API gateway issues HS256 tokens; this module validates them and
//! exposes the caller identity to route handlers. Every claim the issuer
//! sets is checked: signature, `iss`, `aud`, `exp`, `nbf` and a non-empty
//! `jti`. WebSocket clients that cannot set an Authorization header may
//! pass the token as a `token` query parameter instead.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("admin role required")]
    Forbidden,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

/// Claims carried by an AISS access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id
    pub sub: String,
    pub role: String,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub exp: i64,
    #[serde(default)]
    pub nbf: i64,
}

/// Validates HS256 tokens against the configured issuer and audience.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(config: &Config) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.jwt_issuer]);
        validation.set_audience(&[&config.jwt_audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_nbf = true;

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if data.claims.jti.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty jti claim".to_string()));
        }

        Ok(data.claims)
    }
}

/// Authenticated caller, extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// Admin may act on any session, everyone else only on their own.
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
        }
    }
}

/// Pull the raw token out of `Authorization: Bearer ...` or `?token=`.
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
    })
}

#[axum::async_trait]
impl FromRequestParts<crate::api::AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::api::AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).ok_or(AuthError::MissingToken)?;

        let claims = state.validator.validate(&token).inspect_err(|e| {
            debug!("Rejected token: {}", e);
        })?;

        Ok(AuthUser::from(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(secret: &str) -> Config {
        Config {
            server_port: 8085,
            jwt_secret: secret.into(),
            jwt_issuer: "aiss-api".into(),
            jwt_audience: "aiss-terminal".into(),
            allowed_origins: vec![],
            ssh_key_dir: PathBuf::from("/tmp"),
            max_sessions: 20,
            connect_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            write_deadline: Duration::from_secs(3),
            session_service_url: String::new(),
            suggestion_service_url: String::new(),
            vuln_service_url: String::new(),
            rag_agent_url: String::new(),
        }
    }

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: "user-1".into(),
            role: "user".into(),
            iss: "aiss-api".into(),
            aud: "aiss-terminal".into(),
            jti: "token-1".into(),
            exp: now + 600,
            nbf: now - 10,
        }
    }

    #[test]
    fn accepts_well_formed_token() {
        let validator = TokenValidator::new(&config("secret"));
        let token = sign(&valid_claims(), "secret");

        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, "user");
    }

    #[test]
    fn rejects_wrong_signature() {
        let validator = TokenValidator::new(&config("secret"));
        let token = sign(&valid_claims(), "other-secret");

        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let validator = TokenValidator::new(&config("secret"));
        let mut claims = valid_claims();
        claims.exp = chrono::Utc::now().timestamp() - 600;

        assert!(validator.validate(&sign(&claims, "secret")).is_err());
    }

    #[test]
    fn rejects_wrong_audience() {
        let validator = TokenValidator::new(&config("secret"));
        let mut claims = valid_claims();
        claims.aud = "aiss-documents".into();

        assert!(validator.validate(&sign(&claims, "secret")).is_err());
    }

    #[test]
    fn rejects_token_used_before_nbf() {
        let validator = TokenValidator::new(&config("secret"));
        let mut claims = valid_claims();
        claims.nbf = chrono::Utc::now().timestamp() + 600;

        assert!(validator.validate(&sign(&claims, "secret")).is_err());
    }

    #[test]
    fn rejects_empty_jti() {
        let validator = TokenValidator::new(&config("secret"));
        let mut claims = valid_claims();
        claims.jti = "".into();

        assert!(validator.validate(&sign(&claims, "secret")).is_err());
    }

    #[test]
    fn access_scoping() {
        let owner = AuthUser {
            user_id: "user-1".into(),
            role: "user".into(),
        };
        let admin = AuthUser {
            user_id: "root".into(),
            role: "admin".into(),
        };

        assert!(owner.can_access("user-1"));
        assert!(!owner.can_access("user-2"));
        assert!(admin.can_access("user-2"));
    }
}
