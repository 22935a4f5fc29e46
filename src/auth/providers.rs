//! # Authentication Providers
//!
//! The dispatcher delegates credential checks to an [`AuthProvider`]. The shipped
//! provider validates HS256 JWT bearer tokens.

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthContext;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate the credentials carried by `headers`
    async fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<AuthContext>;
}

/// Claims the gateway reads from a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user id)
    pub sub: String,
    /// Expiry as a unix timestamp
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub struct JwtAuthProvider {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthProvider {
    /// Build a provider from the `auth` section; fails without a secret
    pub fn new(config: &AuthConfig) -> GatewayResult<Self> {
        let secret = config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| GatewayError::config("auth.jwt_secret is not set"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        match &config.issuer {
            Some(issuer) => validation.set_issuer(&[issuer]),
            None => validation.iss = None,
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn validate_token(&self, token: &str) -> GatewayResult<AuthContext> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::unauthorized(format!("Invalid token: {}", e)))?;

        Ok(AuthContext {
            user_id: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<AuthContext> {
        let token = bearer_token(headers)
            .ok_or_else(|| GatewayError::unauthorized("Missing bearer token"))?;
        self.validate_token(token)
    }
}
