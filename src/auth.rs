use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::{
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

use crate::{
    config::AuthConfig,
    error::{GatewayError, GatewayResult},
    ratelimit::Tier,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub tier: Tier,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token rejected")]
    Rejected,
    #[error("token not verifiable locally: {0}")]
    Inconclusive(String),
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// HS256 verification with the shared secret. Any failure is inconclusive so
/// the caller can defer to the auth service.
pub struct LocalJwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl LocalJwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for LocalJwtVerifier {
    fn name(&self) -> &'static str {
        "local-jwt"
    }

    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, VerifyError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| VerifyError::Inconclusive(format!("{:?}", e.kind())))?;
        let claims = data.claims;
        Ok(AuthenticatedUser {
            tier: resolve_tier(claims.tier.as_deref(), claims.role.as_deref()),
            user_id: claims.sub,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(alias = "userId")]
    user_id: serde_json::Value,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// Asks the auth backend to verify the token. Its answer is authoritative.
pub struct RemoteAuthVerifier {
    client: reqwest::Client,
    verify_url: String,
    timeout: Duration,
}

impl RemoteAuthVerifier {
    pub fn new(client: reqwest::Client, auth_base_url: &str, cfg: &AuthConfig) -> Self {
        Self {
            client,
            verify_url: format!("{}{}", auth_base_url.trim_end_matches('/'), cfg.verify_path),
            timeout: cfg.timeout,
        }
    }
}

#[async_trait]
impl TokenVerifier for RemoteAuthVerifier {
    fn name(&self) -> &'static str {
        "auth-service"
    }

    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, VerifyError> {
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(VerifyError::Unavailable(format!("auth service returned {status}")));
        }
        if !status.is_success() {
            return Err(VerifyError::Rejected);
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| VerifyError::Unavailable(format!("malformed verify response: {e}")))?;

        let user_id = match body.user_id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => return Err(VerifyError::Rejected),
        };

        Ok(AuthenticatedUser {
            user_id,
            tier: resolve_tier(body.tier.as_deref(), body.role.as_deref()),
        })
    }
}

/// Bearer-token authentication: optional local fast path, remote fallback.
pub struct Authenticator {
    local: Option<Arc<dyn TokenVerifier>>,
    remote: Arc<dyn TokenVerifier>,
}

impl Authenticator {
    pub fn new(local: Option<Arc<dyn TokenVerifier>>, remote: Arc<dyn TokenVerifier>) -> Self {
        Self { local, remote }
    }

    pub async fn authenticate(&self, authorization: Option<&str>) -> GatewayResult<AuthenticatedUser> {
        let token = bearer_token(authorization).ok_or(GatewayError::AuthenticationRequired)?;

        if let Some(local) = &self.local {
            match local.verify(token).await {
                Ok(user) => return Ok(user),
                Err(err) => {
                    tracing::debug!(verifier = local.name(), error = %err, "deferring to auth service");
                }
            }
        }

        match self.remote.verify(token).await {
            Ok(user) => Ok(user),
            Err(VerifyError::Unavailable(reason)) => Err(GatewayError::ServiceUnavailable(reason)),
            Err(VerifyError::Rejected | VerifyError::Inconclusive(_)) => {
                Err(GatewayError::AuthenticationRequired)
            }
        }
    }
}

fn bearer_token(header: Option<&str>) -> Option<&str> {
    let (scheme, token) = header?.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Tokens always grant at least the authenticated tier.
fn resolve_tier(tier: Option<&str>, role: Option<&str>) -> Tier {
    if let Some(tier) = tier.and_then(|t| t.parse::<Tier>().ok()) {
        return if tier == Tier::Public {
            Tier::Authenticated
        } else {
            tier
        };
    }
    match role {
        Some(role) if role.eq_ignore_ascii_case("admin") => Tier::Admin,
        _ => Tier::Authenticated,
    }
}
