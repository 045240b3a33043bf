//! Bearer token verification against a published JWK set.
//!
//! The key set is fetched lazily on first use and cached for the lifetime of
//! the process. Concurrent first callers share a single fetch. A failed fetch
//! is not cached: every validation fails closed until a later fetch succeeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::TokenGrants;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::TokenSettings;

/// Why a bearer token was not accepted.
///
/// These never escape the auth gate; callers only ever see a uniform 401.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenRejection {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token header has no key id")]
    MissingKeyId,

    #[error("algorithm {0:?} not allowed")]
    AlgorithmNotAllowed(Algorithm),

    #[error("no key with id {0} in key set")]
    UnknownKeyId(String),

    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("issuer {0:?} not trusted")]
    UntrustedIssuer(Option<String>),

    #[error("token expired")]
    Expired,

    #[error("signature mismatch")]
    BadSignature,

    #[error("token invalid: {0}")]
    Invalid(String),
}

impl TokenRejection {
    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenRejection::Malformed(_) => "malformed",
            TokenRejection::MissingKeyId => "missing_kid",
            TokenRejection::AlgorithmNotAllowed(_) => "algorithm",
            TokenRejection::UnknownKeyId(_) => "unknown_kid",
            TokenRejection::KeySetUnavailable(_) => "key_set_unavailable",
            TokenRejection::UntrustedIssuer(_) => "issuer",
            TokenRejection::Expired => "expired",
            TokenRejection::BadSignature => "signature",
            TokenRejection::Invalid(_) => "invalid",
        }
    }
}

/// A token whose signature, expiry and issuer checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: Option<String>,
    pub issuer: String,
    pub grants: TokenGrants,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenRejection>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    iss: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<Vec<String>>,
    #[serde(default)]
    realm_access: Option<RoleClaim>,
    #[serde(default)]
    resource_access: HashMap<String, RoleClaim>,
}

#[derive(Debug, Default, Deserialize)]
struct RoleClaim {
    #[serde(default)]
    roles: Vec<String>,
}

impl Claims {
    fn into_verified(self) -> VerifiedToken {
        let mut scopes: HashSet<String> = self
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        scopes.extend(self.scp.unwrap_or_default());

        VerifiedToken {
            subject: self.sub,
            issuer: self.iss,
            grants: TokenGrants {
                scopes,
                realm_roles: self.realm_access.unwrap_or_default().roles.into_iter().collect(),
                client_roles: self
                    .resource_access
                    .into_iter()
                    .map(|(client, claim)| (client, claim.roles.into_iter().collect()))
                    .collect(),
            },
        }
    }
}

#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

type KeySet = HashMap<String, DecodingKey>;

/// Verifies RS/ES/HS-signed JWTs against a remote JWK set.
pub struct JwksTokenVerifier {
    jwks_url: Url,
    allowed_issuers: Vec<String>,
    algorithms: Vec<Algorithm>,
    http_client: reqwest::Client,
    keys: OnceCell<Arc<KeySet>>,
}

impl JwksTokenVerifier {
    pub fn new(settings: &TokenSettings) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()?;
        Ok(Self {
            jwks_url: settings.jwks_url.clone(),
            allowed_issuers: settings.allowed_issuers.clone(),
            algorithms: settings.algorithms.clone(),
            http_client,
            keys: OnceCell::new(),
        })
    }

    /// Number of cached keys, zero until the first successful fetch.
    pub fn cached_key_count(&self) -> usize {
        self.keys.get().map_or(0, |keys| keys.len())
    }

    async fn key_set(&self) -> Result<Arc<KeySet>, TokenRejection> {
        self.keys
            .get_or_try_init(|| self.fetch_key_set())
            .await
            .cloned()
    }

    async fn fetch_key_set(&self) -> Result<Arc<KeySet>, TokenRejection> {
        info!(url = %self.jwks_url, "Fetching JWKS");

        let unavailable = |e: String| {
            warn!(url = %self.jwks_url, error = %e, "JWKS fetch failed, token validation fails closed");
            TokenRejection::KeySetUnavailable(e)
        };

        let response = self
            .http_client
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }
        let raw: RawKeySet = response.json().await.map_err(|e| unavailable(e.to_string()))?;

        let mut keys = HashMap::new();
        for value in raw.keys {
            let jwk: Jwk = match serde_json::from_value(value) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable JWK");
                    continue;
                }
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("skipping JWK without kid");
                continue;
            };
            match DecodingKey::from_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "skipping unusable JWK"),
            }
        }

        if keys.is_empty() {
            return Err(unavailable("no usable signing keys".to_string()));
        }

        info!("JWKS cache populated with {} keys", keys.len());
        Ok(Arc::new(keys))
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(self.allowed_issuers.as_slice());
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        // No clock skew allowance: a past `exp` is already expired.
        validation.leeway = 0;
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwksTokenVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenRejection> {
        let header = decode_header(token).map_err(|e| TokenRejection::Malformed(e.to_string()))?;
        let kid = header.kid.ok_or(TokenRejection::MissingKeyId)?;
        if !self.algorithms.contains(&header.alg) {
            return Err(TokenRejection::AlgorithmNotAllowed(header.alg));
        }

        let keys = self.key_set().await?;
        let key = keys.get(&kid).ok_or_else(|| TokenRejection::UnknownKeyId(kid.clone()))?;

        let data = decode::<Claims>(token, key, &self.validation(header.alg)).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenRejection::Expired,
            ErrorKind::InvalidIssuer => TokenRejection::UntrustedIssuer(None),
            ErrorKind::InvalidSignature => TokenRejection::BadSignature,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                TokenRejection::Malformed(e.to_string())
            }
            _ => TokenRejection::Invalid(e.to_string()),
        })?;

        if !self.allowed_issuers.iter().any(|iss| iss == &data.claims.iss) {
            return Err(TokenRejection::UntrustedIssuer(Some(data.claims.iss)));
        }

        Ok(data.claims.into_verified())
    }
}
