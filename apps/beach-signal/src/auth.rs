use std::{sync::Arc, time::Duration};

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthMode, Config};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("jwks url not configured")]
    MissingJwksUrl,
    #[error("missing bearer token")]
    MissingToken,
    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),
    #[error("no keys published in key set")]
    NoKeysPublished,
    #[error("token signature invalid")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token could not be verified: {0}")]
    Unverified(String),
    #[error("token missing subject")]
    MissingSubject,
}

impl AuthError {
    /// Short reason safe to hand back to a rejected client
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing token",
            AuthError::Expired => "token expired",
            AuthError::MissingJwksUrl
            | AuthError::KeySetUnavailable(_)
            | AuthError::NoKeysPublished => "key set unavailable",
            AuthError::InvalidSignature
            | AuthError::Unverified(_)
            | AuthError::MissingSubject => "invalid token",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Unverified(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    #[serde(default)]
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Verifies RS256 bearer tokens against a remotely published key set.
///
/// The key set is fetched on every call and the first published key is the
/// only one tried; tokens are not matched to keys by `kid`.
#[derive(Clone)]
pub struct Authenticator {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    client: Client,
}

impl Authenticator {
    pub fn new(
        jwks_url: String,
        issuer: Option<String>,
        audience: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|err| {
            warn!(
                target: "beach-signal::auth",
                error = %err,
                "failed to build key set client with timeout; using defaults"
            );
            Client::new()
        });

        Self {
            jwks_url,
            issuer,
            audience,
            client,
        }
    }

    /// Returns the token's subject on success
    pub async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let key = self.first_published_key().await?;

        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &key, &validation)?;
        match data.claims.sub {
            Some(subject) if !subject.is_empty() => {
                debug!(target: "beach-signal::auth", subject = %subject, "token verified");
                Ok(subject)
            }
            _ => Err(AuthError::MissingSubject),
        }
    }

    async fn first_published_key(&self) -> Result<DecodingKey, AuthError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|err| AuthError::KeySetUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::KeySetUnavailable(format!(
                "status {}",
                response.status()
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::KeySetUnavailable(err.to_string()))?;
        let entry = body.keys.into_iter().next().ok_or(AuthError::NoKeysPublished)?;

        if entry.kty.as_deref() != Some("RSA") {
            return Err(AuthError::Unverified(format!(
                "unsupported key type {:?}",
                entry.kty
            )));
        }
        let (Some(n), Some(e)) = (entry.n, entry.e) else {
            return Err(AuthError::Unverified(format!(
                "rsa key {:?} missing modulus or exponent",
                entry.kid
            )));
        };

        Ok(DecodingKey::from_rsa_components(&n, &e)?)
    }
}

/// How a new WebSocket connection is admitted
#[derive(Clone)]
pub enum Admission {
    /// No token; identities come from `register` messages only
    Open,
    /// Token is the second `Sec-WebSocket-Protocol` value
    HeaderToken(Arc<Authenticator>),
    /// Token is the `token` query parameter
    QueryToken(Arc<Authenticator>),
}

impl Admission {
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        if config.auth_mode == AuthMode::None {
            return Ok(Admission::Open);
        }

        let jwks_url = config
            .jwks_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or(AuthError::MissingJwksUrl)?;
        let authenticator = Arc::new(Authenticator::new(
            jwks_url,
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
            Duration::from_secs(config.jwks_timeout_seconds),
        ));

        Ok(match config.auth_mode {
            AuthMode::Header => Admission::HeaderToken(authenticator),
            AuthMode::Query => Admission::QueryToken(authenticator),
            AuthMode::None => Admission::Open,
        })
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Admission::Open => AuthMode::None,
            Admission::HeaderToken(_) => AuthMode::Header,
            Admission::QueryToken(_) => AuthMode::Query,
        }
    }
}
