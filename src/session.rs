//! Reading the workload name from an inbound request
//!
//! Two sources are supported: a signed session cookie (HS256 JWT whose
//! claim names the workload) and a plain header set by a trusted front
//! proxy. Either way, a name that is missing, unverifiable or not a valid
//! container name counts as "no workload".

use crate::config::{SessionConfig, SessionSource};
use chrono::{Duration, Utc};
use hyper::header::{HeaderName, COOKIE};
use hyper::http::request::Parts;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Longest workload name accepted
pub const MAX_WORKLOAD_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session header name '{0}'")]
    InvalidHeader(String),

    #[error("session cookie source requires a secret")]
    MissingSecret,

    #[error("invalid session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("session token has no '{0}' claim")]
    MissingClaim(String),

    #[error("invalid workload name '{0}'")]
    InvalidName(String),
}

/// Session accessor: the workload name for a request, if any
pub trait WorkloadExtractor: Send + Sync {
    fn workload_name(&self, parts: &Parts) -> Option<String>;
}

/// Container naming rule: `[A-Za-z0-9][A-Za-z0-9_.-]*`
pub fn is_valid_workload_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.len() <= MAX_WORKLOAD_NAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Build the extractor selected by the session configuration
pub fn from_config(config: &SessionConfig) -> Result<Arc<dyn WorkloadExtractor>, SessionError> {
    match config.source {
        SessionSource::Header => Ok(Arc::new(HeaderExtractor::new(&config.header)?)),
        SessionSource::Cookie => {
            let secret = config
                .secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(SessionError::MissingSecret)?;
            Ok(Arc::new(SessionCookie::new(
                &config.cookie_name,
                secret,
                &config.claim,
            )))
        }
    }
}

/// Reads the workload name from a request header
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    header: HeaderName,
}

impl HeaderExtractor {
    pub fn new(header: &str) -> Result<Self, SessionError> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| SessionError::InvalidHeader(header.to_string()))?;
        Ok(Self { header })
    }
}

impl WorkloadExtractor for HeaderExtractor {
    fn workload_name(&self, parts: &Parts) -> Option<String> {
        let value = parts.headers.get(&self.header)?.to_str().ok()?.trim();
        if value.is_empty() {
            return None;
        }
        if !is_valid_workload_name(value) {
            debug!(header = %self.header, "Ignoring invalid workload name");
            return None;
        }
        Some(value.to_string())
    }
}

/// Signed session cookie carrying the workload name in a claim
#[derive(Clone)]
pub struct SessionCookie {
    cookie_name: String,
    claim: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionCookie {
    pub fn new(cookie_name: &str, secret: &str, claim: &str) -> Self {
        Self {
            cookie_name: cookie_name.to_string(),
            claim: claim.to_string(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Mint a token binding the bearer to `name` for `ttl`
    pub fn issue(&self, name: &str, ttl: Duration) -> Result<String, SessionError> {
        if !is_valid_workload_name(name) {
            return Err(SessionError::InvalidName(name.to_string()));
        }

        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert(self.claim.clone(), Value::String(name.to_string()));
        claims.insert("iat".to_string(), Value::from(now.timestamp()));
        claims.insert("exp".to_string(), Value::from((now + ttl).timestamp()));

        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// `Set-Cookie` value for a freshly issued token
    pub fn set_cookie_header(&self, token: &str, ttl: Duration) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name,
            token,
            ttl.num_seconds().max(0)
        )
    }

    /// Verify signature and expiry, then return the workload name
    pub fn extract(&self, token: &str) -> Result<String, SessionError> {
        let data = decode::<Map<String, Value>>(token, &self.decoding_key, &Validation::default())?;
        let name = data
            .claims
            .get(&self.claim)
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::MissingClaim(self.claim.clone()))?;

        if !is_valid_workload_name(name) {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        Ok(name.to_string())
    }

    fn token_from_cookies<'a>(&self, parts: &'a Parts) -> Option<&'a str> {
        // HTTP/2 clients may send one cookie header per pair
        parts
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, value)| *key == self.cookie_name && !value.is_empty())
            .map(|(_, value)| value)
    }
}

impl WorkloadExtractor for SessionCookie {
    fn workload_name(&self, parts: &Parts) -> Option<String> {
        let token = self.token_from_cookies(parts)?;
        match self.extract(token) {
            Ok(name) => Some(name),
            Err(e) => {
                debug!(error = %e, "Ignoring session cookie");
                None
            }
        }
    }
}
