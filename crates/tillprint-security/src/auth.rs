// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bearer credential validation for the enqueue/inspect API.
//
// Two credential forms are accepted:
//
//   - Static API keys configured at startup.  Each key is stored only as an
//     HMAC tag, and candidates are checked with `ring::hmac::verify`, so the
//     comparison is constant time and the raw keys never sit in memory
//     after construction.
//   - Signed tokens `hex(claims).hex(tag)` where `claims` is JSON
//     `{ "sub": ..., "iat": ..., "exp": ... }` and `tag` is HMAC-SHA256 over
//     the hex claims, keyed by the service secret.

use std::time::Duration;

use chrono::Utc;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tillprint_core::config::{AuthSettings, MIN_SECRET_LEN};
use tillprint_core::error::{Result, TillprintError};

/// Domain separation prefixes for the two uses of the service key.
const API_KEY_DOMAIN: &[u8] = b"tillprint-api-key:";
const TOKEN_DOMAIN: &[u8] = b"tillprint-token:";

/// How a caller proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Token,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub subject: String,
    pub credential: CredentialKind,
}

/// Claims carried inside a signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Validates bearer credentials before any queue access.
pub struct Authenticator {
    key: hmac::Key,
    /// HMAC tags of the configured API keys.
    api_key_tags: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("api_keys", &self.api_key_tags.len())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(settings: &AuthSettings) -> Result<Self> {
        if settings.secret.len() < MIN_SECRET_LEN {
            return Err(TillprintError::Config(format!(
                "auth secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let key = hmac::Key::new(hmac::HMAC_SHA256, settings.secret.as_bytes());
        let api_key_tags = settings
            .api_keys
            .iter()
            .map(|api_key| sign(&key, API_KEY_DOMAIN, api_key.as_bytes()))
            .collect();

        Ok(Self { key, api_key_tags })
    }

    /// Mint a signed token for `subject`, valid for `ttl`.
    pub fn issue_token(&self, subject: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now.saturating_add(ttl_secs),
        };
        let encoded = hex::encode(serde_json::to_vec(&claims)?);
        let tag = sign(&self.key, TOKEN_DOMAIN, encoded.as_bytes());
        Ok(format!("{encoded}.{}", hex::encode(tag)))
    }

    /// Validate the value of an `Authorization` header.
    pub fn verify_header(&self, header: Option<&str>) -> Result<Principal> {
        let header = header.ok_or(TillprintError::Unauthorized)?;
        let (scheme, credential) = header
            .trim()
            .split_once(' ')
            .ok_or(TillprintError::Unauthorized)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            debug!(scheme, "rejecting non-bearer authorization scheme");
            return Err(TillprintError::Unauthorized);
        }
        self.verify(credential.trim())
    }

    /// Validate a bare bearer credential (API key or signed token).
    pub fn verify(&self, credential: &str) -> Result<Principal> {
        if credential.is_empty() {
            return Err(TillprintError::Unauthorized);
        }

        if let Some(index) = self.match_api_key(credential) {
            return Ok(Principal {
                subject: format!("api-key#{index}"),
                credential: CredentialKind::ApiKey,
            });
        }

        self.verify_token(credential)
    }

    /// Index of the configured key matching `candidate`, checking every key.
    fn match_api_key(&self, candidate: &str) -> Option<usize> {
        let mut data = API_KEY_DOMAIN.to_vec();
        data.extend_from_slice(candidate.as_bytes());

        self.api_key_tags
            .iter()
            .enumerate()
            .fold(None, |found, (index, tag)| {
                let matches = hmac::verify(&self.key, &data, tag).is_ok();
                found.or(matches.then_some(index))
            })
    }

    fn verify_token(&self, token: &str) -> Result<Principal> {
        let (encoded, tag_hex) = token.split_once('.').ok_or(TillprintError::Unauthorized)?;
        let tag = hex::decode(tag_hex).map_err(|_| TillprintError::Unauthorized)?;

        let mut data = TOKEN_DOMAIN.to_vec();
        data.extend_from_slice(encoded.as_bytes());
        hmac::verify(&self.key, &data, &tag).map_err(|_| {
            debug!("token signature mismatch");
            TillprintError::Unauthorized
        })?;

        let raw = hex::decode(encoded).map_err(|_| TillprintError::Unauthorized)?;
        let claims: TokenClaims =
            serde_json::from_slice(&raw).map_err(|_| TillprintError::Unauthorized)?;

        if claims.exp <= Utc::now().timestamp() {
            debug!(subject = %claims.sub, "token expired");
            return Err(TillprintError::Unauthorized);
        }

        Ok(Principal {
            subject: claims.sub,
            credential: CredentialKind::Token,
        })
    }
}

fn sign(key: &hmac::Key, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut ctx = hmac::Context::with_key(key);
    ctx.update(domain);
    ctx.update(data);
    ctx.sign().as_ref().to_vec()
}
