//! Token builder
//!
//! Resolves the signing key, fills in `iat`/`exp` (and configured `iss`,
//! `aud`, `jti`) where the caller left them out, serializes header and claims
//! canonically, signs, and emits the compact token. Nothing is recorded.

use crate::claims::ClaimsSet;
use crate::codec::{canonical_json, encode_segment};
use crate::engine::SignatureEngine;
use crate::error::{TokenError, TokenResult};
use crate::header::Header;
use sigil_key::{Algorithm, KeyMaterial, KeyRegistry, SharedClock};
use std::sync::Arc;
use std::time::Duration;

/// Encode and sign a header and claims set with `key`
///
/// # Errors
/// `Serialization` for unencodable claims, plus any engine error.
pub fn encode_token(header: &Header, claims: &ClaimsSet, key: &KeyMaterial) -> TokenResult<String> {
    let header_segment = encode_segment(&canonical_json(header)?);
    let claims_segment = encode_segment(&canonical_json(claims)?);
    let signing_input = format!("{header_segment}.{claims_segment}");
    let signature = SignatureEngine::sign(header.alg, key, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", encode_segment(&signature)))
}

/// Builds signed tokens from registry keys
pub struct TokenBuilder {
    registry: Arc<KeyRegistry>,
    clock: SharedClock,
    issuer: Option<String>,
    audience: Option<String>,
    with_jti: bool,
}

impl std::fmt::Debug for TokenBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBuilder")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("with_jti", &self.with_jti)
            .finish_non_exhaustive()
    }
}

impl TokenBuilder {
    /// Builder reading keys and time from `registry`
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        let clock = Arc::clone(registry.clock());
        Self {
            registry,
            clock,
            issuer: None,
            audience: None,
            with_jti: false,
        }
    }

    /// Stamp `iss` on tokens whose claims have none
    #[must_use]
    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    /// Stamp `aud` on tokens whose claims have none
    #[must_use]
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    /// Add a random `jti` to tokens whose claims have none
    #[must_use]
    pub fn with_jti(mut self, enabled: bool) -> Self {
        self.with_jti = enabled;
        self
    }

    /// Build a token signed by `kid` with `algorithm`
    ///
    /// `iat` defaults to now and `exp` to `iat + ttl`.
    ///
    /// # Errors
    /// `KeyNotFound` if `kid` is not an active signing key,
    /// `AlgorithmKeyMismatch` if the key is bound to another algorithm,
    /// `Serialization` for reserved names among application claims,
    /// `InvalidConfig` for a zero `ttl`.
    pub async fn build(
        &self,
        claims: ClaimsSet,
        algorithm: Algorithm,
        kid: &str,
        ttl: Duration,
    ) -> TokenResult<String> {
        if ttl.is_zero() {
            return Err(TokenError::InvalidConfig("token ttl must be positive".into()));
        }
        claims.check_reserved()?;
        let key = self.registry.signing_key(kid).await?;
        if key.algorithm() != algorithm {
            return Err(TokenError::AlgorithmKeyMismatch {
                algorithm: algorithm.to_string(),
                kid: kid.to_string(),
                key_algorithm: key.algorithm().to_string(),
            });
        }

        let claims = self.complete(claims, ttl);
        let token = encode_token(&Header::new(algorithm, kid), &claims, &key)?;
        tracing::debug!(kid = %kid, alg = %algorithm, sub = ?claims.sub, exp = ?claims.exp, "Issued token");
        Ok(token)
    }

    fn complete(&self, mut claims: ClaimsSet, ttl: Duration) -> ClaimsSet {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let iat = *claims.iat.get_or_insert_with(|| self.clock.now().timestamp());
        if claims.exp.is_none() {
            claims.exp = Some(iat.saturating_add(ttl_secs));
        }
        if claims.iss.is_none() {
            claims.iss.clone_from(&self.issuer);
        }
        if claims.aud.is_none() {
            claims.aud = self.audience.clone().map(Into::into);
        }
        if self.with_jti && claims.jti.is_none() {
            claims.jti = Some(uuid::Uuid::new_v4().to_string());
        }
        claims
    }
}
