//! Token verifier
//!
//! Single pass over an untrusted compact token, terminal on the first failure:
//!
//! 1. split into three segments
//! 2. decode and parse the header (`alg` in the closed set, `kid` present)
//! 3. resolve the key, refreshing remote key sets once on a miss
//! 4. check the header `alg` against the key, then verify the signature
//! 5. decode the claims
//! 6. `nbf` / `exp` with leeway
//! 7. audience and issuer
//! 8. revocation hook, if any
//!
//! Nothing here retries except the key refresh, which belongs to the loader.

use crate::claims::ClaimsSet;
use crate::codec::{decode_segment, split_token, token_digest};
use crate::engine::SignatureEngine;
use crate::error::{TokenError, TokenResult};
use crate::header::Header;
use crate::revocation::RevocationCheck;
use sigil_key::{KeyError, KeyLoader, KeyMaterial, KeyRegistry, SharedClock};
use std::sync::Arc;
use std::time::Duration;

fn default_leeway() -> Duration {
    Duration::from_secs(5)
}

/// Claim validation policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Tolerated clock skew for `exp` and `nbf`
    pub leeway: Duration,
    /// Required `iss`
    pub expected_issuer: Option<String>,
    /// Required member of `aud`
    pub expected_audience: Option<String>,
    /// Reject tokens without `exp`
    pub require_expiration: bool,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            leeway: default_leeway(),
            expected_issuer: None,
            expected_audience: None,
            require_expiration: true,
        }
    }
}

impl Validation {
    /// Set the leeway
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Require `iss`
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    /// Require `aud` to contain `audience`
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.expected_audience = Some(audience.into());
        self
    }

    /// Whether `exp` is mandatory
    #[must_use]
    pub fn with_required_expiration(mut self, required: bool) -> Self {
        self.require_expiration = required;
        self
    }

    fn leeway_secs(&self) -> i64 {
        i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX)
    }

    /// `nbf` then `exp`
    fn check_time(&self, claims: &ClaimsSet, now: i64) -> TokenResult<()> {
        let leeway = self.leeway_secs();
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(leeway) < nbf {
                return Err(TokenError::TokenNotYetValid);
            }
        }
        match claims.exp {
            Some(exp) if now >= exp.saturating_add(leeway) => Err(TokenError::TokenExpired),
            Some(_) => Ok(()),
            None if self.require_expiration => Err(TokenError::missing_claim("exp")),
            None => Ok(()),
        }
    }

    fn check_audience(claims: &ClaimsSet, expected: Option<&str>) -> TokenResult<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        match &claims.aud {
            None => Err(TokenError::missing_claim("aud")),
            Some(aud) if aud.contains(expected) => Ok(()),
            Some(_) => Err(TokenError::AudienceMismatch),
        }
    }

    fn check_issuer(&self, claims: &ClaimsSet) -> TokenResult<()> {
        let Some(expected) = self.expected_issuer.as_deref() else {
            return Ok(());
        };
        match claims.iss.as_deref() {
            None => Err(TokenError::missing_claim("iss")),
            Some(iss) if iss == expected => Ok(()),
            Some(_) => Err(TokenError::IssuerMismatch),
        }
    }
}

/// Verifies compact tokens against a key registry
pub struct TokenVerifier {
    registry: Arc<KeyRegistry>,
    loader: Option<KeyLoader>,
    revocation: Option<Arc<dyn RevocationCheck>>,
    validation: Validation,
    clock: SharedClock,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("validation", &self.validation)
            .field("loader", &self.loader.is_some())
            .field("revocation", &self.revocation.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Verifier reading keys and time from `registry`
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>, validation: Validation) -> Self {
        let clock = Arc::clone(registry.clock());
        Self {
            registry,
            loader: None,
            revocation: None,
            validation,
            clock,
        }
    }

    /// Refresh remote key sets through `loader` when a `kid` is unknown
    #[must_use]
    pub fn with_loader(mut self, loader: KeyLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Consult `check` for tokens that pass every other check
    #[must_use]
    pub fn with_revocation(mut self, check: Arc<dyn RevocationCheck>) -> Self {
        self.revocation = Some(check);
        self
    }

    /// Validation policy in force
    #[inline]
    #[must_use]
    pub fn validation(&self) -> &Validation {
        &self.validation
    }

    /// Verify a token with the configured expected audience
    ///
    /// # Errors
    /// See [`TokenVerifier::verify_with`].
    pub async fn verify(&self, token: &str) -> TokenResult<ClaimsSet> {
        self.verify_with(token, None).await
    }

    /// Verify a token, overriding the expected audience for this call
    ///
    /// # Errors
    /// `MalformedToken`, `KeyNotFound`, `KeyInfrastructureUnavailable`,
    /// `InvalidSignature`, `TokenNotYetValid`, `TokenExpired`,
    /// `MissingClaim`, `AudienceMismatch`, `IssuerMismatch` or `Revoked`,
    /// in pipeline order.
    #[tracing::instrument(level = "debug", skip_all, fields(token = %token_digest(token)))]
    pub async fn verify_with(&self, token: &str, expected_audience: Option<&str>) -> TokenResult<ClaimsSet> {
        let result = self.run(token, expected_audience).await;
        if let Err(e) = &result {
            if e.is_server_fault() {
                tracing::error!(error = %e, "Token verification failed on the server side");
            } else {
                tracing::warn!(error = %e, "Token rejected");
            }
        }
        result
    }

    async fn run(&self, token: &str, expected_audience: Option<&str>) -> TokenResult<ClaimsSet> {
        let parts = split_token(token)?;
        let header = Header::parse(&decode_segment(parts.header, "header")?)?;
        let key = self.resolve_key(header.kid()).await?;

        if key.algorithm() != header.alg {
            tracing::debug!(kid = %key.id(), header_alg = %header.alg, key_alg = %key.algorithm(), "Header algorithm does not match key");
            return Err(TokenError::InvalidSignature);
        }
        let signature = decode_segment(parts.signature, "signature")?;
        if !SignatureEngine::verify(header.alg, &key, parts.signing_input.as_bytes(), &signature)? {
            return Err(TokenError::InvalidSignature);
        }

        let claims: ClaimsSet = serde_json::from_slice(&decode_segment(parts.claims, "claims")?)
            .map_err(|e| TokenError::MalformedToken(format!("invalid claims: {e}")))?;

        self.validation.check_time(&claims, self.clock.now().timestamp())?;
        let audience = expected_audience.or(self.validation.expected_audience.as_deref());
        Validation::check_audience(&claims, audience)?;
        self.validation.check_issuer(&claims)?;

        if let Some(revocation) = &self.revocation {
            if revocation.is_revoked(&claims, &token_digest(token)).await? {
                return Err(TokenError::Revoked);
            }
        }
        tracing::debug!(kid = %header.kid(), sub = ?claims.sub, "Token verified");
        Ok(claims)
    }

    async fn resolve_key(&self, kid: &str) -> TokenResult<Arc<KeyMaterial>> {
        let miss = match self.registry.lookup(kid).await {
            Ok(key) => return Ok(key),
            Err(e) => e,
        };
        match (&self.loader, miss) {
            (Some(loader), KeyError::KeyNotFound { .. }) => {
                loader.refresh_on_miss(kid).await.map_err(|e| match e {
                    KeyError::KeySourceUnavailable { .. } => {
                        TokenError::KeyInfrastructureUnavailable(e.to_string())
                    }
                    other => other.into(),
                })
            }
            (_, e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TokenBuilder;
    use crate::claims::Audience;
    use sigil_key::{Algorithm, ManualClock, RotationPolicy};

    const NOW: i64 = 1_700_000_000;

    async fn setup(validation: Validation) -> (TokenBuilder, TokenVerifier) {
        let clock = Arc::new(ManualClock::at_timestamp(NOW));
        let registry = Arc::new(KeyRegistry::with_clock(RotationPolicy::default(), clock));
        registry
            .register(sigil_key::KeyMaterial::hmac("k1", Algorithm::HS256, vec![9u8; 32]).unwrap())
            .await
            .unwrap();
        (
            TokenBuilder::new(Arc::clone(&registry)),
            TokenVerifier::new(registry, validation),
        )
    }

    async fn token(builder: &TokenBuilder, claims: ClaimsSet) -> String {
        builder
            .build(claims, Algorithm::HS256, "k1", Duration::from_secs(300))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn valid_token_yields_claims() {
        let (builder, verifier) = setup(Validation::default()).await;
        let t = token(&builder, ClaimsSet::new().with_subject("user-1")).await;
        let claims = verifier.verify(&t).await.unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert_eq!(claims.exp, Some(NOW + 300));
    }

    #[tokio::test]
    async fn not_yet_valid_is_checked_before_expiry() {
        let (builder, verifier) = setup(Validation::default().with_leeway(Duration::ZERO)).await;
        let claims = ClaimsSet::new().with_not_before(NOW + 10).with_expiration(NOW - 10);
        let t = token(&builder, claims).await;
        assert_eq!(verifier.verify(&t).await.unwrap_err(), TokenError::TokenNotYetValid);
    }

    #[tokio::test]
    async fn missing_exp_is_a_missing_claim_unless_optional() {
        let (builder, verifier) = setup(Validation::default()).await;
        let t = token(&builder, ClaimsSet::new().with_subject("s")).await;
        let header = Header::new(Algorithm::HS256, "k1");
        let key = verifier.registry.lookup("k1").await.unwrap();
        let no_exp = crate::builder::encode_token(&header, &ClaimsSet::new().with_subject("s"), &key).unwrap();
        assert!(verifier.verify(&t).await.is_ok());
        assert_eq!(verifier.verify(&no_exp).await.unwrap_err(), TokenError::missing_claim("exp"));

        let (_, lenient) = setup(Validation::default().with_required_expiration(false)).await;
        assert!(lenient.verify(&no_exp).await.is_ok());
    }

    #[tokio::test]
    async fn audience_and_issuer_are_exact() {
        let validation = Validation::default().with_issuer("https://auth").with_audience("api");
        let (builder, verifier) = setup(validation).await;

        let good = token(
            &builder,
            ClaimsSet::new()
                .with_issuer("https://auth")
                .with_audience(Audience::Many(vec!["web".into(), "api".into()])),
        )
        .await;
        assert!(verifier.verify(&good).await.is_ok());
        assert_eq!(
            verifier.verify_with(&good, Some("billing")).await.unwrap_err(),
            TokenError::AudienceMismatch
        );

        let wrong_case = token(&builder, ClaimsSet::new().with_issuer("https://auth").with_audience("API")).await;
        assert_eq!(verifier.verify(&wrong_case).await.unwrap_err(), TokenError::AudienceMismatch);

        let wrong_iss = token(&builder, ClaimsSet::new().with_issuer("https://evil").with_audience("api")).await;
        assert_eq!(verifier.verify(&wrong_iss).await.unwrap_err(), TokenError::IssuerMismatch);

        let no_aud = token(&builder, ClaimsSet::new().with_issuer("https://auth")).await;
        assert_eq!(verifier.verify(&no_aud).await.unwrap_err(), TokenError::missing_claim("aud"));
    }

    #[tokio::test]
    async fn unknown_kid_without_loader_is_key_not_found() {
        let (_, verifier) = setup(Validation::default()).await;
        let other = sigil_key::KeyMaterial::hmac("k9", Algorithm::HS256, vec![1u8; 32]).unwrap();
        let t = crate::builder::encode_token(
            &Header::new(Algorithm::HS256, "k9"),
            &ClaimsSet::new().with_expiration(NOW + 60),
            &other,
        )
        .unwrap();
        assert_eq!(verifier.verify(&t).await.unwrap_err(), TokenError::KeyNotFound("k9".into()));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let (_, verifier) = setup(Validation::default()).await;
        for bad in ["", "a.b", "a.b.c.d", "!!.e30.sig", "e30.e30.sig"] {
            assert!(matches!(
                verifier.verify(bad).await,
                Err(TokenError::MalformedToken(_))
            ), "{bad}");
        }
    }
}
