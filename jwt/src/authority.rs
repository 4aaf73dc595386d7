//! Token authority
//!
//! Wires one [`KeyRegistry`], its [`KeyLoader`], a [`TokenBuilder`] and a
//! [`TokenVerifier`] together behind `issue` / `authenticate`.
//!
//! The current signing key is held in an atomically swapped slot. Issuance
//! reads the slot under a shared guard and rotation swaps it under the
//! exclusive guard, so a token is never built against a key that rotation has
//! already retired.

use crate::builder::TokenBuilder;
use crate::claims::ClaimsSet;
use crate::codec::token_digest;
use crate::config::AuthorityConfig;
use crate::error::TokenResult;
use crate::revocation::RevocationCheck;
use crate::verifier::TokenVerifier;
use arc_swap::ArcSwap;
use sigil_key::{Algorithm, JwkSet, KeyLoader, KeyMaterial, KeyRegistry, LoaderHealth};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Key used for issuing
#[derive(Debug, Clone, PartialEq, Eq)]
struct SigningSlot {
    kid: String,
    algorithm: Algorithm,
}

/// Issues and authenticates tokens
pub struct TokenAuthority {
    registry: Arc<KeyRegistry>,
    loader: KeyLoader,
    builder: TokenBuilder,
    verifier: TokenVerifier,
    signing: ArcSwap<SigningSlot>,
    rotation: RwLock<()>,
    default_ttl: Duration,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("signing", &**self.signing.load())
            .field("default_ttl", &self.default_ttl)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Build an authority from configuration
    ///
    /// Validates the configuration, loads every key source and starts the
    /// background refresh task. Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Configuration errors, and any key loading failure that leaves the
    /// registry empty.
    pub async fn from_config(config: AuthorityConfig) -> TokenResult<Self> {
        config.validate()?;
        let registry = Arc::new(KeyRegistry::new(config.rotation));
        let loader = KeyLoader::new(config.keys.clone(), Arc::clone(&registry))?;
        loader.load().await?;
        loader.spawn_refresh_task(config.keys.refresh_interval()).await;
        Self::new(registry, loader, &config).await
    }

    /// Build an authority over an already populated registry
    ///
    /// `loader` is used for cache-miss refreshes and health; it is not
    /// loaded or started here.
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` for the configured algorithm.
    pub async fn new(registry: Arc<KeyRegistry>, loader: KeyLoader, config: &AuthorityConfig) -> TokenResult<Self> {
        let algorithm = config.algorithm()?;
        if let Err(e) = registry.signing_key(&config.signing_key_id).await {
            let usable = registry.active_signing_kid().await;
            tracing::warn!(kid = %config.signing_key_id, usable = ?usable, error = %e, "Configured signing key is not available; issuing will fail until it is");
        }

        let builder = TokenBuilder::new(Arc::clone(&registry))
            .with_issuer(config.issuer.clone())
            .with_audience(config.audience.clone());
        let verifier = TokenVerifier::new(Arc::clone(&registry), config.validation()).with_loader(loader.clone());
        tracing::info!(kid = %config.signing_key_id, alg = %algorithm, "Token authority ready");

        Ok(Self {
            registry,
            loader,
            builder,
            verifier,
            signing: ArcSwap::from_pointee(SigningSlot {
                kid: config.signing_key_id.clone(),
                algorithm,
            }),
            rotation: RwLock::new(()),
            default_ttl: config.default_ttl(),
        })
    }

    /// Consult `check` on every authentication
    #[must_use]
    pub fn with_revocation(mut self, check: Arc<dyn RevocationCheck>) -> Self {
        self.verifier = self.verifier.with_revocation(check);
        self
    }

    /// Issue a token valid for `ttl`
    ///
    /// # Errors
    /// `KeyNotFound` when the signing key is unavailable, plus builder errors.
    pub async fn issue(&self, claims: ClaimsSet, ttl: Duration) -> TokenResult<String> {
        let _guard = self.rotation.read().await;
        let slot = self.signing.load_full();
        self.builder.build(claims, slot.algorithm, &slot.kid, ttl).await
    }

    /// Issue a token with the configured default lifetime
    ///
    /// # Errors
    /// See [`TokenAuthority::issue`].
    pub async fn issue_default(&self, claims: ClaimsSet) -> TokenResult<String> {
        self.issue(claims, self.default_ttl).await
    }

    /// Verify a token and return its claims
    ///
    /// `expected_audience` overrides the configured audience for this call.
    ///
    /// # Errors
    /// Any verifier failure; see [`TokenVerifier::verify_with`].
    #[tracing::instrument(skip_all, fields(token = %token_digest(token)))]
    pub async fn authenticate(&self, token: &str, expected_audience: Option<&str>) -> TokenResult<ClaimsSet> {
        self.verifier.verify_with(token, expected_audience).await
    }

    /// Public JWK Set of every resolvable asymmetric key, for remote verifiers
    pub async fn public_jwks(&self) -> JwkSet {
        let published: Vec<KeyMaterial> = self
            .registry
            .snapshot()
            .await
            .iter()
            .filter_map(|key| key.public_only())
            .collect();
        JwkSet::public_from(&published)
    }

    /// Make `material` the signing key
    ///
    /// Previous signing keys stay verify-only for the rotation grace period.
    /// Returns the identifiers of the retired keys.
    ///
    /// # Errors
    /// `InvalidKey` if `material` cannot sign.
    pub async fn rotate_signing_key(&self, material: KeyMaterial) -> TokenResult<Vec<String>> {
        let slot = SigningSlot {
            kid: material.id().to_string(),
            algorithm: material.algorithm(),
        };
        let grace = self.registry.policy().grace_period();

        let _guard = self.rotation.write().await;
        let retired = self.registry.rotate(material, grace).await?;
        tracing::info!(kid = %slot.kid, alg = %slot.algorithm, retired = ?retired, "Signing key rotated");
        self.signing.store(Arc::new(slot));
        Ok(retired)
    }

    /// `kid` of the current signing key
    #[must_use]
    pub fn signing_key_id(&self) -> String {
        self.signing.load().kid.clone()
    }

    /// Algorithm of the current signing key
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.signing.load().algorithm
    }

    /// Key sources health
    #[inline]
    #[must_use]
    pub fn health(&self) -> LoaderHealth {
        self.loader.health()
    }

    /// Shared key registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Key loader
    #[inline]
    #[must_use]
    pub fn loader(&self) -> &KeyLoader {
        &self.loader
    }

    /// Stop background key refresh
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
        tracing::info!("Token authority shut down");
    }
}
