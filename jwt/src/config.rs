//! Authority configuration
//!
//! Loaded from YAML or JSON. Every timing field is in whole seconds and has a
//! default, so a minimal file names only the signing key and its sources:
//!
//! ```yaml
//! signing_key_id: k1
//! algorithm: HS256
//! keys:
//!   sources:
//!     - type: inline
//!       kid: k1
//!       algorithm: HS256
//!       secret: "0123456789abcdef0123456789abcdef"
//! ```

use crate::engine::SignatureEngine;
use crate::error::{TokenError, TokenResult};
use crate::verifier::Validation;
use serde::{Deserialize, Serialize};
use sigil_key::{Algorithm, KeyLoaderConfig, KeySourceConfig, RotationPolicy};
use std::path::Path;
use std::time::Duration;

fn default_algorithm() -> String {
    Algorithm::HS256.to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_leeway_secs() -> u64 {
    5
}

fn default_require_expiration() -> bool {
    true
}

/// Token authority configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Stamped as `iss` on issued tokens and required on verified ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Stamped as `aud` on issued tokens and required on verified ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// `kid` of the key used for issuing
    pub signing_key_id: String,
    /// Signing algorithm name
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Lifetime of tokens issued without an explicit TTL
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Tolerated clock skew for `exp`/`nbf`
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
    /// Reject tokens without `exp`
    #[serde(default = "default_require_expiration")]
    pub require_expiration: bool,
    /// Key sources and refresh timings
    #[serde(default)]
    pub keys: KeyLoaderConfig,
    /// Rotation grace periods
    #[serde(default)]
    pub rotation: RotationPolicy,
}

impl AuthorityConfig {
    /// Configuration with defaults for everything but the signing key and sources
    #[must_use]
    pub fn new(signing_key_id: impl Into<String>, algorithm: Algorithm, sources: Vec<KeySourceConfig>) -> Self {
        Self {
            issuer: None,
            audience: None,
            signing_key_id: signing_key_id.into(),
            algorithm: algorithm.to_string(),
            default_ttl_secs: default_ttl_secs(),
            leeway_secs: default_leeway_secs(),
            require_expiration: default_require_expiration(),
            keys: KeyLoaderConfig::with_sources(sources),
            rotation: RotationPolicy::default(),
        }
    }

    /// Parse YAML
    ///
    /// # Errors
    /// `InvalidConfig` for syntax or type errors.
    pub fn from_yaml_str(yaml: &str) -> TokenResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TokenError::InvalidConfig(format!("invalid YAML config: {e}")))
    }

    /// Parse JSON
    ///
    /// # Errors
    /// `InvalidConfig` for syntax or type errors.
    pub fn from_json_str(json: &str) -> TokenResult<Self> {
        serde_json::from_str(json).map_err(|e| TokenError::InvalidConfig(format!("invalid JSON config: {e}")))
    }

    /// Read a `.json` file as JSON and anything else as YAML
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read or parsed.
    pub async fn from_file(path: impl AsRef<Path>) -> TokenResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TokenError::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Signing algorithm
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` for `none` or any unknown name.
    pub fn algorithm(&self) -> TokenResult<Algorithm> {
        SignatureEngine::resolve(&self.algorithm)
    }

    /// Default token lifetime
    #[inline]
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Verification policy derived from this configuration
    #[must_use]
    pub fn validation(&self) -> Validation {
        Validation {
            leeway: Duration::from_secs(self.leeway_secs),
            expected_issuer: self.issuer.clone(),
            expected_audience: self.audience.clone(),
            require_expiration: self.require_expiration,
        }
    }

    /// Reject configurations the authority cannot run with
    ///
    /// # Errors
    /// `InvalidConfig` for an empty `signing_key_id`, no key sources, a zero
    /// TTL or refresh timing; `UnsupportedAlgorithm` for the algorithm name;
    /// `InvalidKey` for an inline secret shorter than the digest;
    /// `AlgorithmKeyMismatch` when the inline signing key is bound to another
    /// algorithm.
    pub fn validate(&self) -> TokenResult<()> {
        let algorithm = self.algorithm()?;
        if self.signing_key_id.is_empty() {
            return Err(TokenError::InvalidConfig("signing_key_id must not be empty".into()));
        }
        if self.keys.sources.is_empty() {
            return Err(TokenError::InvalidConfig("at least one key source is required".into()));
        }
        if self.default_ttl_secs == 0 {
            return Err(TokenError::InvalidConfig("default_ttl_secs must be positive".into()));
        }
        self.keys.validate()?;

        for source in &self.keys.sources {
            if let KeySourceConfig::Inline { kid, .. } = source {
                let material = source.inline_material()?;
                if *kid == self.signing_key_id && material.algorithm() != algorithm {
                    return Err(TokenError::AlgorithmKeyMismatch {
                        algorithm: algorithm.to_string(),
                        kid: kid.clone(),
                        key_algorithm: material.algorithm().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
