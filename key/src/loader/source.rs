//! Key source descriptors

use crate::algorithm::Algorithm;
use crate::error::{KeyError, KeyResult};
use crate::material::KeyMaterial;
use crate::registry::secs;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How an inline secret is written in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretEncoding {
    /// Secret bytes are the UTF-8 string itself
    #[default]
    Utf8,
    /// Secret is base64url (padding optional)
    Base64url,
}

/// One place keys come from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeySourceConfig {
    /// Symmetric secret embedded in configuration
    Inline {
        /// Key identifier
        kid: String,
        /// HMAC algorithm
        algorithm: Algorithm,
        /// Secret value
        secret: String,
        /// Encoding of `secret`
        #[serde(default)]
        encoding: SecretEncoding,
    },
    /// Local keystore file: PEM key or JWK Set (optionally sealed)
    Keystore {
        /// File path
        path: PathBuf,
        /// Passphrase for encrypted PEM or sealed JWK Set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
        /// Key identifier; required for PEM, filters a JWK Set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kid: Option<String>,
        /// Algorithm; required for PEM
        #[serde(default, skip_serializing_if = "Option::is_none")]
        algorithm: Option<Algorithm>,
    },
    /// Remote JWK Set endpoint
    Remote {
        /// Key-set URL
        url: String,
    },
}

impl fmt::Debug for KeySourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySourceConfig::Inline {
                kid,
                algorithm,
                encoding,
                ..
            } => f
                .debug_struct("Inline")
                .field("kid", kid)
                .field("algorithm", algorithm)
                .field("secret", &"[REDACTED]")
                .field("encoding", encoding)
                .finish(),
            KeySourceConfig::Keystore {
                path,
                passphrase,
                kid,
                algorithm,
            } => f
                .debug_struct("Keystore")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .field("kid", kid)
                .field("algorithm", algorithm)
                .finish(),
            KeySourceConfig::Remote { url } => f.debug_struct("Remote").field("url", url).finish(),
        }
    }
}

impl KeySourceConfig {
    /// Short descriptor used in logs and errors; never contains secrets
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            KeySourceConfig::Inline { kid, .. } => format!("inline:{kid}"),
            KeySourceConfig::Keystore { path, .. } => format!("keystore:{}", path.display()),
            KeySourceConfig::Remote { url } => url.clone(),
        }
    }

    /// Whether this source is fetched over the network
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, KeySourceConfig::Remote { .. })
    }

    /// Decode an inline secret into key material
    ///
    /// # Errors
    /// `InvalidKey` for a bad encoding or a secret shorter than the digest;
    /// `InvalidConfig` when called on a non-inline source.
    pub fn inline_material(&self) -> KeyResult<KeyMaterial> {
        let KeySourceConfig::Inline {
            kid,
            algorithm,
            secret,
            encoding,
        } = self
        else {
            return Err(KeyError::InvalidConfig(format!("{} is not an inline source", self.describe())));
        };
        let bytes = match encoding {
            SecretEncoding::Utf8 => secret.as_bytes().to_vec(),
            SecretEncoding::Base64url => URL_SAFE_NO_PAD
                .decode(secret.trim_end_matches('='))
                .map_err(|_| KeyError::invalid_key(format!("inline secret for '{kid}' is not base64url")))?,
        };
        KeyMaterial::hmac(kid.as_str(), *algorithm, bytes)
    }
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_refresh_wait_secs() -> u64 {
    5
}

fn default_miss_refresh_interval_secs() -> u64 {
    30
}

/// Key loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLoaderConfig {
    /// Key sources, loaded in order
    #[serde(default)]
    pub sources: Vec<KeySourceConfig>,
    /// Background refresh period for remote sources
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Upper bound for one remote fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Minimum delay between two attempts after a failed remote fetch
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Longest a caller waits on a shared refresh; the refresh itself keeps running
    #[serde(default = "default_refresh_wait_secs")]
    pub refresh_wait_secs: u64,
    /// Minimum age of healthy remote sets before a `kid` miss fetches them again
    #[serde(default = "default_miss_refresh_interval_secs")]
    pub miss_refresh_interval_secs: u64,
}

impl Default for KeyLoaderConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            refresh_wait_secs: default_refresh_wait_secs(),
            miss_refresh_interval_secs: default_miss_refresh_interval_secs(),
        }
    }
}

impl KeyLoaderConfig {
    /// Configuration with the given sources and default timings
    #[must_use]
    pub fn with_sources(sources: Vec<KeySourceConfig>) -> Self {
        Self {
            sources,
            ..Self::default()
        }
    }

    /// Background refresh period
    #[inline]
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Fetch timeout
    #[inline]
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// Bound on waiting for a shared refresh
    #[inline]
    #[must_use]
    pub fn refresh_wait(&self) -> Duration {
        Duration::from_secs(self.refresh_wait_secs.max(1))
    }

    /// Retry backoff after a failed fetch, on the registry clock
    #[inline]
    #[must_use]
    pub fn retry_backoff(&self) -> chrono::Duration {
        secs(self.retry_backoff_secs)
    }

    /// Cache-miss refresh throttle, on the registry clock
    #[inline]
    #[must_use]
    pub fn miss_refresh_interval(&self) -> chrono::Duration {
        secs(self.miss_refresh_interval_secs)
    }

    /// Check the configuration for mistakes that would only surface at load time
    ///
    /// # Errors
    /// `InvalidConfig` for an empty source list or a blank remote URL;
    /// `InvalidKey` for an inline secret that is too short or badly encoded.
    pub fn validate(&self) -> KeyResult<()> {
        if self.sources.is_empty() {
            return Err(KeyError::InvalidConfig("at least one key source is required".into()));
        }
        for source in &self.sources {
            match source {
                KeySourceConfig::Inline { .. } => {
                    source.inline_material()?;
                }
                KeySourceConfig::Remote { url } if url.trim().is_empty() => {
                    return Err(KeyError::InvalidConfig("remote key source has an empty url".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_deserialize_from_tagged_yaml_like_json() {
        let json = r#"{
            "sources": [
                {"type": "inline", "kid": "k1", "algorithm": "HS256", "secret": "0123456789abcdef0123456789abcdef"},
                {"type": "keystore", "path": "/etc/keys.json", "passphrase": "pw"},
                {"type": "remote", "url": "https://issuer.example/jwks.json"}
            ],
            "refresh_interval_secs": 60
        }"#;
        let config: KeyLoaderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.refresh_wait(), Duration::from_secs(5));
        assert_eq!(config.miss_refresh_interval(), chrono::Duration::seconds(30));
        assert_eq!(config.retry_backoff(), chrono::Duration::seconds(30));
        assert!(config.sources[2].is_remote());
        config.validate().unwrap();
    }

    #[test]
    fn none_algorithm_is_rejected_in_configuration() {
        let json = r#"{"type": "inline", "kid": "k", "algorithm": "none", "secret": "x"}"#;
        assert!(serde_json::from_str::<KeySourceConfig>(json).is_err());
    }

    #[test]
    fn short_inline_secret_fails_validation() {
        let config = KeyLoaderConfig::with_sources(vec![KeySourceConfig::Inline {
            kid: "k".into(),
            algorithm: Algorithm::HS256,
            secret: "short".into(),
            encoding: SecretEncoding::Utf8,
        }]);
        assert!(matches!(config.validate(), Err(KeyError::InvalidKey(_))));
        assert!(KeyLoaderConfig::default().validate().is_err());
    }

    #[test]
    fn base64url_inline_secret_decodes() {
        let source = KeySourceConfig::Inline {
            kid: "k".into(),
            algorithm: Algorithm::HS256,
            secret: URL_SAFE_NO_PAD.encode([5u8; 32]),
            encoding: SecretEncoding::Base64url,
        };
        assert!(source.inline_material().unwrap().can_sign());
    }

    #[test]
    fn debug_redacts_secrets() {
        let source = KeySourceConfig::Inline {
            kid: "k".into(),
            algorithm: Algorithm::HS256,
            secret: "hunter2-hunter2-hunter2-hunter2!".into(),
            encoding: SecretEncoding::Utf8,
        };
        assert!(!format!("{source:?}").contains("hunter2"));
    }
}
