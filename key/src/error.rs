//! Error types for key material, the key registry and key loading

use thiserror::Error;

/// Result alias used across the key crate
pub type KeyResult<T> = Result<T, KeyError>;

/// Key-layer errors
///
/// Errors are `Clone` so that the outcome of one shared refresh can be handed
/// to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// No usable key is registered under this identifier
    #[error("Key not found: kid={kid}")]
    KeyNotFound {
        /// Key identifier
        kid: String,
    },

    /// An active key with the same identifier is already registered
    #[error("Duplicate key conflict: kid={kid} is already active")]
    DuplicateKeyConflict {
        /// Key identifier
        kid: String,
    },

    /// A key source could not be read, fetched or parsed
    #[error("Key source unavailable: {source_name} - {reason}")]
    KeySourceUnavailable {
        /// Human-readable source descriptor (URL, path, inline kid)
        source_name: String,
        /// What went wrong
        reason: String,
    },

    /// The algorithm identifier is not one this crate implements
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key bytes are malformed or inconsistent with the declared algorithm
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Keystore could not be sealed or opened
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// Loader or registry configuration is unusable
    #[error("Invalid key configuration: {0}")]
    InvalidConfig(String),
}

impl KeyError {
    /// Create a key-not-found error
    #[inline]
    #[must_use]
    pub fn not_found(kid: &str) -> Self {
        KeyError::KeyNotFound {
            kid: kid.to_string(),
        }
    }

    /// Create a duplicate-key error
    #[inline]
    #[must_use]
    pub fn duplicate(kid: &str) -> Self {
        KeyError::DuplicateKeyConflict {
            kid: kid.to_string(),
        }
    }

    /// Create a source-unavailable error
    #[inline]
    #[must_use]
    pub fn source_unavailable(source_name: &str, reason: impl Into<String>) -> Self {
        KeyError::KeySourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid key error
    #[inline]
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        KeyError::InvalidKey(msg.into())
    }
}
