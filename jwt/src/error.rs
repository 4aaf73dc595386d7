//! Token error taxonomy
//!
//! Every failure keeps its specific kind and also belongs to one of two broad
//! classes, so a calling layer can map it to a response without losing detail:
//! client faults (reject, do not retry) and server faults (log, alert, degrade).

use sigil_key::KeyError;
use thiserror::Error;

/// Token operation result type
pub type TokenResult<T> = Result<T, TokenError>;

/// Who caused a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// The presented token or request is at fault
    Client,
    /// The authority itself cannot currently do its job
    Server,
}

/// Token errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Structurally invalid token: segments, encoding, header or claims JSON
    #[error("Malformed token: {0}")]
    MalformedToken(String),
    /// Signature does not verify under the resolved key
    #[error("Invalid token signature")]
    InvalidSignature,
    /// `exp` has passed
    #[error("Token has expired")]
    TokenExpired,
    /// `nbf` is still in the future
    #[error("Token not yet valid")]
    TokenNotYetValid,
    /// `aud` does not contain the expected audience
    #[error("Token audience mismatch")]
    AudienceMismatch,
    /// `iss` is not the expected issuer
    #[error("Token issuer mismatch")]
    IssuerMismatch,
    /// No usable key for the `kid`
    #[error("Key not found: kid={0}")]
    KeyNotFound(String),
    /// A required claim is absent
    #[error("Missing required claim: {0}")]
    MissingClaim(String),
    /// Revocation check reported the token
    #[error("Token has been revoked")]
    Revoked,
    /// A key source could not be read, fetched or parsed
    #[error("Key source unavailable: {0}")]
    KeySourceUnavailable(String),
    /// The key could not be resolved because key sources are unavailable
    #[error("Key infrastructure unavailable: {0}")]
    KeyInfrastructureUnavailable(String),
    /// Two active keys claim the same `kid`
    #[error("Duplicate key conflict: kid={0}")]
    DuplicateKeyConflict(String),
    /// Algorithm name outside the supported set
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Key family does not match the requested algorithm
    #[error("Algorithm {algorithm} cannot be used with key {kid} ({key_algorithm})")]
    AlgorithmKeyMismatch {
        /// Requested algorithm
        algorithm: String,
        /// Key identifier
        kid: String,
        /// Algorithm the key is bound to
        key_algorithm: String,
    },
    /// Key material is unusable for the operation
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    /// Claims or header could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Authority configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TokenError {
    /// Broad class of this error
    #[must_use]
    pub fn class(&self) -> FaultClass {
        match self {
            TokenError::MalformedToken(_)
            | TokenError::InvalidSignature
            | TokenError::TokenExpired
            | TokenError::TokenNotYetValid
            | TokenError::AudienceMismatch
            | TokenError::IssuerMismatch
            | TokenError::KeyNotFound(_)
            | TokenError::MissingClaim(_)
            | TokenError::Revoked => FaultClass::Client,
            TokenError::KeySourceUnavailable(_)
            | TokenError::KeyInfrastructureUnavailable(_)
            | TokenError::DuplicateKeyConflict(_)
            | TokenError::UnsupportedAlgorithm(_)
            | TokenError::AlgorithmKeyMismatch { .. }
            | TokenError::InvalidKey(_)
            | TokenError::Serialization(_)
            | TokenError::InvalidConfig(_) => FaultClass::Server,
        }
    }

    /// Whether the caller's input caused the failure
    #[inline]
    #[must_use]
    pub fn is_client_fault(&self) -> bool {
        self.class() == FaultClass::Client
    }

    /// Whether the authority caused the failure
    #[inline]
    #[must_use]
    pub fn is_server_fault(&self) -> bool {
        self.class() == FaultClass::Server
    }

    /// Create a malformed token error
    #[inline]
    #[must_use]
    pub fn malformed(msg: &str) -> Self {
        TokenError::MalformedToken(msg.to_string())
    }

    /// Create a missing claim error
    #[inline]
    #[must_use]
    pub fn missing_claim(claim: &str) -> Self {
        TokenError::MissingClaim(claim.to_string())
    }

    /// Create a serialization error
    #[inline]
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        TokenError::Serialization(msg.into())
    }
}

impl From<KeyError> for TokenError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::KeyNotFound { kid } => TokenError::KeyNotFound(kid),
            KeyError::DuplicateKeyConflict { kid } => TokenError::DuplicateKeyConflict(kid),
            KeyError::KeySourceUnavailable { .. } | KeyError::Keystore(_) => {
                TokenError::KeySourceUnavailable(err.to_string())
            }
            KeyError::UnsupportedAlgorithm(alg) => TokenError::UnsupportedAlgorithm(alg),
            KeyError::InvalidKey(msg) => TokenError::InvalidKey(msg),
            KeyError::InvalidConfig(msg) => TokenError::InvalidConfig(msg),
        }
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(err: serde_json::Error) -> Self {
        TokenError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_faults_are_separated() {
        let client = [
            TokenError::malformed("x"),
            TokenError::InvalidSignature,
            TokenError::TokenExpired,
            TokenError::TokenNotYetValid,
            TokenError::AudienceMismatch,
            TokenError::IssuerMismatch,
            TokenError::KeyNotFound("k".into()),
        ];
        assert!(client.iter().all(TokenError::is_client_fault));

        let server = [
            TokenError::KeySourceUnavailable("x".into()),
            TokenError::KeyInfrastructureUnavailable("x".into()),
            TokenError::DuplicateKeyConflict("k".into()),
            TokenError::UnsupportedAlgorithm("none".into()),
            TokenError::AlgorithmKeyMismatch {
                algorithm: "RS256".into(),
                kid: "k".into(),
                key_algorithm: "HS256".into(),
            },
        ];
        assert!(server.iter().all(TokenError::is_server_fault));
    }

    #[test]
    fn key_errors_keep_their_kind() {
        assert_eq!(
            TokenError::from(KeyError::not_found("k1")),
            TokenError::KeyNotFound("k1".into())
        );
        assert_eq!(
            TokenError::from(KeyError::duplicate("k1")),
            TokenError::DuplicateKeyConflict("k1".into())
        );
        let unavailable = TokenError::from(KeyError::source_unavailable("https://x", "timeout"));
        assert!(matches!(unavailable, TokenError::KeySourceUnavailable(ref m) if m.contains("timeout")));
        assert!(unavailable.is_server_fault());
    }
}
