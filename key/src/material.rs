//! Key material: a signing/verification key with its identifier, algorithm,
//! usage scope and validity window
//!
//! A [`KeyMaterial`] is immutable once built. The registry hands it out behind
//! an `Arc`, so every reader sees either the old or the new value of a key,
//! never a mix of both.

use crate::algorithm::{Algorithm, KeyFamily};
use crate::error::{KeyError, KeyResult};
use chrono::{DateTime, Utc};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Smallest RSA modulus accepted, in bits
pub const MIN_RSA_BITS: usize = 2048;

/// What a key may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    /// Signing only
    Sign,
    /// Verification only
    Verify,
    /// Signing and verification
    Both,
}

impl KeyUsage {
    /// Whether the usage scope includes signing
    #[inline]
    #[must_use]
    pub fn can_sign(&self) -> bool {
        matches!(self, KeyUsage::Sign | KeyUsage::Both)
    }

    /// Whether the usage scope includes verification
    #[inline]
    #[must_use]
    pub fn can_verify(&self) -> bool {
        matches!(self, KeyUsage::Verify | KeyUsage::Both)
    }
}

/// Parsed key bytes, one variant per key family/curve
#[derive(Clone)]
pub enum KeyData {
    /// Shared HMAC secret, wiped on drop
    Hmac(Zeroizing<Vec<u8>>),
    /// RSA public key with optional private half
    Rsa {
        /// Verification key
        public: RsaPublicKey,
        /// Signing key, when this party may sign
        private: Option<RsaPrivateKey>,
    },
    /// P-256 public key with optional private half
    EcP256 {
        /// Verification key
        public: p256::ecdsa::VerifyingKey,
        /// Signing key, when this party may sign
        private: Option<p256::ecdsa::SigningKey>,
    },
    /// P-384 public key with optional private half
    EcP384 {
        /// Verification key
        public: p384::ecdsa::VerifyingKey,
        /// Signing key, when this party may sign
        private: Option<p384::ecdsa::SigningKey>,
    },
}

impl KeyData {
    /// Key family of the stored key
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        match self {
            KeyData::Hmac(_) => KeyFamily::Hmac,
            KeyData::Rsa { .. } => KeyFamily::Rsa,
            KeyData::EcP256 { .. } | KeyData::EcP384 { .. } => KeyFamily::Ec,
        }
    }

    /// Whether this key can produce signatures
    #[must_use]
    pub fn has_private(&self) -> bool {
        match self {
            KeyData::Hmac(_) => true,
            KeyData::Rsa { private, .. } => private.is_some(),
            KeyData::EcP256 { private, .. } => private.is_some(),
            KeyData::EcP384 { private, .. } => private.is_some(),
        }
    }

    /// Whether the stored key is usable with `algorithm`
    #[must_use]
    pub fn supports(&self, algorithm: Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (
                KeyData::Hmac(_),
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
            ) | (
                KeyData::Rsa { .. },
                Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512
            ) | (KeyData::EcP256 { .. }, Algorithm::ES256)
                | (KeyData::EcP384 { .. }, Algorithm::ES384)
        )
    }

    fn without_private(&self) -> Option<KeyData> {
        match self {
            KeyData::Hmac(_) => None,
            KeyData::Rsa { public, .. } => Some(KeyData::Rsa {
                public: public.clone(),
                private: None,
            }),
            KeyData::EcP256 { public, .. } => Some(KeyData::EcP256 {
                public: public.clone(),
                private: None,
            }),
            KeyData::EcP384 { public, .. } => Some(KeyData::EcP384 {
                public: public.clone(),
                private: None,
            }),
        }
    }
}

impl fmt::Debug for KeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyData::Hmac(secret) => write!(f, "Hmac([REDACTED; {}])", secret.len()),
            KeyData::Rsa { public, private } => write!(
                f,
                "Rsa {{ bits: {}, private: {} }}",
                public.size() * 8,
                private.is_some()
            ),
            KeyData::EcP256 { private, .. } => {
                write!(f, "EcP256 {{ private: {} }}", private.is_some())
            }
            KeyData::EcP384 { private, .. } => {
                write!(f, "EcP384 {{ private: {} }}", private.is_some())
            }
        }
    }
}

/// A key plus the metadata needed to decide whether and how it may be used
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    id: String,
    algorithm: Algorithm,
    usage: KeyUsage,
    data: KeyData,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

impl KeyMaterial {
    /// Assemble material from already-parsed key data
    ///
    /// # Errors
    /// Returns `InvalidKey` when the key data does not fit the algorithm or the
    /// identifier is empty.
    pub fn from_parts(kid: impl Into<String>, algorithm: Algorithm, data: KeyData) -> KeyResult<Self> {
        let id = kid.into();
        if id.trim().is_empty() {
            return Err(KeyError::invalid_key("key identifier must not be blank"));
        }
        if !data.supports(algorithm) {
            return Err(KeyError::invalid_key(format!(
                "{} key cannot be used with {algorithm}",
                data.family()
            )));
        }
        match &data {
            KeyData::Hmac(secret) => {
                let min = algorithm.min_secret_len().unwrap_or(0);
                if secret.len() < min {
                    return Err(KeyError::invalid_key(format!(
                        "HMAC key for {algorithm} must be at least {min} bytes, got {}",
                        secret.len()
                    )));
                }
            }
            KeyData::Rsa { public, .. } => {
                let bits = public.size() * 8;
                if bits < MIN_RSA_BITS {
                    return Err(KeyError::invalid_key(format!(
                        "RSA key must be at least {MIN_RSA_BITS} bits, got {bits}"
                    )));
                }
            }
            KeyData::EcP256 { .. } | KeyData::EcP384 { .. } => {}
        }
        let usage = if data.has_private() {
            KeyUsage::Both
        } else {
            KeyUsage::Verify
        };
        Ok(Self {
            id,
            algorithm,
            usage,
            data,
            not_before: None,
            not_after: None,
        })
    }

    /// Shared-secret key for an HMAC algorithm
    ///
    /// # Errors
    /// Returns `InvalidKey` if the algorithm is not HMAC or the secret is
    /// shorter than the digest size.
    pub fn hmac(kid: impl Into<String>, algorithm: Algorithm, secret: impl Into<Vec<u8>>) -> KeyResult<Self> {
        Self::from_parts(kid, algorithm, KeyData::Hmac(Zeroizing::new(secret.into())))
    }

    /// Fresh random HMAC key sized to the algorithm's digest
    ///
    /// # Errors
    /// Returns `InvalidKey` if the algorithm is not HMAC.
    pub fn generate_hmac(kid: impl Into<String>, algorithm: Algorithm) -> KeyResult<Self> {
        use rand::RngCore;

        let len = algorithm
            .min_secret_len()
            .ok_or_else(|| KeyError::invalid_key(format!("{algorithm} is not an HMAC algorithm")))?;
        let mut secret = Zeroizing::new(vec![0u8; len]);
        rand::rng().fill_bytes(&mut secret);
        Self::from_parts(kid, algorithm, KeyData::Hmac(secret))
    }

    /// Parse a PEM-encoded RSA or EC key
    ///
    /// Accepts PKCS#8 private keys (plain or passphrase-encrypted), PKCS#1 RSA
    /// private/public keys and SubjectPublicKeyInfo public keys.
    ///
    /// # Errors
    /// Returns `InvalidKey` for unparseable PEM, a missing or wrong passphrase,
    /// or a key that does not match `algorithm`.
    pub fn from_pem(
        kid: impl Into<String>,
        algorithm: Algorithm,
        pem: &str,
        passphrase: Option<&str>,
    ) -> KeyResult<Self> {
        let pem = pem.trim();
        let label = pem_label(pem)?;
        let data = match (algorithm.family(), label) {
            (KeyFamily::Hmac, _) => {
                return Err(KeyError::invalid_key(
                    "HMAC secrets cannot be loaded from PEM",
                ))
            }
            (_, "ENCRYPTED PRIVATE KEY") => {
                let passphrase = passphrase.ok_or_else(|| {
                    KeyError::invalid_key("encrypted PEM key requires a passphrase")
                })?;
                decode_encrypted_private(algorithm, pem, passphrase)?
            }
            (_, "PRIVATE KEY") => decode_private(algorithm, pem)?,
            (KeyFamily::Rsa, "RSA PRIVATE KEY") => {
                let private = RsaPrivateKey::from_pkcs1_pem(pem)
                    .map_err(|e| KeyError::invalid_key(format!("Invalid RSA private key: {e}")))?;
                rsa_pair(private)
            }
            (KeyFamily::Rsa, "RSA PUBLIC KEY") => KeyData::Rsa {
                public: RsaPublicKey::from_pkcs1_pem(pem)
                    .map_err(|e| KeyError::invalid_key(format!("Invalid RSA public key: {e}")))?,
                private: None,
            },
            (_, "PUBLIC KEY") => decode_public(algorithm, pem)?,
            (_, other) => {
                return Err(KeyError::invalid_key(format!(
                    "unsupported PEM block '{other}' for {algorithm}"
                )))
            }
        };
        Self::from_parts(kid, algorithm, data)
    }

    /// Restrict the usage scope
    #[must_use]
    pub fn with_usage(mut self, usage: KeyUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Bound the window in which the key is considered valid
    #[must_use]
    pub fn with_validity(
        mut self,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Key identifier (`kid`)
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Algorithm this key is bound to
    #[inline]
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Usage scope
    #[inline]
    #[must_use]
    pub fn usage(&self) -> KeyUsage {
        self.usage
    }

    /// Parsed key data
    #[inline]
    #[must_use]
    pub fn data(&self) -> &KeyData {
        &self.data
    }

    /// Start of validity, if bounded
    #[inline]
    #[must_use]
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// End of validity, if bounded
    #[inline]
    #[must_use]
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    /// Whether this key may produce signatures
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.usage.can_sign() && self.data.has_private()
    }

    /// Whether this key may verify signatures
    #[must_use]
    pub fn can_verify(&self) -> bool {
        self.usage.can_verify()
    }

    /// Whether `now` falls inside `[not_before, not_after)`
    #[must_use]
    pub fn is_within_validity(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |nbf| now >= nbf) && self.not_after.map_or(true, |naf| now < naf)
    }

    /// Verification-only copy without private material
    ///
    /// Returns `None` for HMAC keys, whose secret cannot be split.
    #[must_use]
    pub fn public_only(&self) -> Option<KeyMaterial> {
        let data = self.data.without_private()?;
        Some(KeyMaterial {
            id: self.id.clone(),
            algorithm: self.algorithm,
            usage: KeyUsage::Verify,
            data,
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }
}

fn pem_label(pem: &str) -> KeyResult<&str> {
    let first = pem.lines().next().unwrap_or_default().trim();
    first
        .strip_prefix("-----BEGIN ")
        .and_then(|rest| rest.strip_suffix("-----"))
        .ok_or_else(|| KeyError::invalid_key("not a PEM document"))
}

fn rsa_pair(private: RsaPrivateKey) -> KeyData {
    KeyData::Rsa {
        public: private.to_public_key(),
        private: Some(private),
    }
}

fn decode_private(algorithm: Algorithm, pem: &str) -> KeyResult<KeyData> {
    match algorithm {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            let private = RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| KeyError::invalid_key(format!("Invalid RSA private key: {e}")))?;
            Ok(rsa_pair(private))
        }
        Algorithm::ES256 => {
            let private = p256::ecdsa::SigningKey::from_pkcs8_pem(pem).map_err(|e| {
                KeyError::invalid_key(format!("Invalid EC private key for ES256: {e}"))
            })?;
            Ok(KeyData::EcP256 {
                public: private.verifying_key().clone(),
                private: Some(private),
            })
        }
        Algorithm::ES384 => {
            let private = p384::ecdsa::SigningKey::from_pkcs8_pem(pem).map_err(|e| {
                KeyError::invalid_key(format!("Invalid EC private key for ES384: {e}"))
            })?;
            Ok(KeyData::EcP384 {
                public: private.verifying_key().clone(),
                private: Some(private),
            })
        }
        _ => Err(KeyError::UnsupportedAlgorithm(algorithm.to_string())),
    }
}

fn decode_encrypted_private(algorithm: Algorithm, pem: &str, passphrase: &str) -> KeyResult<KeyData> {
    let bad = |e: pkcs8::Error| KeyError::invalid_key(format!("Cannot decrypt private key: {e}"));
    match algorithm {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Ok(rsa_pair(
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase).map_err(bad)?,
        )),
        Algorithm::ES256 => {
            let private = p256::ecdsa::SigningKey::from_pkcs8_encrypted_pem(pem, passphrase).map_err(bad)?;
            Ok(KeyData::EcP256 {
                public: private.verifying_key().clone(),
                private: Some(private),
            })
        }
        Algorithm::ES384 => {
            let private = p384::ecdsa::SigningKey::from_pkcs8_encrypted_pem(pem, passphrase).map_err(bad)?;
            Ok(KeyData::EcP384 {
                public: private.verifying_key().clone(),
                private: Some(private),
            })
        }
        _ => Err(KeyError::UnsupportedAlgorithm(algorithm.to_string())),
    }
}

fn decode_public(algorithm: Algorithm, pem: &str) -> KeyResult<KeyData> {
    match algorithm {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Ok(KeyData::Rsa {
            public: RsaPublicKey::from_public_key_pem(pem)
                .map_err(|e| KeyError::invalid_key(format!("Invalid RSA public key: {e}")))?,
            private: None,
        }),
        Algorithm::ES256 => Ok(KeyData::EcP256 {
            public: p256::ecdsa::VerifyingKey::from_public_key_pem(pem).map_err(|e| {
                KeyError::invalid_key(format!("Invalid EC public key for ES256: {e}"))
            })?,
            private: None,
        }),
        Algorithm::ES384 => Ok(KeyData::EcP384 {
            public: p384::ecdsa::VerifyingKey::from_public_key_pem(pem).map_err(|e| {
                KeyError::invalid_key(format!("Invalid EC public key for ES384: {e}"))
            })?,
            private: None,
        }),
        _ => Err(KeyError::UnsupportedAlgorithm(algorithm.to_string())),
    }
}
