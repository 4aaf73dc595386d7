//! Signature engine
//!
//! Stateless dispatch from the closed [`Algorithm`] set to the primitive for
//! each family. The key is borrowed for the duration of one call. A key is
//! only ever used with the algorithm it is bound to: any other pairing fails
//! with `AlgorithmKeyMismatch` before a primitive runs.

mod ecdsa;
mod hmac;
mod rsa;

use crate::error::{TokenError, TokenResult};
use sigil_key::{Algorithm, KeyData, KeyMaterial};

/// Signs and verifies raw payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureEngine;

impl SignatureEngine {
    /// Resolve an algorithm name
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` for anything outside the supported set,
    /// including `none`.
    pub fn resolve(name: &str) -> TokenResult<Algorithm> {
        name.parse::<Algorithm>()
            .map_err(|_| TokenError::UnsupportedAlgorithm(name.to_string()))
    }

    fn check_pairing(algorithm: Algorithm, key: &KeyMaterial) -> TokenResult<()> {
        if key.algorithm() != algorithm || !key.data().supports(algorithm) {
            return Err(TokenError::AlgorithmKeyMismatch {
                algorithm: algorithm.to_string(),
                kid: key.id().to_string(),
                key_algorithm: key.algorithm().to_string(),
            });
        }
        Ok(())
    }

    /// Sign `payload`
    ///
    /// # Errors
    /// `AlgorithmKeyMismatch` when the key is bound to another algorithm;
    /// `InvalidKey` when the key has no signing capability.
    pub fn sign(algorithm: Algorithm, key: &KeyMaterial, payload: &[u8]) -> TokenResult<Vec<u8>> {
        Self::check_pairing(algorithm, key)?;
        if !key.can_sign() {
            return Err(TokenError::InvalidKey(format!(
                "key {} cannot be used for signing",
                key.id()
            )));
        }
        let no_private = || TokenError::InvalidKey(format!("key {} has no private material", key.id()));
        match key.data() {
            KeyData::Hmac(secret) => hmac::sign(algorithm, secret, payload),
            KeyData::Rsa { private, .. } => {
                rsa::sign(algorithm, private.as_ref().ok_or_else(no_private)?, payload)
            }
            KeyData::EcP256 { private, .. } => {
                ecdsa::sign_p256(private.as_ref().ok_or_else(no_private)?, payload)
            }
            KeyData::EcP384 { private, .. } => {
                ecdsa::sign_p384(private.as_ref().ok_or_else(no_private)?, payload)
            }
        }
    }

    /// Verify `signature` over `payload`
    ///
    /// Returns `Ok(false)` for a signature that does not verify, including one
    /// with the wrong length or encoding.
    ///
    /// # Errors
    /// `AlgorithmKeyMismatch` when the key is bound to another algorithm.
    pub fn verify(algorithm: Algorithm, key: &KeyMaterial, payload: &[u8], signature: &[u8]) -> TokenResult<bool> {
        Self::check_pairing(algorithm, key)?;
        match key.data() {
            KeyData::Hmac(secret) => hmac::verify(algorithm, secret, payload, signature),
            KeyData::Rsa { public, .. } => rsa::verify(algorithm, public, payload, signature),
            KeyData::EcP256 { public, .. } => Ok(ecdsa::verify_p256(public, payload, signature)),
            KeyData::EcP384 { public, .. } => Ok(ecdsa::verify_p384(public, payload, signature)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_PRIVATE: &str = include_str!("../../../testdata/rsa_private.pem");
    const RSA_PUBLIC: &str = include_str!("../../../testdata/rsa_public.pem");
    const EC256_PRIVATE: &str = include_str!("../../../testdata/ec256_private.pem");
    const EC384_PRIVATE: &str = include_str!("../../../testdata/ec384_private.pem");

    fn keys() -> Vec<KeyMaterial> {
        vec![
            KeyMaterial::generate_hmac("hs256", Algorithm::HS256).unwrap(),
            KeyMaterial::generate_hmac("hs384", Algorithm::HS384).unwrap(),
            KeyMaterial::generate_hmac("hs512", Algorithm::HS512).unwrap(),
            KeyMaterial::from_pem("rs256", Algorithm::RS256, RSA_PRIVATE, None).unwrap(),
            KeyMaterial::from_pem("rs384", Algorithm::RS384, RSA_PRIVATE, None).unwrap(),
            KeyMaterial::from_pem("rs512", Algorithm::RS512, RSA_PRIVATE, None).unwrap(),
            KeyMaterial::from_pem("es256", Algorithm::ES256, EC256_PRIVATE, None).unwrap(),
            KeyMaterial::from_pem("es384", Algorithm::ES384, EC384_PRIVATE, None).unwrap(),
        ]
    }

    #[test]
    fn every_algorithm_signs_and_verifies() {
        for key in keys() {
            let alg = key.algorithm();
            let sig = SignatureEngine::sign(alg, &key, b"payload").unwrap();
            assert!(SignatureEngine::verify(alg, &key, b"payload", &sig).unwrap(), "{alg}");
            assert!(!SignatureEngine::verify(alg, &key, b"payloaD", &sig).unwrap(), "{alg}");
        }
    }

    #[test]
    fn ecdsa_signatures_are_fixed_width() {
        for key in keys().into_iter().filter(|k| k.algorithm().curve().is_some()) {
            let sig = SignatureEngine::sign(key.algorithm(), &key, b"x").unwrap();
            let expected = if key.algorithm() == Algorithm::ES256 { 64 } else { 96 };
            assert_eq!(sig.len(), expected);
        }
    }

    #[test]
    fn mismatched_pairings_fail_before_any_primitive() {
        let keys = keys();
        for key in &keys {
            for alg in Algorithm::ALL.into_iter().filter(|a| *a != key.algorithm()) {
                assert!(matches!(
                    SignatureEngine::sign(alg, key, b"x"),
                    Err(TokenError::AlgorithmKeyMismatch { .. })
                ));
                assert!(matches!(
                    SignatureEngine::verify(alg, key, b"x", b"sig"),
                    Err(TokenError::AlgorithmKeyMismatch { .. })
                ));
            }
        }
    }

    #[test]
    fn garbage_signatures_do_not_verify() {
        for key in keys() {
            for sig in [&b""[..], &[0u8; 3][..], &[0xffu8; 64][..], &[0u8; 512][..]] {
                assert!(!SignatureEngine::verify(key.algorithm(), &key, b"x", sig).unwrap());
            }
        }
    }

    #[test]
    fn signature_from_another_rsa_key_does_not_verify() {
        let other = include_str!("../../../testdata/rsa_other_private.pem");
        let signer = KeyMaterial::from_pem("rs256", Algorithm::RS256, other, None).unwrap();
        let verifier = KeyMaterial::from_pem("rs256", Algorithm::RS256, RSA_PUBLIC, None).unwrap();
        let sig = SignatureEngine::sign(Algorithm::RS256, &signer, b"payload").unwrap();
        assert!(!SignatureEngine::verify(Algorithm::RS256, &verifier, b"payload", &sig).unwrap());
    }

    #[test]
    fn public_key_cannot_sign() {
        let key = KeyMaterial::from_pem("pub", Algorithm::RS256, RSA_PUBLIC, None).unwrap();
        assert!(matches!(
            SignatureEngine::sign(Algorithm::RS256, &key, b"x"),
            Err(TokenError::InvalidKey(_))
        ));
    }

    #[test]
    fn none_is_not_an_algorithm() {
        for name in ["none", "NONE", "HS1", ""] {
            assert!(matches!(
                SignatureEngine::resolve(name),
                Err(TokenError::UnsupportedAlgorithm(_))
            ));
        }
        assert_eq!(SignatureEngine::resolve("ES384").unwrap(), Algorithm::ES384);
    }
}
