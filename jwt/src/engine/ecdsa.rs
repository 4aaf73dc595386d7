//! ECDSA (ES256 on P-256, ES384 on P-384)
//!
//! Signatures use the JWS fixed-width `r || s` encoding, not DER.

use crate::error::{TokenError, TokenResult};
use p256::ecdsa::signature::{Signer, Verifier};

pub(super) fn sign_p256(key: &p256::ecdsa::SigningKey, payload: &[u8]) -> TokenResult<Vec<u8>> {
    let signature: p256::ecdsa::Signature = key
        .try_sign(payload)
        .map_err(|e| TokenError::InvalidKey(format!("ES256 signing failed: {e}")))?;
    Ok(signature.to_bytes().to_vec())
}

pub(super) fn verify_p256(key: &p256::ecdsa::VerifyingKey, payload: &[u8], signature: &[u8]) -> bool {
    p256::ecdsa::Signature::from_slice(signature)
        .map(|sig| key.verify(payload, &sig).is_ok())
        .unwrap_or(false)
}

pub(super) fn sign_p384(key: &p384::ecdsa::SigningKey, payload: &[u8]) -> TokenResult<Vec<u8>> {
    let signature: p384::ecdsa::Signature = key
        .try_sign(payload)
        .map_err(|e| TokenError::InvalidKey(format!("ES384 signing failed: {e}")))?;
    Ok(signature.to_bytes().to_vec())
}

pub(super) fn verify_p384(key: &p384::ecdsa::VerifyingKey, payload: &[u8], signature: &[u8]) -> bool {
    p384::ecdsa::Signature::from_slice(signature)
        .map(|sig| key.verify(payload, &sig).is_ok())
        .unwrap_or(false)
}
