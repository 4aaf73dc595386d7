//! RSASSA-PKCS1-v1_5 (RS256, RS384, RS512)

use crate::error::{TokenError, TokenResult};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha384, Sha512};
use sigil_key::Algorithm;

pub(super) fn sign(algorithm: Algorithm, private_key: &RsaPrivateKey, payload: &[u8]) -> TokenResult<Vec<u8>> {
    let signature = match algorithm {
        Algorithm::RS256 => SigningKey::<Sha256>::new(private_key.clone()).try_sign(payload),
        Algorithm::RS384 => SigningKey::<Sha384>::new(private_key.clone()).try_sign(payload),
        Algorithm::RS512 => SigningKey::<Sha512>::new(private_key.clone()).try_sign(payload),
        other => {
            return Err(TokenError::UnsupportedAlgorithm(format!(
                "{other} is not an RSA algorithm"
            )))
        }
    }
    .map_err(|e| TokenError::InvalidKey(format!("RSA signing failed: {e}")))?;
    Ok(signature.to_vec())
}

/// A signature of the wrong length or encoding does not verify
pub(super) fn verify(
    algorithm: Algorithm,
    public_key: &RsaPublicKey,
    payload: &[u8],
    signature: &[u8],
) -> TokenResult<bool> {
    let Ok(signature) = Signature::try_from(signature) else {
        return Ok(false);
    };
    let verified = match algorithm {
        Algorithm::RS256 => VerifyingKey::<Sha256>::new(public_key.clone()).verify(payload, &signature),
        Algorithm::RS384 => VerifyingKey::<Sha384>::new(public_key.clone()).verify(payload, &signature),
        Algorithm::RS512 => VerifyingKey::<Sha512>::new(public_key.clone()).verify(payload, &signature),
        other => {
            return Err(TokenError::UnsupportedAlgorithm(format!(
                "{other} is not an RSA algorithm"
            )))
        }
    };
    Ok(verified.is_ok())
}
