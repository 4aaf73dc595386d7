//! HMAC-SHA2 (HS256, HS384, HS512)

use crate::error::{TokenError, TokenResult};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use sigil_key::Algorithm;
use subtle::ConstantTimeEq;

fn mac<M: Mac + KeyInit>(secret: &[u8], payload: &[u8]) -> TokenResult<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(secret)
        .map_err(|_| TokenError::InvalidKey("Invalid HMAC key".to_string()))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[inline]
pub(super) fn sign(algorithm: Algorithm, secret: &[u8], payload: &[u8]) -> TokenResult<Vec<u8>> {
    match algorithm {
        Algorithm::HS256 => mac::<Hmac<Sha256>>(secret, payload),
        Algorithm::HS384 => mac::<Hmac<Sha384>>(secret, payload),
        Algorithm::HS512 => mac::<Hmac<Sha512>>(secret, payload),
        other => Err(TokenError::UnsupportedAlgorithm(format!("{other} is not an HMAC algorithm"))),
    }
}

/// Recompute and compare in constant time
#[inline]
pub(super) fn verify(algorithm: Algorithm, secret: &[u8], payload: &[u8], signature: &[u8]) -> TokenResult<bool> {
    let expected = sign(algorithm, secret, payload)?;
    Ok(bool::from(expected.as_slice().ct_eq(signature)))
}
