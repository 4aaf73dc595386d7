//! Compact serialization helpers
//!
//! Base64url segments, canonical JSON and token fingerprints.

use crate::error::{TokenError, TokenResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Longest token accepted for parsing, in bytes
pub const MAX_TOKEN_LEN: usize = 16 * 1024;

/// Base64url encoding without padding (RFC 7515)
#[inline]
#[must_use]
pub fn encode_segment(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// Base64url decoding without padding (RFC 7515)
///
/// # Errors
/// `MalformedToken` naming the offending segment.
#[inline]
pub fn decode_segment(segment: &str, what: &str) -> TokenResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::MalformedToken(format!("{what} is not valid base64url")))
}

/// Stable JSON bytes: object members sorted by name at every depth
///
/// # Errors
/// `Serialization` if the value cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> TokenResult<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Short SHA-256 fingerprint of a token for log correlation
#[must_use]
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// The three segments of a compact token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    /// Encoded header
    pub header: &'a str,
    /// Encoded claims
    pub claims: &'a str,
    /// Encoded signature
    pub signature: &'a str,
    /// `header.claims`, the bytes covered by the signature
    pub signing_input: &'a str,
}

/// Split a compact token into exactly three non-empty segments
///
/// # Errors
/// `MalformedToken` for oversized input, a wrong segment count or an empty
/// segment.
pub fn split_token(token: &str) -> TokenResult<TokenParts<'_>> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::malformed("token exceeds maximum length"));
    }
    let mut segments = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(TokenError::malformed("token must have exactly three segments"));
    };
    if header.is_empty() || claims.is_empty() || signature.is_empty() {
        return Err(TokenError::malformed("token segments must not be empty"));
    }
    Ok(TokenParts {
        header,
        claims,
        signature,
        signing_input: &token[..header.len() + 1 + claims.len()],
    })
}
