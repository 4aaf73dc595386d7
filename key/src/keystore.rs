//! Keystore files
//!
//! A keystore holds either a single PEM key or a JWK Set. A JWK Set may be
//! sealed under a passphrase: the passphrase is stretched with Argon2id and
//! the set is encrypted with AES-256-GCM. The sealed form is a small JSON
//! envelope carrying the KDF parameters, salt and nonce next to the
//! ciphertext, so parameters can be raised later without breaking old files.

use crate::algorithm::Algorithm;
use crate::error::{KeyError, KeyResult};
use crate::jwk::JwkSet;
use crate::material::KeyMaterial;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm,
};
use argon2::{Argon2, Params, Version};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const ENVELOPE_FORMAT: &str = "sigil-keystore";
const ENVELOPE_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    /// Iterations
    pub t_cost: u32,
    /// Lanes
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &[u8], params: KdfParams) -> KeyResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| KeyError::Keystore(format!("Invalid Argon2 parameters: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| KeyError::Keystore(format!("Key derivation failed: {e}")))?;
    Ok(key)
}

fn decode_field(name: &str, value: &str) -> KeyResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| KeyError::Keystore(format!("Keystore field '{name}' is not base64url")))
}

/// Seal a JWK Set under a passphrase with default KDF parameters
///
/// # Errors
/// Returns `InvalidKey` if `jwks_json` is not a JWK Set, `Keystore` if sealing
/// fails.
pub fn seal_keystore(jwks_json: &[u8], passphrase: &str) -> KeyResult<Vec<u8>> {
    seal_keystore_with(jwks_json, passphrase, KdfParams::default())
}

/// Seal a JWK Set under a passphrase with explicit KDF parameters
///
/// # Errors
/// See [`seal_keystore`].
pub fn seal_keystore_with(jwks_json: &[u8], passphrase: &str, params: KdfParams) -> KeyResult<Vec<u8>> {
    use rand::RngCore;

    JwkSet::parse(jwks_json)?;
    if passphrase.is_empty() {
        return Err(KeyError::Keystore("Passphrase must not be empty".into()));
    }

    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| KeyError::Keystore(format!("Invalid keystore key: {e}")))?;
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), jwks_json)
        .map_err(|_| KeyError::Keystore("Keystore encryption failed".into()))?;

    let envelope = Envelope {
        format: ENVELOPE_FORMAT.to_string(),
        version: ENVELOPE_VERSION,
        kdf: params,
        salt: URL_SAFE_NO_PAD.encode(salt),
        nonce: URL_SAFE_NO_PAD.encode(nonce),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| KeyError::Keystore(e.to_string()))
}

/// Open a sealed keystore, returning the JWK Set bytes
///
/// # Errors
/// Returns `Keystore` for a malformed envelope, an unknown version, or a
/// wrong passphrase (authentication failure).
pub fn open_keystore(sealed: &[u8], passphrase: &str) -> KeyResult<Zeroizing<Vec<u8>>> {
    let envelope: Envelope = serde_json::from_slice(sealed)
        .map_err(|e| KeyError::Keystore(format!("Not a sealed keystore: {e}")))?;
    if envelope.format != ENVELOPE_FORMAT || envelope.version != ENVELOPE_VERSION {
        return Err(KeyError::Keystore(format!(
            "Unsupported keystore format {} v{}",
            envelope.format, envelope.version
        )));
    }
    let salt = decode_field("salt", &envelope.salt)?;
    let nonce = decode_field("nonce", &envelope.nonce)?;
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
    if nonce.len() != NONCE_LEN {
        return Err(KeyError::Keystore("Invalid keystore nonce".into()));
    }

    let key = derive_key(passphrase, &salt, envelope.kdf)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| KeyError::Keystore(format!("Invalid keystore key: {e}")))?;
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| KeyError::Keystore("Keystore decryption failed: wrong passphrase or corrupted file".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Whether the bytes look like a sealed keystore envelope
#[must_use]
pub fn is_sealed(bytes: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("format").and_then(|f| f.as_str()).map(|f| f == ENVELOPE_FORMAT))
        .unwrap_or(false)
}

/// Keys held by a keystore file
///
/// PEM files yield one key and need `kid` and `algorithm`; the passphrase
/// decrypts an encrypted PKCS#8 key. JSON files are JWK Sets, sealed or
/// plain; a sealed set needs the passphrase.
///
/// # Errors
/// Returns `InvalidKey` / `Keystore` for unreadable contents and
/// `InvalidConfig` when a PEM keystore lacks `kid` or `algorithm`.
pub fn parse_keystore(
    bytes: &[u8],
    passphrase: Option<&str>,
    kid: Option<&str>,
    algorithm: Option<Algorithm>,
) -> KeyResult<Vec<KeyMaterial>> {
    let text = std::str::from_utf8(bytes).map_err(|_| KeyError::Keystore("Keystore is not UTF-8".into()))?;
    let trimmed = text.trim_start();

    if trimmed.starts_with("-----BEGIN") {
        let (kid, algorithm) = kid.zip(algorithm).ok_or_else(|| {
            KeyError::InvalidConfig("PEM keystore requires 'kid' and 'algorithm'".into())
        })?;
        return Ok(vec![KeyMaterial::from_pem(kid, algorithm, trimmed, passphrase)?]);
    }

    let materials = if is_sealed(bytes) {
        let passphrase = passphrase
            .ok_or_else(|| KeyError::Keystore("Sealed keystore requires a passphrase".into()))?;
        let opened = open_keystore(bytes, passphrase)?;
        JwkSet::parse(&opened)?.to_materials()?
    } else {
        JwkSet::parse(bytes)?.to_materials()?
    };
    Ok(match kid {
        Some(kid) => materials.into_iter().filter(|m| m.id() == kid).collect(),
        None => materials,
    })
}
