//! JSON Web Key (RFC 7517) codec
//!
//! Converts between JWK / JWK Set documents and [`KeyMaterial`]. Remote key
//! sets and JSON keystores are parsed here; the public half of the registry is
//! exported here for publication to remote verifiers.

use crate::algorithm::{Algorithm, KeyFamily};
use crate::error::{KeyError, KeyResult};
use crate::material::{KeyData, KeyMaterial};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::DateTime;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use zeroize::Zeroizing;

/// A single JSON Web Key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type: `oct`, `RSA` or `EC`
    pub kty: String,
    /// Key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Intended algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Public key use: `sig` or `enc`
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// EC curve name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// RSA modulus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Private exponent (RSA) or private scalar (EC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// RSA first prime factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    /// RSA second prime factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// Symmetric key value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    /// Key not valid before this unix time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Key not valid at or after this unix time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// A JSON Web Key Set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Member keys
    pub keys: Vec<Jwk>,
}

fn b64(field: &str, value: Option<&String>) -> KeyResult<Vec<u8>> {
    let value = value.ok_or_else(|| KeyError::invalid_key(format!("JWK is missing '{field}'")))?;
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| KeyError::invalid_key(format!("JWK '{field}' is not base64url")))
}

fn uint(field: &str, value: Option<&String>) -> KeyResult<BigUint> {
    Ok(BigUint::from_bytes_be(&b64(field, value)?))
}

fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Jwk {
    /// Resolve the algorithm from `alg`, falling back to the key type
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` for unknown names, `InvalidKey` when nothing
    /// identifies the algorithm.
    pub fn algorithm(&self) -> KeyResult<Algorithm> {
        if let Some(alg) = &self.alg {
            return alg.parse();
        }
        match (self.kty.as_str(), self.crv.as_deref()) {
            ("oct", _) => Ok(Algorithm::HS256),
            ("RSA", _) => Ok(Algorithm::RS256),
            ("EC", Some("P-256")) => Ok(Algorithm::ES256),
            ("EC", Some("P-384")) => Ok(Algorithm::ES384),
            (kty, crv) => Err(KeyError::invalid_key(format!(
                "cannot infer algorithm for kty={kty} crv={}",
                crv.unwrap_or("-")
            ))),
        }
    }

    /// Convert into key material
    ///
    /// # Errors
    /// Returns `InvalidKey` for a missing `kid`, a `kty` that disagrees with
    /// the algorithm, or malformed key parameters.
    pub fn to_material(&self) -> KeyResult<KeyMaterial> {
        let kid = self
            .kid
            .as_deref()
            .ok_or_else(|| KeyError::invalid_key("JWK has no 'kid'"))?;
        let algorithm = self.algorithm()?;
        let expected_kty = algorithm.family().to_string();
        if self.kty != expected_kty {
            return Err(KeyError::invalid_key(format!(
                "kty '{}' does not match algorithm {algorithm}",
                self.kty
            )));
        }

        let data = match algorithm.family() {
            KeyFamily::Hmac => KeyData::Hmac(Zeroizing::new(b64("k", self.k.as_ref())?)),
            KeyFamily::Rsa => self.rsa_data()?,
            KeyFamily::Ec => self.ec_data(algorithm)?,
        };

        let material = KeyMaterial::from_parts(kid, algorithm, data)?;
        let not_before = self.nbf.and_then(|t| DateTime::from_timestamp(t, 0));
        let not_after = self.exp.and_then(|t| DateTime::from_timestamp(t, 0));
        Ok(material.with_validity(not_before, not_after))
    }

    fn rsa_data(&self) -> KeyResult<KeyData> {
        let n = uint("n", self.n.as_ref())?;
        let e = uint("e", self.e.as_ref())?;
        let public = RsaPublicKey::new(n.clone(), e.clone())
            .map_err(|err| KeyError::invalid_key(format!("Invalid RSA public key: {err}")))?;
        let private = match &self.d {
            None => None,
            Some(_) => {
                let d = uint("d", self.d.as_ref())?;
                let p = uint("p", self.p.as_ref())?;
                let q = uint("q", self.q.as_ref())?;
                let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
                    .map_err(|err| KeyError::invalid_key(format!("Invalid RSA private key: {err}")))?;
                key.validate()
                    .map_err(|err| KeyError::invalid_key(format!("Invalid RSA private key: {err}")))?;
                Some(key)
            }
        };
        Ok(KeyData::Rsa { public, private })
    }

    fn ec_data(&self, algorithm: Algorithm) -> KeyResult<KeyData> {
        let curve = algorithm.curve().unwrap_or_default();
        if self.crv.as_deref() != Some(curve) {
            return Err(KeyError::invalid_key(format!(
                "crv '{}' does not match algorithm {algorithm}",
                self.crv.as_deref().unwrap_or("-")
            )));
        }
        let x = b64("x", self.x.as_ref())?;
        let y = b64("y", self.y.as_ref())?;
        let width = if algorithm == Algorithm::ES256 { 32 } else { 48 };
        if x.len() != width || y.len() != width {
            return Err(KeyError::invalid_key(format!(
                "EC coordinates for {curve} must be {width} bytes"
            )));
        }
        let mut sec1 = Vec::with_capacity(1 + 2 * width);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);
        let d = match &self.d {
            Some(_) => Some(Zeroizing::new(b64("d", self.d.as_ref())?)),
            None => None,
        };
        let mismatch = || KeyError::invalid_key("EC private key does not match public coordinates");

        match algorithm {
            Algorithm::ES256 => {
                let public = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                    .map_err(|_| KeyError::invalid_key("Invalid P-256 public point"))?;
                let private = match d {
                    Some(d) => {
                        let key = p256::ecdsa::SigningKey::from_slice(&d)
                            .map_err(|_| KeyError::invalid_key("Invalid P-256 private scalar"))?;
                        if key.verifying_key() != &public {
                            return Err(mismatch());
                        }
                        Some(key)
                    }
                    None => None,
                };
                Ok(KeyData::EcP256 { public, private })
            }
            Algorithm::ES384 => {
                let public = p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                    .map_err(|_| KeyError::invalid_key("Invalid P-384 public point"))?;
                let private = match d {
                    Some(d) => {
                        let key = p384::ecdsa::SigningKey::from_slice(&d)
                            .map_err(|_| KeyError::invalid_key("Invalid P-384 private scalar"))?;
                        if key.verifying_key() != &public {
                            return Err(mismatch());
                        }
                        Some(key)
                    }
                    None => None,
                };
                Ok(KeyData::EcP384 { public, private })
            }
            _ => Err(KeyError::UnsupportedAlgorithm(algorithm.to_string())),
        }
    }

    /// Encode key material as a JWK
    ///
    /// With `include_private == false`, HMAC keys yield `None` and asymmetric
    /// keys are exported without their private parameters.
    #[must_use]
    pub fn from_material(material: &KeyMaterial, include_private: bool) -> Option<Jwk> {
        let mut jwk = Jwk {
            kty: material.algorithm().family().to_string(),
            kid: Some(material.id().to_string()),
            alg: Some(material.algorithm().to_string()),
            key_use: Some("sig".to_string()),
            nbf: material.not_before().map(|t| t.timestamp()),
            exp: material.not_after().map(|t| t.timestamp()),
            ..Jwk::default()
        };
        match material.data() {
            KeyData::Hmac(secret) => {
                if !include_private {
                    return None;
                }
                jwk.k = Some(encode(secret));
            }
            KeyData::Rsa { public, private } => {
                jwk.n = Some(encode(&public.n().to_bytes_be()));
                jwk.e = Some(encode(&public.e().to_bytes_be()));
                if let (true, Some(private)) = (include_private, private) {
                    let primes = private.primes();
                    if primes.len() == 2 {
                        jwk.d = Some(encode(&private.d().to_bytes_be()));
                        jwk.p = Some(encode(&primes[0].to_bytes_be()));
                        jwk.q = Some(encode(&primes[1].to_bytes_be()));
                    }
                }
            }
            KeyData::EcP256 { public, private } => {
                let point = public.to_encoded_point(false);
                set_coordinates(&mut jwk, "P-256", point.as_bytes(), 32);
                if let (true, Some(private)) = (include_private, private) {
                    jwk.d = Some(encode(&private.to_bytes()));
                }
            }
            KeyData::EcP384 { public, private } => {
                let point = public.to_encoded_point(false);
                set_coordinates(&mut jwk, "P-384", point.as_bytes(), 48);
                if let (true, Some(private)) = (include_private, private) {
                    jwk.d = Some(encode(&private.to_bytes()));
                }
            }
        }
        Some(jwk)
    }
}

fn set_coordinates(jwk: &mut Jwk, curve: &str, uncompressed: &[u8], width: usize) {
    jwk.crv = Some(curve.to_string());
    if uncompressed.len() == 1 + 2 * width {
        jwk.x = Some(encode(&uncompressed[1..=width]));
        jwk.y = Some(encode(&uncompressed[1 + width..]));
    }
}

impl JwkSet {
    /// Parse a JWK Set document
    ///
    /// # Errors
    /// Returns `InvalidKey` if the bytes are not a JWK Set.
    pub fn parse(bytes: &[u8]) -> KeyResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| KeyError::invalid_key(format!("Invalid JWK Set: {e}")))
    }

    /// Serialize to JSON
    ///
    /// # Errors
    /// Returns `InvalidKey` if serialization fails.
    pub fn to_json(&self) -> KeyResult<String> {
        serde_json::to_string(self).map_err(|e| KeyError::invalid_key(e.to_string()))
    }

    /// Convert the usable signature keys of this set into key material
    ///
    /// Encryption keys, keys without `kid` and keys with unsupported or
    /// malformed parameters are skipped with a warning.
    ///
    /// # Errors
    /// Returns `InvalidKey` when two members share a `kid`: key resolution for
    /// that identifier would be ambiguous.
    pub fn to_materials(&self) -> KeyResult<Vec<KeyMaterial>> {
        let mut seen = HashSet::new();
        let mut materials = Vec::with_capacity(self.keys.len());
        for jwk in &self.keys {
            if jwk.key_use.as_deref() == Some("enc") {
                tracing::debug!(kid = ?jwk.kid, "Skipping encryption key in key set");
                continue;
            }
            if let Some(kid) = &jwk.kid {
                if !seen.insert(kid.clone()) {
                    return Err(KeyError::invalid_key(format!(
                        "key set contains kid '{kid}' more than once"
                    )));
                }
            }
            match jwk.to_material() {
                Ok(material) => materials.push(material),
                Err(e) => tracing::warn!(kid = ?jwk.kid, kty = %jwk.kty, error = %e, "Skipping unusable key in key set"),
            }
        }
        Ok(materials)
    }

    /// Public key set for the given materials (HMAC keys are never published)
    #[must_use]
    pub fn public_from<'a>(materials: impl IntoIterator<Item = &'a KeyMaterial>) -> Self {
        Self {
            keys: materials
                .into_iter()
                .filter_map(|m| Jwk::from_material(m, false))
                .collect(),
        }
    }

    /// Full key set including private parameters, for sealing into a keystore
    #[must_use]
    pub fn private_from<'a>(materials: impl IntoIterator<Item = &'a KeyMaterial>) -> Self {
        Self {
            keys: materials
                .into_iter()
                .filter_map(|m| Jwk::from_material(m, true))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::KeyUsage;

    const RSA_PRIVATE: &str = include_str!("../../testdata/rsa_private.pem");
    const EC256_PRIVATE: &str = include_str!("../../testdata/ec256_private.pem");
    const EC384_PRIVATE: &str = include_str!("../../testdata/ec384_private.pem");

    #[test]
    fn public_export_omits_private_parameters_and_secrets() {
        let rsa = KeyMaterial::from_pem("rsa", Algorithm::RS256, RSA_PRIVATE, None).unwrap();
        let hmac = KeyMaterial::generate_hmac("hmac", Algorithm::HS256).unwrap();
        let set = JwkSet::public_from([&rsa, &hmac]);
        assert_eq!(set.keys.len(), 1);
        let jwk = &set.keys[0];
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some("rsa"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
        assert!(jwk.d.is_none());
        assert!(jwk.n.is_some() && jwk.e.is_some());
    }

    #[test]
    fn exported_public_ec_key_parses_back_as_verify_only() {
        for (alg, pem) in [(Algorithm::ES256, EC256_PRIVATE), (Algorithm::ES384, EC384_PRIVATE)] {
            let key = KeyMaterial::from_pem("ec", alg, pem, None).unwrap();
            let jwk = Jwk::from_material(&key, false).unwrap();
            let parsed = jwk.to_material().unwrap();
            assert_eq!(parsed.algorithm(), alg);
            assert_eq!(parsed.usage(), KeyUsage::Verify);
        }
    }

    #[test]
    fn private_export_keeps_signing_capability() {
        let rsa = KeyMaterial::from_pem("rsa", Algorithm::RS512, RSA_PRIVATE, None).unwrap();
        let ec = KeyMaterial::from_pem("ec", Algorithm::ES256, EC256_PRIVATE, None).unwrap();
        let hmac = KeyMaterial::generate_hmac("hmac", Algorithm::HS512).unwrap();
        let set = JwkSet::private_from([&rsa, &ec, &hmac]);
        let materials = set.to_materials().unwrap();
        assert_eq!(materials.len(), 3);
        assert!(materials.iter().all(KeyMaterial::can_sign));
    }

    #[test]
    fn duplicate_kids_make_the_set_ambiguous() {
        let hmac = KeyMaterial::generate_hmac("dup", Algorithm::HS256).unwrap();
        let jwk = Jwk::from_material(&hmac, true).unwrap();
        let set = JwkSet {
            keys: vec![jwk.clone(), jwk],
        };
        assert!(matches!(set.to_materials(), Err(KeyError::InvalidKey(_))));
    }

    #[test]
    fn unusable_members_are_skipped() {
        let doc = br#"{"keys":[
            {"kty":"oct","kid":"enc","use":"enc","k":"AAAA"},
            {"kty":"oct","k":"AAAA"},
            {"kty":"oct","kid":"none","alg":"none","k":"AAAA"},
            {"kty":"oct","kid":"short","alg":"HS256","k":"AAAA"},
            {"kty":"EC","kid":"bad-curve","crv":"P-521","x":"AA","y":"AA"}
        ]}"#;
        let set = JwkSet::parse(doc).unwrap();
        assert!(set.to_materials().unwrap().is_empty());
    }

    #[test]
    fn validity_bounds_are_carried_over() {
        let doc = br#"{"keys":[{"kty":"oct","kid":"k","alg":"HS256",
            "k":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA","nbf":100,"exp":200}]}"#;
        let materials = JwkSet::parse(doc).unwrap().to_materials().unwrap();
        assert_eq!(materials[0].not_before().unwrap().timestamp(), 100);
        assert_eq!(materials[0].not_after().unwrap().timestamp(), 200);
    }

    #[test]
    fn garbage_is_not_a_key_set() {
        assert!(JwkSet::parse(b"<html>").is_err());
        assert!(JwkSet::parse(br#"{"keys":"nope"}"#).is_err());
    }
}
