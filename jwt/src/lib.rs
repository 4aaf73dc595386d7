//! JWS/JWT issuance and verification
//!
//! - [`TokenAuthority`]: `issue` / `authenticate` facade over a shared key
//!   registry, built from an [`AuthorityConfig`]
//! - [`TokenBuilder`] and [`TokenVerifier`]: the two halves on their own
//! - [`SignatureEngine`]: closed algorithm set, `none` is never accepted
//! - [`TokenError`]: specific failure kinds, each classified as a client or
//!   server fault

#![forbid(unsafe_code)]

pub mod authority;
pub mod builder;
pub mod claims;
pub mod codec;
pub mod config;
pub mod engine;
mod error;
pub mod header;
pub mod revocation;
pub mod verifier;

pub use authority::TokenAuthority;
pub use builder::{encode_token, TokenBuilder};
pub use claims::{Audience, ClaimsSet, RESERVED_CLAIMS};
pub use codec::{token_digest, MAX_TOKEN_LEN};
pub use config::AuthorityConfig;
pub use engine::SignatureEngine;
pub use error::*;
pub use header::Header;
pub use revocation::{RevocationCheck, RevocationList, RevokedToken};
pub use verifier::{TokenVerifier, Validation};

// Key types callers need to configure and rotate
pub use sigil_key::{
    Algorithm, JwkSet, KeyLoader, KeyLoaderConfig, KeyMaterial, KeyRegistry, KeySourceConfig, KeyUsage,
    LoaderHealth, RotationPolicy, SecretEncoding,
};
