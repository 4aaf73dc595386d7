//! Key material, registry and loading for the sigil token authority
//!
//! - [`KeyMaterial`]: an immutable signing/verification key with its `kid`,
//!   algorithm, usage scope and validity window
//! - [`KeyRegistry`]: concurrent `kid` → key map with rotation grace periods
//! - [`KeyLoader`]: populates the registry from inline secrets, keystore files
//!   and remote JWK Sets, with serve-stale caching and single-flight refresh
//! - [`jwk`]: JWK / JWK Set codec
//! - [`keystore`]: passphrase-sealed keystore files

#![forbid(unsafe_code)]

pub mod algorithm;
pub mod clock;
pub mod error;
pub mod jwk;
pub mod keystore;
pub mod loader;
pub mod material;
pub mod registry;

pub use algorithm::{Algorithm, KeyFamily};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{KeyError, KeyResult};
pub use jwk::{Jwk, JwkSet};
pub use keystore::{open_keystore, parse_keystore, seal_keystore, seal_keystore_with, KdfParams};
pub use loader::{
    FsKeystoreReader, HttpKeySetFetcher, KeyLoader, KeyLoaderConfig, KeySetFetcher, KeySourceConfig,
    KeystoreReader, LoaderHealth, RefreshReport, SecretEncoding,
};
pub use material::{KeyData, KeyMaterial, KeyUsage, MIN_RSA_BITS};
pub use registry::{EntryState, KeyRegistry, RotationPolicy};
