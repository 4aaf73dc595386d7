#![allow(dead_code)]

use async_trait::async_trait;
use sigil_key::{
    FsKeystoreReader, KeyError, KeyLoader, KeyRegistry, KeyResult, KeySetFetcher, ManualClock,
};
use sigil_jwt::{Algorithm, AuthorityConfig, KeySourceConfig, SecretEncoding, TokenAuthority};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NOW: i64 = 1_700_000_000;
pub const SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const REMOTE_URL: &str = "https://idp.example/.well-known/jwks.json";

pub const RSA_PRIVATE: &str = include_str!("../../../testdata/rsa_private.pem");
pub const RSA_PUBLIC: &str = include_str!("../../../testdata/rsa_public.pem");
pub const EC256_PRIVATE: &str = include_str!("../../../testdata/ec256_private.pem");
pub const EC384_PRIVATE: &str = include_str!("../../../testdata/ec384_private.pem");

/// In-memory key set endpoint
pub struct ScriptedFetcher {
    calls: AtomicUsize,
    response: Mutex<Result<Vec<u8>, String>>,
    delay: Mutex<Duration>,
}

impl ScriptedFetcher {
    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new(Err(reason.to_string())),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn respond(&self, body: Vec<u8>) {
        *self.response.lock().unwrap() = Ok(body);
    }

    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl KeySetFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> KeyResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| KeyError::source_unavailable(url, reason))
    }
}

pub fn inline(kid: &str) -> KeySourceConfig {
    KeySourceConfig::Inline {
        kid: kid.into(),
        algorithm: Algorithm::HS256,
        secret: SECRET.into(),
        encoding: SecretEncoding::Utf8,
    }
}

pub fn hs256_config() -> AuthorityConfig {
    AuthorityConfig::new("k1", Algorithm::HS256, vec![inline("k1")])
}

pub struct Harness {
    pub authority: TokenAuthority,
    pub registry: Arc<KeyRegistry>,
    pub clock: Arc<ManualClock>,
    pub fetcher: Arc<ScriptedFetcher>,
}

impl Harness {
    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn set(&self, timestamp: i64) {
        self.clock.set(chrono::DateTime::from_timestamp(timestamp, 0).unwrap());
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Authority over a manually driven clock and a scripted key set endpoint
pub async fn harness(config: AuthorityConfig) -> Harness {
    harness_with(config, ScriptedFetcher::failing("no remote configured")).await
}

pub async fn harness_with(config: AuthorityConfig, fetcher: Arc<ScriptedFetcher>) -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::at_timestamp(NOW));
    let registry = Arc::new(KeyRegistry::with_clock(config.rotation, clock.clone()));
    let loader = KeyLoader::with_capabilities(
        config.keys.clone(),
        Arc::clone(&registry),
        fetcher.clone(),
        Arc::new(FsKeystoreReader),
    );
    loader.load().await.unwrap();
    let authority = TokenAuthority::new(Arc::clone(&registry), loader, &config)
        .await
        .unwrap();
    Harness {
        authority,
        registry,
        clock,
        fetcher,
    }
}
