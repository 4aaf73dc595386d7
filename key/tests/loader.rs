use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use sigil_key::{
    seal_keystore_with, Algorithm, EntryState, FsKeystoreReader, Jwk, JwkSet, KdfParams, KeyError,
    KeyLoader, KeyLoaderConfig, KeyMaterial, KeyRegistry, KeyResult, KeySetFetcher, KeySourceConfig,
    ManualClock, RotationPolicy, SecretEncoding,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EC256_PUBLIC: &str = include_str!("../../testdata/ec256_public.pem");
const URL: &str = "https://issuer.example/.well-known/jwks.json";
const OTHER_URL: &str = "https://partner.example/.well-known/jwks.json";

struct ScriptedFetcher {
    calls: AtomicUsize,
    response: Mutex<Result<Vec<u8>, String>>,
    delay: Duration,
}

impl ScriptedFetcher {
    fn new(body: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new(Ok(body)),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, body: Vec<u8>) {
        *self.response.lock().unwrap() = Ok(body);
    }

    fn fail(&self, reason: &str) {
        *self.response.lock().unwrap() = Err(reason.to_string());
    }
}

#[async_trait]
impl KeySetFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> KeyResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| KeyError::source_unavailable(url, reason))
    }
}

fn jwks(kids: &[&str]) -> Vec<u8> {
    let keys: Vec<KeyMaterial> = kids
        .iter()
        .map(|kid| KeyMaterial::from_pem(*kid, Algorithm::ES256, EC256_PUBLIC, None).unwrap())
        .collect();
    JwkSet::public_from(keys.iter()).to_json().unwrap().into_bytes()
}

fn inline_source() -> KeySourceConfig {
    KeySourceConfig::Inline {
        kid: "local".into(),
        algorithm: Algorithm::HS256,
        secret: "an-inline-secret-of-32-bytes-ok!".into(),
        encoding: SecretEncoding::Utf8,
    }
}

fn remote_source() -> KeySourceConfig {
    KeySourceConfig::Remote { url: URL.into() }
}

fn setup(
    sources: Vec<KeySourceConfig>,
    fetcher: Arc<ScriptedFetcher>,
) -> (KeyLoader, Arc<KeyRegistry>, Arc<ManualClock>) {
    let mut config = KeyLoaderConfig::with_sources(sources);
    config.fetch_timeout_secs = 5;
    setup_with(config, fetcher)
}

fn setup_with(
    config: KeyLoaderConfig,
    fetcher: Arc<ScriptedFetcher>,
) -> (KeyLoader, Arc<KeyRegistry>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
    let registry = Arc::new(KeyRegistry::with_clock(RotationPolicy::default(), clock.clone()));
    let loader = KeyLoader::with_capabilities(config, Arc::clone(&registry), fetcher, Arc::new(FsKeystoreReader));
    (loader, registry, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_fetch() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::from_millis(200));
    let (loader, _, clock) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    fetcher.respond(jwks(&["a", "b"]));
    clock.advance(ChronoDuration::seconds(30));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let loader = loader.clone();
        tasks.push(tokio::spawn(async move { loader.refresh_on_miss("b").await }));
    }
    for task in tasks {
        let key = task.await.unwrap().unwrap();
        assert_eq!(key.id(), "b");
    }
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn failed_refresh_serves_stale_keys_and_backs_off() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, registry, clock) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();
    assert!(!loader.is_degraded());

    fetcher.fail("connection refused");
    assert!(matches!(loader.refresh().await, Err(KeyError::KeySourceUnavailable { .. })));
    let health = loader.health();
    assert!(health.degraded);
    assert_eq!(health.failures, 1);
    assert!(health.last_error.unwrap().contains("connection refused"));
    assert!(registry.lookup("a").await.is_ok());

    let err = loader.refresh_on_miss("unknown").await.unwrap_err();
    assert!(matches!(err, KeyError::KeySourceUnavailable { .. }));
    assert_eq!(fetcher.calls(), 2, "refresh inside the backoff window must not fetch");

    fetcher.respond(jwks(&["a"]));
    clock.advance(ChronoDuration::seconds(30));
    let report = loader.refresh().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert!(!loader.is_degraded());
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn unknown_kid_against_healthy_source_is_not_found() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, _, _) = setup(vec![remote_source()], fetcher);
    loader.load().await.unwrap();
    assert_eq!(loader.refresh_on_miss("zzz").await.unwrap_err(), KeyError::not_found("zzz"));
}

#[tokio::test]
async fn keys_removed_upstream_are_retired_with_grace() {
    let fetcher = ScriptedFetcher::new(jwks(&["a", "b"]), Duration::ZERO);
    let (loader, registry, clock) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();

    fetcher.respond(jwks(&["a"]));
    loader.refresh().await.unwrap();
    assert!(matches!(registry.state("b").await, Some(EntryState::Retired { .. })));
    assert!(registry.lookup("b").await.is_ok());

    clock.advance(ChronoDuration::seconds(600));
    assert!(registry.lookup("b").await.is_err());
    assert_eq!(registry.state("a").await, Some(EntryState::Active));
}

#[tokio::test]
async fn remote_outage_on_first_load_degrades_but_local_keys_load() {
    let fetcher = ScriptedFetcher::new(Vec::new(), Duration::ZERO);
    fetcher.fail("dns failure");
    let (loader, registry, _) = setup(vec![inline_source(), remote_source()], fetcher);
    let report = loader.load().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(loader.is_degraded());
    assert!(registry.signing_key("local").await.is_ok());
}

#[tokio::test]
async fn load_fails_when_nothing_could_be_loaded() {
    let fetcher = ScriptedFetcher::new(b"<html>oops</html>".to_vec(), Duration::ZERO);
    let (loader, _, _) = setup(vec![remote_source()], fetcher);
    assert!(matches!(loader.load().await, Err(KeyError::KeySourceUnavailable { .. })));
}

#[tokio::test]
async fn duplicate_local_kids_conflict() {
    let fetcher = ScriptedFetcher::new(Vec::new(), Duration::ZERO);
    let (loader, _, _) = setup(vec![inline_source(), inline_source()], fetcher);
    assert_eq!(loader.load().await.unwrap_err(), KeyError::duplicate("local"));
}

#[tokio::test]
async fn sealed_keystore_file_loads_with_passphrase() {
    let signer = KeyMaterial::generate_hmac("vault-key", Algorithm::HS512).unwrap();
    let set = JwkSet {
        keys: vec![Jwk::from_material(&signer, true).unwrap()],
    };
    let fast = KdfParams {
        m_cost: 64,
        t_cost: 1,
        p_cost: 1,
    };
    let sealed = seal_keystore_with(set.to_json().unwrap().as_bytes(), "open sesame", fast).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("keys.sealed.json");
    std::fs::write(&path, sealed).unwrap();

    let source = KeySourceConfig::Keystore {
        path: path.clone(),
        passphrase: Some("open sesame".into()),
        kid: None,
        algorithm: None,
    };
    let (loader, registry, _) = setup(vec![source], ScriptedFetcher::new(Vec::new(), Duration::ZERO));
    loader.load().await.unwrap();
    let key = registry.signing_key("vault-key").await.unwrap();
    assert_eq!(key.algorithm(), Algorithm::HS512);

    let wrong = KeySourceConfig::Keystore {
        path,
        passphrase: Some("wrong".into()),
        kid: None,
        algorithm: None,
    };
    let (loader, _, _) = setup(vec![wrong], ScriptedFetcher::new(Vec::new(), Duration::ZERO));
    assert!(matches!(loader.load().await, Err(KeyError::Keystore(_))));
}

#[tokio::test]
async fn missing_keystore_file_is_unavailable() {
    let source = KeySourceConfig::Keystore {
        path: PathBuf::from("/definitely/not/here.pem"),
        passphrase: None,
        kid: Some("k".into()),
        algorithm: Some(Algorithm::RS256),
    };
    let (loader, _, _) = setup(vec![source], ScriptedFetcher::new(Vec::new(), Duration::ZERO));
    assert!(matches!(loader.load().await, Err(KeyError::KeySourceUnavailable { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_task_refreshes_until_shutdown() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, _, _) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();

    loader.spawn_refresh_task(Duration::from_millis(40)).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    loader.shutdown().await;

    let after_shutdown = fetcher.calls();
    assert!(after_shutdown >= 3, "expected periodic refreshes, saw {after_shutdown}");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fetcher.calls(), after_shutdown);
    assert!(loader.health().refreshes >= 3);
}

#[tokio::test]
async fn misses_inside_the_refresh_interval_do_not_fetch() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, _, clock) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();

    for i in 0..50 {
        let kid = format!("bogus-{i}");
        assert_eq!(loader.refresh_on_miss(&kid).await.unwrap_err(), KeyError::not_found(&kid));
    }
    assert_eq!(fetcher.calls(), 1);

    fetcher.respond(jwks(&["a", "b"]));
    clock.advance(ChronoDuration::seconds(29));
    assert!(loader.refresh_on_miss("b").await.is_err());
    assert_eq!(fetcher.calls(), 1);

    clock.advance(ChronoDuration::seconds(1));
    assert_eq!(loader.refresh_on_miss("b").await.unwrap().id(), "b");
    assert_eq!(fetcher.calls(), 2);
    assert!(loader.refresh_on_miss("bogus-0").await.is_err());
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn waiter_gives_up_without_cancelling_the_fetch() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::from_secs(2));
    let mut config = KeyLoaderConfig::with_sources(vec![remote_source()]);
    config.fetch_timeout_secs = 5;
    config.refresh_wait_secs = 1;
    let (loader, registry, clock) = setup_with(config, fetcher.clone());
    loader.load().await.unwrap();

    fetcher.respond(jwks(&["a", "b"]));
    clock.advance(ChronoDuration::seconds(30));
    let err = loader.refresh_on_miss("b").await.unwrap_err();
    assert!(matches!(err, KeyError::KeySourceUnavailable { .. }), "{err:?}");
    assert_eq!(fetcher.calls(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(registry.lookup("b").await.unwrap().id(), "b");
    assert_eq!(loader.refresh_on_miss("b").await.unwrap().id(), "b");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn remote_set_cannot_replace_a_local_key() {
    let fetcher = ScriptedFetcher::new(jwks(&["local", "a"]), Duration::ZERO);
    let (loader, registry, _) = setup(vec![inline_source(), remote_source()], fetcher);
    let report = loader.load().await.unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.conflicts, 1);
    assert_eq!(registry.signing_key("local").await.unwrap().algorithm(), Algorithm::HS256);
    assert_eq!(registry.lookup("a").await.unwrap().algorithm(), Algorithm::ES256);

    loader.refresh().await.unwrap();
    assert_eq!(registry.lookup("local").await.unwrap().algorithm(), Algorithm::HS256);
    let health = loader.health();
    assert_eq!(health.conflicts, 2);
    assert!(health.last_error.unwrap().contains("kid=local"));
    assert!(!health.degraded);
}

#[tokio::test]
async fn first_remote_to_publish_a_kid_owns_it() {
    let fetcher = ScriptedFetcher::new(jwks(&["shared"]), Duration::ZERO);
    let sources = vec![remote_source(), KeySourceConfig::Remote { url: OTHER_URL.into() }];
    let (loader, registry, _) = setup(sources, fetcher.clone());
    let report = loader.load().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.conflicts, 1);

    fetcher.respond(jwks(&[]));
    loader.refresh().await.unwrap();
    assert!(matches!(registry.state("shared").await, Some(EntryState::Retired { .. })));
}

#[tokio::test]
async fn rotated_in_key_is_not_replaced_by_a_remote_set() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, registry, _) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();

    let signer = KeyMaterial::generate_hmac("minted", Algorithm::HS256).unwrap();
    registry.rotate(signer, ChronoDuration::seconds(60)).await.unwrap();
    fetcher.respond(jwks(&["a", "minted"]));
    let report = loader.refresh().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert!(registry.signing_key("minted").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_task_stops_when_the_loader_is_dropped() {
    let fetcher = ScriptedFetcher::new(jwks(&["a"]), Duration::ZERO);
    let (loader, _, _) = setup(vec![remote_source()], fetcher.clone());
    loader.load().await.unwrap();

    loader.spawn_refresh_task(Duration::from_millis(40)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(loader);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let after_drop = fetcher.calls();
    assert!(after_drop >= 2, "expected periodic refreshes, saw {after_drop}");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetcher.calls(), after_drop);
}
