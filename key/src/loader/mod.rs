//! Key loader
//!
//! Populates a [`KeyRegistry`] from configured sources and keeps remote key
//! sets fresh:
//!
//! - inline secrets and keystore files are loaded once and fail hard,
//! - remote JWK Sets are fetched through an injected [`KeySetFetcher`], cached
//!   per source, and re-fetched on an interval or on a `kid` cache miss,
//! - a failed fetch keeps serving the last good set and flags the loader as
//!   degraded until a fetch succeeds again,
//! - concurrent refresh requests share one in-flight fetch (single-flight);
//!   a waiter that gives up never cancels the fetch for everyone else,
//! - a `kid` miss only fetches again once the healthy sets are older than
//!   the miss refresh interval,
//! - every `kid` belongs to the first source that supplied it; a remote set
//!   publishing a `kid` owned elsewhere has that key rejected.

mod fetch;
mod source;

pub use fetch::{FsKeystoreReader, HttpKeySetFetcher, KeySetFetcher, KeystoreReader};
pub use source::{KeyLoaderConfig, KeySourceConfig, SecretEncoding};

use crate::error::{KeyError, KeyResult};
use crate::jwk::JwkSet;
use crate::keystore::parse_keystore;
use crate::material::KeyMaterial;
use crate::registry::{deadline, KeyRegistry};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable state of the loader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderHealth {
    /// At least one remote source is being served from its stale cache
    pub degraded: bool,
    /// Most recent fetch failure
    pub last_error: Option<String>,
    /// Time of the most recent successful remote fetch
    pub last_success: Option<DateTime<Utc>>,
    /// Completed refresh cycles
    pub refreshes: u64,
    /// Failed remote fetches
    pub failures: u64,
    /// Remote keys rejected because another source owns their `kid`, per refresh
    pub conflicts: u64,
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Sources fetched successfully
    pub fetched: usize,
    /// Sources whose fetch failed
    pub failed: usize,
    /// Sources skipped because they are backing off after a failure
    pub skipped: usize,
    /// Remote keys rejected because another source owns their `kid`
    pub conflicts: usize,
}

#[derive(Debug)]
struct CachedSet {
    materials: Vec<KeyMaterial>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RemoteStatus {
    cached: Option<Arc<CachedSet>>,
    failed_at: Option<DateTime<Utc>>,
}

struct Remote {
    url: String,
    /// Index into the configured sources
    source: usize,
    status: ArcSwap<RemoteStatus>,
}

type SharedRefresh = Shared<BoxFuture<'static, KeyResult<RefreshReport>>>;

struct Inner {
    config: KeyLoaderConfig,
    registry: Arc<KeyRegistry>,
    fetcher: Arc<dyn KeySetFetcher>,
    reader: Arc<dyn KeystoreReader>,
    remotes: Vec<Remote>,
    owners: RwLock<HashMap<String, usize>>,
    health: ArcSwap<LoaderHealth>,
    inflight: Mutex<Option<SharedRefresh>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Loads keys into a registry and keeps remote key sets fresh
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct KeyLoader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KeyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLoader")
            .field("sources", &self.inner.config.sources)
            .field("health", &**self.inner.health.load())
            .finish_non_exhaustive()
    }
}

impl KeyLoader {
    /// Loader using HTTP for remote sets and the file system for keystores
    ///
    /// # Errors
    /// `KeySourceUnavailable` if the HTTP client cannot be built.
    pub fn new(config: KeyLoaderConfig, registry: Arc<KeyRegistry>) -> KeyResult<Self> {
        let fetcher = Arc::new(HttpKeySetFetcher::new(config.fetch_timeout())?);
        Ok(Self::with_capabilities(config, registry, fetcher, Arc::new(FsKeystoreReader)))
    }

    /// Loader with injected fetch and read capabilities
    #[must_use]
    pub fn with_capabilities(
        config: KeyLoaderConfig,
        registry: Arc<KeyRegistry>,
        fetcher: Arc<dyn KeySetFetcher>,
        reader: Arc<dyn KeystoreReader>,
    ) -> Self {
        let remotes = config
            .sources
            .iter()
            .enumerate()
            .filter_map(|(index, source)| match source {
                KeySourceConfig::Remote { url } => Some(Remote {
                    url: url.clone(),
                    source: index,
                    status: ArcSwap::from_pointee(RemoteStatus::default()),
                }),
                _ => None,
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                fetcher,
                reader,
                remotes,
                owners: RwLock::new(HashMap::new()),
                health: ArcSwap::from_pointee(LoaderHealth::default()),
                inflight: Mutex::new(None),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Registry this loader populates
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.inner.registry
    }

    /// Loader configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &KeyLoaderConfig {
        &self.inner.config
    }

    /// Current health snapshot
    #[must_use]
    pub fn health(&self) -> LoaderHealth {
        (**self.inner.health.load()).clone()
    }

    /// Whether any remote source is currently served from stale cache
    #[inline]
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.inner.health.load().degraded
    }

    /// Perform the initial population of the registry
    ///
    /// Inline and keystore sources must load. A remote source that cannot
    /// be fetched is recorded and retried later; the report counts it as
    /// failed.
    ///
    /// # Errors
    /// Errors from inline or keystore sources, `DuplicateKeyConflict` when two
    /// local sources define the same `kid`, and `KeySourceUnavailable` when
    /// the registry would end up empty.
    pub async fn load(&self) -> KeyResult<RefreshReport> {
        self.inner.config.validate()?;
        let local = self.inner.load_local().await?;
        let (report, _) = self.inner.refresh_remotes(true).await;

        if self.inner.registry.is_empty().await {
            let reason = self
                .health()
                .last_error
                .unwrap_or_else(|| "no keys were loaded".to_string());
            return Err(KeyError::source_unavailable("key loader", reason));
        }
        tracing::info!(
            local_keys = local,
            remote_fetched = report.fetched,
            remote_failed = report.failed,
            remote_conflicts = report.conflicts,
            "Key loader populated registry"
        );
        Ok(report)
    }

    /// Refresh remote sources, sharing any refresh already in flight
    ///
    /// The wait is bounded by the refresh wait; giving up does not cancel
    /// the shared refresh.
    ///
    /// # Errors
    /// `KeySourceUnavailable` when no source could be fetched and at least one
    /// failed, or when the wait timed out.
    pub async fn refresh(&self) -> KeyResult<RefreshReport> {
        let shared = self.inflight_refresh().await;
        let wait = self.inner.config.refresh_wait();
        match tokio::time::timeout(wait, shared).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(wait_secs = wait.as_secs(), "Gave up waiting on shared key refresh");
                Err(KeyError::source_unavailable(
                    "key loader",
                    format!("refresh did not complete within {}s", wait.as_secs()),
                ))
            }
        }
    }

    async fn inflight_refresh(&self) -> SharedRefresh {
        let mut slot = self.inner.inflight.lock().await;
        if let Some(shared) = slot.as_ref() {
            return shared.clone();
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let (report, error) = inner.refresh_remotes(false).await;
            *inner.inflight.lock().await = None;
            match error {
                Some(e) if report.fetched == 0 => Err(e),
                _ => Ok(report),
            }
        });
        let shared = async move {
            handle.await.unwrap_or_else(|e| {
                Err(KeyError::source_unavailable(
                    "key loader",
                    format!("refresh task failed: {e}"),
                ))
            })
        }
        .boxed()
        .shared();
        *slot = Some(shared.clone());
        shared
    }

    /// Resolve a `kid` that missed the registry by refreshing remote sources
    ///
    /// Healthy remote sets fetched within the miss refresh interval are not
    /// fetched again; the miss is answered from the registry.
    ///
    /// # Errors
    /// `KeyNotFound` when the sources are healthy and still do not hold the
    /// key; `KeySourceUnavailable` when the refresh failed or the loader is
    /// degraded, since the key may exist upstream.
    pub async fn refresh_on_miss(&self, kid: &str) -> KeyResult<Arc<KeyMaterial>> {
        if let Ok(material) = self.inner.registry.lookup(kid).await {
            return Ok(material);
        }
        if self.inner.remotes.is_empty() {
            return Err(KeyError::not_found(kid));
        }
        if self.inner.recently_fetched(self.inner.registry.clock().now()) {
            tracing::debug!(kid = %kid, "Key cache miss inside the miss refresh interval, not fetching");
            return Err(KeyError::not_found(kid));
        }

        tracing::debug!(kid = %kid, "Key cache miss, refreshing remote sources");
        let refreshed = self.refresh().await;
        match self.inner.registry.lookup(kid).await {
            Ok(material) => Ok(material),
            Err(not_found) => match refreshed {
                Err(e) => Err(e),
                Ok(_) if self.is_degraded() => Err(KeyError::source_unavailable(
                    "key loader",
                    format!("kid={kid} unresolved while key sources are degraded"),
                )),
                Ok(_) => Err(not_found),
            },
        }
    }

    /// Start the background task that refreshes remote sources and evicts
    /// expired keys every `interval`
    ///
    /// Replaces a previously started task. The task stops on
    /// [`KeyLoader::shutdown`] or once every loader handle is dropped. Must be
    /// called within a Tokio runtime.
    pub async fn spawn_refresh_task(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Key refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        KeyLoader { inner }.tick().await;
                    }
                }
            }
        });
        if let Some(previous) = self.inner.task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn tick(&self) {
        if !self.inner.remotes.is_empty() {
            if let Err(e) = self.refresh().await {
                tracing::error!(error = %e, "Background key refresh failed");
            }
        }
        let now = self.inner.registry.clock().now();
        self.inner.registry.evict_expired(now).await;
    }

    /// Stop the background refresh task, waiting for it to finish
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Key refresh task panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    async fn load_local(&self) -> KeyResult<usize> {
        let mut seen = HashSet::new();
        let mut materials = Vec::new();
        for (index, source) in self.config.sources.iter().enumerate() {
            let loaded = match source {
                KeySourceConfig::Inline { .. } => vec![source.inline_material()?],
                KeySourceConfig::Keystore {
                    path,
                    passphrase,
                    kid,
                    algorithm,
                } => {
                    let bytes = self.reader.read(path).await?;
                    let keys = parse_keystore(&bytes, passphrase.as_deref(), kid.as_deref(), *algorithm)?;
                    if keys.is_empty() {
                        return Err(KeyError::source_unavailable(
                            &source.describe(),
                            "keystore holds no usable keys",
                        ));
                    }
                    keys
                }
                KeySourceConfig::Remote { .. } => continue,
            };
            for material in loaded {
                if !seen.insert(material.id().to_string()) {
                    return Err(KeyError::duplicate(material.id()));
                }
                materials.push((index, material));
            }
        }

        let count = materials.len();
        let mut owners = self.owners.write().await;
        for (index, material) in materials {
            owners.insert(material.id().to_string(), index);
            self.registry.upsert(material).await;
        }
        Ok(count)
    }

    /// Every remote holds a healthy set younger than the miss refresh interval
    fn recently_fetched(&self, now: DateTime<Utc>) -> bool {
        let interval = self.config.miss_refresh_interval();
        self.remotes.iter().all(|remote| {
            let status = remote.status.load();
            status.failed_at.is_none()
                && status
                    .cached
                    .as_ref()
                    .is_some_and(|cached| now < deadline(cached.fetched_at, interval))
        })
    }

    /// Split a fetched set into keys this remote may install and the `kid`s
    /// owned by another source
    async fn claim(&self, remote: &Remote, materials: Vec<KeyMaterial>) -> (Vec<KeyMaterial>, Vec<String>) {
        let mut owners = self.owners.write().await;
        let mut accepted = Vec::with_capacity(materials.len());
        let mut rejected = Vec::new();
        for material in materials {
            let kid = material.id().to_string();
            let foreign = match owners.get(&kid) {
                Some(&owner) => owner != remote.source,
                // installed outside the loader, e.g. by a signing key rotation
                None => self.registry.state(&kid).await.is_some(),
            };
            if foreign {
                let owner = owners
                    .get(&kid)
                    .and_then(|&index| self.config.sources.get(index))
                    .map_or_else(|| "registry".to_string(), KeySourceConfig::describe);
                tracing::warn!(url = %remote.url, kid = %kid, owner = %owner, "Remote key set publishes a kid owned by another source, ignoring it");
                rejected.push(kid);
            } else {
                owners.insert(kid, remote.source);
                accepted.push(material);
            }
        }
        (accepted, rejected)
    }

    /// Fetch every remote source that is not backing off
    ///
    /// Returns the report with the last failure or ownership conflict seen.
    #[tracing::instrument(skip_all, fields(sources = self.remotes.len(), force = force))]
    async fn refresh_remotes(&self, force: bool) -> (RefreshReport, Option<KeyError>) {
        let mut report = RefreshReport::default();
        let mut last_error = None;
        let mut any_success = false;

        for remote in &self.remotes {
            let now = self.registry.clock().now();
            let status = remote.status.load_full();
            if !force {
                if let Some(failed_at) = status.failed_at {
                    if now < deadline(failed_at, self.config.retry_backoff()) {
                        tracing::debug!(url = %remote.url, "Remote key source backing off");
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            match self.fetch_set(&remote.url).await {
                Ok(materials) => {
                    let rejected = self.apply_set(remote, &status, materials, now).await;
                    if let Some(kid) = rejected.first() {
                        last_error = Some(KeyError::duplicate(kid));
                    }
                    report.conflicts += rejected.len();
                    report.fetched += 1;
                    any_success = true;
                }
                Err(e) => {
                    tracing::error!(url = %remote.url, error = %e, "Remote key set refresh failed, serving cached keys");
                    self.restore_stale(&status).await;
                    remote.status.store(Arc::new(RemoteStatus {
                        cached: status.cached.clone(),
                        failed_at: Some(now),
                    }));
                    report.failed += 1;
                    last_error = Some(e);
                }
            }
        }

        self.record(&report, any_success, last_error.as_ref());
        (report, last_error)
    }

    async fn fetch_set(&self, url: &str) -> KeyResult<Vec<KeyMaterial>> {
        let timeout = self.config.fetch_timeout();
        let bytes = tokio::time::timeout(timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| KeyError::source_unavailable(url, format!("fetch timed out after {}s", timeout.as_secs())))??;
        JwkSet::parse(&bytes)
            .and_then(|set| set.to_materials())
            .map_err(|e| KeyError::source_unavailable(url, e.to_string()))
    }

    /// Install a fetched set, returning the rejected `kid`s
    async fn apply_set(
        &self,
        remote: &Remote,
        previous: &RemoteStatus,
        materials: Vec<KeyMaterial>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let (materials, rejected) = self.claim(remote, materials).await;
        let vanished: Vec<String> = match &previous.cached {
            Some(cached) => {
                let fresh: HashSet<&str> = materials.iter().map(KeyMaterial::id).collect();
                cached
                    .materials
                    .iter()
                    .map(KeyMaterial::id)
                    .filter(|kid| !fresh.contains(kid))
                    .map(str::to_string)
                    .collect()
            }
            None => Vec::new(),
        };
        let grace = self.registry.policy().grace_period();
        for gone in &vanished {
            if self.registry.retire(gone, grace).await.is_ok() {
                tracing::info!(url = %remote.url, kid = %gone, "Key removed upstream, retired with grace");
            }
        }
        for material in &materials {
            self.registry.upsert(material.clone()).await;
        }
        tracing::debug!(url = %remote.url, keys = materials.len(), "Remote key set applied");
        remote.status.store(Arc::new(RemoteStatus {
            cached: Some(Arc::new(CachedSet {
                materials,
                fetched_at: now,
            })),
            failed_at: None,
        }));
        rejected
    }

    async fn restore_stale(&self, status: &RemoteStatus) {
        let Some(cached) = &status.cached else {
            return;
        };
        let now = self.registry.clock().now();
        for material in &cached.materials {
            if self.registry.lookup(material.id()).await.is_err() && material.is_within_validity(now) {
                tracing::warn!(kid = %material.id(), fetched_at = %cached.fetched_at, "Restoring cached key");
                self.registry.upsert(material.clone()).await;
            }
        }
    }

    fn record(&self, report: &RefreshReport, any_success: bool, error: Option<&KeyError>) {
        let previous = self.health.load_full();
        let degraded = self.remotes.iter().any(|r| r.status.load().failed_at.is_some());
        if degraded && !previous.degraded {
            tracing::warn!("Key loader entered degraded mode");
        } else if !degraded && previous.degraded {
            tracing::info!("Key loader recovered from degraded mode");
        }
        self.health.store(Arc::new(LoaderHealth {
            degraded,
            last_error: error.map(ToString::to_string).or_else(|| previous.last_error.clone()),
            last_success: if any_success {
                Some(self.registry.clock().now())
            } else {
                previous.last_success
            },
            refreshes: previous.refreshes + 1,
            failures: previous.failures + report.failed as u64,
            conflicts: previous.conflicts + report.conflicts as u64,
        }));
    }
}
