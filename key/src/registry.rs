//! Thread-safe key registry
//!
//! Maps key identifiers to immutable [`KeyMaterial`]. Readers (signing and
//! verification) take the shared lock; registration, rotation and eviction
//! take the exclusive lock only for the duration of the map mutation.
//!
//! Rotation keeps the outgoing signing key around in a verify-only
//! [`EntryState::Retired`] state until its grace period lapses, so tokens
//! signed just before a rotation keep verifying.

use crate::clock::{system_clock, SharedClock};
use crate::error::{KeyError, KeyResult};
use crate::material::KeyMaterial;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

fn default_grace_period_secs() -> u64 {
    600
}

/// How long superseded and expired keys stay usable for verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Verify-only lifetime of a key after it is rotated out or retired
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Extra time a key stays resolvable after its own `not_after`
    #[serde(default)]
    pub expiry_grace_secs: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            expiry_grace_secs: 0,
        }
    }
}

impl RotationPolicy {
    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        secs(self.grace_period_secs)
    }

    /// Expiry grace as a duration
    #[inline]
    #[must_use]
    pub fn expiry_grace(&self) -> Duration {
        secs(self.expiry_grace_secs)
    }
}

/// Upper bound on configured windows (100 years), keeps date arithmetic in range
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

pub(crate) fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(MAX_WINDOW_SECS)).unwrap_or_default())
}

/// `at + by`, saturating at the end of representable time
pub(crate) fn deadline(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifecycle state of a registered key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Usable for signing (if it has private material) and verification
    Active,
    /// Verification only, until the given instant
    Retired {
        /// End of the verify-only window
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    material: Arc<KeyMaterial>,
    state: EntryState,
    seq: u64,
}

impl Entry {
    fn is_fully_expired(&self, now: DateTime<Utc>, expiry_grace: Duration) -> bool {
        if let EntryState::Retired { until } = self.state {
            if now >= until {
                return true;
            }
        }
        self.material
            .not_after()
            .is_some_and(|not_after| now >= deadline(not_after, expiry_grace))
    }

    fn is_resolvable(&self, now: DateTime<Utc>, expiry_grace: Duration) -> bool {
        !self.is_fully_expired(now, expiry_grace)
            && self.material.not_before().map_or(true, |nbf| now >= nbf)
    }
}

/// In-memory `kid` → key material map with reader/writer discipline
pub struct KeyRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    policy: RotationPolicy,
    clock: SharedClock,
    seq: AtomicU64,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new(RotationPolicy::default())
    }
}

impl KeyRegistry {
    /// Empty registry reading the wall clock
    #[must_use]
    pub fn new(policy: RotationPolicy) -> Self {
        Self::with_clock(policy, system_clock())
    }

    /// Empty registry reading the given clock
    #[must_use]
    pub fn with_clock(policy: RotationPolicy, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    /// Rotation policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Clock used for expiry decisions
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn entry(&self, material: KeyMaterial) -> Entry {
        Entry {
            material: Arc::new(material),
            state: EntryState::Active,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Insert a new key
    ///
    /// A retired or fully expired entry under the same `kid` is replaced.
    ///
    /// # Errors
    /// `DuplicateKeyConflict` if an active, unexpired key already uses the `kid`.
    pub async fn register(&self, material: KeyMaterial) -> KeyResult<Arc<KeyMaterial>> {
        let now = self.clock.now();
        let kid = material.id().to_string();
        let entry = self.entry(material);
        let shared = Arc::clone(&entry.material);

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&kid) {
            if existing.state == EntryState::Active
                && !existing.is_fully_expired(now, self.policy.expiry_grace())
            {
                return Err(KeyError::duplicate(&kid));
            }
        }
        entries.insert(kid.clone(), entry);
        drop(entries);

        tracing::info!(kid = %kid, alg = %shared.algorithm(), "Registered key");
        Ok(shared)
    }

    /// Insert or replace a key as active
    ///
    /// Used when a key source is reloaded and re-asserts its keys. Returns
    /// `true` when an existing entry was replaced.
    pub async fn upsert(&self, material: KeyMaterial) -> bool {
        let kid = material.id().to_string();
        let entry = self.entry(material);
        let replaced = self.entries.write().await.insert(kid.clone(), entry).is_some();
        tracing::debug!(kid = %kid, replaced, "Upserted key");
        replaced
    }

    /// Install a new signing key, retiring the previous signing keys
    ///
    /// Every other active key that can sign is moved to verify-only state for
    /// `grace`. Verify-only keys (e.g. fetched from a remote key set) are left
    /// alone. Returns the identifiers of the retired keys.
    ///
    /// # Errors
    /// `InvalidKey` if the new key cannot sign.
    pub async fn rotate(&self, material: KeyMaterial, grace: Duration) -> KeyResult<Vec<String>> {
        if !material.can_sign() {
            return Err(KeyError::invalid_key(format!(
                "rotation target '{}' has no signing capability",
                material.id()
            )));
        }
        let until = deadline(self.clock.now(), grace);
        let kid = material.id().to_string();
        let entry = self.entry(material);

        let mut entries = self.entries.write().await;
        let mut retired = Vec::new();
        for (other, existing) in entries.iter_mut() {
            if other != &kid && existing.state == EntryState::Active && existing.material.can_sign() {
                existing.state = EntryState::Retired { until };
                retired.push(other.clone());
            }
        }
        if entries.insert(kid.clone(), entry).is_some() {
            tracing::warn!(kid = %kid, "Rotation replaced a key under the same kid");
        }
        drop(entries);

        retired.sort();
        tracing::info!(kid = %kid, retired = ?retired, grace_secs = grace.num_seconds(), "Rotated signing key");
        Ok(retired)
    }

    /// Move a key to verify-only state for `grace`
    ///
    /// # Errors
    /// `KeyNotFound` if no entry uses the `kid`.
    pub async fn retire(&self, kid: &str, grace: Duration) -> KeyResult<()> {
        let until = deadline(self.clock.now(), grace);
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(kid).ok_or_else(|| KeyError::not_found(kid))?;
        entry.state = match entry.state {
            EntryState::Retired { until: earlier } if earlier < until => entry.state,
            _ => EntryState::Retired { until },
        };
        tracing::info!(kid = %kid, "Retired key");
        Ok(())
    }

    /// Remove a key immediately
    pub async fn remove(&self, kid: &str) -> Option<Arc<KeyMaterial>> {
        self.entries.write().await.remove(kid).map(|e| e.material)
    }

    /// Drop every entry that is fully expired at `now`
    ///
    /// An entry is fully expired once its retirement window has passed or
    /// `not_after + expiry_grace` has passed. Returns the evicted identifiers.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let grace = self.policy.expiry_grace();
        let mut entries = self.entries.write().await;
        let mut evicted: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_fully_expired(now, grace))
            .map(|(kid, _)| kid.clone())
            .collect();
        for kid in &evicted {
            entries.remove(kid);
        }
        drop(entries);

        evicted.sort();
        if !evicted.is_empty() {
            tracing::info!(evicted = ?evicted, "Evicted expired keys");
        }
        evicted
    }

    /// Key for verifying a token signed under `kid`
    ///
    /// # Errors
    /// `KeyNotFound` if the key is absent, fully expired, not yet valid, or
    /// not usable for verification.
    pub async fn lookup(&self, kid: &str) -> KeyResult<Arc<KeyMaterial>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(kid)
            .filter(|e| e.is_resolvable(now, self.policy.expiry_grace()) && e.material.can_verify())
            .map(|e| Arc::clone(&e.material))
            .ok_or_else(|| KeyError::not_found(kid))
    }

    /// Key for signing under `kid`
    ///
    /// # Errors
    /// `KeyNotFound` unless the key is active, carries private material, may
    /// sign and is inside its own validity window.
    pub async fn signing_key(&self, kid: &str) -> KeyResult<Arc<KeyMaterial>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(kid)
            .filter(|e| {
                e.state == EntryState::Active
                    && e.material.can_sign()
                    && e.material.is_within_validity(now)
            })
            .map(|e| Arc::clone(&e.material))
            .ok_or_else(|| KeyError::not_found(kid))
    }

    /// Most recently installed key that can currently sign
    pub async fn active_signing_kid(&self) -> Option<String> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| {
                e.state == EntryState::Active
                    && e.material.can_sign()
                    && e.material.is_within_validity(now)
            })
            .max_by_key(|(_, e)| e.seq)
            .map(|(kid, _)| kid.clone())
    }

    /// Lifecycle state of `kid`, if registered
    pub async fn state(&self, kid: &str) -> Option<EntryState> {
        self.entries.read().await.get(kid).map(|e| e.state)
    }

    /// Registered identifiers, sorted
    pub async fn kids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        kids.sort();
        kids
    }

    /// Number of registered entries, expired ones included until evicted
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the registry holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All currently resolvable keys, sorted by `kid`
    pub async fn snapshot(&self) -> Vec<Arc<KeyMaterial>> {
        let now = self.clock.now();
        let grace = self.policy.expiry_grace();
        let entries = self.entries.read().await;
        let mut materials: Vec<Arc<KeyMaterial>> = entries
            .values()
            .filter(|e| e.is_resolvable(now, grace))
            .map(|e| Arc::clone(&e.material))
            .collect();
        drop(entries);
        materials.sort_by(|a, b| a.id().cmp(b.id()));
        materials
    }
}
