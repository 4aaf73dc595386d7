//! Token revocation
//!
//! Tokens are stateless, so revocation lives outside the verifier: it consults
//! a [`RevocationCheck`] after every other check has passed. [`RevocationList`]
//! is an in-memory implementation keyed by `jti` or by token fingerprint, with
//! entries dropped once the token they name would have expired anyway.

use crate::claims::ClaimsSet;
use crate::codec::token_digest;
use crate::error::TokenResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sigil_key::SharedClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Consulted by the verifier for tokens that are otherwise valid
#[async_trait]
pub trait RevocationCheck: Send + Sync + 'static {
    /// Whether the token has been revoked
    ///
    /// `token_digest` is the fingerprint from [`token_digest`].
    async fn is_revoked(&self, claims: &ClaimsSet, token_digest: &str) -> TokenResult<bool>;
}

/// What a revocation entry is keyed on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RevokedId {
    Jti(String),
    Digest(String),
}

/// A revoked token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedToken {
    /// Reason given at revocation
    pub reason: String,
    /// When the token was revoked
    pub revoked_at: DateTime<Utc>,
    /// After this the entry is redundant and may be purged
    pub expires_at: DateTime<Utc>,
}

/// In-memory revocation list
pub struct RevocationList {
    revoked: DashMap<RevokedId, RevokedToken>,
    clock: SharedClock,
}

impl std::fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationList")
            .field("revoked", &self.revoked.len())
            .finish_non_exhaustive()
    }
}

impl RevocationList {
    /// Empty list using `clock` for revocation times and purging
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            revoked: DashMap::new(),
            clock,
        }
    }

    /// Revoke every token carrying `jti` until `expires_at`
    pub fn revoke_jti(&self, jti: &str, expires_at: DateTime<Utc>, reason: &str) {
        self.insert(RevokedId::Jti(jti.to_string()), expires_at, reason);
        tracing::info!(jti = %jti, reason = %reason, "Revoked token by jti");
    }

    /// Revoke one token by its fingerprint
    ///
    /// The entry lives until the token's own `exp` when it can be read from
    /// the claims, otherwise until `fallback_expiry`.
    pub fn revoke_token(&self, token: &str, claims: Option<&ClaimsSet>, fallback_expiry: DateTime<Utc>, reason: &str) {
        let expires_at = claims
            .and_then(|c| c.exp)
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
            .unwrap_or(fallback_expiry);
        let digest = token_digest(token);
        self.insert(RevokedId::Digest(digest.clone()), expires_at, reason);
        tracing::info!(token = %digest, reason = %reason, "Revoked token");
    }

    fn insert(&self, id: RevokedId, expires_at: DateTime<Utc>, reason: &str) {
        self.revoked.insert(
            id,
            RevokedToken {
                reason: reason.to_string(),
                revoked_at: self.clock.now(),
                expires_at,
            },
        );
    }

    /// Revocation entry for a `jti`
    #[must_use]
    pub fn get_jti(&self, jti: &str) -> Option<RevokedToken> {
        self.revoked
            .get(&RevokedId::Jti(jti.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Drop entries whose token has expired; returns how many were dropped
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.revoked.len();
        self.revoked.retain(|_, token| token.expires_at > now);
        let purged = before.saturating_sub(self.revoked.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.revoked.len(), "Purged expired revocations");
        }
        purged
    }

    /// Number of revocation entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    /// Whether nothing is revoked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }

    /// Purge expired entries every `interval` until the handle is aborted
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let list = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(list) = list.upgrade() else {
                    break;
                };
                list.purge_expired(list.clock.now());
            }
        })
    }
}

#[async_trait]
impl RevocationCheck for RevocationList {
    async fn is_revoked(&self, claims: &ClaimsSet, token_digest: &str) -> TokenResult<bool> {
        let now = self.clock.now();
        let live = |id: RevokedId| {
            self.revoked
                .get(&id)
                .is_some_and(|entry| entry.expires_at > now)
        };
        let by_jti = claims.jti.as_ref().is_some_and(|jti| live(RevokedId::Jti(jti.clone())));
        Ok(by_jti || live(RevokedId::Digest(token_digest.to_string())))
    }
}
