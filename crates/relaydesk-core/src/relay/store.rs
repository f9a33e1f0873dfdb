//! In-process relay store with optional write-through persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::model::{RelayCredential, RelayHealth, RelayId};
use super::repository::RelayRepository;
use crate::{Error, Result};

/// Why a send could not be counted against a relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The relay's daily ceiling would be exceeded; the counter is unchanged.
    #[error("relay {relay} reached its daily quota ({sent}/{quota})")]
    Exceeded {
        /// Relay concerned.
        relay: RelayId,
        /// Daily ceiling.
        quota: u32,
        /// Sends already counted today.
        sent: u32,
    },
    /// The relay is not in the store.
    #[error("relay {0} is not in the store")]
    UnknownRelay(RelayId),
}

struct Entry {
    seq: u64,
    relay: RelayCredential,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<RelayId, Entry>,
}

/// The relays available to one user, keyed by id.
///
/// All mutation goes through the methods here; callers only ever see
/// clones, so concurrent workers cannot step on each other.
pub struct RelayStore {
    inner: RwLock<Inner>,
    repository: Option<Arc<dyn RelayRepository>>,
}

impl RelayStore {
    /// Creates an empty, memory-only store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            repository: None,
        }
    }

    /// Creates a store backed by `repository`, loading what it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read.
    pub async fn open(repository: Arc<dyn RelayRepository>) -> Result<Self> {
        let relays = repository.load_all().await?;
        let store = Self {
            inner: RwLock::new(Inner::default()),
            repository: Some(repository),
        };
        {
            let mut inner = store.inner.write().await;
            for relay in relays {
                inner.insert(relay);
            }
            info!(count = inner.entries.len(), "Loaded relays");
        }
        Ok(store)
    }

    /// Every relay, in insertion order.
    pub async fn list_all(&self) -> Vec<RelayCredential> {
        self.inner.read().await.sorted(|_| true)
    }

    /// Relays that passed validation, in insertion order.
    pub async fn list_valid(&self) -> Vec<RelayCredential> {
        self.inner.read().await.sorted(RelayCredential::is_valid)
    }

    /// Looks up one relay.
    pub async fn get(&self, id: RelayId) -> Option<RelayCredential> {
        self.inner
            .read()
            .await
            .entries
            .get(&id)
            .map(|entry| entry.relay.clone())
    }

    /// Number of relays held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Whether the store holds no relays.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Inserts or replaces a relay.
    ///
    /// The quota counter is owned by the store: a replaced relay keeps the
    /// stored `sent_today` and `quota_day`, a new one starts at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the relay fails.
    pub async fn upsert(&self, mut relay: RelayCredential) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.entries.get(&relay.id) {
            Some(existing) => {
                relay.sent_today = existing.relay.sent_today;
                relay.quota_day = existing.relay.quota_day;
            }
            None => {
                relay.sent_today = 0;
                relay.quota_day = None;
            }
        }
        if let Some(repo) = &self.repository {
            repo.upsert(&relay).await?;
        }
        debug!(relay = %relay.id, label = %relay.label(), "Upserted relay");
        inner.insert(relay);
        Ok(())
    }

    /// Removes a relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelayNotFound`] if absent, or a persistence error.
    pub async fn remove(&self, id: RelayId) -> Result<RelayCredential> {
        let mut inner = self.inner.write().await;
        if let Some(repo) = &self.repository {
            repo.delete(id).await?;
        }
        inner
            .entries
            .remove(&id)
            .map(|entry| entry.relay)
            .ok_or(Error::RelayNotFound(id))
    }

    /// Deletes every relay whose last validation failed.
    ///
    /// # Errors
    ///
    /// Returns an error if a deletion cannot be persisted; relays removed
    /// before the failure stay removed.
    pub async fn remove_invalid(&self) -> Result<Vec<RelayId>> {
        let doomed: Vec<RelayId> = self
            .inner
            .read()
            .await
            .sorted(|relay| matches!(relay.health, RelayHealth::Invalid { .. }))
            .into_iter()
            .map(|relay| relay.id)
            .collect();

        for id in &doomed {
            self.remove(*id).await?;
        }
        info!(removed = doomed.len(), "Removed invalid relays");
        Ok(doomed)
    }

    /// Counts `n` sends against today's quota.
    ///
    /// This is the only way `sent_today` changes. It never clamps: a request
    /// that would pass the ceiling is refused and the counter left alone.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] or [`QuotaError::UnknownRelay`].
    pub async fn increment_sent(&self, id: RelayId, n: u32) -> std::result::Result<u32, QuotaError> {
        self.increment_sent_on(id, n, Utc::now().date_naive()).await
    }

    /// [`Self::increment_sent`] against an explicit UTC day.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] or [`QuotaError::UnknownRelay`].
    pub async fn increment_sent_on(
        &self,
        id: RelayId,
        n: u32,
        day: NaiveDate,
    ) -> std::result::Result<u32, QuotaError> {
        let mut inner = self.inner.write().await;
        let relay = &mut inner
            .entries
            .get_mut(&id)
            .ok_or(QuotaError::UnknownRelay(id))?
            .relay;

        let used = if relay.quota_day == Some(day) { relay.sent_today } else { 0 };
        let next = used.saturating_add(n);
        if let Some(quota) = relay.daily_quota
            && next > quota
        {
            return Err(QuotaError::Exceeded {
                relay: id,
                quota,
                sent: used,
            });
        }

        relay.sent_today = next;
        relay.quota_day = Some(day);
        let snapshot = relay.clone();
        self.persist_quietly(&snapshot).await;
        drop(inner);
        Ok(next)
    }

    /// Sends still allowed today, `u32::MAX` if unlimited, `None` if unknown.
    pub async fn remaining_quota(&self, id: RelayId) -> Option<u32> {
        let today = Utc::now().date_naive();
        self.get(id).await.map(|relay| relay.remaining_quota(today))
    }

    /// Flags a relay as unusable so no further tasks are assigned to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelayNotFound`] if absent.
    pub async fn mark_invalid(&self, id: RelayId, reason: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.get_mut(&id).ok_or(Error::RelayNotFound(id))?;
        entry.relay.mark_invalid(reason);
        let snapshot = entry.relay.clone();
        warn!(relay = %id, reason, "Relay marked invalid");
        self.persist_quietly(&snapshot).await;
        drop(inner);
        Ok(())
    }

    /// Stores the outcome of a validation run for an existing relay.
    ///
    /// Only health and the validation timestamp are taken from `validated`;
    /// counters stay as the store has them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelayNotFound`] if absent.
    pub async fn record_validation(&self, validated: &RelayCredential) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&validated.id)
            .ok_or(Error::RelayNotFound(validated.id))?;
        entry.relay.health = validated.health.clone();
        entry.relay.last_validated_at = validated.last_validated_at;
        let snapshot = entry.relay.clone();
        self.persist_quietly(&snapshot).await;
        drop(inner);
        Ok(())
    }

    /// Counters and health are authoritative in memory; a failed write is
    /// logged and retried on the next mutation. Callers hold the write lock
    /// so the repository sees snapshots in mutation order.
    async fn persist_quietly(&self, relay: &RelayCredential) {
        if let Some(repo) = &self.repository
            && let Err(e) = repo.upsert(relay).await
        {
            warn!(relay = %relay.id, "Failed to persist relay state: {e}");
        }
    }
}

impl Default for RelayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn insert(&mut self, relay: RelayCredential) {
        let seq = match self.entries.get(&relay.id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(relay.id, Entry { seq, relay });
    }

    fn sorted(&self, keep: impl Fn(&RelayCredential) -> bool) -> Vec<RelayCredential> {
        let mut entries: Vec<&Entry> = self.entries.values().filter(|e| keep(&e.relay)).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.relay.clone()).collect()
    }
}
