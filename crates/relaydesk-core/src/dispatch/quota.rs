//! Daily and concurrent send ceilings per relay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::relay::{QuotaError, RelayId, RelayStore};

/// Gatekeeper the sender consults before every attempt.
///
/// Daily counts live in the [`RelayStore`]; concurrency permits live here
/// and are shared by every lane that uses the same relay.
pub struct QuotaTracker {
    store: Arc<RelayStore>,
    per_relay: usize,
    permits: Mutex<HashMap<RelayId, Arc<Semaphore>>>,
}

impl QuotaTracker {
    /// Creates a tracker allowing `per_relay` simultaneous sends per relay.
    #[must_use]
    pub fn new(store: Arc<RelayStore>, per_relay: usize) -> Self {
        Self {
            store,
            per_relay: per_relay.max(1),
            permits: Mutex::new(HashMap::new()),
        }
    }

    /// Sends still allowed today; `None` for an unknown relay.
    pub async fn remaining(&self, id: RelayId) -> Option<u32> {
        self.store.remaining_quota(id).await
    }

    /// Reserves one send against today's quota.
    ///
    /// The slot stays consumed even if the send then fails.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] when the relay is used up.
    pub async fn try_acquire(&self, id: RelayId) -> Result<u32, QuotaError> {
        let sent = self.store.increment_sent(id, 1).await?;
        debug!(relay = %id, sent, "Reserved quota");
        Ok(sent)
    }

    /// Waits for one of the relay's concurrency slots.
    pub async fn permit(&self, id: RelayId) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut permits = self.permits.lock().await;
            Arc::clone(
                permits
                    .entry(id)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_relay))),
            )
        };
        semaphore.acquire_owned().await.ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::{RelayCredential, RelayEndpoint, Security, SmtpDetails};
    use std::time::Duration;

    fn relay(quota: Option<u32>) -> RelayCredential {
        RelayCredential::new(
            "a@example.com",
            "pw",
            RelayEndpoint::Smtp(SmtpDetails {
                host: "smtp.example.com".into(),
                port: 587,
                security: Security::StartTls,
                host_guessed: false,
            }),
        )
        .with_daily_quota(quota)
    }

    #[tokio::test]
    async fn acquire_stops_at_quota() {
        let store = Arc::new(RelayStore::new());
        let r = relay(Some(2));
        store.upsert(r.clone()).await.unwrap();
        let quota = QuotaTracker::new(Arc::clone(&store), 1);

        assert_eq!(quota.try_acquire(r.id).await, Ok(1));
        assert_eq!(quota.remaining(r.id).await, Some(1));
        assert_eq!(quota.try_acquire(r.id).await, Ok(2));
        assert!(matches!(
            quota.try_acquire(r.id).await,
            Err(QuotaError::Exceeded { quota: 2, sent: 2, .. })
        ));
        assert_eq!(store.get(r.id).await.unwrap().sent_today, 2);
    }

    #[tokio::test]
    async fn unlimited_relay_reports_max() {
        let store = Arc::new(RelayStore::new());
        let r = relay(None);
        store.upsert(r.clone()).await.unwrap();
        let quota = QuotaTracker::new(store, 1);
        assert_eq!(quota.remaining(r.id).await, Some(u32::MAX));
        assert_eq!(quota.remaining(RelayId::new()).await, None);
    }

    #[tokio::test]
    async fn permits_cap_concurrency_per_relay() {
        let store = Arc::new(RelayStore::new());
        let quota = QuotaTracker::new(store, 2);
        let id = RelayId::new();

        let first = quota.permit(id).await.unwrap();
        let _second = quota.permit(id).await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(20), quota.permit(id)).await;
        assert!(third.is_err());

        drop(first);
        assert!(quota.permit(id).await.is_some());
        assert!(quota.permit(RelayId::new()).await.is_some());
    }
}
