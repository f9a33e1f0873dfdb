//! Live relay validation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::relay::{RelayCredential, RelayStore};
use crate::transport::{DeliveryError, RelayTransport};
use crate::Result;

/// A relay that failed validation, with the reason.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRelay {
    /// The relay, health `Invalid`.
    pub config: RelayCredential,
    /// Why it failed.
    pub error: String,
}

/// Partition of a validation run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// The run completed; individual failures are listed below.
    pub success: bool,
    /// Relays that authenticated, in input order.
    pub valid_configs: Vec<RelayCredential>,
    /// Relays that did not, in input order.
    pub invalid_configs: Vec<InvalidRelay>,
    /// Relays examined.
    pub total: usize,
    /// `valid_configs.len()`.
    pub valid: usize,
    /// `invalid_configs.len()`.
    pub invalid: usize,
}

impl ValidationReport {
    fn from_checked(checked: Vec<RelayCredential>) -> Self {
        let total = checked.len();
        let (valid_configs, invalid): (Vec<_>, Vec<_>) =
            checked.into_iter().partition(RelayCredential::is_valid);
        let invalid_configs: Vec<InvalidRelay> = invalid
            .into_iter()
            .map(|config| InvalidRelay {
                error: config.last_error().unwrap_or("unknown failure").to_string(),
                config,
            })
            .collect();

        Self {
            success: true,
            valid: valid_configs.len(),
            invalid: invalid_configs.len(),
            total,
            valid_configs,
            invalid_configs,
        }
    }
}

/// Checks relays against their real servers.
///
/// Never retries: one handshake per relay per call.
#[derive(Clone)]
pub struct RelayValidator {
    transport: Arc<dyn RelayTransport>,
    concurrency: usize,
    timeout: Duration,
}

impl RelayValidator {
    /// Creates a validator with the concurrency and deadline from `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn RelayTransport>, config: &CoreConfig) -> Self {
        Self {
            transport,
            concurrency: config.validation_concurrency.max(1),
            timeout: config.validation_timeout(),
        }
    }

    /// Validates one relay and returns it with health and timestamp set.
    pub async fn validate(&self, relay: RelayCredential) -> RelayCredential {
        check(self.transport.as_ref(), self.timeout, relay).await
    }

    /// Validates many relays, at most `validation_concurrency` at a time.
    pub async fn validate_all(&self, relays: Vec<RelayCredential>) -> ValidationReport {
        let total = relays.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut slots: Vec<Option<RelayCredential>> = vec![None; total];
        let fallbacks = relays.clone();
        let mut tasks = JoinSet::new();

        for (index, relay) in relays.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let transport = Arc::clone(&self.transport);
            let timeout = self.timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, check(transport.as_ref(), timeout, relay).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, checked)) => slots[index] = Some(checked),
                Err(e) => warn!("Validation task failed: {e}"),
            }
        }

        let checked = slots
            .into_iter()
            .zip(fallbacks)
            .map(|(slot, mut fallback)| {
                slot.unwrap_or_else(|| {
                    fallback.mark_invalid("validation task aborted");
                    fallback.last_validated_at = Some(Utc::now());
                    fallback
                })
            })
            .collect();

        let report = ValidationReport::from_checked(checked);
        info!(
            total = report.total,
            valid = report.valid,
            invalid = report.invalid,
            "Validated relays"
        );
        report
    }

    /// Revalidates every stored relay and writes the results back.
    ///
    /// # Errors
    ///
    /// Returns an error if a relay vanished from the store mid-run.
    pub async fn validate_store(&self, store: &RelayStore) -> Result<ValidationReport> {
        let report = self.validate_all(store.list_all().await).await;
        for relay in report
            .valid_configs
            .iter()
            .chain(report.invalid_configs.iter().map(|i| &i.config))
        {
            store.record_validation(relay).await?;
        }
        Ok(report)
    }
}

async fn check(transport: &dyn RelayTransport, timeout: Duration, mut relay: RelayCredential) -> RelayCredential {
    let outcome = match tokio::time::timeout(timeout, transport.verify(&relay)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::timed_out(timeout)),
    };

    let now = Utc::now();
    match outcome {
        Ok(()) => {
            debug!(relay = %relay.id, label = %relay.label(), "Relay is valid");
            relay.mark_valid(now);
        }
        Err(e) => {
            debug!(relay = %relay.id, label = %relay.label(), "Relay is invalid: {e}");
            relay.mark_invalid(e.message());
            relay.last_validated_at = Some(now);
        }
    }
    relay
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::{RelayEndpoint, RelayHealth, Security, SmtpDetails};
    use crate::transport::OutgoingMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts usernames starting with "ok", hangs on "slow", refuses the rest.
    #[derive(Default)]
    struct ScriptedTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn verify(&self, relay: &RelayCredential) -> std::result::Result<(), DeliveryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if relay.username.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if relay.username.starts_with("ok") {
                Ok(())
            } else {
                Err(DeliveryError::relay_broken("535 authentication failed"))
            }
        }

        async fn send(&self, _: &RelayCredential, _: &OutgoingMessage) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn relay(user: &str) -> RelayCredential {
        RelayCredential::new(
            user,
            "pw",
            RelayEndpoint::Smtp(SmtpDetails {
                host: "smtp.example.com".into(),
                port: 587,
                security: Security::StartTls,
                host_guessed: false,
            }),
        )
    }

    fn validator(transport: Arc<ScriptedTransport>, concurrency: usize) -> RelayValidator {
        let config = CoreConfig {
            validation_concurrency: concurrency,
            validation_timeout_secs: 1,
            ..CoreConfig::default()
        };
        RelayValidator::new(transport, &config)
    }

    #[tokio::test]
    async fn health_invariants_hold() {
        let v = validator(Arc::default(), 2);
        let good = v.validate(relay("ok@example.com")).await;
        assert!(good.is_valid());
        assert_eq!(good.last_error(), None);
        assert!(good.last_validated_at.is_some());

        let bad = v.validate(relay("bad@example.com")).await;
        assert!(!bad.is_valid());
        assert_eq!(bad.last_error(), Some("535 authentication failed"));
        assert!(bad.last_validated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_invalid() {
        let v = validator(Arc::default(), 1);
        let slow = v.validate(relay("slow@example.com")).await;
        assert_eq!(slow.last_error(), Some("timed out after 1s"));
    }

    #[tokio::test]
    async fn validate_all_partitions_in_order_with_bounded_concurrency() {
        let transport = Arc::new(ScriptedTransport::default());
        let v = validator(Arc::clone(&transport), 2);
        let input: Vec<_> = ["ok1@a.io", "bad1@a.io", "ok2@a.io", "bad2@a.io", "ok3@a.io"]
            .into_iter()
            .map(relay)
            .collect();
        let report = v.validate_all(input.clone()).await;

        assert_eq!((report.total, report.valid, report.invalid), (5, 3, 2));
        let valid_ids: Vec<_> = report.valid_configs.iter().map(|r| r.id).collect();
        assert_eq!(valid_ids, vec![input[0].id, input[2].id, input[4].id]);
        assert_eq!(report.invalid_configs[0].config.id, input[1].id);
        assert_eq!(report.invalid_configs[0].error, "535 authentication failed");
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn validate_store_records_results() {
        let store = RelayStore::new();
        let good = relay("ok@a.io");
        let bad = relay("bad@a.io");
        store.upsert(good.clone()).await.unwrap();
        store.upsert(bad.clone()).await.unwrap();

        let report = validator(Arc::default(), 4).validate_store(&store).await.unwrap();
        assert_eq!(report.valid, 1);
        assert!(store.get(good.id).await.unwrap().is_valid());
        assert!(matches!(
            store.get(bad.id).await.unwrap().health,
            RelayHealth::Invalid { .. }
        ));
    }

    #[test]
    fn report_serializes_contract_names() {
        let report = ValidationReport::from_checked(Vec::new());
        let json = serde_json::to_value(&report).unwrap();
        for key in ["success", "validConfigs", "invalidConfigs", "total", "valid", "invalid"] {
            assert!(json.get(key).is_some(), "{key}");
        }
    }
}
