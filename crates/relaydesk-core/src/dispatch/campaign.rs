//! Campaign requests and per-recipient send tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::relay::RelayId;
use crate::{Error, Result};

/// Identifier of one submitted campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub Uuid);

impl CampaignId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What every recipient receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Whether `body` is HTML.
    #[serde(default)]
    pub is_html: bool,
}

/// Which relays a campaign may use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "SelectionRecord", into = "SelectionRecord")]
pub enum RelaySelection {
    /// Every valid relay in the store.
    #[default]
    All,
    /// These relays, in this order.
    Explicit(Vec<RelayId>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SelectionRecord {
    Keyword(String),
    Ids(Vec<RelayId>),
}

impl TryFrom<SelectionRecord> for RelaySelection {
    type Error = String;

    fn try_from(record: SelectionRecord) -> std::result::Result<Self, Self::Error> {
        match record {
            SelectionRecord::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(Self::All),
            SelectionRecord::Keyword(k) => Err(format!("unknown relay selection '{k}'")),
            SelectionRecord::Ids(ids) => Ok(Self::Explicit(ids)),
        }
    }
}

impl From<RelaySelection> for SelectionRecord {
    fn from(selection: RelaySelection) -> Self {
        match selection {
            RelaySelection::All => Self::Keyword("all".to_string()),
            RelaySelection::Explicit(ids) => Self::Ids(ids),
        }
    }
}

/// Caller-declared urgency. Recorded and logged; it does not reorder work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Urgent.
    High,
}

/// Batching and retry policy. Durations are milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pacing {
    /// Tasks released together.
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    pub delay_between_batches: u64,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Pause before a retry, in milliseconds.
    pub retry_delay: u64,
    /// Advisory priority.
    pub priority: Priority,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_between_batches: 1_000,
            retry_attempts: 2,
            retry_delay: 5_000,
            priority: Priority::Normal,
        }
    }
}

impl Pacing {
    /// Pause between batches.
    #[must_use]
    pub const fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches)
    }

    /// Pause before a retry.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    /// Total tries a task gets.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

/// A campaign submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    /// Message sent to everyone.
    pub message: MessageTemplate,
    /// Recipient addresses, in send order.
    pub recipients: Vec<String>,
    /// Relays to use.
    #[serde(default)]
    pub relays: RelaySelection,
    /// Batching and retries.
    #[serde(default)]
    pub pacing: Pacing,
}

impl CampaignRequest {
    /// Rejects requests that cannot be scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCampaign`] for a zero batch size, no
    /// recipients, or an empty explicit relay list.
    pub fn check(&self) -> Result<()> {
        if self.pacing.batch_size == 0 {
            return Err(Error::InvalidCampaign("batchSize must be at least 1".into()));
        }
        if self.recipients.iter().all(|r| r.trim().is_empty()) {
            return Err(Error::InvalidCampaign("no recipients".into()));
        }
        if matches!(&self.relays, RelaySelection::Explicit(ids) if ids.is_empty()) {
            return Err(Error::InvalidCampaign("relay list is empty".into()));
        }
        Ok(())
    }

    /// Creates one pending task per non-blank recipient.
    #[must_use]
    pub fn tasks(&self, campaign_id: CampaignId) -> Vec<SendTask> {
        self.recipients
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .enumerate()
            .map(|(index, recipient)| SendTask {
                campaign_id,
                index,
                recipient: recipient.to_string(),
                subject: self.message.subject.clone(),
                body: self.message.body.clone(),
                is_html: self.message.is_html,
                assigned_relay: None,
                attempt: 0,
                max_attempts: self.pacing.max_attempts(),
                status: TaskStatus::Pending,
                last_error: None,
            })
            .collect()
    }
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a relay or a retry.
    Pending,
    /// An attempt is in flight.
    Sending,
    /// Delivered. Final.
    Sent,
    /// Given up on.
    Failed,
    /// Postponed for lack of quota.
    Deferred,
    /// Stopped by cancellation.
    Cancelled,
}

/// One recipient of one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTask {
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Position in the recipient list.
    pub index: usize,
    /// Recipient address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Body.
    pub body: String,
    /// Whether `body` is HTML.
    pub is_html: bool,
    /// Relay the task is bound to.
    pub assigned_relay: Option<RelayId>,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Attempts allowed.
    pub max_attempts: u32,
    /// Current state.
    pub status: TaskStatus,
    /// Most recent failure.
    pub last_error: Option<String>,
}

impl SendTask {
    /// Whether the task can still try to send.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Binds the task to a relay. A sent task is never reassigned.
    pub fn assign(&mut self, relay: RelayId) -> bool {
        if self.status == TaskStatus::Sent {
            return false;
        }
        self.assigned_relay = Some(relay);
        true
    }

    /// Counts one failed attempt, never past `max_attempts`.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        if self.status == TaskStatus::Sent {
            return;
        }
        self.attempt = (self.attempt + 1).min(self.max_attempts);
        self.last_error = Some(reason.into());
    }

    /// Moves to `to`, refusing to leave `Sent`.
    pub fn transition(&mut self, to: TaskStatus) -> bool {
        if self.status == TaskStatus::Sent {
            return false;
        }
        self.status = to;
        true
    }

    /// Defers the task with a reason.
    pub fn defer(&mut self, reason: impl Into<String>) -> bool {
        let moved = self.transition(TaskStatus::Deferred);
        if moved {
            self.last_error = Some(reason.into());
        }
        moved
    }

    /// Fails the task with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let moved = self.transition(TaskStatus::Failed);
        if moved {
            self.last_error = Some(reason.into());
        }
        moved
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(json: &str) -> CampaignRequest {
        serde_json::from_str(json).unwrap()
    }

    mod request_tests {
        use super::*;

        #[test]
        fn parses_wire_shape() {
            let r = request(
                r#"{"message":{"subject":"Hi","body":"<p>x</p>","isHtml":true},
                    "recipients":["a@x.io"," ","b@x.io"],"relays":"all",
                    "pacing":{"batchSize":1,"delayBetweenBatches":250,"retryAttempts":3,"priority":"high"}}"#,
            );
            assert_eq!(r.relays, RelaySelection::All);
            assert_eq!(r.pacing.batch_delay(), Duration::from_millis(250));
            assert_eq!(r.pacing.max_attempts(), 4);
            assert_eq!(r.pacing.priority, Priority::High);
            assert_eq!(r.pacing.retry_delay, 5_000);

            let tasks = r.tasks(CampaignId::new());
            assert_eq!(tasks.len(), 2);
            assert_eq!(tasks[1].index, 1);
            assert_eq!(tasks[1].recipient, "b@x.io");
            assert!(tasks[0].is_html);
            assert_eq!(tasks[0].status, TaskStatus::Pending);
        }

        #[test]
        fn explicit_selection() {
            let id = RelayId::new();
            let r = request(&format!(
                r#"{{"message":{{"subject":"s","body":"b"}},"recipients":["a@x.io"],"relays":["{id}"]}}"#
            ));
            assert_eq!(r.relays, RelaySelection::Explicit(vec![id]));
            assert!(r.check().is_ok());
        }

        #[test]
        fn unknown_keyword_is_rejected() {
            let result: std::result::Result<CampaignRequest, _> = serde_json::from_str(
                r#"{"message":{"subject":"s","body":"b"},"recipients":["a@x.io"],"relays":"some"}"#,
            );
            assert!(result.is_err());
        }

        #[test]
        fn check_rejects_unschedulable() {
            let mut r = request(r#"{"message":{"subject":"s","body":"b"},"recipients":["a@x.io"]}"#);
            r.pacing.batch_size = 0;
            assert!(matches!(r.check(), Err(Error::InvalidCampaign(_))));
            r.pacing.batch_size = 1;
            r.recipients = vec!["  ".into()];
            assert!(r.check().is_err());
        }
    }

    mod task_tests {
        use super::*;

        fn task() -> SendTask {
            request(r#"{"message":{"subject":"s","body":"b"},"recipients":["a@x.io"],"pacing":{"retryAttempts":1}}"#)
                .tasks(CampaignId::new())
                .remove(0)
        }

        #[test]
        fn sent_is_final() {
            let mut t = task();
            assert!(t.transition(TaskStatus::Sending));
            assert!(t.transition(TaskStatus::Sent));
            assert!(!t.fail("late"));
            assert!(!t.defer("late"));
            assert!(!t.assign(RelayId::new()));
            assert_eq!(t.status, TaskStatus::Sent);
            assert_eq!(t.last_error, None);
        }

        #[test]
        fn attempts_never_exceed_max() {
            let mut t = task();
            assert_eq!(t.max_attempts, 2);
            for _ in 0..5 {
                t.record_failure("timeout");
            }
            assert_eq!(t.attempt, 2);
            assert!(!t.has_attempts_left());
        }
    }
}
