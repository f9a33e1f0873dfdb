//! Progress events emitted while a campaign runs.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::campaign::{CampaignId, SendTask, TaskStatus};
use crate::relay::RelayId;

/// One task transition.
///
/// Each task produces exactly one event with `terminal == true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Task index in the recipient list.
    pub index: usize,
    /// Recipient address.
    pub recipient: String,
    /// Relay involved, if any.
    pub relay: Option<RelayId>,
    /// Status after the transition.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Failure or deferral reason.
    pub error: Option<String>,
    /// Last event for this task.
    pub terminal: bool,
    /// Zero-based batch the task was processed in.
    pub batch: usize,
}

/// Cheap clonable event sink. Events are dropped once nobody listens.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: UnboundedSender<TaskEvent>,
}

impl EventSink {
    pub(crate) const fn new(tx: UnboundedSender<TaskEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn progress(&self, task: &SendTask, batch: usize) {
        self.emit(task, batch, false);
    }

    pub(crate) fn finished(&self, task: &SendTask, batch: usize) {
        self.emit(task, batch, true);
    }

    fn emit(&self, task: &SendTask, batch: usize, terminal: bool) {
        let _ = self.tx.send(TaskEvent {
            campaign_id: task.campaign_id,
            index: task.index,
            recipient: task.recipient.clone(),
            relay: task.assigned_relay,
            status: task.status,
            attempt: task.attempt,
            error: task.last_error.clone(),
            terminal,
            batch,
        });
    }
}
