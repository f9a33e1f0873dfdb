//! Campaign scheduling: batching, relay assignment and pacing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::campaign::{CampaignId, CampaignRequest, RelaySelection, SendTask, TaskStatus};
use super::event::{EventSink, TaskEvent};
use super::quota::QuotaTracker;
use super::sender::{BatchContext, BatchSender};
use crate::config::CoreConfig;
use crate::relay::{RelayCredential, RelayId, RelayStore};
use crate::transport::RelayTransport;
use crate::{Error, Result};

/// Final state of a campaign.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignReport {
    /// Campaign identifier.
    pub campaign_id: CampaignId,
    /// Tasks created.
    pub total: usize,
    /// Delivered.
    pub sent: usize,
    /// Given up on.
    pub failed: usize,
    /// Still waiting for quota when the campaign ended.
    pub deferred: usize,
    /// Stopped by cancellation.
    pub cancelled: usize,
    /// Batches released.
    pub batches: usize,
    /// Every task, in recipient order.
    pub tasks: Vec<SendTask>,
}

impl CampaignReport {
    fn new(campaign_id: CampaignId, tasks: Vec<SendTask>, batches: usize) -> Self {
        let count = |status| tasks.iter().filter(|t| t.status == status).count();
        Self {
            campaign_id,
            total: tasks.len(),
            sent: count(TaskStatus::Sent),
            failed: count(TaskStatus::Failed),
            deferred: count(TaskStatus::Deferred),
            cancelled: count(TaskStatus::Cancelled),
            batches,
            tasks,
        }
    }
}

/// A running campaign.
pub struct CampaignHandle {
    /// Campaign identifier.
    pub campaign_id: CampaignId,
    /// Task transitions as they happen.
    pub events: UnboundedReceiver<TaskEvent>,
    cancel: CancellationToken,
    join: JoinHandle<CampaignReport>,
}

impl CampaignHandle {
    /// Stops releasing work. In-flight sends finish; everything else is
    /// cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this campaign.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the campaign to end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dispatch`] if the campaign task panicked.
    pub async fn join(self) -> Result<CampaignReport> {
        self.join.await.map_err(|e| Error::Dispatch(e.to_string()))
    }
}

/// Turns campaign requests into paced batches.
#[derive(Clone)]
pub struct DispatchScheduler {
    store: Arc<RelayStore>,
    sender: BatchSender,
}

impl DispatchScheduler {
    /// Creates a scheduler sending through `transport`.
    #[must_use]
    pub fn new(store: Arc<RelayStore>, transport: Arc<dyn RelayTransport>, config: &CoreConfig) -> Self {
        let quota = Arc::new(QuotaTracker::new(Arc::clone(&store), config.per_relay_concurrency));
        let sender = BatchSender::new(Arc::clone(&store), quota, transport, config);
        Self { store, sender }
    }

    /// Starts a campaign in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUsableRelay`] immediately if no selected relay is
    /// valid, or [`Error::InvalidCampaign`] for a malformed request.
    pub async fn submit(&self, request: CampaignRequest) -> Result<CampaignHandle> {
        let selection = self.precheck(&request).await?;
        let campaign_id = CampaignId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let scheduler = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            scheduler
                .execute(campaign_id, request, selection, tx, token)
                .await
        });

        Ok(CampaignHandle {
            campaign_id,
            events: rx,
            cancel,
            join,
        })
    }

    /// Runs a campaign to completion on the current task.
    ///
    /// # Errors
    ///
    /// Same preconditions as [`Self::submit`].
    pub async fn run(
        &self,
        request: CampaignRequest,
        events: UnboundedSender<TaskEvent>,
        cancel: CancellationToken,
    ) -> Result<CampaignReport> {
        let selection = self.precheck(&request).await?;
        Ok(self
            .execute(CampaignId::new(), request, selection, events, cancel)
            .await)
    }

    async fn precheck(&self, request: &CampaignRequest) -> Result<Vec<RelayId>> {
        request.check()?;
        let selection: Vec<RelayId> = self
            .selected(&request.relays)
            .await
            .into_iter()
            .filter(RelayCredential::is_valid)
            .map(|r| r.id)
            .collect();
        if selection.is_empty() {
            return Err(Error::NoUsableRelay);
        }
        Ok(selection)
    }

    /// Selected relays that still exist, in selection order.
    async fn selected(&self, selection: &RelaySelection) -> Vec<RelayCredential> {
        match selection {
            RelaySelection::All => self.store.list_all().await,
            RelaySelection::Explicit(ids) => {
                let mut relays = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(relay) = self.store.get(*id).await
                        && !relays.iter().any(|r: &RelayCredential| r.id == relay.id)
                    {
                        relays.push(relay);
                    }
                }
                relays
            }
        }
    }

    #[instrument(skip_all, fields(campaign = %campaign_id))]
    async fn execute(
        &self,
        campaign_id: CampaignId,
        request: CampaignRequest,
        selection: Vec<RelayId>,
        events: UnboundedSender<TaskEvent>,
        cancel: CancellationToken,
    ) -> CampaignReport {
        let events = EventSink::new(events);
        let pacing = request.pacing.clone();
        let mut tasks = request.tasks(campaign_id);
        let batches: Vec<Vec<usize>> = (0..tasks.len())
            .collect::<Vec<_>>()
            .chunks(pacing.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        info!(
            tasks = tasks.len(),
            batches = batches.len(),
            relays = selection.len(),
            priority = ?pacing.priority,
            "Campaign started"
        );

        let selection: Arc<[RelayId]> = selection.into();
        let mut carried: Vec<usize> = Vec::new();
        let mut cursor = 0usize;
        let mut released = 0usize;

        for (batch, fresh) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if batch > 0 && !pacing.batch_delay().is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(pacing.batch_delay()) => {}
                }
            }

            let relays = self.usable(&selection).await;
            if relays.is_empty() {
                info!(batch, "No relay left with quota; holding remaining tasks");
                break;
            }

            let work: Vec<usize> = carried.drain(..).chain(fresh).collect();
            for &i in &work {
                if tasks[i].status == TaskStatus::Deferred {
                    tasks[i].transition(TaskStatus::Pending);
                }
            }
            assign_round_robin(&mut tasks, &work, &relays, &mut cursor);
            for &i in &work {
                if tasks[i].status == TaskStatus::Deferred {
                    events.progress(&tasks[i], batch);
                }
            }

            let ctx = BatchContext {
                batch,
                selection: Arc::clone(&selection),
                retry_delay: pacing.retry_delay(),
                events: events.clone(),
                cancel: cancel.clone(),
            };
            let outgoing: Vec<SendTask> = work.iter().map(|&i| tasks[i].clone()).collect();
            debug!(batch, size = outgoing.len(), "Releasing batch");
            for task in self.sender.send_batch(outgoing, &ctx).await {
                let index = task.index;
                tasks[index] = task;
            }
            released += 1;

            carried = work
                .into_iter()
                .filter(|&i| tasks[i].status == TaskStatus::Deferred)
                .collect();
        }

        let last_batch = released.saturating_sub(1);
        for task in &mut tasks {
            let closing = match task.status {
                TaskStatus::Pending | TaskStatus::Sending if cancel.is_cancelled() => TaskStatus::Cancelled,
                TaskStatus::Deferred if cancel.is_cancelled() => TaskStatus::Cancelled,
                TaskStatus::Pending | TaskStatus::Sending | TaskStatus::Deferred => TaskStatus::Deferred,
                TaskStatus::Sent | TaskStatus::Failed | TaskStatus::Cancelled => continue,
            };
            if closing == TaskStatus::Deferred && task.last_error.is_none() {
                task.last_error = Some("no relay in the selection has quota left".to_string());
            }
            task.transition(closing);
            events.finished(task, last_batch);
        }

        let report = CampaignReport::new(campaign_id, tasks, released);
        info!(
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            cancelled = report.cancelled,
            "Campaign finished"
        );
        report
    }

    /// Selected relays that are valid and have quota left, in selection order.
    async fn usable(&self, selection: &[RelayId]) -> Vec<RelayCredential> {
        let today = Utc::now().date_naive();
        let mut relays = Vec::with_capacity(selection.len());
        for id in selection {
            if let Some(relay) = self.store.get(*id).await
                && relay.is_valid()
                && relay.remaining_quota(today) > 0
            {
                relays.push(relay);
            }
        }
        relays
    }
}

/// Binds each pending task to the next relay with unplanned quota.
///
/// `cursor` carries the rotation across batches. Tasks no relay can take
/// are deferred.
fn assign_round_robin(tasks: &mut [SendTask], work: &[usize], relays: &[RelayCredential], cursor: &mut usize) {
    let today = Utc::now().date_naive();
    let mut planned: HashMap<RelayId, u32> = HashMap::new();
    let n = relays.len();

    for &i in work {
        if tasks[i].status != TaskStatus::Pending {
            continue;
        }
        let mut chosen = None;
        for step in 0..n {
            let slot = (*cursor + step) % n;
            let relay = &relays[slot];
            let used = planned.get(&relay.id).copied().unwrap_or(0);
            if relay.is_valid() && relay.remaining_quota(today) > used {
                chosen = Some(relay.id);
                *cursor = (slot + 1) % n;
                *planned.entry(relay.id).or_insert(0) += 1;
                break;
            }
        }

        match chosen {
            Some(id) => {
                tasks[i].assign(id);
            }
            None => {
                tasks[i].defer("every selected relay is out of quota");
            }
        }
    }
}
