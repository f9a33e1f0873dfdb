//! Executes one batch of send tasks.
//!
//! Tasks are grouped into lanes by relay. Lanes run concurrently; a lane
//! sends its tasks one after another, so retries and re-routed tasks keep
//! their relative order. Every attempt holds a global worker permit and a
//! per-relay permit for the duration of the network call only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::campaign::{SendTask, TaskStatus};
use super::event::EventSink;
use super::quota::QuotaTracker;
use crate::config::CoreConfig;
use crate::relay::{QuotaError, RelayCredential, RelayId, RelayStore};
use crate::transport::{DeliveryError, FailureClass, OutgoingMessage, RelayTransport};

/// Everything one batch shares across its lanes.
#[derive(Clone)]
pub(crate) struct BatchContext {
    pub(crate) batch: usize,
    pub(crate) selection: Arc<[RelayId]>,
    pub(crate) retry_delay: Duration,
    pub(crate) events: EventSink,
    pub(crate) cancel: CancellationToken,
}

/// Sends tasks through their assigned relays.
#[derive(Clone)]
pub struct BatchSender {
    store: Arc<RelayStore>,
    quota: Arc<QuotaTracker>,
    transport: Arc<dyn RelayTransport>,
    workers: Arc<Semaphore>,
    lanes_per_relay: usize,
    send_timeout: Duration,
}

enum Attempt {
    Done,
    Retry,
    Reroute(String),
}

impl BatchSender {
    /// Creates a sender with the worker and timeout limits of `config`.
    #[must_use]
    pub fn new(
        store: Arc<RelayStore>,
        quota: Arc<QuotaTracker>,
        transport: Arc<dyn RelayTransport>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            store,
            quota,
            transport,
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            lanes_per_relay: config.per_relay_concurrency.max(1),
            send_timeout: config.send_timeout(),
        }
    }

    /// Runs one batch and returns its tasks in index order.
    ///
    /// Tasks without an assigned relay are returned untouched.
    pub(crate) async fn send_batch(&self, tasks: Vec<SendTask>, ctx: &BatchContext) -> Vec<SendTask> {
        let mut finished = Vec::with_capacity(tasks.len());
        let mut lanes: Vec<(RelayId, Vec<SendTask>)> = Vec::new();

        for task in tasks {
            let Some(relay) = task.assigned_relay.filter(|_| task.status == TaskStatus::Pending) else {
                finished.push(task);
                continue;
            };
            match lanes.iter_mut().find(|(id, _)| *id == relay) {
                Some((_, lane)) => lane.push(task),
                None => lanes.push((relay, vec![task])),
            }
        }

        let mut snapshots: HashMap<usize, SendTask> = HashMap::new();
        let mut running = JoinSet::new();
        for (relay, lane) in lanes {
            for sub_lane in split_lane(lane, self.lanes_per_relay) {
                for task in &sub_lane {
                    snapshots.insert(task.index, task.clone());
                }
                let sender = self.clone();
                let ctx = ctx.clone();
                running.spawn(async move { sender.run_lane(relay, sub_lane, &ctx).await });
            }
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(done) => {
                    for task in done {
                        snapshots.remove(&task.index);
                        finished.push(task);
                    }
                }
                Err(e) => warn!(batch = ctx.batch, "Send lane aborted: {e}"),
            }
        }

        for (_, mut lost) in snapshots {
            lost.fail("send lane aborted");
            ctx.events.finished(&lost, ctx.batch);
            finished.push(lost);
        }

        finished.sort_by_key(|t| t.index);
        finished
    }

    async fn run_lane(&self, relay: RelayId, tasks: Vec<SendTask>, ctx: &BatchContext) -> Vec<SendTask> {
        let mut current = Some(relay);
        let mut done = Vec::with_capacity(tasks.len());
        for task in tasks {
            done.push(self.deliver(task, &mut current, ctx).await);
        }
        done
    }

    /// Drives one task to sent, failed, deferred or cancelled.
    ///
    /// `current` is the lane's relay; it changes when the relay breaks or
    /// runs out of quota, and later tasks in the lane follow it.
    async fn deliver(&self, mut task: SendTask, current: &mut Option<RelayId>, ctx: &BatchContext) -> SendTask {
        loop {
            if ctx.cancel.is_cancelled() {
                task.transition(TaskStatus::Cancelled);
                ctx.events.finished(&task, ctx.batch);
                return task;
            }

            let Some(relay_id) = *current else {
                task.defer("no relay in the selection has quota left");
                ctx.events.progress(&task, ctx.batch);
                return task;
            };

            let relay = match self.store.get(relay_id).await {
                Some(relay) if relay.is_valid() => relay,
                _ => {
                    *current = self.alternative(ctx, relay_id).await;
                    continue;
                }
            };

            match self.quota.try_acquire(relay_id).await {
                Ok(_) => {}
                Err(QuotaError::Exceeded { .. } | QuotaError::UnknownRelay(_)) => {
                    debug!(relay = %relay_id, "Relay out of quota, looking for another");
                    *current = self.alternative(ctx, relay_id).await;
                    if let Some(next) = *current {
                        task.assign(next);
                    }
                    continue;
                }
            }

            task.assign(relay_id);
            task.transition(TaskStatus::Sending);
            ctx.events.progress(&task, ctx.batch);

            match self.attempt(&mut task, &relay, ctx).await {
                Attempt::Done => return task,
                Attempt::Retry => {
                    if ctx.cancel.is_cancelled() {
                        continue;
                    }
                    tokio::select! {
                        () = ctx.cancel.cancelled() => {}
                        () = tokio::time::sleep(ctx.retry_delay) => {}
                    }
                }
                Attempt::Reroute(reason) => {
                    *current = self.alternative(ctx, relay_id).await;
                    match *current {
                        Some(next) => {
                            info!(task = task.index, from = %relay_id, to = %next, "Re-routing task");
                            task.assign(next);
                            task.transition(TaskStatus::Pending);
                            ctx.events.progress(&task, ctx.batch);
                        }
                        None => {
                            task.fail(format!("{reason}; no other relay available"));
                            ctx.events.finished(&task, ctx.batch);
                            return task;
                        }
                    }
                }
            }
        }
    }

    /// One network attempt plus its bookkeeping.
    async fn attempt(&self, task: &mut SendTask, relay: &RelayCredential, ctx: &BatchContext) -> Attempt {
        let message = OutgoingMessage::new(&relay.from_email, &task.recipient, &task.subject, &task.body)
            .with_from_name(&relay.from_name)
            .html(task.is_html);

        let result = {
            let _relay_slot = self.quota.permit(relay.id).await;
            let _worker = Arc::clone(&self.workers).acquire_owned().await;
            match tokio::time::timeout(self.send_timeout, self.transport.send(relay, &message)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::timed_out(self.send_timeout)),
            }
        };

        let error = match result {
            Ok(()) => {
                task.transition(TaskStatus::Sent);
                task.last_error = None;
                debug!(task = task.index, relay = %relay.id, "Sent");
                ctx.events.finished(task, ctx.batch);
                return Attempt::Done;
            }
            Err(e) => e,
        };

        task.record_failure(error.message());
        match error.class() {
            FailureClass::Transient if task.has_attempts_left() => {
                debug!(task = task.index, attempt = task.attempt, "Transient failure, will retry: {error}");
                task.transition(TaskStatus::Pending);
                ctx.events.progress(task, ctx.batch);
                Attempt::Retry
            }
            FailureClass::Transient | FailureClass::Permanent => {
                task.fail(error.message());
                ctx.events.finished(task, ctx.batch);
                Attempt::Done
            }
            FailureClass::RelayBroken => {
                if let Err(e) = self.store.mark_invalid(relay.id, error.message()).await {
                    warn!(relay = %relay.id, "Could not mark relay invalid: {e}");
                }
                if task.has_attempts_left() {
                    Attempt::Reroute(error.message().to_string())
                } else {
                    task.fail(error.message());
                    ctx.events.finished(task, ctx.batch);
                    Attempt::Done
                }
            }
        }
    }

    /// Next usable relay in the selection after `broken`.
    async fn alternative(&self, ctx: &BatchContext, broken: RelayId) -> Option<RelayId> {
        let start = ctx
            .selection
            .iter()
            .position(|id| *id == broken)
            .map_or(0, |p| p + 1);
        let n = ctx.selection.len();

        for step in 0..n {
            let id = ctx.selection[(start + step) % n];
            if id == broken {
                continue;
            }
            if let Some(relay) = self.store.get(id).await
                && relay.is_valid()
                && self.quota.remaining(id).await.unwrap_or(0) > 0
            {
                return Some(id);
            }
        }
        None
    }
}

/// Deals a relay's tasks into `n` lanes, keeping order within each.
fn split_lane(tasks: Vec<SendTask>, n: usize) -> Vec<Vec<SendTask>> {
    if n <= 1 || tasks.len() <= 1 {
        return vec![tasks];
    }
    let mut lanes: Vec<Vec<SendTask>> = (0..n.min(tasks.len())).map(|_| Vec::new()).collect();
    let count = lanes.len();
    for (i, task) in tasks.into_iter().enumerate() {
        lanes[i % count].push(task);
    }
    lanes
}
