//! Campaign dispatch.
//!
//! A [`DispatchScheduler`] turns a [`CampaignRequest`] into one [`SendTask`]
//! per recipient, spreads them round-robin over the selected relays and
//! releases them in paced batches. Each task emits [`TaskEvent`]s as it
//! moves, ending in exactly one terminal event.

mod campaign;
mod event;
mod quota;
mod scheduler;
mod sender;

pub use campaign::{
    CampaignId, CampaignRequest, MessageTemplate, Pacing, Priority, RelaySelection, SendTask,
    TaskStatus,
};
pub use event::TaskEvent;
pub use quota::QuotaTracker;
pub use scheduler::{CampaignHandle, CampaignReport, DispatchScheduler};
pub use sender::BatchSender;
