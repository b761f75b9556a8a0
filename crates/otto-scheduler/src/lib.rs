//! otto-scheduler: the automation scheduling engine.
//!
//! A fixed-period tick loop loads the automation list, decides which
//! automations are due (direct schedule match or missed-run catch-up),
//! dispatches agent runs, and finalizes run records when the dispatcher
//! reports a terminal status change.

pub mod automations;
pub mod dispatch;
pub mod engine;
pub mod recorder;

pub use automations::AutomationStore;
pub use dispatch::AgentDispatcher;
pub use engine::{AutomationScheduler, CATCHUP_FIRE_CAP};
pub use recorder::{RUN_HISTORY_CAP, RunOutcome, RunRecorder};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] otto_store::StoreError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown automation: {0}")]
    UnknownAutomation(String),
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
