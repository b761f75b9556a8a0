//! Bounded, persisted run history per automation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use otto_store::{KeyLocks, PersistentStore, runs_key};
use otto_types::{RunRecord, RunStatus};

use crate::Result;

/// Run-history entries kept per automation; older entries fall off.
pub const RUN_HISTORY_CAP: usize = 50;

/// Final state applied to a running record.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub summary: Option<String>,
    pub exit_code: Option<i32>,
    pub completed_at: DateTime<Utc>,
}

/// Reads and rewrites per-automation run histories, newest first.
pub struct RunRecorder {
    store: Arc<dyn PersistentStore>,
    locks: Arc<KeyLocks>,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn PersistentStore>, locks: Arc<KeyLocks>) -> Self {
        Self { store, locks }
    }

    /// Load an automation's run history, newest first.
    pub async fn history(&self, automation_id: &str) -> Result<Vec<RunRecord>> {
        self.read_runs(&runs_key(automation_id)).await
    }

    /// Prepend a freshly dispatched run, truncating to the history cap.
    pub async fn record_started(&self, record: RunRecord) -> Result<()> {
        let key = runs_key(&record.automation_id);
        let _guard = self.locks.acquire(&key).await;
        let mut runs = self.read_runs(&key).await?;
        runs.insert(0, record);
        runs.truncate(RUN_HISTORY_CAP);
        self.write_runs(&key, &runs).await
    }

    /// Apply a final outcome to the running record for `agent_id`.
    ///
    /// Returns false when no running record matches: already finalized,
    /// or evicted by the history cap.
    pub async fn finalize(
        &self,
        automation_id: &str,
        agent_id: &str,
        outcome: RunOutcome,
    ) -> Result<bool> {
        let key = runs_key(automation_id);
        let _guard = self.locks.acquire(&key).await;
        let mut runs = self.read_runs(&key).await?;
        let Some(record) = runs
            .iter_mut()
            .find(|r| r.agent_id == agent_id && r.status == RunStatus::Running)
        else {
            return Ok(false);
        };
        record.status = outcome.status;
        record.summary = outcome.summary;
        record.exit_code = outcome.exit_code;
        record.completed_at = Some(outcome.completed_at);
        self.write_runs(&key, &runs).await?;
        Ok(true)
    }

    async fn read_runs(&self, key: &str) -> Result<Vec<RunRecord>> {
        match self.store.read(key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_runs(&self, key: &str, runs: &[RunRecord]) -> Result<()> {
        self.store.write(key, serde_json::to_value(runs)?).await?;
        Ok(())
    }
}
