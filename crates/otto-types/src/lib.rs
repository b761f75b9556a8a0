use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Automation Types ────────────────────

/// What to do about fire instants that elapsed while the scheduler
/// was not running.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MissedRunPolicy {
    /// Skip missed fires entirely.
    #[default]
    Ignore,
    /// Fire once, no matter how many instants were missed.
    RunOnce,
    /// Fire once per missed instant, up to the catch-up cap.
    RunAll,
}

/// Options forwarded to the agent dispatcher with each run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Model ID override (dispatcher default if None).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Orchestrator profile to run under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<String>,
    /// Run without orchestrator supervision.
    #[serde(default)]
    pub free_agent: bool,
}

/// A user-declared recurring automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique automation ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Cron expression (e.g. "0 9 * * 1" for Mondays at 09:00).
    pub schedule: String,
    /// Prompt text sent to the agent on each fire.
    pub prompt: String,
    /// Dispatch options for agent runs.
    #[serde(default)]
    pub options: DispatchOptions,
    /// Whether the scheduler considers this automation at all.
    pub enabled: bool,
    /// Catch-up behavior for fires missed while the scheduler was down.
    #[serde(default)]
    pub missed_run_policy: MissedRunPolicy,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent fire. Only the scheduler writes this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

// ──────────────────── Run History Types ────────────────────

/// Lifecycle state of a recorded run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Dispatched, no terminal status seen yet.
    Running,
    /// Agent finished normally.
    Completed,
    /// Agent finished with an error.
    Failed,
}

/// One dispatched agent run belonging to an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Agent ID returned by the dispatcher.
    pub agent_id: String,
    /// Owning automation ID.
    pub automation_id: String,
    /// Dispatch time.
    pub started_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Agent output summary, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Process exit code, set on completion when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ──────────────────── Dispatcher Types ────────────────────

/// Lifecycle status the dispatcher reports for an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Actively working on a run.
    Running,
    /// Idle after finishing normally.
    Sleeping,
    /// Stopped after a failure.
    Error,
}

/// A status transition for a dispatched agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    /// Agent the transition belongs to.
    pub agent_id: String,
    /// New status.
    pub status: AgentStatus,
    /// Status before the transition.
    pub prev_status: AgentStatus,
}

impl StatusChange {
    /// Final run status if this transition ends a run: running to
    /// sleeping is a normal completion, running to error a failure.
    /// Any other transition is not terminal.
    pub fn terminal_outcome(&self) -> Option<RunStatus> {
        if self.prev_status != AgentStatus::Running {
            return None;
        }
        match self.status {
            AgentStatus::Sleeping => Some(RunStatus::Completed),
            AgentStatus::Error => Some(RunStatus::Failed),
            AgentStatus::Running => None,
        }
    }
}

/// Completion details the dispatcher retains for a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRun {
    /// Agent ID of the finished run.
    pub id: String,
    /// Output summary, when the agent produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Process exit code, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

// ──────────────────── Scheduler Types ────────────────────

/// Precision of the same-minute duplicate-fire guard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPrecision {
    /// Compare calendar fields (minute, hour, day, month, year) of the
    /// last fire against now.
    #[default]
    CalendarMinute,
    /// Compare whole minutes since the Unix epoch.
    EpochMinute,
}
