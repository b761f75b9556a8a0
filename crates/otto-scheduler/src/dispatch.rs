//! Agent dispatch interface consumed by the scheduler.

use async_trait::async_trait;
use otto_types::{CompletedRun, DispatchOptions};

/// Dispatches agent runs on behalf of the scheduler.
///
/// Implementations report lifecycle transitions as
/// [`otto_types::StatusChange`] values on the channel sender they are
/// constructed with; the scheduler consumes the paired receiver. Use
/// `&self` for all methods; implementations should use interior
/// mutability for mutable state.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Start one agent run and return its agent ID.
    async fn run_quick(&self, prompt: &str, options: &DispatchOptions) -> anyhow::Result<String>;

    /// Completion details for finished runs, newest first.
    async fn list_completed(&self) -> Vec<CompletedRun>;

    /// Terminate an in-flight run.
    async fn kill(&self, agent_id: &str) -> anyhow::Result<()>;
}
