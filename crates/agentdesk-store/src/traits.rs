//! Storage contracts consumed by the runtime.

use agentdesk_core::Result;

use crate::types::{Message, Project, RunState};

/// Durable per-project run state.
///
/// Implementations need not serialize writers themselves; the orchestrator
/// guarantees at most one writer per project at a time.
pub trait StateStore: Send + Sync {
    /// Fetch the run state for a project, `None` if it has never run.
    fn get(&self, project_id: &str) -> Result<Option<RunState>>;

    /// Insert or replace the run state keyed by `state.project_id`.
    fn put(&self, state: &RunState) -> Result<()>;

    /// Remove the run state. Returns true if a record existed.
    fn delete(&self, project_id: &str) -> Result<bool>;

    /// Token usage recorded for the project, 0 if it has never run.
    fn latest_token_usage(&self, project_id: &str) -> Result<u64> {
        Ok(self.get(project_id)?.map(|s| s.token_usage).unwrap_or(0))
    }

    /// All records currently flagged active.
    fn list_active(&self) -> Result<Vec<RunState>>;
}

/// Registered projects and their conversation history.
pub trait ProjectRegistry: Send + Sync {
    fn create_project(&self, name: &str) -> Result<Project>;

    fn project_exists(&self, name: &str) -> Result<bool>;

    fn list_projects(&self) -> Result<Vec<Project>>;

    /// Delete a project with its messages and run state.
    fn delete_project(&self, name: &str) -> Result<bool>;

    fn add_message(&self, project: &str, from_agent: bool, text: &str) -> Result<Message>;

    /// Messages in insertion order.
    fn get_messages(&self, project: &str) -> Result<Vec<Message>>;
}
