//! Run task contract and the handle a running task reports through.

use std::sync::Arc;

use agentdesk_core::Result;
use agentdesk_store::{RunState, StateStore};
use tracing::{debug, warn};

use crate::locks::ProjectLocks;
use crate::notify::Notifier;
use crate::types::{now_millis, RunInput};

/// Executes one unit of agent work. Called on the blocking pool; a returned
/// error leaves the project resumable.
///
/// The orchestrator renews the run's lease while the task executes, so a task
/// may take as long as it needs without calling [`RunContext::heartbeat`].
pub trait RunTask: Send + Sync + 'static {
    /// Start a run with no prior conversational context.
    fn start_fresh(&self, input: &RunInput, ctx: &RunContext) -> Result<()>;

    /// Resume the project's existing conversation.
    fn continue_prior(&self, input: &RunInput, ctx: &RunContext) -> Result<()>;

    /// Whether there is conversation context a failed run could resume from.
    fn has_context(&self, _project_id: &str) -> bool {
        true
    }
}

/// Handle through which a dispatched run updates its project's state.
///
/// Every write takes the project lock and is dropped once the run has been
/// superseded, so a stale run can never clobber a newer one.
pub struct RunContext {
    project_id: String,
    run_id: String,
    store: Arc<dyn StateStore>,
    locks: Arc<ProjectLocks>,
    notifier: Arc<dyn Notifier>,
}

impl RunContext {
    pub(crate) fn new(
        project_id: String,
        run_id: String,
        store: Arc<dyn StateStore>,
        locks: Arc<ProjectLocks>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            project_id,
            run_id,
            store,
            locks,
            notifier,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Renew the lease now. Returns false if this run no longer owns the
    /// project.
    pub fn heartbeat(&self) -> Result<bool> {
        self.update(|_| {})
    }

    pub fn add_token_usage(&self, tokens: u64) -> Result<bool> {
        self.update(|state| state.token_usage = state.token_usage.saturating_add(tokens))
    }

    pub fn set_browser_session(&self, session: serde_json::Value) -> Result<bool> {
        self.update(|state| state.browser_session = Some(session))
    }

    pub fn set_terminal_session(&self, session: serde_json::Value) -> Result<bool> {
        self.update(|state| state.terminal_session = Some(session))
    }

    /// Publish an event on behalf of the run. Failures are logged only.
    pub fn notify(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.notifier.publish(topic, payload) {
            warn!("Run {} failed to publish {}: {}", self.run_id, topic, e);
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RunState)) -> Result<bool> {
        self.locks.with_lock(&self.project_id, || -> Result<bool> {
            let mut state = match self.store.get(&self.project_id)? {
                Some(s) if s.is_active && s.is_run(&self.run_id) => s,
                _ => {
                    debug!(
                        "Run {} superseded for {}; update dropped",
                        self.run_id, self.project_id
                    );
                    return Ok(false);
                }
            };
            apply(&mut state);
            let now = now_millis();
            state.heartbeat_at = Some(now);
            state.updated_at = now;
            self.store.put(&state)?;
            Ok(true)
        })
    }
}
