//! Data types for run state, projects and messages.

use serde::{Deserialize, Serialize};

/// How a run was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Started with no prior conversational context.
    Fresh,
    /// Resumed an existing conversational context.
    Continue,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Continue => "continue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fresh" => Some(Self::Fresh),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record of the most recent run for one project.
///
/// `is_active` and `is_completed` are never both true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub project_id: String,
    pub is_active: bool,
    pub is_completed: bool,
    /// Cumulative token usage for the project; never decreases.
    pub token_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_session: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_session: Option<serde_json::Value>,
    /// Identifier of the most recent dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    /// Last liveness signal from the running task, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl RunState {
    /// A blank record for a project that has never run.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            is_active: false,
            is_completed: false,
            token_usage: 0,
            browser_session: None,
            terminal_session: None,
            run_id: None,
            mode: None,
            heartbeat_at: None,
            last_error: None,
            updated_at: 0,
        }
    }

    /// Whether the stored run id matches `run_id`.
    pub fn is_run(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub created_at: i64,
}

/// One entry in a project's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub project: String,
    pub from_agent: bool,
    pub text: String,
    pub timestamp: i64,
}
