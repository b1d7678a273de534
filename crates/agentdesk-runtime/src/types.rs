//! Runtime types.

use agentdesk_store::RunMode;
use serde::{Deserialize, Serialize};

/// One inbound work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    pub text: String,
    pub model_id: String,
    pub project_id: String,
    pub search_engine_id: String,
}

impl RunInput {
    pub fn new(text: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_id: String::new(),
            project_id: project_id.into(),
            search_engine_id: String::new(),
        }
    }
}

/// Result of a successful submit: the run that was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub run_id: String,
    pub mode: RunMode,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
