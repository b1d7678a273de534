//! Development run task: records the conversation and answers with an echo.

use std::sync::Arc;

use agentdesk_core::Result;
use agentdesk_runtime::{topics, RunContext, RunInput, RunTask};
use agentdesk_store::ProjectRegistry;
use tracing::debug;

/// Stand-in agent used when no real executor is wired in.
pub struct EchoAgent {
    projects: Arc<dyn ProjectRegistry>,
}

impl EchoAgent {
    pub fn new(projects: Arc<dyn ProjectRegistry>) -> Self {
        Self { projects }
    }

    fn respond(&self, input: &RunInput, ctx: &RunContext, resumed: bool) -> Result<()> {
        self.projects.add_message(&input.project_id, false, &input.text)?;

        let reply = if resumed {
            format!("Continuing where we left off: {}", input.text)
        } else {
            format!("Starting a new plan for: {}", input.text)
        };

        let tokens = (input.text.split_whitespace().count() + reply.split_whitespace().count()) as u64;
        ctx.add_token_usage(tokens)?;
        ctx.set_terminal_session(serde_json::json!({
            "title": "Terminal",
            "command": format!("echo {:?}", input.text),
            "output": reply,
            "model": input.model_id,
            "search_engine": input.search_engine_id,
        }))?;

        let message = self.projects.add_message(&input.project_id, true, &reply)?;
        ctx.notify(
            topics::AGENT_MESSAGE,
            serde_json::json!({ "project": input.project_id, "message": message }),
        );
        debug!("EchoAgent answered run {} ({} tokens)", ctx.run_id(), tokens);
        Ok(())
    }
}

impl RunTask for EchoAgent {
    fn start_fresh(&self, input: &RunInput, ctx: &RunContext) -> Result<()> {
        self.respond(input, ctx, false)
    }

    fn continue_prior(&self, input: &RunInput, ctx: &RunContext) -> Result<()> {
        self.respond(input, ctx, true)
    }

    fn has_context(&self, project_id: &str) -> bool {
        self.projects
            .get_messages(project_id)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }
}
