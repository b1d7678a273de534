//! AgentDesk Store — durable run state, projects and conversation history.

pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use sqlite::SqliteStore;
pub use traits::{ProjectRegistry, StateStore};
pub use types::*;
