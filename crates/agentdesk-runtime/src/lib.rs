//! Run orchestrator — decides whether an inbound item starts a fresh run,
//! continues the previous one, or is refused, and dispatches it.
//!
//! At most one run is active per project. The decide-and-mark-active step is
//! serialized per project through [`ProjectLocks`]; the run itself executes on
//! the blocking pool and reports back through [`RunContext`].

pub mod decision;
pub mod locks;
pub mod notify;
pub mod orchestrator;
pub mod task;
pub mod types;

pub use decision::{classify, lease_expired, RunDecision};
pub use locks::ProjectLocks;
pub use notify::{topics, EventBus, Notification, Notifier};
pub use orchestrator::Orchestrator;
pub use task::{RunContext, RunTask};
pub use types::*;
