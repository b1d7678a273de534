//! AgentDesk Core — error taxonomy and configuration.

pub mod config;
pub mod error;

pub use config::{AgentDeskConfig, DataPaths};
pub use error::{Error, Result};
