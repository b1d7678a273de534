//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Models advertised by `/api/data` when `AGENTDESK_MODELS` is unset.
pub const DEFAULT_MODELS: &[&str] = &["gpt-4o", "claude-sonnet-4-20250514", "llama-3.3-70b-versatile"];

/// Search engines a run may be configured with.
pub const SEARCH_ENGINES: &[&str] = &["Bing", "Google", "DuckDuckGo"];

/// Paths to all AgentDesk data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database directory (`data/db/`).
    pub db: PathBuf,
    /// Per-project working directories (`data/projects/`).
    pub projects: PathBuf,
    /// Log output (`data/logs/`).
    pub logs: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            projects: root.join("projects"),
            logs: root.join("logs"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.projects)?;
        std::fs::create_dir_all(&self.logs)?;
        Ok(())
    }
}

/// Top-level AgentDesk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeskConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// How long an active run may go without a heartbeat before it is
    /// considered stale.
    pub lease_ttl: Duration,
    /// How often the background reaper looks for stale runs.
    pub reap_interval: Duration,
    /// Model identifiers advertised to clients.
    pub models: Vec<String>,
}

impl AgentDeskConfig {
    /// Create configuration from environment and defaults.
    ///
    /// Fails with [`Error::Config`] when the lease TTL is zero.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let port = env_parse("PORT").unwrap_or(1337);
        let lease_secs = env_parse("AGENTDESK_LEASE_TTL_SECS").unwrap_or(300);
        let reap_secs = env_parse("AGENTDESK_REAP_INTERVAL_SECS").unwrap_or(30);

        let models = std::env::var("AGENTDESK_MODELS")
            .ok()
            .map(|raw| parse_models(&raw))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect());

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            port,
            data_paths,
            lease_ttl: lease_ttl(lease_secs)?,
            reap_interval: Duration::from_secs(reap_secs.max(1)),
            models,
        })
    }
}

fn lease_ttl(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::Config(
            "AGENTDESK_LEASE_TTL_SECS must be greater than zero".into(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn parse_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}
