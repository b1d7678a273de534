//! AgentDesk — per-project agent run server.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod agent;
mod reaper;
mod routes;
mod state;

use agentdesk_core::AgentDeskConfig;
use agentdesk_runtime::{EventBus, Orchestrator};
use agentdesk_store::SqliteStore;
use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("AGENTDESK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn open_store(config: &AgentDeskConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.data_paths.db)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    info!("Store: {}", store.db_path().display());
    Ok(Arc::new(store))
}

/// Mark runs left active by a previous process as interrupted and exit.
fn recover_offline(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = AgentDeskConfig::from_env(&data_dir)?;
    let store = open_store(&config)?;
    let orchestrator = Orchestrator::new(
        store.clone(),
        store.clone(),
        Arc::new(agent::EchoAgent::new(store)),
        Arc::new(EventBus::new()),
        config.lease_ttl,
    );
    let released = orchestrator.recover_interrupted()?;
    if released.is_empty() {
        println!("No interrupted runs found in {}", data_dir.display());
    } else {
        println!("Released {} interrupted runs:", released.len());
        for project in released {
            println!("  {}", project);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    // Handle CLI subcommands
    if args.len() > 1 {
        match args[1].as_str() {
            "--recover" | "recover" => {
                let data_dir = if args.len() > 2 {
                    PathBuf::from(&args[2])
                } else {
                    resolve_data_dir()
                };
                return recover_offline(data_dir);
            }
            "--help" | "-h" | "help" => {
                println!("AgentDesk — per-project agent run server");
                println!();
                println!("Usage: agentdesk [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  recover [data-dir]       Release runs left active by a crashed server");
                println!("  help                     Show this help message");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'agentdesk help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    // Normal server startup
    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = AgentDeskConfig::from_env(&data_dir)?;
    let port = config.port;
    let store = open_store(&config)?;

    let state = Arc::new(AppState::new(config, store));

    // No run can have survived a restart.
    let released = state.orchestrator.recover_interrupted()?;
    if !released.is_empty() {
        warn!("Released {} runs interrupted by restart: {:?}", released.len(), released);
    }

    reaper::start_reaper(state.clone());

    let app = routes::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("AgentDesk server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
