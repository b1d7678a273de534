//! Background lease reaper — releases projects whose run stopped heartbeating.

use std::sync::Arc;

use tracing::{error, info};

use crate::state::AppState;

/// Start the periodic reaper task.
pub fn start_reaper(state: Arc<AppState>) {
    let period = state.config.reap_interval;

    tokio::spawn(async move {
        info!(
            "Lease reaper started: every {}s, ttl {}s",
            period.as_secs(),
            state.orchestrator.lease_ttl().as_secs()
        );
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; startup recovery already ran.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let orchestrator = state.orchestrator.clone();
            match tokio::task::spawn_blocking(move || orchestrator.reap_stale()).await {
                Ok(Ok(released)) if !released.is_empty() => {
                    info!("Reaped {} stale runs: {:?}", released.len(), released);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Lease reaper failed: {}", e),
                Err(e) => error!("Lease reaper task panicked: {}", e),
            }
        }
    });
}
