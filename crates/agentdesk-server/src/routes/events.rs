//! Notification stream — forwards bus events to clients as Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/events", get(stream_events))
}

/// GET /api/events — one SSE event per notification, named after its topic.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    debug!("Event subscriber connected ({} total)", state.bus.subscriber_count());
    state.orchestrator.connected();

    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(notification) => Event::default()
            .event(notification.topic.clone())
            .json_data(&notification.payload)
            .ok()
            .map(Ok::<_, Infallible>),
        Err(e) => {
            // Lagged subscriber: events dropped, keep streaming.
            debug!("Event subscriber lagged: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
