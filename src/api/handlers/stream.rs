//! Live stream of rows, analysis announcements and heartbeats (SSE)

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};

use super::ApiState;
use crate::broadcast::StreamEvent;

fn to_sse(event: &StreamEvent) -> Event {
    let json = event.to_json().unwrap_or_default();
    Event::default().event(event.event_name()).data(json)
}

/// GET /api/v1/stream - Subscribe to the live stream
///
/// Event names: `row`, `analysis`, `heartbeat`. The stream ends when the
/// broadcaster drops this subscriber (queue overflow).
pub async fn stream_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    tracing::debug!(subscriber = subscription.id, "SSE client connected");

    let stream = stream::unfold(subscription.rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(to_sse(&event)), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive).text("ping"))
}
