//! SSE event stream — live delivery with replay-on-reconnect.
//!
//! Honors the standard `Last-Event-ID` header: events with a strictly
//! greater ID are replayed before live delivery switches on. Each wire
//! event carries its numeric ID in the `id:` field so a reconnecting
//! client can resume from the last one it saw.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::events::{EventFilter, EventKind};
use crate::tasks::StatusBucket;

use super::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    /// Comma-separated skill list.
    #[serde(default)]
    skills: Option<String>,
    /// Comma-separated event kinds.
    #[serde(default)]
    types: Option<String>,
}

impl EventsQuery {
    fn into_filter(self) -> EventFilter {
        let kinds = self.types.map(|s| {
            s.split(',')
                .filter_map(|t| EventKind::parse(t.trim()))
                .collect::<Vec<_>>()
        });
        let skills = self.skills.map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        });
        EventFilter {
            kinds: kinds.filter(|k| !k.is_empty()),
            status: self.status.as_deref().and_then(StatusBucket::parse),
            platform: self.platform,
            skills: skills.filter(|s| !s.is_empty()),
        }
    }
}

/// GET /a2a/events — open the stream.
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let filter = query.into_filter();
    debug!(?last_event_id, "SSE client subscribing");

    // The subscription unsubscribes on drop, i.e. when the client goes
    // away and the stream is torn down.
    let subscription = state.bus.subscribe(filter, last_event_id);

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let wire = match SseEvent::default()
            .id(event.id.to_string())
            .event(event.kind.as_str())
            .json_data(&event)
        {
            Ok(wire) => wire,
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Failed to encode event");
                SseEvent::default()
                    .id(event.id.to_string())
                    .event(event.kind.as_str())
                    .data("{}")
            }
        };
        Some((Ok::<_, Infallible>(wire), subscription))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
