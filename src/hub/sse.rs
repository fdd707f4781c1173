//! `text/event-stream` push channel.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event as SseEvent, Sse};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use utoipa::IntoParams;

use super::broadcast::Subscription;
use super::frame::Frame;
use super::transport::{ChannelTransport, TRANSPORT_CHANNEL_SIZE};
use crate::auth::{bearer_token, AuthError};
use crate::errors::{ErrorBody, LiveError};
use crate::service::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct EventStreamQuery {
    /// Identity token. `EventSource` cannot set headers, so the query string
    /// is accepted alongside `Authorization: Bearer`.
    pub token: Option<String>,
    /// Comma-separated event types; omitted means all types.
    pub types: Option<String>,
}

/// Subscribe to live events.
#[utoipa::path(
    get,
    path = "/api/events/stream",
    params(EventStreamQuery),
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 401, description = "Missing, invalid or expired token", body = ErrorBody)
    ),
    tag = "events"
)]
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, LiveError> {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(header_token))
        .ok_or(AuthError::Missing)?;
    let identity = state.validator.verify(token)?;

    if let Some(last_seen) = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
    {
        // Delivery is at-most-once; there is nothing to replay from.
        debug!(user_id = %identity.user_id, last_event_id = %last_seen, "[sse] client reconnected");
    }

    let (transport, rx) = ChannelTransport::pair(TRANSPORT_CHANNEL_SIZE);
    let subscription = Subscription::from_query(query.types.as_deref());
    state.hub.register(identity, transport, subscription)?;

    let stream = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((Ok(to_sse_event(frame)), rx))
    });
    Ok(Sse::new(stream))
}

fn to_sse_event(frame: Frame) -> SseEvent {
    match frame {
        Frame::Connected { connection_id } => SseEvent::default()
            .event("connected")
            .data(json!({ "connectionId": connection_id }).to_string()),
        Frame::Event {
            seq,
            event_type,
            data,
        } => SseEvent::default()
            .id(seq.to_string())
            .event(sanitize_event_name(&event_type))
            .data(&*data),
        Frame::Keepalive => SseEvent::default().comment("keepalive"),
        Frame::Closing { reason } => SseEvent::default()
            .event(reason.as_str())
            .data(json!({ "reason": reason.as_str() }).to_string()),
    }
}

/// Event names end up on an `event:` line and cannot contain line breaks.
fn sanitize_event_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect()
}
