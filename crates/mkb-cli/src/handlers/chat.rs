//! Streaming knowledge-base chat over server-sent events.

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::StreamExt;

use mkb_core::chat::{ChatEvent, ChatRequest, stream_chat};

use super::parse_json;
use crate::serve_cmd::{AppError, AppState};

fn to_event(event: &ChatEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|e| Event::default().data(format!("{{\"error\":\"{e}\"}}")))
}

/// Each event's `data:` line is one JSON payload; the stream ends after a
/// `done` or `error` payload.
pub async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<axum::response::Response, AppError> {
    let request = parse_json(payload)?;
    tracing::info!(tenant_id = %request.tenant_id, "chat stream request");

    let events = stream_chat(state.kb.clone(), state.llm.clone(), state.project.clone(), request)
        .map(|event| Ok::<_, Infallible>(to_event(&event)));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
