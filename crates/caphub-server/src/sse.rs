//! Server-sent events for run streams.
//!
//! Each event is `event: <name>\ndata: <json>\n\n`. The stream closes on
//! any terminal status; a subscriber joining after the run finished gets
//! the synthesized terminal event and an immediate close.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use caphub::{HubEvent, Run, RunStatus};
use caphub_contract::bus::BusSubscription;
use caphub_contract::HubError;
use std::convert::Infallible;
use tracing::debug;

fn frame(name: &str, data: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {name}\ndata: {data}\n\n"))
}

fn frame_event(event: &HubEvent) -> Option<Bytes> {
    event.sse_name().map(|name| frame(name, &event.sse_payload()))
}

/// Synthesize the terminal event for a run that already finished.
fn terminal_event(run: &Run) -> Option<HubEvent> {
    let error = || {
        run.error
            .clone()
            .unwrap_or_else(|| HubError::execution_failed("run failed"))
    };
    match run.status {
        RunStatus::Completed => Some(HubEvent::RunCompleted {
            run_id: run.run_id.clone(),
            response: run
                .output
                .as_ref()
                .map(|o| o.response.clone())
                .unwrap_or_default(),
            usage: run.usage,
        }),
        RunStatus::Failed => Some(HubEvent::RunFailed {
            run_id: run.run_id.clone(),
            error: error(),
        }),
        RunStatus::Cancelled => Some(HubEvent::RunCancelled {
            run_id: run.run_id.clone(),
            error: error(),
        }),
        RunStatus::Timeout => Some(HubEvent::RunTimeout {
            run_id: run.run_id.clone(),
            error: error(),
        }),
        _ => None,
    }
}

/// Build the SSE response for a run.
///
/// The subscription must have been opened before the run snapshot was
/// taken, so a terminal transition between the two is never lost.
pub fn run_event_stream(run: Run, mut subscription: BusSubscription) -> Response {
    let stream = async_stream::stream! {
        if let Some(event) = terminal_event(&run) {
            if let Some(chunk) = frame_event(&event) {
                yield Ok::<Bytes, Infallible>(chunk);
            }
            return;
        }

        while let Some(event) = subscription.recv().await {
            let terminal = event.is_terminal();
            if let Some(chunk) = frame_event(&event) {
                yield Ok::<Bytes, Infallible>(chunk);
            }
            if terminal {
                debug!(run_id = %run.run_id, "run stream closed");
                return;
            }
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}
