//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /api/events`: push stream of pipeline events (`location.recorded`,
//! `locations.cleared`). Each event's SSE name is its `type` field.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

/// `GET /api/events`: SSE event stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.sse_connections.fetch_add(1, Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        state.sse_connections.fetch_sub(1, Ordering::Relaxed);
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }

    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(value) => {
                let event_type = value["type"].as_str().unwrap_or("message").to_string();
                let event = Event::default().event(event_type).data(value.to_string());
                Some((Ok(event), rx))
            }
            Err(RecvError::Lagged(n)) => {
                let event = Event::default()
                    .event("error")
                    .data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                Some((Ok(event), rx))
            }
            Err(RecvError::Closed) => None,
        }
    });

    let stream = CountedStream {
        inner: Box::pin(stream),
        counter: Arc::clone(&state.sse_connections),
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

/// Holds one slot of the SSE connection count until dropped.
struct CountedStream<S> {
    inner: Pin<Box<S>>,
    counter: Arc<AtomicU32>,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for CountedStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for CountedStream<S> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
