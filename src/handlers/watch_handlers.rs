//! `GET /watch`: live bucket notifications over Server-Sent Events.
//!
//! Each client gets its own [`WatchSession`]: one backend subscription, one
//! pump task and one SSE response. The pump waits on two sources at once, the
//! next notification and the session's cancellation token. The token is
//! cancelled when the response stream is dropped, which is how a client
//! disconnect reaches the pump, so the subscription never outlives the
//! connection.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    errors::AppError,
    models::event::EventType,
    services::storage_backend::NotificationStream,
    state::AppState,
};
use axum::{
    extract::State,
    http::{HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

const WATCHED_EVENTS: [EventType; 2] = [EventType::ObjectCreated, EventType::ObjectRemoved];

/// Frames queued for a slow client before the pump waits.
const SESSION_BUFFER: usize = 16;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /watch`
pub async fn watch_bucket(State(state): State<AppState>) -> Result<Response, AppError> {
    let subscription = state
        .backend
        .subscribe(&WATCHED_EVENTS)
        .await
        .map_err(|err| {
            error!(error = %err, "Error subscribing to bucket notifications");
            AppError::internal("Failed to watch bucket")
        })?;

    info!(bucket = %state.bucket(), "SSE connection established, watching for bucket events");

    let mut response = Sse::new(WatchSession::open(subscription))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

/// The client-facing half of a watch session.
///
/// Yields SSE frames produced by the pump task. Dropping it cancels the pump,
/// which in turn drops the backend subscription.
pub struct WatchSession {
    frames: ReceiverStream<Event>,
    _cancel_on_drop: DropGuard,
}

impl WatchSession {
    pub fn open(subscription: NotificationStream) -> Self {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let token = CancellationToken::new();

        // The channel is empty, so the greeting always fits and goes out first.
        let _ = tx.try_send(Event::default().comment("connection established"));

        tokio::spawn(pump(subscription, tx, token.clone()));

        Self {
            frames: ReceiverStream::new(rx),
            _cancel_on_drop: token.drop_guard(),
        }
    }
}

impl Stream for WatchSession {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx).map(|frame| frame.map(Ok))
    }
}

/// Forward notifications into `tx` until the client leaves or the
/// subscription fails. One notification becomes exactly one `data:` frame.
async fn pump(
    mut subscription: NotificationStream,
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                info!("SSE client disconnected");
                break;
            }
            next = subscription.next() => next,
        };

        let frame = match next {
            Some(Ok(notification)) => match Event::default().json_data(&notification.records) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "Error marshaling notification");
                    continue;
                }
            },
            Some(Err(err)) => {
                error!(error = %err, "Error in bucket notification");
                let _ = tx.send(error_frame(&err.to_string())).await;
                break;
            }
            None => {
                error!("Bucket notification channel closed");
                let _ = tx.send(error_frame("notification channel closed")).await;
                break;
            }
        };

        if tx.send(frame).await.is_err() {
            debug!("SSE receiver dropped");
            break;
        }
    }
}

fn error_frame(message: &str) -> Event {
    Event::default().event("error").data(message)
}
