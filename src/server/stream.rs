//! SSE encoding of a job's progress channel.

use axum::response::sse::{Event, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::error;

use crate::events::{NextEvent, ProgressReceiver};

/// Silence window after which a comment frame keeps the connection warm.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

fn event_stream(mut rx: ProgressReceiver) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.next(KEEPALIVE_INTERVAL).await {
                NextEvent::Event(event) => {
                    let terminal = event.is_terminal();
                    match Event::default().json_data(&event) {
                        Ok(frame) => yield Ok(frame),
                        Err(e) => {
                            error!("unencodable progress event: {e}");
                            break;
                        }
                    }
                    if terminal {
                        break;
                    }
                }
                NextEvent::KeepAlive => {
                    yield Ok(Event::default().comment("keepalive"));
                }
                NextEvent::Closed => break,
            }
        }
    }
}

/// Stream a job's progress to the client, one JSON object per frame.
///
/// The stream closes right after the terminal frame, or when the
/// producer vanishes.
pub fn sse_response(rx: ProgressReceiver) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(rx))
}
