//! Progress events and the per-job progress channel.
//!
//! Every job owns exactly one channel: the worker pushes [`ProgressEvent`]s
//! into a [`ProgressSender`], the HTTP stream drains the matching
//! [`ProgressReceiver`]. Events are delivered in production order and the
//! sender enforces the terminal guarantee: after an event with
//! `complete = true` nothing else goes through.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One progress frame as seen by the client.
///
/// Terminal events carry `complete = true` and either an `error` (failure)
/// or a success payload, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Percentage in `0.0..=100.0`, non-decreasing within one job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub complete: bool,

    /// Free-form payload keys (`download`, `message`, `count`, ...).
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, JsonValue>,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl ProgressEvent {
    /// Non-terminal status line.
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            status: Some(text.into()),
            ..Self::default()
        }
    }

    /// Non-terminal percentage update.
    pub fn progress(value: f32) -> Self {
        Self {
            progress: Some(value.clamp(0.0, 100.0)),
            ..Self::default()
        }
    }

    /// Non-terminal error report (e.g. one beat of a batch failed).
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Terminal success event with a human-readable message.
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
        .with("message", JsonValue::String(message.into()))
    }

    /// Terminal failure event.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            complete: true,
            ..Self::default()
        }
    }

    /// Attach a payload key.
    pub fn with(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.complete
    }
}

/// Producer half of a job's progress channel.
///
/// `push` never blocks. Once a terminal event has been pushed, later
/// events from the same worker are dropped.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    terminated: Arc<AtomicBool>,
}

impl ProgressSender {
    pub fn push(&self, event: ProgressEvent) {
        if self.terminated.load(Ordering::Acquire) {
            debug!("dropping progress event after terminal: {:?}", event.status);
            return;
        }
        if event.is_terminal() {
            self.terminated.store(true, Ordering::Release);
        }
        // A send failure means the consumer is gone (client disconnected);
        // the worker keeps running to completion regardless.
        if self.tx.send(event).is_err() {
            debug!("progress consumer gone, event discarded");
        }
    }
}

/// What the stream consumer got out of one poll.
#[derive(Debug)]
pub enum NextEvent {
    Event(ProgressEvent),
    /// Nothing arrived within the timeout; emit a keepalive frame.
    KeepAlive,
    /// The producer went away without a terminal event.
    Closed,
}

/// Consumer half of a job's progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Wait up to `timeout` for the next event.
    pub async fn next(&mut self, timeout: Duration) -> NextEvent {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => NextEvent::Event(event),
            Ok(None) => NextEvent::Closed,
            Err(_) => NextEvent::KeepAlive,
        }
    }
}

/// Create the conduit for one job.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        },
        ProgressReceiver { rx },
    )
}
