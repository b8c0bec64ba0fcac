//! Ordered, typed event stream between one task run and one consumer.
//!
//! The producer half ([`EventSink`]) refuses anything after the first
//! terminal event. The consumer half ([`StepStream`]) stops yielding as soon
//! as it is closed, dropped, or has yielded a terminal event, so a `Done`
//! racing with `close()` is discarded silently.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use crate::agent::Action;
use crate::history::StepRecord;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Step {
        step: usize,
        thinking: String,
        action: Action,
        success: bool,
        finished: bool,
    },
    Done {
        message: String,
        steps: usize,
        success: bool,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn step(record: &StepRecord, finished: bool) -> Self {
        StreamEvent::Step {
            step: record.index,
            thinking: record.thinking.clone(),
            action: record.action.clone(),
            success: record.step_success,
            finished,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Step { .. })
    }
}

/// Called for every event handed to the consumer, in delivery order.
pub type Observer = Box<dyn FnMut(&StreamEvent) + Send>;

pub fn channel(cancel: CancellationToken) -> (EventSink, StepStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = EventSink { tx, terminated: false };
    let stream = StepStream {
        rx,
        cancelled: Box::pin(cancel.clone().cancelled_owned()),
        cancel,
        finished: false,
        observer: None,
    };
    (sink, stream)
}

pub struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    terminated: bool,
}

impl EventSink {
    /// Queues `event` for the consumer. Returns false if the event was
    /// refused (stream already terminated) or nobody is listening any more.
    pub fn emit(&mut self, event: StreamEvent) -> bool {
        if self.terminated {
            warn!(event = ?event, "event after terminal event dropped");
            return false;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        if self.tx.send(event).is_err() {
            debug!("consumer detached, event dropped");
            return false;
        }
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

pub struct StepStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
    observer: Option<Observer>,
}

impl StepStream {
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Consumer-side cancellation. The producer stops at its next
    /// checkpoint; nothing is delivered from here on.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.finished = true;
        self.rx.close();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for StepStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.finished = true;
            this.rx.close();
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                if let Some(observer) = this.observer.as_mut() {
                    observer(&event);
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StepStream {
    fn drop(&mut self) {
        // A consumer that walks away is treated like close().
        self.cancel.cancel();
    }
}
