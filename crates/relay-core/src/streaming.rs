//! Streaming handle for upstream responses.
//!
//! An [`EventStream`] owns one background task that drains the upstream source
//! into a bounded channel. The consumer sees data items followed by exactly one
//! terminal signal: either a single `Err`, or the end of the stream. Closing or
//! dropping the handle stops the task, so an abandoned stream never leaks its
//! reader.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RelayError;

/// Buffered events between the reader task and the consumer
const STREAM_BUFFER: usize = 64;

/// Typed event stream fed by a single reader task
pub struct EventStream<T> {
    rx: mpsc::Receiver<Result<T, RelayError>>,
    task: JoinHandle<()>,
    terminated: bool,
}

impl<T: Send + 'static> EventStream<T> {
    /// Spawn a reader task over `source`.
    ///
    /// The task stops at the first error, at the end of `source`, or as soon as
    /// the consumer goes away.
    pub fn spawn<S>(source: S) -> Self
    where
        S: Stream<Item = Result<T, RelayError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let task = tokio::spawn(async move {
            let mut source = Box::pin(source);
            loop {
                tokio::select! {
                    () = tx.closed() => {
                        debug!("Stream consumer closed, stopping reader");
                        break;
                    }
                    item = source.next() => match item {
                        Some(Ok(event)) => {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            let _ = tx.send(Err(err)).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            rx,
            task,
            terminated: false,
        }
    }

    /// Build a stream from already materialized items
    pub fn from_items(items: Vec<Result<T, RelayError>>) -> Self {
        Self::spawn(futures::stream::iter(items))
    }
}

impl<T> EventStream<T> {
    /// Receive the next event.
    ///
    /// Returns `None` once the stream has terminated; an `Err` is delivered at
    /// most once and is always the last item.
    pub async fn recv(&mut self) -> Option<Result<T, RelayError>> {
        if self.terminated {
            return None;
        }
        let item = self.rx.recv().await;
        self.observe(item.as_ref());
        item
    }

    /// Stop the reader task and discard anything still buffered
    pub fn close(&mut self) {
        self.terminated = true;
        self.rx.close();
        self.task.abort();
    }

    /// Whether the reader task has exited
    #[must_use]
    pub fn reader_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn observe(&mut self, item: Option<&Result<T, RelayError>>) {
        if matches!(item, None | Some(Err(_))) {
            self.terminated = true;
        }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(item) => {
                this.observe(item.as_ref());
                Poll::Ready(item)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("terminated", &self.terminated)
            .field("reader_finished", &self.task.is_finished())
            .finish()
    }
}
