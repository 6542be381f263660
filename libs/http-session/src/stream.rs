//! Push-to-pull bridge for transport callbacks.
//!
//! Producers call [`DataStreamSender::append`] synchronously from any thread.
//! The single consumer either pulls the [`DataStream`] as a
//! [`futures::Stream`] or hands it a callback with [`DataStream::observe`].
//! Values arrive in append order, followed by exactly one terminal signal.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::SessionError;

/// One produced element: a value, normal completion (`Ok(None)`), or failure.
pub type StreamItem<T> = Result<Option<T>, SessionError>;

/// Producer side. Cloning shares the same closed state.
pub struct DataStreamSender<T> {
    // `None` once a terminal item went through.
    queue: Arc<Mutex<Option<UnboundedSender<StreamItem<T>>>>>,
}

impl<T> Clone for DataStreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> DataStreamSender<T> {
    /// Queue an item. Never blocks.
    ///
    /// Returns `false` when the stream is already closed or the consumer is
    /// gone; the item is dropped in that case.
    #[must_use]
    pub fn append(&self, item: StreamItem<T>) -> bool {
        self.push(item)
    }

    /// Queue a value, dropping it silently if the stream is closed.
    pub fn send(&self, value: T) {
        self.push(Ok(Some(value)));
    }

    /// Close the stream normally. A no-op once closed.
    pub fn finish(&self) {
        self.push(Ok(None));
    }

    /// Close the stream with `error`. A no-op once closed.
    pub fn fail(&self, error: SessionError) {
        self.push(Err(error));
    }

    fn push(&self, item: StreamItem<T>) -> bool {
        let mut queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return false;
        };
        let terminal = !matches!(item, Ok(Some(_)));
        let accepted = tx.send(item).is_ok();
        if terminal || !accepted {
            *queue = None;
        }
        accepted
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.lock().as_ref().is_none_or(UnboundedSender::is_closed)
    }
}

impl<T> fmt::Debug for DataStreamSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStreamSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer side of the bridge.
pub struct DataStream<T> {
    rx: UnboundedReceiver<StreamItem<T>>,
    done: bool,
}

impl<T> DataStream<T> {
    #[must_use]
    pub fn channel() -> (DataStreamSender<T>, DataStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DataStreamSender {
                queue: Arc::new(Mutex::new(Some(tx))),
            },
            DataStream { rx, done: false },
        )
    }

    /// A stream that is already complete.
    #[must_use]
    pub fn finished() -> Self {
        let (tx, stream) = Self::channel();
        tx.finish();
        stream
    }

    /// Receive the next item, synthesizing completion when all producers
    /// vanished without a terminal item.
    pub async fn next_item(&mut self) -> StreamItem<T> {
        if self.done {
            return Ok(None);
        }
        let item = self.rx.recv().await.unwrap_or(Ok(None));
        if !matches!(item, Ok(Some(_))) {
            self.done = true;
            self.rx.close();
        }
        item
    }

    /// Collect every remaining value.
    ///
    /// # Errors
    /// The terminal failure, if the producer failed the stream.
    pub async fn drain(self) -> Result<Vec<T>, SessionError> {
        self.try_collect().await
    }
}

impl<T: Send + 'static> DataStream<T> {
    /// Switch to dispatch mode: buffered items are replayed to `callback`,
    /// then live items are forwarded as they are appended.
    ///
    /// The callback sees zero or more `Ok(Some(_))` followed by exactly one
    /// `Ok(None)` or `Err(_)`. Must be called within a tokio runtime.
    pub fn observe<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(StreamItem<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let item = self.next_item().await;
                let terminal = !matches!(item, Ok(Some(_)));
                callback(item);
                if terminal {
                    break;
                }
            }
        })
    }
}

impl<T> Stream for DataStream<T> {
    type Item = Result<T, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(Some(value)))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(None)) | None) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(None)
            }
        }
    }
}

impl<T> fmt::Debug for DataStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
