//! Tying inference streams to instance leases.
//!
//! A stream produced from a model handle must keep the instance alive for as
//! long as it yields tokens. [`LeasedStream`] carries the [`Lease`] inside the
//! stream and drops it as soon as the stream ends or is dropped, whichever
//! comes first. [`bounded_stream`] does the same behind a bounded channel so a
//! slow consumer applies backpressure to the producer.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio_stream::wrappers::ReceiverStream;

use crate::Result;
use crate::cache::Lease;

/// Default number of items buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

pin_project! {
    /// A stream that holds a [`Lease`] until it is exhausted or dropped.
    pub struct LeasedStream<S, H>
    where
        H: Send,
        H: Sync,
        H: 'static,
    {
        #[pin]
        inner: S,
        lease: Option<Lease<H>>,
    }
}

impl<S, H> LeasedStream<S, H>
where
    H: Send + Sync + 'static,
{
    pub fn new(lease: Lease<H>, inner: S) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }

    /// The lease, until the inner stream has ended.
    pub fn lease(&self) -> Option<&Lease<H>> {
        self.lease.as_ref()
    }
}

impl<S, H> Stream for LeasedStream<S, H>
where
    S: Stream,
    H: Send + Sync + 'static,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(None) = polled {
            // Release the stream slot the moment the producer is done.
            this.lease.take();
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<H: Send + Sync + 'static> Lease<H> {
    /// Move this lease into `inner`; the stream slot is released when the
    /// returned stream ends or is dropped.
    pub fn into_stream<S: Stream>(self, inner: S) -> LeasedStream<S, H> {
        LeasedStream::new(self, inner)
    }
}

/// Drive `inner` on a spawned task that owns `lease`, forwarding items
/// through a bounded channel of `buffer_size`.
///
/// The producer blocks while the channel is full. It stops, and releases the
/// lease, when `inner` ends or the consumer drops the returned stream.
///
/// # Panics
///
/// Requires a tokio runtime context.
pub fn bounded_stream<T, H>(
    lease: Lease<H>,
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
    buffer_size: usize,
) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>>
where
    T: Send + 'static,
    H: Send + Sync + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        while let Some(item) = inner.next().await {
            if tx.send(item).await.is_err() {
                break; // receiver dropped
            }
        }
        // Release the stream slot before the consumer sees the end.
        drop(lease);
    });

    Box::pin(ReceiverStream::new(rx))
}
