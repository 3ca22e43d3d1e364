//! Ordered event delivery with a separately awaitable final result.
//!
//! [`event_channel`] returns three halves:
//! - [`EventSender`] pushes events and eventually ends the channel with one
//!   terminal event plus the final result
//! - [`EventStream`] yields events in push order and finishes after the terminal one
//! - [`EventResult`] resolves with the final result, independently of whether
//!   anyone drains the stream
//!
//! Events are buffered without bound, so a slow consumer never stalls the producer.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Result, StrandError};

struct ChannelState<E, R> {
    events: Option<mpsc::UnboundedSender<E>>,
    result: Option<oneshot::Sender<R>>,
}

/// Producer half. Clones share one queue.
pub struct EventSender<E, R> {
    state: Arc<Mutex<ChannelState<E, R>>>,
}

impl<E, R> Clone for EventSender<E, R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Consumer half: a FIFO stream of events.
pub struct EventStream<E> {
    inner: UnboundedReceiverStream<E>,
}

/// Final-result half.
pub struct EventResult<R> {
    rx: oneshot::Receiver<R>,
}

/// Create a connected sender, stream, and result.
pub fn event_channel<E, R>() -> (EventSender<E, R>, EventStream<E>, EventResult<R>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();
    (
        EventSender {
            state: Arc::new(Mutex::new(ChannelState {
                events: Some(events_tx),
                result: Some(result_tx),
            })),
        },
        EventStream {
            inner: UnboundedReceiverStream::new(events_rx),
        },
        EventResult { rx: result_rx },
    )
}

impl<E, R> EventSender<E, R> {
    fn lock(&self) -> MutexGuard<'_, ChannelState<E, R>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push one event.
    ///
    /// Fails with [`StrandError::ChannelClosed`] once [`end`](Self::end) has run.
    /// A consumer that dropped its stream is not an error; the event is discarded.
    pub fn push(&self, event: E) -> Result<()> {
        let state = self.lock();
        let Some(events) = state.events.as_ref() else {
            return Err(StrandError::ChannelClosed);
        };
        let _ = events.send(event);
        Ok(())
    }

    /// Push the terminal event, close the stream and resolve the final result.
    pub fn end(&self, terminal: E, result: R) -> Result<()> {
        let mut state = self.lock();
        let (Some(events), Some(result_tx)) = (state.events.take(), state.result.take()) else {
            return Err(StrandError::ChannelClosed);
        };
        let _ = events.send(terminal);
        drop(events);
        let _ = result_tx.send(result);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().events.is_none()
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<R> EventResult<R> {
    /// Wait for the final result.
    ///
    /// Fails with [`StrandError::ChannelClosed`] if every sender was dropped
    /// without calling `end`.
    pub async fn wait(self) -> Result<R> {
        self.rx.await.map_err(|_| StrandError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn buffers_events_until_pulled_in_order() {
        let (tx, stream, result) = event_channel::<u32, &'static str>();
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.end(3, "done").unwrap();

        let events: Vec<u32> = stream.collect().await;
        assert_eq!(events, vec![1, 2, 3]);
        assert_eq!(result.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn delivers_to_waiting_consumer() {
        let (tx, mut stream, _result) = event_channel::<u32, ()>();
        let consumer = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        tx.push(7).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn push_after_end_is_an_error() {
        let (tx, _stream, _result) = event_channel::<u32, ()>();
        let clone = tx.clone();
        tx.end(0, ()).unwrap();

        assert!(matches!(clone.push(1), Err(StrandError::ChannelClosed)));
        assert!(matches!(tx.end(2, ()), Err(StrandError::ChannelClosed)));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn result_resolves_without_draining_stream() {
        let (tx, stream, result) = event_channel::<u32, u32>();
        tx.push(1).unwrap();
        tx.end(2, 42).unwrap();
        assert_eq!(result.wait().await.unwrap(), 42);
        drop(stream);
    }

    #[tokio::test]
    async fn dropping_all_senders_fails_the_result() {
        let (tx, stream, result) = event_channel::<u32, u32>();
        tx.push(1).unwrap();
        drop(tx);
        let events: Vec<u32> = stream.collect().await;
        assert_eq!(events, vec![1]);
        assert!(matches!(result.wait().await, Err(StrandError::ChannelClosed)));
    }

    #[tokio::test]
    async fn push_succeeds_after_consumer_dropped() {
        let (tx, stream, result) = event_channel::<u32, u32>();
        drop(stream);
        tx.push(1).unwrap();
        tx.end(2, 5).unwrap();
        assert_eq!(result.wait().await.unwrap(), 5);
    }
}
