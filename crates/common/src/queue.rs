//! Bounded producer/consumer queue used for per-connection send queues.
//!
//! Producers observe one of four outcomes: the item was queued, the queue is
//! full, the wait for space timed out, or the queue has been shut down.
//! Consumers drain remaining items after shutdown and then observe the end
//! of the stream.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Result of a producer-side push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Success,
    Full,
    Timeout,
    Shutdown,
}

/// Producer half. Cloneable so multiple handlers can enqueue responses.
#[derive(Debug, Clone)]
pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
}

/// Consumer half, owned by a single worker task.
#[derive(Debug)]
pub struct QueueConsumer<T> {
    rx: mpsc::Receiver<T>,
}

/// Create a bounded queue with the given capacity.
pub fn bounded_queue<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");
    let (tx, rx) = mpsc::channel(capacity);
    (QueueProducer { tx }, QueueConsumer { rx })
}

impl<T> QueueProducer<T> {
    /// Queue an item, waiting for space if necessary.
    pub async fn push(&self, item: T) -> PushOutcome {
        match self.tx.send(item).await {
            Ok(()) => PushOutcome::Success,
            Err(_) => PushOutcome::Shutdown,
        }
    }

    /// Queue an item without waiting.
    pub fn try_push(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::Success,
            Err(TrySendError::Full(_)) => PushOutcome::Full,
            Err(TrySendError::Closed(_)) => PushOutcome::Shutdown,
        }
    }

    /// Queue an item, waiting at most `timeout` for space.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> PushOutcome {
        match self.tx.send_timeout(item, timeout).await {
            Ok(()) => PushOutcome::Success,
            Err(SendTimeoutError::Timeout(_)) => PushOutcome::Timeout,
            Err(SendTimeoutError::Closed(_)) => PushOutcome::Shutdown,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.is_closed()
    }

    /// Remaining space before pushes start blocking.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl<T> QueueConsumer<T> {
    /// Receive the next item; `None` once the queue is shut down and drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Receive with a deadline. `Ok(None)` means shut down and drained,
    /// `Err(())` means the deadline passed with the queue still open.
    pub async fn pop_timeout(&mut self, timeout: Duration) -> Result<Option<T>, ()> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(item) => Ok(item),
            Err(_) => Err(()),
        }
    }

    /// Stop accepting new items. Items already queued remain poppable.
    pub fn shutdown(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_limit() {
        let (tx, mut rx) = bounded_queue::<u32>(3);
        for i in 0..3 {
            assert_eq!(tx.try_push(i), PushOutcome::Success);
        }
        assert_eq!(tx.try_push(99), PushOutcome::Full);

        assert_eq!(rx.pop().await, Some(0));
        assert_eq!(tx.try_push(3), PushOutcome::Success);
    }

    #[tokio::test]
    async fn test_push_timeout_on_full_queue() {
        let (tx, _rx) = bounded_queue::<u32>(1);
        assert_eq!(tx.try_push(0), PushOutcome::Success);
        let outcome = tx.push_timeout(1, Duration::from_millis(20)).await;
        assert_eq!(outcome, PushOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_producers_but_drains() {
        let (tx, mut rx) = bounded_queue::<u32>(4);
        tx.try_push(1);
        tx.try_push(2);

        rx.shutdown();
        assert_eq!(tx.try_push(3), PushOutcome::Shutdown);
        assert_eq!(tx.push(4).await, PushOutcome::Shutdown);

        assert_eq!(rx.pop().await, Some(1));
        assert_eq!(rx.pop().await, Some(2));
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn test_consumer_sees_none_when_producers_drop() {
        let (tx, mut rx) = bounded_queue::<u32>(2);
        tx.try_push(7);
        drop(tx);
        assert_eq!(rx.pop().await, Some(7));
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let (_tx, mut rx) = bounded_queue::<u32>(2);
        assert!(rx.pop_timeout(Duration::from_millis(20)).await.is_err());
    }
}
