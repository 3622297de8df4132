//! In-process messaging
//!
//! Components exchange events over [`ReplicateQueue`]s: a writer pushes
//! once and every reader observes every element, independently and in push
//! order. Closing the queue terminates all readers with an end-of-stream
//! signal. Writers never block; per-reader buffers are unbounded and
//! pressure is bounded by the rate limiters at the sources.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by queue operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been closed; no further elements will arrive
    #[error("queue closed")]
    Closed,
}

struct Shared<T> {
    readers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// Single-producer/multi-consumer replicated queue
///
/// Cloning the queue clones the writer handle; all clones feed the same
/// reader set.
pub struct ReplicateQueue<T: Clone> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Clone> Clone for ReplicateQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for ReplicateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ReplicateQueue<T> {
    /// Create an empty queue with no readers
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                readers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Push a value, replicating it to every open reader
    ///
    /// Readers that went away are pruned here. With no readers the value
    /// is silently dropped (matching the semantics callers rely on during
    /// startup ordering).
    pub fn push(&self, value: T) -> Result<(), QueueError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(QueueError::Closed);
        }
        shared.readers.retain(|tx| !tx.is_closed());
        match shared.readers.split_last() {
            None => {}
            Some((last, rest)) => {
                for tx in rest {
                    let _ = tx.send(value.clone());
                }
                // the final reader takes the original, saving one clone
                let _ = last.send(value);
            }
        }
        Ok(())
    }

    /// Open a new reader observing everything pushed from now on
    pub fn get_reader(&self) -> RQueue<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        if !shared.closed {
            shared.readers.push(tx);
        }
        // if already closed, tx is dropped here and the reader sees
        // end-of-stream immediately
        RQueue { rx }
    }

    /// Number of currently open readers
    pub fn reader_count(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.readers.retain(|tx| !tx.is_closed());
        shared.readers.len()
    }

    /// Close the queue: all readers see end-of-stream, further pushes fail
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.readers.clear();
    }

    /// Has the queue been closed?
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Reader end of a [`ReplicateQueue`]
pub struct RQueue<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> RQueue<T> {
    /// Await the next element; `Err(Closed)` signals end-of-stream
    pub async fn recv(&mut self) -> Result<T, QueueError> {
        self.rx.recv().await.ok_or(QueueError::Closed)
    }

    /// Non-blocking read, for tests and drain loops
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_reader_sees_all() {
        let queue = ReplicateQueue::new();
        let mut reader = queue.get_reader();
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(reader.recv().await.unwrap(), 1);
        assert_eq!(reader.recv().await.unwrap(), 2);
        assert_eq!(reader.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_every_reader_sees_every_element() {
        let queue = ReplicateQueue::new();
        let mut r1 = queue.get_reader();
        let mut r2 = queue.get_reader();
        queue.push("x".to_string()).unwrap();
        queue.push("y".to_string()).unwrap();
        assert_eq!(r1.recv().await.unwrap(), "x");
        assert_eq!(r2.recv().await.unwrap(), "x");
        assert_eq!(r1.recv().await.unwrap(), "y");
        assert_eq!(r2.recv().await.unwrap(), "y");
    }

    #[tokio::test]
    async fn test_no_readers_drops_silently() {
        let queue = ReplicateQueue::new();
        assert!(queue.push(42u64).is_ok());
        // a reader opened later does not see earlier elements
        let mut reader = queue.get_reader();
        queue.push(43).unwrap();
        assert_eq!(reader.recv().await.unwrap(), 43);
    }

    #[tokio::test]
    async fn test_close_terminates_readers() {
        let queue: ReplicateQueue<u32> = ReplicateQueue::new();
        let mut reader = queue.get_reader();
        queue.push(1).unwrap();
        queue.close();
        assert_eq!(reader.recv().await.unwrap(), 1);
        assert_eq!(reader.recv().await, Err(QueueError::Closed));
        assert_eq!(queue.push(2), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_reader_after_close_ends_immediately() {
        let queue: ReplicateQueue<u32> = ReplicateQueue::new();
        queue.close();
        let mut reader = queue.get_reader();
        assert_eq!(reader.recv().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_readers_are_pruned() {
        let queue = ReplicateQueue::new();
        let r1 = queue.get_reader();
        let _r2 = queue.get_reader();
        assert_eq!(queue.reader_count(), 2);
        drop(r1);
        queue.push(5u32).unwrap();
        assert_eq!(queue.reader_count(), 1);
    }

    #[tokio::test]
    async fn test_order_preserved_under_concurrency() {
        let queue = ReplicateQueue::new();
        let mut reader = queue.get_reader();
        let writer = queue.clone();
        let handle = tokio::spawn(async move {
            for i in 0..100u32 {
                writer.push(i).unwrap();
            }
        });
        handle.await.unwrap();
        for i in 0..100u32 {
            assert_eq!(reader.recv().await.unwrap(), i);
        }
    }
}
