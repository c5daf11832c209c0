// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Stale-discard channel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::TrySendError;
use log::debug;

/// Send error, handing the rejected item back
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError<T> {
    /// Capacity reached; nothing was evicted.
    #[error("Channel is full")]
    Full(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(item) => item,
        }
    }
}

/// Receive error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// No fresh item arrived before the timeout.
    #[error("Channel is empty")]
    Empty,
}

struct Stamped<T> {
    enqueued_at: Instant,
    item: T,
}

/// Bounded FIFO with consumer-side expiry
///
/// Items are stamped when enqueued. On dequeue, items older than `max_age`
/// are dropped and the next one is examined. Expiry never happens at enqueue
/// time, and a full channel rejects new items instead of evicting old ones.
pub struct StaleDiscardChannel<T> {
    tx: flume::Sender<Stamped<T>>,
    rx: flume::Receiver<Stamped<T>>,
    capacity: usize,
    max_age: Duration,
    discarded: Arc<AtomicU64>,
}

impl<T> Clone for StaleDiscardChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            max_age: self.max_age,
            discarded: self.discarded.clone(),
        }
    }
}

impl<T> StaleDiscardChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            max_age,
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking.
    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        let stamped = Stamped {
            enqueued_at: Instant::now(),
            item,
        };
        self.tx.try_send(stamped).map_err(|e| match e {
            TrySendError::Full(s) | TrySendError::Disconnected(s) => SendError::Full(s.item),
        })
    }

    /// Wait up to `timeout` for an item no older than `max_age`.
    ///
    /// A timeout too large to form a deadline waits without one.
    pub fn receive(&self, timeout: Duration) -> Result<T, RecvError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let stamped = match deadline {
                Some(deadline) => self.rx.recv_deadline(deadline).map_err(|_| RecvError::Empty),
                None => self.rx.recv().map_err(|_| RecvError::Empty),
            }?;
            if let Some(item) = self.admit(stamped) {
                return Ok(item);
            }
        }
    }

    /// Dequeue the first fresh item without waiting.
    pub fn try_receive(&self) -> Result<T, RecvError> {
        loop {
            let stamped = self.rx.try_recv().map_err(|_| RecvError::Empty)?;
            if let Some(item) = self.admit(stamped) {
                return Ok(item);
            }
        }
    }

    fn admit(&self, stamped: Stamped<T>) -> Option<T> {
        let age = stamped.enqueued_at.elapsed();
        if age <= self.max_age {
            Some(stamped.item)
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding stale item ({age:?} > {:?})", self.max_age);
            None
        }
    }

    /// Items currently queued, fresh or not
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Items dropped at dequeue time for being too old
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Outcome of a deduplicating send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued
    Sent,
    /// Identical to the last value sent; not enqueued
    Suppressed,
}

/// Producer-side filter that skips repeats of the last value sent
///
/// The remembered value only changes after a successful enqueue, so a value
/// rejected with `Full` is not suppressed when retried.
pub struct DedupSender<T> {
    channel: StaleDiscardChannel<T>,
    last: Option<T>,
}

impl<T: PartialEq + Clone> DedupSender<T> {
    pub fn new(channel: StaleDiscardChannel<T>) -> Self {
        Self {
            channel,
            last: None,
        }
    }

    pub fn send(&mut self, item: T) -> Result<SendOutcome, SendError<T>> {
        if self.last.as_ref() == Some(&item) {
            return Ok(SendOutcome::Suppressed);
        }
        let remembered = item.clone();
        self.channel.try_send(item)?;
        self.last = Some(remembered);
        Ok(SendOutcome::Sent)
    }

    /// Last value that was enqueued
    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// Forget the last value so the next send always goes through.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let channel = StaleDiscardChannel::new(3, Duration::from_secs(60));
        channel.try_send("a").unwrap();
        channel.try_send("b").unwrap();
        channel.try_send("c").unwrap();
        assert_eq!(channel.try_receive(), Ok("a"));
        assert_eq!(channel.try_receive(), Ok("b"));
        assert_eq!(channel.try_receive(), Ok("c"));
        assert_eq!(channel.try_receive(), Err(RecvError::Empty));
    }

    #[test]
    fn test_full_rejects_without_eviction() {
        let channel = StaleDiscardChannel::new(2, Duration::from_secs(60));
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();
        assert_eq!(channel.try_send(3), Err(SendError::Full(3)));
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.try_receive(), Ok(1));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let channel = StaleDiscardChannel::new(0, Duration::from_secs(1));
        assert_eq!(channel.capacity(), 1);
        channel.try_send(()).unwrap();
    }

    #[test]
    fn test_stale_items_are_skipped() {
        let channel = StaleDiscardChannel::new(4, Duration::from_millis(30));
        channel.try_send("old").unwrap();
        thread::sleep(Duration::from_millis(60));
        channel.try_send("fresh").unwrap();
        assert_eq!(channel.receive(Duration::from_millis(10)), Ok("fresh"));
        assert_eq!(channel.discarded(), 1);
    }

    #[test]
    fn test_only_stale_items_yield_empty() {
        let channel = StaleDiscardChannel::new(4, Duration::from_millis(10));
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(channel.receive(Duration::from_millis(20)), Err(RecvError::Empty));
        assert_eq!(channel.discarded(), 2);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_receive_waits_for_producer() {
        let channel = StaleDiscardChannel::new(1, Duration::from_secs(5));
        let producer = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.try_send(5u8).unwrap();
        });
        assert_eq!(channel.receive(Duration::from_secs(10)), Ok(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_timeout_skips_stale_then_waits() {
        let channel = StaleDiscardChannel::new(4, Duration::from_millis(20));
        channel.try_send(1).unwrap();
        thread::sleep(Duration::from_millis(40));

        let producer = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.try_send(2).unwrap();
        });
        assert_eq!(channel.receive(Duration::MAX), Ok(2));
        assert_eq!(channel.discarded(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_dedup_suppresses_repeats() {
        let channel = StaleDiscardChannel::new(8, Duration::from_secs(60));
        let mut sender = DedupSender::new(channel.clone());
        assert_eq!(sender.send("word"), Ok(SendOutcome::Sent));
        assert_eq!(sender.send("word"), Ok(SendOutcome::Suppressed));
        assert_eq!(sender.send("other"), Ok(SendOutcome::Sent));
        assert_eq!(sender.send("word"), Ok(SendOutcome::Sent));
        assert_eq!(channel.len(), 3);
    }

    #[test]
    fn test_dedup_retries_after_full() {
        let channel = StaleDiscardChannel::new(1, Duration::from_secs(60));
        let mut sender = DedupSender::new(channel.clone());
        sender.send("a").unwrap();
        assert_eq!(sender.send("b"), Err(SendError::Full("b")));
        assert_eq!(sender.last(), Some(&"a"));
        channel.try_receive().unwrap();
        assert_eq!(sender.send("b"), Ok(SendOutcome::Sent));
    }
}
