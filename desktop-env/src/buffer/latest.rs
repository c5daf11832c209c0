// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Latest-value slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::callback::Callback;

/// Slot take error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TakeError {
    /// Nothing arrived before the timeout.
    #[error("Slot is empty")]
    Empty,
}

struct Slot<T> {
    value: Mutex<Option<T>>,
    filled: Condvar,
    evicted: AtomicU64,
}

/// Capacity-1 buffer with overwrite-on-full semantics
///
/// `put` never blocks; an occupied slot has its old value evicted first.
/// Cloning yields another handle to the same slot.
pub struct LatestValueSlot<T> {
    inner: Arc<Slot<T>>,
}

impl<T> Clone for LatestValueSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for LatestValueSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestValueSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Slot {
                value: Mutex::new(None),
                filled: Condvar::new(),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Store `item`, returning the value it evicted.
    pub fn put(&self, item: T) -> Option<T> {
        let old = {
            let mut value = self
                .inner
                .value
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            value.replace(item)
        };
        if old.is_some() {
            self.inner.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.filled.notify_one();
        old
    }

    /// Wait up to `timeout` for a value and remove it.
    pub fn take(&self, timeout: Duration) -> Result<T, TakeError> {
        let value = self
            .inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut value, _) = self
            .inner
            .filled
            .wait_timeout_while(value, timeout, |v| v.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        value.take().ok_or(TakeError::Empty)
    }

    /// Remove the value without waiting.
    pub fn try_take(&self) -> Result<T, TakeError> {
        self.inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TakeError::Empty)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of values overwritten before being taken
    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> LatestValueSlot<T> {
    /// Callback that puts every value it receives into this slot.
    pub fn sink(&self) -> Callback<T> {
        let slot = self.clone();
        Arc::new(move |item: T| {
            slot.put(item);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_last_put_wins() {
        let slot = LatestValueSlot::new();
        for n in 0..100 {
            slot.put(n);
        }
        assert_eq!(slot.try_take(), Ok(99));
        assert_eq!(slot.try_take(), Err(TakeError::Empty));
        assert_eq!(slot.evicted(), 99);
    }

    #[test]
    fn test_put_returns_evicted_value() {
        let slot = LatestValueSlot::new();
        assert_eq!(slot.put("first"), None);
        assert_eq!(slot.put("second"), Some("first"));
    }

    #[test]
    fn test_take_times_out_when_empty() {
        let slot: LatestValueSlot<u8> = LatestValueSlot::new();
        let started = Instant::now();
        assert_eq!(slot.take(Duration::from_millis(20)), Err(TakeError::Empty));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_take_wakes_on_put() {
        let slot = LatestValueSlot::new();
        let producer = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.put(42u32);
        });
        assert_eq!(slot.take(Duration::from_secs(10)), Ok(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_sink_feeds_slot() {
        let slot = LatestValueSlot::new();
        let sink = slot.sink();
        sink(1u64).unwrap();
        sink(2u64).unwrap();
        assert!(!slot.is_empty());
        assert_eq!(slot.try_take(), Ok(2));
    }
}
