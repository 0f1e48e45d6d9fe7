//! Single-slot "latest value wins" handoff between the capture thread and the
//! recognition thread. Publishing never blocks on a slow consumer; a frame that
//! was not taken in time is overwritten and counted as dropped.

use crate::types::Frame;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct LatestSlot<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Mailbox carrying the most recent camera frame.
pub type FrameSlot = LatestSlot<Frame>;

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot { value: None, dropped: 0, closed: false }),
            ready: Condvar::new(),
        }
    }

    /// Store `value`, replacing any value not yet taken.
    ///
    /// Returns `true` if an older value was overwritten. Values published
    /// after [`close`](Self::close) are discarded.
    pub fn publish(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            return false;
        }
        let replaced = slot.value.replace(value).is_some();
        if replaced {
            slot.dropped += 1;
        }
        drop(slot);
        self.ready.notify_one();
        replaced
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).value.take()
    }

    /// Wait up to `timeout` for a value. Returns `None` on timeout or once closed
    /// and drained.
    pub fn wait_take(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of values overwritten before being taken.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).dropped
    }

    /// Wake all waiters and refuse further values.
    pub fn close(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latest_value_wins() {
        let slot = LatestSlot::new();
        assert!(!slot.publish(1));
        assert!(slot.publish(2));
        assert!(slot.publish(3));
        assert_eq!(slot.take(), Some(3));
        assert_eq!(slot.take(), None);
        assert_eq!(slot.dropped(), 2);
    }

    #[test]
    fn test_wait_take_times_out() {
        let slot: LatestSlot<u32> = LatestSlot::new();
        let start = Instant::now();
        assert_eq!(slot.wait_take(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_take_wakes_on_publish() {
        let slot = Arc::new(LatestSlot::new());
        let producer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                slot.publish(7u32);
            })
        };
        assert_eq!(slot.wait_take(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_waiter_and_rejects_values() {
        let slot: Arc<LatestSlot<u32>> = Arc::new(LatestSlot::new());
        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.wait_take(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(!slot.publish(1));
        assert_eq!(slot.take(), None);
        assert!(slot.is_closed());
    }
}
