//! Offline request queue: bounded FIFO buffering operations while no
//! transport is available.
//!
//! The insertion timer belongs to the driver (it owns time); `enqueue`
//! reports when the queue went from empty to non-empty so the driver can
//! arm it. On expiry the driver freezes the queue and purges every entry
//! with a queue-timeout error.

use std::collections::VecDeque;
use std::time::Duration;

pub(crate) enum Enqueue<T> {
    /// Entry accepted; `start_timer` is set on the empty-to-non-empty
    /// transition when a queue timeout is configured.
    Accepted { start_timer: bool },
    /// Queue frozen or at capacity; the entry is handed back.
    Rejected(T),
}

pub(crate) struct RequestQueue<T> {
    entries: VecDeque<T>,
    capacity: Option<usize>,
    timeout: Option<Duration>,
    frozen: bool,
}

impl<T> RequestQueue<T> {
    pub(crate) fn new(capacity: Option<usize>, timeout: Option<Duration>, frozen: bool) -> Self {
        RequestQueue {
            entries: VecDeque::new(),
            capacity,
            timeout,
            frozen,
        }
    }

    pub(crate) fn enqueue(&mut self, entry: T) -> Enqueue<T> {
        if self.frozen {
            return Enqueue::Rejected(entry);
        }
        if let Some(cap) = self.capacity {
            if self.entries.len() >= cap {
                return Enqueue::Rejected(entry);
            }
        }
        let was_empty = self.entries.is_empty();
        self.entries.push_back(entry);
        Enqueue::Accepted {
            start_timer: was_empty && self.timeout.is_some(),
        }
    }

    /// Drain FIFO, handing every entry to `handler`.
    pub(crate) fn flush(&mut self, mut handler: impl FnMut(T)) {
        while let Some(entry) = self.entries.pop_front() {
            handler(entry);
        }
    }

    /// Drain FIFO into a Vec (for async per-entry handling).
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn thaw(&mut self) {
        self.frozen = false;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = RequestQueue::new(None, None, false);
        for i in 0..5 {
            assert!(matches!(q.enqueue(i), Enqueue::Accepted { .. }));
        }
        let mut out = Vec::new();
        q.flush(|i| out.push(i));
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_rejects() {
        let mut q = RequestQueue::new(Some(2), None, false);
        assert!(matches!(q.enqueue(1), Enqueue::Accepted { .. }));
        assert!(matches!(q.enqueue(2), Enqueue::Accepted { .. }));
        assert!(matches!(q.enqueue(3), Enqueue::Rejected(_)));
    }

    #[test]
    fn freeze_and_thaw() {
        let mut q = RequestQueue::new(None, None, false);
        q.freeze();
        assert!(matches!(q.enqueue(1), Enqueue::Rejected(_)));
        q.thaw();
        assert!(matches!(q.enqueue(1), Enqueue::Accepted { .. }));
    }

    #[test]
    fn starts_frozen_when_queuing_disabled() {
        let mut q = RequestQueue::new(None, None, true);
        assert!(matches!(q.enqueue(1), Enqueue::Rejected(_)));
    }

    #[test]
    fn timer_arms_on_empty_to_nonempty_only() {
        let mut q = RequestQueue::new(None, Some(Duration::from_millis(10)), false);
        match q.enqueue(1) {
            Enqueue::Accepted { start_timer } => assert!(start_timer),
            Enqueue::Rejected(_) => panic!("rejected"),
        }
        match q.enqueue(2) {
            Enqueue::Accepted { start_timer } => assert!(!start_timer),
            Enqueue::Rejected(_) => panic!("rejected"),
        }
        // drained and refilled: arms again
        let _ = q.drain();
        match q.enqueue(3) {
            Enqueue::Accepted { start_timer } => assert!(start_timer),
            Enqueue::Rejected(_) => panic!("rejected"),
        }
    }

    #[test]
    fn no_timer_without_timeout() {
        let mut q = RequestQueue::new(None, None, false);
        match q.enqueue(1) {
            Enqueue::Accepted { start_timer } => assert!(!start_timer),
            Enqueue::Rejected(_) => panic!("rejected"),
        }
    }
}
