/// Bounded FIFO of human-readable event lines.
///
/// Producers: the realtime bridge loop and the discovery task.
/// Consumer: the UI poller, which drains the queue on a timer.
///
/// Design goals:
///   - Appends hold the lock only for a push and at most one pop
///   - Bounded: fixed capacity, oldest line dropped on overflow
///   - Switchable: while disabled, producers skip formatting entirely
///     (`is_enabled()` is an atomic load, checked before building a line)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub struct LogQueue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    enabled: AtomicBool,
}

impl LogQueue {
    /// Create a queue retaining at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
            enabled: AtomicBool::new(true),
        }
    }

    // A panicking producer must not take the log down with it.
    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line, evicting the oldest one when over capacity.
    /// No-op while logging is disabled.
    pub fn push(&self, line: impl Into<String>) {
        if !self.is_enabled() {
            return;
        }
        let line = line.into();
        let mut lines = self.lock();
        lines.push_back(line);
        if lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    /// Take every queued line in arrival order, leaving the queue empty.
    pub fn drain(&self) -> Vec<String> {
        let mut lines = self.lock();
        lines.drain(..).collect()
    }

    /// The newest `limit` lines, oldest first, without clearing.
    pub fn snapshot(&self, limit: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::new(crate::DEFAULT_LOG_CAPACITY)
    }
}
