//! Bounded ring of recent driver events.
//!
//! Drivers record each primitive they issue. When a call fails the ring is
//! flushed to `tracing`, so the log shows what led up to the failure without
//! paying for per-call info logging.

use crate::error::{ErrorClass, StorageError};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of events kept per driver.
pub const DEFAULT_RING_CAPACITY: usize = 20;

/// A single recorded driver event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    /// Primitive name (`write_file`, `rename`, ...).
    pub op: &'static str,
    /// Path the primitive addressed.
    pub path: String,
}

/// A bounded FIFO of recent driver events.
#[derive(Debug)]
pub struct DiagnosticRing {
    capacity: usize,
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

impl Default for DiagnosticRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl DiagnosticRing {
    /// Creates a ring keeping at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Records an event, evicting the oldest one when full.
    pub fn record(&self, op: &'static str, path: impl Into<String>) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(DiagnosticEvent {
            op,
            path: path.into(),
        });
    }

    /// Returns a copy of the recorded events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Number of events currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if no events are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Logs and clears the ring because `err` was returned by `driver`.
    ///
    /// Not-found and conflict outcomes are expected during normal operation
    /// and are not flushed.
    pub fn flush_on_error(&self, driver: &str, err: &StorageError) {
        let class = err.class();
        if matches!(class, ErrorClass::NotFound | ErrorClass::Conflict) {
            return;
        }
        let events: Vec<DiagnosticEvent> = self.events.lock().drain(..).collect();
        match class {
            ErrorClass::ProgrammerError | ErrorClass::CorruptResponse => {
                tracing::error!(driver, error = %err, ?class, "driver call failed");
            }
            _ => tracing::warn!(driver, error = %err, ?class, "driver call failed"),
        }
        for (i, event) in events.iter().enumerate() {
            tracing::debug!(driver, seq = i, op = event.op, path = %event.path, "recent driver event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let ring = DiagnosticRing::new(2);
        ring.record("write_file", "a");
        ring.record("write_file", "b");
        ring.record("unlink", "c");

        let events = ring.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, "b");
        assert_eq!(events[1].op, "unlink");
    }

    #[test]
    fn flush_clears_on_transient() {
        let ring = DiagnosticRing::default();
        ring.record("read_file", "x");
        ring.flush_on_error("memory", &StorageError::transient("boom"));
        assert!(ring.is_empty());
    }

    #[test]
    fn not_found_is_not_flushed() {
        let ring = DiagnosticRing::default();
        ring.record("read_file", "x");
        ring.flush_on_error("memory", &StorageError::not_found("x"));
        assert_eq!(ring.len(), 1);
    }
}
