//! Pending-event buffer for an event sink

use crate::payload::Payload;
use parking_lot::Mutex;

/// Thread-safe bounded buffer of payloads awaiting a flush
///
/// The buffer never evicts. The push that fills it takes the whole batch in
/// the same critical section, and [`EventBuffer::take_all`] swaps the
/// contents for an empty vector in one step, so a batch is never sent twice.
pub struct EventBuffer {
    events: Mutex<Vec<Payload>>,
    capacity: usize,
}

impl EventBuffer {
    /// Create a new buffer with the given capacity (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(Vec::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Append one payload and, if that fills the buffer, take everything in
    /// the same critical section
    ///
    /// Concurrent callers can never push past capacity or take the same
    /// batch twice.
    pub fn push_and_take_if_full(&self, payload: Payload) -> Option<Vec<Payload>> {
        let mut events = self.events.lock();
        events.push(payload);

        if events.len() < self.capacity {
            return None;
        }
        Some(std::mem::take(&mut *events))
    }

    /// Take every buffered payload, leaving the buffer empty
    pub fn take_all(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
