use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

/// Per-provider mapping from correlation identifier to message uuid.
///
/// Identifiers are assigned from a wrapping 32-bit counter; an entry is
/// published before the provider submission that will complete it, and
/// removed exactly once when the completion is processed. The counter skips
/// identifiers that are still live, so a wrap cannot collide with an
/// in-flight message.
pub struct CorrelationTable {
    next: AtomicU32,
    entries: Mutex<HashMap<u32, Uuid>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh identifier for `message` and publish the mapping.
    pub fn assign(&self, message: Uuid) -> u32 {
        loop {
            let ident = self.next.fetch_add(1, Ordering::Relaxed);
            let mut entries = self.entries.lock().expect("correlation table poisoned");
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(ident) {
                slot.insert(message);
                return ident;
            }
        }
    }

    /// Remove and return the message for `ident`, if registered.
    pub fn take(&self, ident: u32) -> Option<Uuid> {
        self.entries
            .lock()
            .expect("correlation table poisoned")
            .remove(&ident)
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .expect("correlation table poisoned")
            .len()
    }
}
