use std::collections::VecDeque;

use crate::operation::{Operation, PendingOperation};

/// The per-session operation queue.
///
/// Entries leave in submission order. A disconnect jumps to the front and evicts everything it
/// overtakes. Before the session is ready only lifecycle entries are eligible; application
/// entries wait in place.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    entries: VecDeque<PendingOperation>,
}

impl OperationQueue {
    pub fn push(&mut self, entry: PendingOperation) {
        tracing::trace!(seq = entry.seq, operation = ?entry.operation, "queued");
        self.entries.push_back(entry);
    }

    /// Puts a disconnect at the front of the queue.
    ///
    /// Returns the entries that were waiting behind it, which will never be dispatched.
    pub fn push_disconnect(&mut self, entry: PendingOperation) -> Vec<PendingOperation> {
        debug_assert!(matches!(entry.operation, Operation::Disconnect));
        let displaced = self.entries.drain(..).collect();
        self.entries.push_front(entry);
        displaced
    }

    /// Removes the next entry that may be dispatched.
    pub fn pop_next(&mut self, ready: bool) -> Option<PendingOperation> {
        let index = if ready {
            0
        } else {
            self.entries.iter().position(|entry| entry.lifecycle)?
        };
        self.entries.remove(index)
    }

    /// Removes every entry.
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
