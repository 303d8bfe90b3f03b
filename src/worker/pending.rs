//! Request correlation bookkeeping.
//!
//! Every in-flight request owns exactly one entry in a [`PendingTable`]. The
//! entry is removed exactly once: by the matching response, by the timeout, by
//! the caller dropping its future, or by worker termination. Whoever removes
//! it settles it; everyone else observes it absent and does nothing.

use crate::error::ForkError;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Final outcome of a single invocation.
pub type Outcome = Result<Value, ForkError>;

/// Largest id before wrapping. Every JSON peer can represent it exactly.
pub const MAX_REQUEST_ID: u64 = (1 << 53) - 1;

/// Monotonic request id counter that wraps back to 0 at [`MAX_REQUEST_ID`].
///
/// The first id handed out is 1, and the first id after a wrap is also 1.
/// A wrap does not check for collisions with still-pending low ids.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: u64,
}

impl RequestIds {
    #[cfg(test)]
    /// Start counting after `last`.
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn next_id(&mut self) -> u64 {
        if self.last >= MAX_REQUEST_ID {
            self.last = 0;
        }
        self.last += 1;
        self.last
    }
}

/// Continuations of in-flight requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<u64, oneshot::Sender<Outcome>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation for `id`.
    pub fn insert(&mut self, id: u64) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        rx
    }

    /// Remove and settle the entry for `id`.
    ///
    /// Returns `false` when no such entry exists (late or stray message).
    pub fn settle(&mut self, id: u64, outcome: Outcome) -> bool {
        match self.entries.remove(&id) {
            Some(tx) => {
                // The caller may have stopped waiting; nothing to deliver then.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without settling it.
    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Reject every entry with an error built by `make_err`.
    pub fn reject_all(&mut self, make_err: impl Fn() -> ForkError) -> usize {
        let count = self.entries.len();
        for (_, tx) in self.entries.drain() {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
