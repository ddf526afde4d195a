//! Report batch staging
//!
//! Between reporting cycles, connections with something to tell the host
//! are staged in two append-only batches: first appearances in `new`,
//! everything later in `updated`. A connection sits in at most one batch
//! at a time (tracked by the record's `pending_notification` flag) and
//! both batches are drained atomically by the dump cycle.

use crate::nat::ConnId;

/// Staged connection batches for the next dump.
#[derive(Debug, Default)]
pub struct ConnCollector {
    new_conns: Vec<ConnId>,
    updated_conns: Vec<ConnId>,
}

impl ConnCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the first appearance of a reportable connection.
    pub fn push_new(&mut self, id: ConnId) {
        self.new_conns.push(id);
    }

    /// Stage a subsequent change (counters, status, DPI outcome).
    pub fn push_update(&mut self, id: ConnId) {
        self.updated_conns.push(id);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_conns.is_empty() && self.updated_conns.is_empty()
    }

    #[must_use]
    pub fn new_count(&self) -> usize {
        self.new_conns.len()
    }

    #[must_use]
    pub fn updated_count(&self) -> usize {
        self.updated_conns.len()
    }

    /// Drain both batches for one dump cycle.
    pub fn take(&mut self) -> (Vec<ConnId>, Vec<ConnId>) {
        (
            std::mem::take(&mut self.new_conns),
            std::mem::take(&mut self.updated_conns),
        )
    }

    /// Drop staged entries without reporting (run teardown).
    pub fn clear(&mut self) {
        self.new_conns.clear();
        self.updated_conns.clear();
    }
}
