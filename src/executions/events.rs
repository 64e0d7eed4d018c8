//! Bounded, sequenced log of runner events for one execution.
//!
//! [`EventLog`] keeps the most recent `max_entries` events. Every event gets a
//! monotonically increasing sequence number so a late-joining UI can ask for
//! "everything after seq N" and learn how many events were evicted in between.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

use crate::util::now_ms;

/// A single runner event, stored verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    /// Unique within an execution, starting at 1.
    pub seq: u64,
    /// Unix timestamp in milliseconds when the event was recorded.
    pub timestamp_ms: u64,
    /// The runner's frame, untouched.
    pub event: Value,
}

/// Ring buffer of [`EventEntry`] items.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<EventEntry>,
    next_seq: u64,
    max_entries: usize,
}

impl EventLog {
    /// Create a log that holds at most `max_entries` events.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries: max_entries.max(1),
        }
    }

    /// Append an event, evicting the oldest if full. Returns its sequence number.
    pub fn push(&mut self, event: Value) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(EventEntry {
            seq,
            timestamp_ms: now_ms(),
            event,
        });
        seq
    }

    /// Read all entries with `seq > since`.
    ///
    /// Returns `(entries, dropped_count)` where `dropped_count > 0` if entries
    /// between `since` and the oldest available entry were evicted.
    pub fn read_since(&self, since: u64) -> (Vec<EventEntry>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = if oldest_available > since.saturating_add(1) {
            oldest_available - since - 1
        } else {
            0
        };

        let entries = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();

        (entries, dropped)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of events ever recorded.
    pub fn total(&self) -> u64 {
        self.next_seq - 1
    }
}
