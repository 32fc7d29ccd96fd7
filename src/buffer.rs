//! Buffer module holding records that await delivery.
//!
//! Records are keyed by a [`Tag`] taken from a monotonic clock when they are
//! appended. The tag doubles as the write-correlation id on the streaming
//! transport, and flushes walk the buffer in ascending-tag order so that send
//! order approximates append order.
//!
//! The buffer does no locking of its own. It is owned by the dispatch worker,
//! which is the only task that ever touches it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::record::LogRecord;

/// Correlation id of a buffered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u64);

impl Tag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A buffered record together with its tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub tag: Tag,
    pub record: LogRecord,
}

/// Issues strictly increasing tags from a high-resolution clock.
#[derive(Debug)]
struct TagClock {
    origin: Instant,
    last: Option<u64>,
}

impl TagClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: None,
        }
    }

    fn next(&mut self) -> Tag {
        let sample = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let value = match self.last {
            // Two samples in the same clock tick must not collide.
            Some(last) if sample <= last => last.saturating_add(1),
            _ => sample,
        };
        self.last = Some(value);
        Tag(value)
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of records appended
    pub appended: u64,

    /// Total number of records removed after confirmed delivery
    pub delivered: u64,

    /// Total number of records dropped because they could not be encoded
    pub dropped: u64,

    /// Number of records currently awaiting delivery
    pub pending: usize,
}

/// Tag-keyed store of records awaiting delivery.
#[derive(Debug)]
pub struct RecordBuffer {
    entries: HashMap<Tag, LogRecord>,
    clock: TagClock,
    stats: BufferStats,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            clock: TagClock::new(),
            stats: BufferStats::default(),
        }
    }

    /// Store a record and return the tag it was filed under.
    pub fn append(&mut self, record: LogRecord) -> Tag {
        let tag = self.clock.next();
        self.entries.insert(tag, record);
        self.stats.appended += 1;
        tag
    }

    /// Remove a record whose delivery was confirmed.
    ///
    /// Returns `false` if the tag was not buffered (already removed).
    pub fn remove(&mut self, tag: Tag) -> bool {
        let removed = self.entries.remove(&tag).is_some();
        if removed {
            self.stats.delivered += 1;
        }
        removed
    }

    /// Remove every listed tag whose delivery was confirmed.
    pub fn remove_all(&mut self, tags: &[Tag]) -> usize {
        let removed = tags.iter().filter(|tag| self.remove(**tag)).count();
        debug!(
            requested = tags.len(),
            removed = removed,
            remaining = self.entries.len(),
            "Removed delivered records"
        );
        removed
    }

    /// Remove a record that can never be delivered.
    pub fn drop_undeliverable(&mut self, tag: Tag) -> bool {
        let removed = self.entries.remove(&tag).is_some();
        if removed {
            self.stats.dropped += 1;
        }
        removed
    }

    /// All pending entries in ascending-tag order.
    pub fn snapshot_ordered(&self) -> Vec<PendingEntry> {
        self.snapshot_excluding(&HashSet::new())
    }

    /// Pending entries in ascending-tag order, skipping `excluded` tags.
    pub fn snapshot_excluding(&self, excluded: &HashSet<Tag>) -> Vec<PendingEntry> {
        let mut snapshot: Vec<PendingEntry> = self
            .entries
            .iter()
            .filter(|(tag, _)| !excluded.contains(tag))
            .map(|(tag, record)| PendingEntry {
                tag: *tag,
                record: record.clone(),
            })
            .collect();
        snapshot.sort_by_key(|entry| entry.tag);
        snapshot
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Get the current number of buffered records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.entries.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(n: usize) -> LogRecord {
        LogRecord::new().with("message", format!("record {}", n))
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = RecordBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.stats(), BufferStats::default());
    }

    #[test]
    fn test_tags_strictly_increase() {
        let mut buffer = RecordBuffer::new();
        let tags: Vec<Tag> = (0..1_000).map(|n| buffer.append(create_test_record(n))).collect();

        assert!(tags.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(buffer.len(), 1_000);
    }

    #[test]
    fn test_snapshot_is_ordered_by_tag() {
        let mut buffer = RecordBuffer::new();
        for n in 0..50 {
            buffer.append(create_test_record(n));
        }

        let snapshot = buffer.snapshot_ordered();
        assert_eq!(snapshot.len(), 50);
        assert!(snapshot.windows(2).all(|pair| pair[0].tag < pair[1].tag));
        // Ascending tags follow append order.
        assert_eq!(snapshot[0].record, create_test_record(0));
        assert_eq!(snapshot[49].record, create_test_record(49));
    }

    #[test]
    fn test_snapshot_excluding_skips_tags() {
        let mut buffer = RecordBuffer::new();
        let first = buffer.append(create_test_record(1));
        let second = buffer.append(create_test_record(2));

        let excluded: HashSet<Tag> = [first].into_iter().collect();
        let snapshot = buffer.snapshot_excluding(&excluded);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].tag, second);
    }

    #[test]
    fn test_remove_all_only_listed_tags() {
        let mut buffer = RecordBuffer::new();
        let first = buffer.append(create_test_record(1));
        let second = buffer.append(create_test_record(2));
        let third = buffer.append(create_test_record(3));

        assert_eq!(buffer.remove_all(&[first, third]), 2);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.contains(second));

        // Removing twice is a no-op.
        assert_eq!(buffer.remove_all(&[first]), 0);
        assert!(!buffer.remove(third));
    }

    #[test]
    fn test_buffer_stats() {
        let mut buffer = RecordBuffer::new();
        let tags: Vec<Tag> = (0..4).map(|n| buffer.append(create_test_record(n))).collect();

        buffer.remove(tags[0]);
        buffer.remove_all(&tags[1..3]);
        buffer.drop_undeliverable(tags[3]);

        let stats = buffer.stats();
        assert_eq!(stats.appended, 4);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::new(42).to_string(), "42");
        assert_eq!(Tag::new(7).value(), 7);
    }
}
