//! Worker log notifications kept for display.

use crate::protocol::LogLevel;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the stream of all entries ever received.
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Ring buffer of the most recent worker log entries.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: String) {
        if self.capacity == 0 {
            self.next_seq += 1;
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            seq: self.next_seq,
            level,
            message,
        });
        self.next_seq += 1;
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_entries_are_evicted() {
        let mut logs = LogBuffer::new(2);
        logs.push(LogLevel::Info, "one".into());
        logs.push(LogLevel::Warn, "two".into());
        logs.push(LogLevel::Error, "three".into());

        let entries = logs.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].seq, 2);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut logs = LogBuffer::new(0);
        logs.push(LogLevel::Info, "x".into());
        assert!(logs.is_empty());
        assert!(logs.snapshot().is_empty());
    }
}
