use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};

/// One buffered line with its append sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub seq: u64,
    /// `"[HH:MM:SS] text"` in local time of receipt
    pub line: String,
}

/// Result of [`MessageBuffer::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared {
    /// Entries removed
    pub count: usize,
    /// Highest sequence number ever assigned at the time of the clear.
    /// Every entry at or below it is gone for good.
    pub watermark: u64,
}

#[derive(Default)]
struct State {
    entries: VecDeque<BufferedEntry>,
    last_seq: u64,
}

/// Append-only buffer of received messages, read by polling.
///
/// A single mutex covers appends, snapshots and clears, so a snapshot taken
/// after `clear` returns never contains an entry the clear removed.
pub struct MessageBuffer {
    state: Mutex<State>,
    /// 0 = unbounded
    capacity: usize,
}

impl MessageBuffer {
    /// Create a buffer. With a non-zero `capacity` the oldest entries are
    /// dropped once it is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity,
        }
    }

    /// Append a message received now. Returns its sequence number.
    pub fn push(&self, text: &str) -> u64 {
        self.push_at(text, Local::now())
    }

    /// Append a message received at `at`.
    pub fn push_at(&self, text: &str, at: DateTime<Local>) -> u64 {
        let line = format!("[{}] {}", at.format("%H:%M:%S"), text);

        let mut state = self.lock();
        state.last_seq += 1;
        let seq = state.last_seq;
        state.entries.push_back(BufferedEntry { seq, line });

        if self.capacity > 0 {
            while state.entries.len() > self.capacity {
                state.entries.pop_front();
            }
        }

        seq
    }

    /// Buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.line.clone())
            .collect()
    }

    /// Buffered entries with their sequence numbers, oldest first.
    pub fn entries(&self) -> Vec<BufferedEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Remove everything currently buffered.
    pub fn clear(&self) -> Cleared {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        Cleared {
            count,
            watermark: state.last_seq,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_line_format() {
        let buffer = MessageBuffer::new(0);
        let at = Local.with_ymd_and_hms(2024, 1, 15, 9, 5, 7).unwrap();

        buffer.push_at("hello", at);
        assert_eq!(buffer.snapshot(), vec!["[09:05:07] hello".to_string()]);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let buffer = MessageBuffer::new(0);
        assert_eq!(buffer.push("a"), 1);
        assert_eq!(buffer.push("b"), 2);

        let seqs: Vec<u64> = buffer.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_clear_reports_watermark_and_empties() {
        let buffer = MessageBuffer::new(0);
        buffer.push("a");
        buffer.push("b");

        let cleared = buffer.clear();
        assert_eq!(cleared, Cleared { count: 2, watermark: 2 });
        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());

        assert_eq!(buffer.push("c"), 3);
        assert_eq!(buffer.snapshot().len(), 1);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let buffer = MessageBuffer::new(2);
        buffer.push("a");
        buffer.push("b");
        buffer.push("c");

        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" b"));
        assert!(lines[1].ends_with(" c"));
    }

    #[test]
    fn test_clear_then_read_never_resurrects_entries() {
        let buffer = Arc::new(MessageBuffer::new(0));

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    buffer.push(&format!("m{i}"));
                }
            })
        };

        let mut floor = 0;
        for _ in 0..200 {
            let cleared = buffer.clear();
            assert!(cleared.watermark >= floor);
            floor = cleared.watermark;

            for entry in buffer.entries() {
                assert!(
                    entry.seq > floor,
                    "entry {} survived a clear at {}",
                    entry.seq,
                    floor
                );
            }
        }

        writer.join().unwrap();
    }
}
