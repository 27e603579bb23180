//! Bounded output history for one session.
//!
//! Keeps the most recent `capacity` bytes of PTY output and a monotonically
//! increasing write offset, so a reconnecting client can ask for everything
//! since the last offset it saw.

use std::collections::VecDeque;

/// Bytes returned by [`SessionBuffer::slice_since`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replay {
    /// Retained bytes at or after the requested offset.
    pub bytes: Vec<u8>,
    /// True when the requested offset was already evicted.
    pub truncated: bool,
    /// Offset immediately after the last returned byte.
    pub next_offset: u64,
}

/// A byte-capacity-bounded FIFO of output bytes.
#[derive(Debug)]
pub struct SessionBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Offset the next pushed byte will receive.
    next_offset: u64,
}

impl SessionBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            next_offset: 0,
        }
    }

    /// Create a buffer pre-filled with a previously persisted log.
    ///
    /// `end_offset` is the offset the log ended at when it was saved, so
    /// offsets held by clients stay valid across a restart. Logs saved
    /// without one (`0`) restart at zero. Only the trailing `capacity`
    /// bytes are kept.
    pub fn from_log(capacity: usize, log: &[u8], end_offset: u64) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.next_offset = end_offset.saturating_sub(log.len() as u64);
        buffer.push(log);
        buffer
    }

    /// Append a chunk, evicting the oldest bytes while over capacity.
    pub fn push(&mut self, chunk: &[u8]) {
        self.next_offset += chunk.len() as u64;

        if self.capacity == 0 {
            return;
        }

        if chunk.len() >= self.capacity {
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend(chunk);
    }

    /// Return bytes written at or after `offset`.
    ///
    /// If `offset` predates the oldest retained byte, every retained byte is
    /// returned and `truncated` is set. Offsets in the future yield nothing.
    pub fn slice_since(&self, offset: u64) -> Replay {
        let oldest = self.oldest_offset();

        if offset >= self.next_offset {
            return Replay {
                bytes: Vec::new(),
                truncated: false,
                next_offset: self.next_offset,
            };
        }

        let (skip, truncated) = if offset < oldest {
            (0, true)
        } else {
            ((offset - oldest) as usize, false)
        };

        Replay {
            bytes: self.data.iter().skip(skip).copied().collect(),
            truncated,
            next_offset: self.next_offset,
        }
    }

    /// Offset the next pushed byte will receive.
    pub fn current_offset(&self) -> u64 {
        self.next_offset
    }

    /// Offset of the oldest retained byte.
    pub fn oldest_offset(&self) -> u64 {
        self.next_offset - self.data.len() as u64
    }

    /// Copy of every retained byte, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let (front, back) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes are retained.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of retained bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut buffer = SessionBuffer::new(16);
        buffer.push(b"hello ");
        buffer.push(b"world");

        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.current_offset(), 11);
        assert_eq!(buffer.oldest_offset(), 0);
        assert_eq!(buffer.contents(), b"hello world");
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = SessionBuffer::new(8);
        buffer.push(b"abcdef");
        buffer.push(b"ghijk");

        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.contents(), b"defghijk");
        assert_eq!(buffer.oldest_offset(), 3);
        assert_eq!(buffer.current_offset(), 11);
    }

    #[test]
    fn test_chunk_larger_than_capacity() {
        let mut buffer = SessionBuffer::new(4);
        buffer.push(b"xy");
        buffer.push(b"0123456789");

        assert_eq!(buffer.contents(), b"6789");
        assert_eq!(buffer.current_offset(), 12);
        assert_eq!(buffer.oldest_offset(), 8);
    }

    #[test]
    fn test_slice_since_zero_returns_last_capacity_bytes() {
        let mut buffer = SessionBuffer::new(10);
        let mut pushed = Vec::new();
        for i in 0..7u8 {
            let chunk = vec![b'a' + i; 3];
            pushed.extend_from_slice(&chunk);
            buffer.push(&chunk);
        }

        let replay = buffer.slice_since(0);
        assert!(replay.truncated);
        assert_eq!(replay.bytes, pushed[pushed.len() - 10..]);
        assert_eq!(replay.next_offset, 21);
    }

    #[test]
    fn test_slice_since_within_retained_range() {
        let mut buffer = SessionBuffer::new(32);
        buffer.push(b"first ");
        buffer.push(b"second");

        let replay = buffer.slice_since(6);
        assert!(!replay.truncated);
        assert_eq!(replay.bytes, b"second");
        assert_eq!(replay.next_offset, 12);

        let replay = buffer.slice_since(0);
        assert!(!replay.truncated);
        assert_eq!(replay.bytes, b"first second");
    }

    #[test]
    fn test_slice_since_current_or_future_offset() {
        let mut buffer = SessionBuffer::new(32);
        buffer.push(b"data");

        let replay = buffer.slice_since(4);
        assert!(replay.bytes.is_empty());
        assert!(!replay.truncated);

        let replay = buffer.slice_since(100);
        assert!(replay.bytes.is_empty());
        assert_eq!(replay.next_offset, 4);
    }

    #[test]
    fn test_truncated_only_when_offset_evicted() {
        let mut buffer = SessionBuffer::new(4);
        buffer.push(b"abcdef");

        assert!(buffer.slice_since(1).truncated);
        let replay = buffer.slice_since(2);
        assert!(!replay.truncated);
        assert_eq!(replay.bytes, b"cdef");
    }

    #[test]
    fn test_from_log_keeps_tail() {
        let buffer = SessionBuffer::from_log(3, b"restored", 0);
        assert_eq!(buffer.contents(), b"red");
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.current_offset(), 8);
    }

    #[test]
    fn test_from_log_continues_saved_offsets() {
        let mut original = SessionBuffer::new(8);
        original.push(b"0123456789abcdef");
        let saved_offset = original.current_offset();

        let mut restored = SessionBuffer::from_log(8, &original.contents(), saved_offset);
        assert_eq!(restored.current_offset(), 16);
        assert_eq!(restored.oldest_offset(), 8);
        assert_eq!(restored.slice_since(12), original.slice_since(12));

        // An offset from before the restart that was already evicted.
        let stale = restored.slice_since(2);
        assert!(stale.truncated);
        assert_eq!(stale.bytes, b"89abcdef");

        restored.push(b"gh");
        let replay = restored.slice_since(16);
        assert_eq!(replay.bytes, b"gh");
        assert_eq!(replay.next_offset, 18);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = SessionBuffer::new(8);
        assert!(buffer.is_empty());
        assert_eq!(buffer.slice_since(0), Replay::default());
    }
}
