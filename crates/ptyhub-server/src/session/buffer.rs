//! Bounded output buffer with stable sequence numbers.
//!
//! Chunks live in a fixed arena of slots indexed from `head`. Every append
//! takes the next sequence number; evicting the oldest chunk never renumbers
//! the survivors, so a poller's `seq` stays meaningful across wraparound.

/// A fixed-capacity arena of output chunks.
#[derive(Debug)]
pub struct OutputBuffer {
    slots: Vec<Option<Vec<u8>>>,
    /// Slot holding the oldest retained chunk.
    head: usize,
    /// Number of occupied slots.
    len: usize,
    /// Sequence number of the newest chunk (0 before the first append).
    tail_seq: u64,
}

impl OutputBuffer {
    /// Create a buffer holding at most `capacity` chunks (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
            tail_seq: 0,
        }
    }

    /// Append a chunk, evicting the oldest one if full. Returns its sequence.
    ///
    /// Empty chunks are ignored and return the current tail.
    pub fn push(&mut self, chunk: Vec<u8>) -> u64 {
        if chunk.is_empty() {
            return self.tail_seq;
        }

        let capacity = self.slots.len();
        if self.len == capacity {
            self.slots[self.head] = Some(chunk);
            self.head = (self.head + 1) % capacity;
        } else {
            let slot = (self.head + self.len) % capacity;
            self.slots[slot] = Some(chunk);
            self.len += 1;
        }

        self.tail_seq += 1;
        self.tail_seq
    }

    /// Concatenate every retained chunk newer than `seq`.
    ///
    /// Returns the bytes and the sequence to poll with next. A `seq` at or
    /// past the tail yields nothing and echoes `seq` back unchanged; a `seq`
    /// older than the oldest retained chunk yields everything retained.
    pub fn since(&self, seq: u64) -> (Vec<u8>, u64) {
        if seq >= self.tail_seq {
            return (Vec::new(), seq);
        }

        let oldest = self.tail_seq + 1 - self.len as u64;
        let skip = seq.saturating_add(1).saturating_sub(oldest) as usize;

        let capacity = self.slots.len();
        let mut out = Vec::new();
        for i in skip..self.len {
            if let Some(chunk) = &self.slots[(self.head + i) % capacity] {
                out.extend_from_slice(chunk);
            }
        }
        (out, self.tail_seq)
    }

    /// Sequence number of the newest chunk.
    pub fn tail_seq(&self) -> u64 {
        self.tail_seq
    }

    /// Sequence number of the oldest retained chunk, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.tail_seq + 1 - self.len as u64)
        }
    }

    /// Number of retained chunks.
    pub fn retained_chunks(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, chunks: &[&[u8]]) -> OutputBuffer {
        let mut buf = OutputBuffer::new(capacity);
        for c in chunks {
            buf.push(c.to_vec());
        }
        buf
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let mut buf = OutputBuffer::new(4);
        assert_eq!(buf.tail_seq(), 0);
        assert_eq!(buf.push(b"a".to_vec()), 1);
        assert_eq!(buf.push(b"b".to_vec()), 2);
        assert_eq!(buf.oldest_seq(), Some(1));
    }

    #[test]
    fn since_zero_returns_full_history() {
        let buf = filled(8, &[b"hel", b"lo ", b"world"]);
        assert_eq!(buf.since(0), (b"hello world".to_vec(), 3));
    }

    #[test]
    fn since_returns_only_newer_chunks() {
        let buf = filled(8, &[b"one", b"two", b"three"]);
        assert_eq!(buf.since(1), (b"twothree".to_vec(), 3));
        assert_eq!(buf.since(2), (b"three".to_vec(), 3));
    }

    #[test]
    fn seq_at_or_past_tail_is_empty_and_unchanged() {
        let buf = filled(8, &[b"x", b"y"]);
        assert_eq!(buf.since(2), (Vec::new(), 2));
        assert_eq!(buf.since(50), (Vec::new(), 50));

        let empty = OutputBuffer::new(8);
        assert_eq!(empty.since(0), (Vec::new(), 0));
    }

    #[test]
    fn eviction_drops_oldest_and_keeps_numbering() {
        let buf = filled(3, &[b"a", b"b", b"c", b"d", b"e"]);
        assert_eq!(buf.retained_chunks(), 3);
        assert_eq!(buf.oldest_seq(), Some(3));
        assert_eq!(buf.tail_seq(), 5);
        // A stale poller gets what is still retained.
        assert_eq!(buf.since(0), (b"cde".to_vec(), 5));
        assert_eq!(buf.since(3), (b"de".to_vec(), 5));
    }

    #[test]
    fn retained_chunks_never_exceed_capacity_across_many_wraps() {
        let mut buf = OutputBuffer::new(7);
        for i in 0..1000u32 {
            buf.push(i.to_string().into_bytes());
            assert!(buf.retained_chunks() <= 7);
        }
        assert_eq!(buf.tail_seq(), 1000);
        assert_eq!(buf.since(998), (b"998999".to_vec(), 1000));
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut buf = OutputBuffer::new(2);
        buf.push(b"a".to_vec());
        assert_eq!(buf.push(Vec::new()), 1);
        assert_eq!(buf.retained_chunks(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buf = OutputBuffer::new(0);
        buf.push(b"a".to_vec());
        buf.push(b"b".to_vec());
        assert_eq!(buf.retained_chunks(), 1);
        assert_eq!(buf.oldest_seq(), Some(2));
        assert_eq!(buf.since(0), (b"b".to_vec(), 2));
    }
}
