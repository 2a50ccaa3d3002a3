//! Drop-oldest byte queue
//!
//! Holds encoded chunks while the Icecast connection is down. The byte total
//! never exceeds the cap; when it would, the oldest whole chunks go first.

use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct OutboundQueue {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    max_bytes: usize,
}

impl OutboundQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append a chunk, evicting from the front until back under the cap.
    /// Returns the number of bytes evicted.
    pub fn push(&mut self, chunk: Bytes) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        let mut dropped = 0;
        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(old) => {
                    self.total_bytes -= old.len();
                    dropped += old.len();
                }
                None => break,
            }
        }
        debug_assert!(self.total_bytes <= self.max_bytes);
        dropped
    }

    /// Put a chunk that failed to send back at the head. Evicts from the
    /// tail side of the head if that would break the cap, so the oldest
    /// audio still goes first.
    pub fn push_front(&mut self, chunk: Bytes) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        if chunk.len() + self.total_bytes > self.max_bytes {
            // the re-queued chunk is the oldest; drop it instead of newer audio
            return chunk.len();
        }
        self.total_bytes += chunk.len();
        self.chunks.push_front(chunk);
        0
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.total_bytes -= chunk.len();
        Some(chunk)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn test_overflow_keeps_newest_whole_chunks() {
        let mut queue = OutboundQueue::new(256 * 1024);
        let mut dropped = 0;
        for tag in 0..10u8 {
            dropped += queue.push(chunk(tag, 64 * 1024));
            assert!(queue.total_bytes() <= 256 * 1024);
        }

        assert_eq!(dropped, 384 * 1024);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.total_bytes(), 256 * 1024);
        let tags: Vec<u8> = std::iter::from_fn(|| queue.pop_front()).map(|c| c[0]).collect();
        assert_eq!(tags, vec![6, 7, 8, 9]);
        assert_eq!(queue.total_bytes(), 0);
    }

    #[test]
    fn test_uneven_chunks_never_split() {
        let mut queue = OutboundQueue::new(100);
        queue.push(chunk(1, 60));
        queue.push(chunk(2, 30));
        assert_eq!(queue.push(chunk(3, 30)), 60);
        assert_eq!(queue.total_bytes(), 60);

        // a single chunk above the cap cannot be kept at all
        assert_eq!(queue.push(chunk(4, 150)), 210);
        assert!(queue.is_empty());
        assert_eq!(queue.total_bytes(), 0);
    }

    #[test]
    fn test_push_front_respects_cap() {
        let mut queue = OutboundQueue::new(100);
        queue.push(chunk(2, 50));
        assert_eq!(queue.push_front(chunk(1, 40)), 0);
        assert_eq!(queue.pop_front().unwrap()[0], 1);

        queue.push(chunk(3, 40));
        assert_eq!(queue.push_front(chunk(4, 20)), 20);
        assert_eq!(queue.total_bytes(), 90);
    }

    #[test]
    fn test_empty_chunks_are_ignored() {
        let mut queue = OutboundQueue::new(10);
        assert_eq!(queue.push(Bytes::new()), 0);
        assert!(queue.is_empty());
    }
}
