//! PCM buffer between the mixer and whichever encoder process is alive
//!
//! Lives for the whole run. Chunks submitted while no encoder is attached
//! wait here and come out in submission order.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct Chunks {
    queue: VecDeque<Bytes>,
    bytes: usize,
}

pub struct PcmBuffer {
    chunks: Mutex<Chunks>,
    high_water_mark: usize,
    ended: AtomicBool,
    readable: Notify,
}

impl PcmBuffer {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            chunks: Mutex::new(Chunks::default()),
            high_water_mark,
            ended: AtomicBool::new(false),
            readable: Notify::new(),
        }
    }

    /// Append a chunk. Always accepted while the buffer is open; returns
    /// false once the buffered bytes pass the high-water mark.
    pub fn push(&self, chunk: Bytes) -> bool {
        if self.ended.load(Ordering::SeqCst) || chunk.is_empty() {
            return true;
        }
        let below_mark = {
            let mut chunks = self.chunks.lock();
            chunks.bytes += chunk.len();
            chunks.queue.push_back(chunk);
            chunks.bytes <= self.high_water_mark
        };
        self.readable.notify_one();
        below_mark
    }

    /// Return a chunk the encoder never took to the head of the line
    pub fn push_front(&self, chunk: Bytes) {
        {
            let mut chunks = self.chunks.lock();
            chunks.bytes += chunk.len();
            chunks.queue.push_front(chunk);
        }
        self.readable.notify_one();
    }

    /// Next chunk in order. Resolves to None once the buffer has ended and
    /// is empty. Cancel safe.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            let readable = self.readable.notified();
            {
                let mut chunks = self.chunks.lock();
                if let Some(chunk) = chunks.queue.pop_front() {
                    chunks.bytes -= chunk.len();
                    return Some(chunk);
                }
            }
            if self.ended.load(Ordering::SeqCst) {
                return None;
            }
            readable.await;
        }
    }

    /// No more input. Already buffered chunks can still be read.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.readable.notify_one();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.chunks.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_order_and_requeue() {
        let buffer = PcmBuffer::new(1024);
        buffer.push(Bytes::from_static(b"a"));
        buffer.push(Bytes::from_static(b"b"));

        let first = buffer.next().await.unwrap();
        buffer.push_front(first);
        buffer.push(Bytes::from_static(b"c"));

        let mut out = Vec::new();
        for _ in 0..3 {
            out.extend_from_slice(&buffer.next().await.unwrap());
        }
        assert_eq!(out, b"abc");
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn test_high_water_mark_still_accepts() {
        let buffer = PcmBuffer::new(4);
        assert!(buffer.push(Bytes::from_static(b"1234")));
        assert!(!buffer.push(Bytes::from_static(b"5")));
        assert_eq!(buffer.buffered_bytes(), 5);
    }

    #[tokio::test]
    async fn test_reader_wakes_on_push_and_end() {
        let buffer = Arc::new(PcmBuffer::new(1024));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(chunk) = buffer.next().await {
                    got.push(chunk);
                }
                got
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(Bytes::from_static(b"x"));
        buffer.end();
        // ignored after end
        buffer.push(Bytes::from_static(b"y"));

        let got = reader.await.unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"x")]);
    }
}
