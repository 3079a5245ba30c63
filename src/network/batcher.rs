//! Output batching
//!
//! The server does a lot of small writes to every connection. Allocating and
//! issuing a syscall per packet does not scale, so producers append into one
//! fixed-capacity buffer and only the reactor's flush opportunities (the
//! periodic tick and write readiness) touch the socket. Packets that do not
//! fit wait in an ordered overflow queue.
//!
//! Two locks:
//! - `shared`: producers append under it; held only for the copy.
//! - `inflight`: owned by the flushing thread; held across the non-blocking
//!   write but never taken by producers.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use super::error::ConnectionError;
use super::{IoOutcome, Transport};

/// Result of one flush opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything buffered has been written.
    Drained,
    /// Socket stopped accepting bytes; resume on next opportunity.
    Pending,
    /// Peer closed the stream mid-flush.
    PeerClosed,
}

struct Shared {
    buffer: BytesMut,
    queue: VecDeque<BytesMut>,
    queued_bytes: usize,
    closed: bool,
}

impl Shared {
    /// Move queued packets into the buffer while they fit.
    fn drain_queue(&mut self, capacity: usize) {
        while let Some(front) = self.queue.front() {
            if self.buffer.len() + front.len() > capacity {
                break;
            }
            if let Some(pkt) = self.queue.pop_front() {
                self.queued_bytes -= pkt.len();
                self.buffer.put_slice(&pkt);
            }
        }
    }
}

pub struct OutputBatcher {
    capacity: usize,
    shared: Mutex<Shared>,
    inflight: Mutex<BytesMut>,
}

impl OutputBatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shared: Mutex::new(Shared {
                buffer: BytesMut::with_capacity(capacity),
                queue: VecDeque::new(),
                queued_bytes: 0,
                closed: false,
            }),
            inflight: Mutex::new(BytesMut::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve `len` bytes and let `write` fill them, all under the producer
    /// lock. Goes into the shared buffer if it fits and nothing is queued
    /// ahead, otherwise into a new overflow packet.
    ///
    /// `write` must append exactly `len` bytes.
    pub fn enqueue(
        &self,
        len: usize,
        write: impl FnOnce(&mut BytesMut),
    ) -> Result<(), ConnectionError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(ConnectionError::Closed);
        }

        if shared.queue.is_empty() && self.capacity.saturating_sub(shared.buffer.len()) >= len {
            write(&mut shared.buffer);
            return Ok(());
        }

        let mut pkt = BytesMut::with_capacity(len);
        write(&mut pkt);
        shared.queued_bytes += pkt.len();
        shared.queue.push_back(pkt);
        tracing::trace!(
            "[world] [out_queue] len={} queued={} depth={}",
            len,
            shared.queued_bytes,
            shared.queue.len()
        );
        Ok(())
    }

    /// Append raw bytes.
    pub fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.enqueue(bytes.len(), |dst| dst.put_slice(bytes))
    }

    /// Write as much as the transport accepts. Bytes that do not go out stay
    /// for the next opportunity, in order.
    ///
    /// Returns `Pending` immediately if another thread is already flushing.
    pub fn flush<T: Transport + ?Sized>(&self, transport: &mut T) -> io::Result<FlushOutcome> {
        let Some(mut inflight) = self.inflight.try_lock() else {
            return Ok(FlushOutcome::Pending);
        };

        loop {
            if inflight.is_empty() && !self.refill(&mut inflight) {
                return Ok(FlushOutcome::Drained);
            }

            match transport.write_from(&inflight)? {
                IoOutcome::Transferred(n) => {
                    tracing::trace!("[world] [write] bytes={}", n);
                    inflight.advance(n);
                }
                IoOutcome::WouldBlock => return Ok(FlushOutcome::Pending),
                IoOutcome::Closed => return Ok(FlushOutcome::PeerClosed),
            }
        }
    }

    /// Hand the next run of bytes to the flusher. False if nothing is left.
    fn refill(&self, inflight: &mut BytesMut) -> bool {
        let mut shared = self.shared.lock();

        if !shared.buffer.is_empty() {
            std::mem::swap(&mut shared.buffer, inflight);
            shared.buffer.clear();
            shared.buffer.reserve(self.capacity);
        } else if let Some(pkt) = shared.queue.pop_front() {
            // larger than the buffer, or queued behind one that was
            shared.queued_bytes -= pkt.len();
            *inflight = pkt;
        } else {
            return false;
        }

        shared.drain_queue(self.capacity);
        true
    }

    /// Bytes waiting in the buffer and queue, excluding a write in progress.
    pub fn buffered_len(&self) -> usize {
        let shared = self.shared.lock();
        shared.buffer.len() + shared.queued_bytes
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn has_pending(&self) -> bool {
        if self.buffered_len() > 0 {
            return true;
        }
        match self.inflight.try_lock() {
            Some(inflight) => !inflight.is_empty(),
            None => true,
        }
    }

    /// Refuse further packets and drop everything pending.
    pub fn close(&self) {
        {
            let mut shared = self.shared.lock();
            shared.closed = true;
            shared.buffer.clear();
            shared.queue.clear();
            shared.queued_bytes = 0;
        }
        if let Some(mut inflight) = self.inflight.try_lock() {
            inflight.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Accepts at most `chunk` bytes per write and `budget` bytes in total
    /// before reporting WouldBlock.
    struct Sink {
        written: Vec<u8>,
        chunk: usize,
        budget: usize,
        writes: usize,
    }

    impl Sink {
        fn new(chunk: usize, budget: usize) -> Self {
            Self { written: Vec::new(), chunk, budget, writes: 0 }
        }
    }

    impl Transport for Sink {
        fn read_into(&mut self, _buf: &mut [u8]) -> io::Result<IoOutcome> {
            Ok(IoOutcome::WouldBlock)
        }

        fn write_from(&mut self, buf: &[u8]) -> io::Result<IoOutcome> {
            if self.budget == 0 {
                return Ok(IoOutcome::WouldBlock);
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            self.writes += 1;
            Ok(IoOutcome::Transferred(n))
        }

        fn close(&mut self) {}
    }

    fn numbered(i: u32, len: usize) -> Vec<u8> {
        let mut v = i.to_le_bytes().to_vec();
        v.resize(len, i as u8);
        v
    }

    #[test]
    fn test_send_does_not_write() {
        let batcher = OutputBatcher::new(1024);
        batcher.send(b"hello").unwrap();
        batcher.send(b"world").unwrap();
        assert_eq!(batcher.buffered_len(), 10);
        assert_eq!(batcher.queue_depth(), 0);

        let mut sink = Sink::new(usize::MAX, usize::MAX);
        assert_eq!(batcher.flush(&mut sink).unwrap(), FlushOutcome::Drained);
        assert_eq!(sink.written, b"helloworld");
        // one syscall for both packets
        assert_eq!(sink.writes, 1);
        assert!(!batcher.has_pending());
    }

    #[test]
    fn test_overflow_goes_to_queue() {
        let batcher = OutputBatcher::new(1024);
        batcher.send(&[1u8; 1000]).unwrap();
        batcher.send(&[2u8; 100]).unwrap();
        // fits, but must not jump ahead of the queued packet
        batcher.send(&[3u8; 10]).unwrap();
        assert_eq!(batcher.queue_depth(), 2);

        let mut sink = Sink::new(usize::MAX, usize::MAX);
        batcher.flush(&mut sink).unwrap();

        let mut expected = vec![1u8; 1000];
        expected.extend_from_slice(&[2u8; 100]);
        expected.extend_from_slice(&[3u8; 10]);
        assert_eq!(sink.written, expected);
        assert_eq!(batcher.queue_depth(), 0);
    }

    #[test]
    fn test_partial_writes_resume_in_order() {
        let batcher = OutputBatcher::new(1024);
        let mut expected = Vec::new();
        for i in 0..50u32 {
            let pkt = numbered(i, 100 + i as usize);
            expected.extend_from_slice(&pkt);
            batcher.send(&pkt).unwrap();
        }

        let mut sink = Sink::new(77, 0);
        let mut rounds = 0;
        loop {
            sink.budget = 500;
            match batcher.flush(&mut sink).unwrap() {
                FlushOutcome::Drained => break,
                FlushOutcome::Pending => rounds += 1,
                FlushOutcome::PeerClosed => panic!("sink never closes"),
            }
            // producers keep going between flushes
            if rounds == 3 {
                let pkt = numbered(999, 40);
                expected.extend_from_slice(&pkt);
                batcher.send(&pkt).unwrap();
            }
        }
        assert!(rounds > 3);
        assert_eq!(sink.written, expected);
    }

    #[test]
    fn test_packet_larger_than_buffer() {
        let batcher = OutputBatcher::new(1024);
        batcher.send(b"head").unwrap();
        let big = vec![0xABu8; 5000];
        batcher.send(&big).unwrap();
        batcher.send(b"tail").unwrap();

        let mut sink = Sink::new(usize::MAX, usize::MAX);
        assert_eq!(batcher.flush(&mut sink).unwrap(), FlushOutcome::Drained);

        let mut expected = b"head".to_vec();
        expected.extend_from_slice(&big);
        expected.extend_from_slice(b"tail");
        assert_eq!(sink.written, expected);
    }

    #[test]
    fn test_would_block_keeps_bytes() {
        let batcher = OutputBatcher::new(1024);
        batcher.send(b"abcdef").unwrap();

        let mut blocked = Sink::new(usize::MAX, 0);
        assert_eq!(batcher.flush(&mut blocked).unwrap(), FlushOutcome::Pending);
        assert!(batcher.has_pending());

        let mut open = Sink::new(usize::MAX, usize::MAX);
        assert_eq!(batcher.flush(&mut open).unwrap(), FlushOutcome::Drained);
        assert_eq!(open.written, b"abcdef");
    }

    #[test]
    fn test_closed_rejects_sends() {
        let batcher = OutputBatcher::new(1024);
        batcher.send(b"pending").unwrap();
        batcher.close();
        assert!(batcher.is_closed());
        assert!(!batcher.has_pending());
        assert!(matches!(batcher.send(b"late"), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_concurrent_producers_keep_packets_whole() {
        const PRODUCERS: u32 = 8;
        const PER_PRODUCER: u32 = 500;

        let batcher = Arc::new(OutputBatcher::new(4096));
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let batcher = batcher.clone();
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        // [producer][seq u32][len u8][filler...]
                        let len = 6 + (seq % 50) as usize;
                        let mut pkt = vec![p as u8];
                        pkt.extend_from_slice(&seq.to_le_bytes());
                        pkt.push(len as u8);
                        pkt.resize(len, p as u8);
                        batcher.send(&pkt).unwrap();
                    }
                })
            })
            .collect();

        // flush concurrently with the producers
        let mut sink = Sink::new(333, usize::MAX);
        while handles.iter().any(|h| !h.is_finished()) {
            batcher.flush(&mut sink).unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        batcher.flush(&mut sink).unwrap();

        let mut next_seq = vec![0u32; PRODUCERS as usize];
        let mut rest = &sink.written[..];
        while !rest.is_empty() {
            let producer = rest[0] as usize;
            let seq = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]);
            let len = rest[5] as usize;
            assert!(rest[6..len].iter().all(|&b| b == producer as u8));
            assert_eq!(seq, next_seq[producer], "producer {} out of order", producer);
            next_seq[producer] += 1;
            rest = &rest[len..];
        }
        assert!(next_seq.iter().all(|&n| n == PER_PRODUCER));
    }
}
