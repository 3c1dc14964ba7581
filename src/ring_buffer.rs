//! Lock-free byte queue between the application thread and the real-time callback
//!
//! Both halves wrap an [`rtrb`] ring: the read and write indices are published with
//! acquire/release ordering, so neither side ever waits on the other.
//!
//! Each half also counts the bytes that went through it. A writer
//! [`position`](RingWriter::position) handed to [`RingReader::discard_until`]
//! drops exactly what had been written up to that point.

use rtrb::{Consumer, Producer, RingBuffer};

/// Creates a ring buffer holding at most `capacity` bytes.
pub fn ring_buffer(capacity: usize) -> (RingWriter, RingReader) {
    let (producer, consumer) = RingBuffer::<u8>::new(capacity);
    (
        RingWriter {
            producer,
            overflowed: false,
            dropped_bytes: 0,
            position: 0,
        },
        RingReader {
            consumer,
            position: 0,
        },
    )
}

/// Producer half, owned by the application thread.
pub struct RingWriter {
    producer: Producer<u8>,
    overflowed: bool,
    dropped_bytes: u64,
    position: u64,
}

impl RingWriter {
    /// Copies as much of `bytes` as fits and returns how many bytes were taken.
    ///
    /// Never blocks. Anything that didn't fit is dropped and remembered as an
    /// overflow, see [`take_overflow`](Self::take_overflow).
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.producer.slots());
        if n < bytes.len() {
            self.overflowed = true;
            self.dropped_bytes += (bytes.len() - n) as u64;
        }
        if n == 0 {
            return 0;
        }

        match self.producer.write_chunk(n) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&bytes[..split]);
                second.copy_from_slice(&bytes[split..n]);
                chunk.commit_all();
                self.position += n as u64;
                n
            }
            // slots() only grows between the check and here
            Err(_) => 0,
        }
    }

    /// Returns `true` once per overflow episode.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    /// Total bytes dropped because the buffer was full.
    #[inline]
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Total bytes written since creation.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Free space in bytes.
    #[inline]
    pub fn free(&self) -> usize {
        self.producer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    /// `true` once the reader has been dropped.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// Consumer half, owned by the real-time callback.
pub struct RingReader {
    consumer: Consumer<u8>,
    position: u64,
}

impl RingReader {
    /// Fills `out` from the buffer and returns how many bytes were real data.
    ///
    /// Whatever couldn't be served is zeroed so the caller never plays stale memory.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.consumer.slots());
        let read = match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                let split = first.len();
                out[..split].copy_from_slice(first);
                out[split..n].copy_from_slice(second);
                chunk.commit_all();
                self.position += n as u64;
                n
            }
            Err(_) => 0,
        };
        out[read..].fill(0);
        read
    }

    /// Drops everything currently buffered, returning the number of bytes discarded.
    pub fn discard(&mut self) -> usize {
        self.skip(self.consumer.slots())
    }

    /// Drops buffered bytes up to writer position `mark`, leaving anything written
    /// after it. Returns the number of bytes discarded.
    pub fn discard_until(&mut self, mark: u64) -> usize {
        let behind = mark.saturating_sub(self.position);
        let n = usize::try_from(behind).unwrap_or(usize::MAX);
        self.skip(n.min(self.consumer.slots()))
    }

    /// Total bytes consumed since creation, read or discarded.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    fn skip(&mut self, n: usize) -> usize {
        match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                chunk.commit_all();
                self.position += n as u64;
                n
            }
            Err(_) => 0,
        }
    }

    /// Bytes ready to be read.
    #[inline]
    pub fn filled(&self) -> usize {
        self.consumer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.consumer.buffer().capacity()
    }

    /// `true` once the writer has been dropped.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_fifo_partial_reads() {
        for &(n, m) in &[(1, 1), (10, 3), (64, 64), (100, 0), (37, 36)] {
            let (mut writer, mut reader) = ring_buffer(128);
            let data = pattern(n);
            assert_eq!(writer.write(&data), n);

            let mut out = vec![0xAA; m];
            assert_eq!(reader.read(&mut out), m.min(n));
            assert_eq!(&out[..], &data[..m]);
        }
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let (mut writer, mut reader) = ring_buffer(16);
        let mut expected = Vec::new();
        let mut got = Vec::new();

        for round in 0..20u8 {
            let chunk: Vec<u8> = (0..5).map(|i| round.wrapping_mul(5).wrapping_add(i)).collect();
            assert_eq!(writer.write(&chunk), 5);
            expected.extend_from_slice(&chunk);

            let mut out = [0u8; 5];
            assert_eq!(reader.read(&mut out), 5);
            got.extend_from_slice(&out);
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_overflow_is_bounded_and_signalled() {
        let (mut writer, mut reader) = ring_buffer(32);
        assert_eq!(writer.write(&pattern(20)), 20);
        assert!(!writer.take_overflow());

        let written = writer.write(&pattern(50));
        assert_eq!(written, 12);
        assert!(writer.take_overflow());
        assert!(!writer.take_overflow());
        assert_eq!(writer.dropped_bytes(), 38);
        assert_eq!(writer.free(), 0);

        assert_eq!(writer.write(&[1, 2, 3]), 0);
        assert_eq!(reader.filled(), 32);
    }

    #[test]
    fn test_unread_data_is_never_overwritten() {
        let (mut writer, mut reader) = ring_buffer(8);
        writer.write(&[1, 2, 3, 4, 5, 6, 7, 8]);
        writer.write(&[9, 9, 9, 9]);

        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out), 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_short_read_is_silence_filled() {
        let (mut writer, mut reader) = ring_buffer(64);
        writer.write(&[5, 6, 7]);

        let mut out = [0xFFu8; 10];
        assert_eq!(reader.read(&mut out), 3);
        assert_eq!(&out[..3], &[5, 6, 7]);
        assert!(out[3..].iter().all(|&b| b == 0));

        let mut out = [0xFFu8; 4];
        assert_eq!(reader.read(&mut out), 0);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_discard() {
        let (mut writer, mut reader) = ring_buffer(16);
        writer.write(&pattern(12));
        assert_eq!(reader.discard(), 12);
        assert_eq!(reader.filled(), 0);
        assert_eq!(writer.free(), 16);
    }

    #[test]
    fn test_discard_until_keeps_later_writes() {
        let (mut writer, mut reader) = ring_buffer(32);
        writer.write(&[1, 1, 1, 1]);
        let mark = writer.position();
        writer.write(&[2, 3, 4]);

        assert_eq!(reader.discard_until(mark), 4);
        assert_eq!(reader.position(), mark);
        let mut out = [0u8; 3];
        assert_eq!(reader.read(&mut out), 3);
        assert_eq!(out, [2, 3, 4]);

        // a stale mark discards nothing
        writer.write(&[5]);
        assert_eq!(reader.discard_until(mark), 0);
        assert_eq!(reader.filled(), 1);
    }

    #[test]
    fn test_abandoned() {
        let (writer, reader) = ring_buffer(4);
        assert!(!reader.is_abandoned());
        drop(writer);
        assert!(reader.is_abandoned());
    }

    #[test]
    fn test_cross_thread_order() {
        let (mut writer, mut reader) = ring_buffer(64);
        let total = 10_000usize;

        let producer = std::thread::spawn(move || {
            let data: Vec<u8> = (0..total).map(|i| i as u8).collect();
            let mut offset = 0;
            while offset < total {
                let end = (offset + 13).min(total);
                offset += writer.write(&data[offset..end]);
                std::thread::yield_now();
            }
        });

        let mut got = Vec::with_capacity(total);
        let mut out = [0u8; 9];
        while got.len() < total {
            let n = reader.read(&mut out);
            got.extend_from_slice(&out[..n]);
            if n == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert!(got.iter().enumerate().all(|(i, &b)| b == i as u8));
    }
}
