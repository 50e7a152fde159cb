//! Chunked byte queue for buffered PTY reads and writes.
//!
//! The buffer is a FIFO of fixed-size heap chunks with a `head` cursor into
//! the front chunk and a `tail` cursor into the back chunk. Producers call
//! [`RingBuffer::reserve`] to get a writable slice sized for an incoming
//! read, then [`RingBuffer::unreserve`] any part that went unused; consumers
//! copy out with [`RingBuffer::read`] and release with [`RingBuffer::free`].
//!
//! The FIFO discipline here is what guarantees that bytes reach the
//! emulation in exactly the order the child produced them, so the read path
//! must never duplicate or skip a byte across a chunk boundary.

use std::collections::VecDeque;

/// Default chunk size. Reservations larger than this get a chunk of their
/// own exact size.
pub const DEFAULT_CHUNK: usize = 4096;

/// FIFO byte queue built from a list of heap chunks.
///
/// An empty buffer always holds exactly one empty chunk, and draining the
/// buffer completely frees consumed chunks back down to that state, so a
/// long-lived buffer does not hold on to burst-sized allocations.
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    head: usize,
    tail: usize,
    total_size: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding a single default-size chunk.
    pub fn new() -> Self {
        let mut chunks = VecDeque::new();
        chunks.push_back(vec![0u8; DEFAULT_CHUNK]);
        Self {
            chunks,
            head: 0,
            tail: 0,
            total_size: 0,
        }
    }

    /// Drop all content and return to the single-empty-chunk state.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.chunks.push_back(vec![0u8; DEFAULT_CHUNK]);
        self.head = 0;
        self.tail = 0;
        self.total_size = 0;
    }

    /// Number of unread bytes in the buffer.
    pub fn len(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.len() == 1 && self.tail == 0
    }

    /// Number of contiguous bytes readable from the front chunk.
    pub fn read_size(&self) -> usize {
        if self.chunks.len() == 1 {
            self.tail - self.head
        } else {
            self.chunks[0].len() - self.head
        }
    }

    /// Contiguous unread bytes at the front of the queue.
    pub fn read_pointer(&self) -> &[u8] {
        let len = self.read_size();
        &self.chunks[0][self.head..self.head + len]
    }

    /// Release `bytes` consumed bytes from the front, dropping chunks as the
    /// head crosses them. Must not exceed [`RingBuffer::len`].
    pub fn free(&mut self, mut bytes: usize) {
        assert!(
            bytes <= self.total_size,
            "freeing {bytes} bytes from a buffer holding {}",
            self.total_size
        );
        self.total_size -= bytes;

        loop {
            let nbs = self.read_size();

            if bytes < nbs {
                self.head += bytes;
                if self.head == self.tail && self.chunks.len() == 1 {
                    self.reset_tail_chunk();
                }
                break;
            }

            bytes -= nbs;
            if self.chunks.len() == 1 {
                self.reset_tail_chunk();
                break;
            }

            self.chunks.pop_front();
            self.head = 0;
        }
    }

    fn reset_tail_chunk(&mut self) {
        self.chunks[0] = vec![0u8; DEFAULT_CHUNK];
        self.head = 0;
        self.tail = 0;
    }

    /// Grow the buffer by `bytes` and return the writable slice at the tail.
    ///
    /// When the current tail chunk cannot hold the reservation it is
    /// truncated to its filled length and a fresh chunk of
    /// `max(DEFAULT_CHUNK, bytes)` is appended, so one reservation is always
    /// contiguous.
    pub fn reserve(&mut self, bytes: usize) -> &mut [u8] {
        self.total_size += bytes;

        let tail_capacity = self
            .chunks
            .back()
            .map(Vec::len)
            .expect("ring buffer always holds at least one chunk");

        if self.tail + bytes <= tail_capacity {
            let start = self.tail;
            self.tail += bytes;
            let chunk = self
                .chunks
                .back_mut()
                .expect("ring buffer always holds at least one chunk");
            &mut chunk[start..start + bytes]
        } else {
            let filled = self.tail;
            self.chunks
                .back_mut()
                .expect("ring buffer always holds at least one chunk")
                .truncate(filled);
            self.chunks.push_back(vec![0u8; DEFAULT_CHUNK.max(bytes)]);
            self.tail = bytes;
            let chunk = self
                .chunks
                .back_mut()
                .expect("chunk pushed above");
            &mut chunk[..bytes]
        }
    }

    /// Roll back the unused suffix of the last reservation.
    pub fn unreserve(&mut self, bytes: usize) {
        assert!(
            bytes <= self.tail && bytes <= self.total_size,
            "unreserving {bytes} bytes past the last reservation"
        );
        self.total_size -= bytes;
        self.tail -= bytes;
    }

    /// Append `data`, growing the buffer as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let view = self.reserve(data.len());
        view.copy_from_slice(data);
    }

    /// Index one past the first occurrence of `byte`, scanning at most
    /// `max_len` bytes.
    ///
    /// Returns `Some(max_len)` when the scan limit is reached before the
    /// byte (the caller's read is then bounded at the limit), and `None`
    /// when the whole buffer holds no occurrence.
    pub fn index_after(&self, byte: u8, mut max_len: usize) -> Option<usize> {
        let mut index = 0usize;
        let mut start = self.head;
        let chunk_count = self.chunks.len();

        for (i, chunk) in self.chunks.iter().enumerate() {
            if max_len == 0 {
                return Some(index);
            }
            if index == self.total_size {
                return None;
            }

            let end = if i + 1 == chunk_count {
                self.tail
            } else {
                chunk.len()
            };
            let len = (end - start).min(max_len);

            if let Some(pos) = chunk[start..start + len].iter().position(|&b| b == byte) {
                return Some(index + pos + 1);
            }

            index += len;
            max_len -= len;
            start = 0;
        }

        if max_len == 0 {
            return Some(index);
        }
        None
    }

    /// Length of the first line (newline inclusive) within `max_len` bytes.
    pub fn line_size(&self, max_len: usize) -> Option<usize> {
        self.index_after(b'\n', max_len)
    }

    /// Whether a complete `\n`-terminated line is buffered.
    pub fn can_read_line(&self) -> bool {
        self.index_after(b'\n', usize::MAX).is_some()
    }

    /// Copy up to `dst.len()` bytes into `dst`, consuming them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let to_read = self.total_size.min(dst.len());
        let mut done = 0usize;

        while done < to_read {
            let step = {
                let front = self.read_pointer();
                let step = (to_read - done).min(front.len());
                dst[done..done + step].copy_from_slice(&front[..step]);
                step
            };
            done += step;
            self.free(step);
        }

        done
    }

    /// Copy out one line, newline inclusive, bounded by `dst.len()`.
    ///
    /// When no newline lies within the bound, reads the bound (or the whole
    /// buffer, whichever is smaller) instead.
    pub fn read_line(&mut self, dst: &mut [u8]) -> usize {
        let bound = dst.len().min(self.total_size);
        let line_len = self.line_size(bound).unwrap_or(bound);
        self.read(&mut dst[..line_len])
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
