//! Bounded Ring Buffer
//!
//! Fixed-capacity byte queue used for flow control on every relay path.
//!
//! # Contract
//!
//! - `write` stores at most `avail_write()` bytes and reports how many it took.
//!   Short writes are normal: the caller keeps the remainder and retries later.
//! - `peek` copies buffered bytes out without consuming them, so a partial
//!   socket send can be retried from the same position.
//! - `consume` drops bytes only after they were confirmed transmitted.
//!
//! The storage is allocated once and never grows.

/// Fixed-capacity FIFO of bytes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Index of the oldest buffered byte
    head: usize,
    /// Number of buffered bytes
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes available to read.
    pub fn avail_read(&self) -> usize {
        self.len
    }

    /// Free space in bytes.
    pub fn avail_write(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Write cursor position.
    fn tail(&self) -> usize {
        let cap = self.capacity();
        if cap == 0 { 0 } else { (self.head + self.len) % cap }
    }

    /// Append as much of `data` as fits; returns the number of bytes stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.avail_write());
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let tail = self.tail();
        let first = n.min(cap - tail);
        self.storage[tail..tail + first].copy_from_slice(&data[..first]);
        // Wrap around to the start of the storage
        self.storage[..n - first].copy_from_slice(&data[first..n]);

        self.len += n;
        n
    }

    /// Copy up to `out.len()` buffered bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.storage[..n - first]);
        n
    }

    /// Drop up to `n` bytes from the front; returns the number dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }

        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            // Keep writes contiguous when the buffer empties
            self.head = 0;
        }
        n
    }

    /// Copy and consume up to `out.len()` bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
