//! Raw byte buffers exchanged with connections.
//!
//! A `RawBuffer` moves by value between the reactor and the event source, so
//! at any moment it has exactly one owner: the pool, the read side of a
//! connection, the write side of a connection, or the code about to free it.
//!
//! ## Disposition
//!
//! When a buffer comes back from the event source (filled by a read, or
//! flushed by a write) its next owner is decided by [`disposition`]. Both
//! completion paths go through the same function so the read and write
//! handlers cannot drift apart.

/// A fixed-capacity byte region with a filled window `[offset, offset + size)`.
#[derive(Debug)]
pub struct RawBuffer {
    bytes: Box<[u8]>,
    size: usize,
    offset: usize,
}

impl RawBuffer {
    /// Allocate a zeroed buffer with `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes currently filled.
    pub fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The filled bytes.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.size]
    }

    /// Unfilled space after the payload, where the next read lands.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.offset + self.size;
        &mut self.bytes[end..]
    }

    /// Record `n` bytes written into [`spare_mut`](Self::spare_mut).
    ///
    /// Clamped to the remaining capacity; returns the amount recorded.
    pub fn advance_filled(&mut self, n: usize) -> usize {
        let room = self.capacity() - self.offset - self.size;
        let n = n.min(room);
        self.size += n;
        n
    }

    /// Drop `n` bytes from the front of the payload after a partial write.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.size);
        self.offset += n;
        self.size -= n;
    }

    /// Reset to an empty buffer ready for the next read.
    pub fn clear(&mut self) {
        self.size = 0;
        self.offset = 0;
    }

    fn zero(&mut self) {
        self.bytes.fill(0);
        self.clear();
    }
}

/// Where a returned buffer goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Release to the pool.
    Free,
    /// Give back to the connection as read capacity.
    PendingRead,
    /// Hand to the connection's write path (echo).
    PendingWrite,
}

/// The exchange that returned a buffer to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Read,
    Written,
}

/// Which directions of a connection are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sides {
    pub read_open: bool,
    pub write_open: bool,
}

/// Decide the next owner of a buffer returned by `completion`.
///
/// Only a read buffer that carries data is echoed; empty buffers are never
/// written, so a stream of zero-length reads cannot spin the write path.
pub fn disposition(completion: Completion, has_payload: bool, sides: Sides) -> BufferState {
    match completion {
        Completion::Read if has_payload && sides.write_open => BufferState::PendingWrite,
        _ if sides.read_open => BufferState::PendingRead,
        _ => BufferState::Free,
    }
}

/// Reusable supply of raw buffers.
///
/// Buffers are allocated on demand. Released buffers are zeroed and kept on a
/// LIFO free list (bounded by `max_free`) so steady-state echo traffic does
/// not hit the allocator.
pub struct BufferPool {
    free_list: Vec<RawBuffer>,
    max_free: usize,
    acquired: u64,
    released: u64,
}

impl BufferPool {
    /// Create a pool that retains at most `max_free` released buffers.
    pub fn new(max_free: usize) -> Self {
        Self {
            free_list: Vec::with_capacity(max_free),
            max_free,
            acquired: 0,
            released: 0,
        }
    }

    /// Get a zeroed buffer of `capacity` bytes.
    pub fn acquire(&mut self, capacity: usize) -> RawBuffer {
        self.acquired += 1;
        match self
            .free_list
            .iter()
            .rposition(|buf| buf.capacity() == capacity)
        {
            Some(pos) => self.free_list.swap_remove(pos),
            None => RawBuffer::new(capacity),
        }
    }

    /// Get `count` zeroed buffers of `capacity` bytes.
    pub fn acquire_many(&mut self, count: usize, capacity: usize) -> Vec<RawBuffer> {
        (0..count).map(|_| self.acquire(capacity)).collect()
    }

    /// Return a buffer. It is zeroed for reuse or dropped if the free list is full.
    pub fn release(&mut self, mut buf: RawBuffer) {
        self.released += 1;
        if self.free_list.len() < self.max_free {
            buf.zero();
            self.free_list.push(buf);
        }
    }

    /// Buffers acquired and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }

    /// Buffers sitting on the free list.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}
