//! Log record buffers and the shared empty-buffer pool
//!
//! A [`RecordsBuffer`] has a single owner at any time. The WAL writer fills
//! it, seals it with the number of consumers that must serialize it (disk
//! flusher, replication, ...), and moves it along. Whoever performs the last
//! [`RecordsBuffer::mark_serialized`] hands it to the [`BufferPool`] for reuse.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Serialized log records waiting to be consumed
#[derive(Debug, Default)]
pub struct RecordsBuffer {
    data: Vec<u8>,
    pending_consumers: u32,
}

impl RecordsBuffer {
    /// Create an empty buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pending_consumers: 0,
        }
    }

    /// Create a buffer holding `bytes`, sealed for `consumers` consumers
    pub fn filled(bytes: &[u8], consumers: u32) -> Self {
        let mut buffer = Self::with_capacity(bytes.len());
        buffer.extend_from_slice(bytes);
        buffer.seal(consumers);
        buffer
    }

    /// Append serialized records
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Buffer contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Mark the buffer as filled; `consumers` must each call
    /// [`mark_serialized`](Self::mark_serialized) before it can be reused
    pub fn seal(&mut self, consumers: u32) {
        self.pending_consumers = consumers;
    }

    /// Record that one consumer is done with the buffer.
    ///
    /// Returns true once no consumer needs the contents anymore.
    pub fn mark_serialized(&mut self) -> bool {
        self.pending_consumers = self.pending_consumers.saturating_sub(1);
        self.pending_consumers == 0
    }

    /// Whether every consumer has serialized the buffer
    pub fn is_fully_serialized(&self) -> bool {
        self.pending_consumers == 0
    }

    /// Consumers that still need the contents
    pub fn pending_consumers(&self) -> u32 {
        self.pending_consumers
    }

    fn reset(&mut self) {
        self.data.clear();
        self.pending_consumers = 0;
    }
}

/// Pool of empty buffers shared by the WAL writer and its consumers
#[derive(Debug, Clone)]
pub struct BufferPool {
    sender: Sender<RecordsBuffer>,
    receiver: Receiver<RecordsBuffer>,
}

impl BufferPool {
    /// Create an empty pool holding at most `capacity` buffers
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Create a pool pre-filled with `count` buffers of `buffer_capacity` bytes
    pub fn with_buffers(count: usize, buffer_capacity: usize) -> Self {
        let pool = Self::new(count);
        for _ in 0..count {
            // Cannot fail: the pool was sized for exactly `count` buffers
            let _ = pool.enqueue(RecordsBuffer::with_capacity(buffer_capacity));
        }
        pool
    }

    /// Return a buffer to the pool.
    ///
    /// A buffer some consumer still needs is refused and handed back. When
    /// the pool is already full the buffer is dropped.
    pub fn enqueue(&self, mut buffer: RecordsBuffer) -> Result<(), RecordsBuffer> {
        if !buffer.is_fully_serialized() {
            return Err(buffer);
        }
        buffer.reset();
        match self.sender.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Buffer pool full, dropping returned buffer");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                // The pool holds its own receiver, so this cannot happen
                Ok(())
            }
        }
    }

    /// Take an empty buffer, blocking until one is available
    pub fn dequeue(&self) -> RecordsBuffer {
        // The pool holds its own sender, so the channel never disconnects
        self.receiver.recv().unwrap_or_default()
    }

    /// Take an empty buffer if one is available
    pub fn try_dequeue(&self) -> Option<RecordsBuffer> {
        self.receiver.try_recv().ok()
    }

    /// Number of buffers currently in the pool
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the pool has no buffers available
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
