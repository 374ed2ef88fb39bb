use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::error::PoolError;
use super::millislice::MillisliceMetadata;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pooled, fixed capacity byte buffer.
///
/// RawBuffer is move-only: at any moment it sits in the empty queue, is held by the
/// receiver while it fills, sits in the filled queue, or is held by the consumer.
/// Only a BufferPool allocates them, and each remembers which pool it belongs to.
#[derive(Debug)]
pub struct RawBuffer {
    data: Vec<u8>,
    capacity: usize,
    metadata: Option<MillisliceMetadata>,
    pool_id: u64,
}

impl RawBuffer {
    pub(crate) fn new(capacity: usize, pool_id: u64) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            metadata: None,
            pool_id,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn metadata(&self) -> Option<&MillisliceMetadata> {
        self.metadata.as_ref()
    }

    pub(crate) fn set_metadata(&mut self, metadata: MillisliceMetadata) {
        self.metadata = Some(metadata);
    }

    /// Writable view for the assembler. Callers must check `remaining()` first.
    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Forget contents and metadata, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.metadata = None;
    }
}

/// BufferPool moves RawBuffers between the receiver thread and the consumer.
///
/// Two bounded FIFO queues, `empty` and `filled`, are the only synchronisation points.
/// Handing a buffer over is a channel send, taking it is a channel receive, so a buffer
/// can never be owned twice. The pool handle is cheap to clone; all clones share queues.
/// Buffers allocated by another pool are refused, so the queues only ever hold buffers
/// counted in `in_circulation`.
#[derive(Debug, Clone)]
pub struct BufferPool {
    id: u64,
    empty_tx: Sender<RawBuffer>,
    empty_rx: Receiver<RawBuffer>,
    filled_tx: Sender<RawBuffer>,
    filled_rx: Receiver<RawBuffer>,
    capacity: usize,
    buffer_size: usize,
    in_circulation: Arc<AtomicUsize>,
    acquire_retries: u32,
    acquire_timeout: Duration,
}

impl BufferPool {
    /// Create the pool and allocate all of its buffers into the empty queue
    pub fn new(
        capacity: usize,
        buffer_size: usize,
        acquire_retries: u32,
        acquire_timeout: Duration,
    ) -> Self {
        let (empty_tx, empty_rx) = bounded(capacity);
        let (filled_tx, filled_rx) = bounded(capacity);
        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            empty_tx,
            empty_rx,
            filled_tx,
            filled_rx,
            capacity,
            buffer_size,
            in_circulation: Arc::new(AtomicUsize::new(0)),
            acquire_retries,
            acquire_timeout,
        };
        pool.replenish();
        pool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently owned by the pool, either queue or any holder
    pub fn in_circulation(&self) -> usize {
        self.in_circulation.load(Ordering::SeqCst)
    }

    pub fn empty_available(&self) -> usize {
        self.empty_rx.len()
    }

    pub fn filled_available(&self) -> usize {
        self.filled_rx.len()
    }

    /// Take an empty buffer, waiting `acquire_timeout` per attempt for up to
    /// `acquire_retries` attempts. Running dry is a fatal condition for the caller.
    pub fn acquire(&self) -> Result<RawBuffer, PoolError> {
        let attempts = self.acquire_retries.max(1);
        for attempt in 1..=attempts {
            match self.empty_rx.recv_timeout(self.acquire_timeout) {
                Ok(buffer) => return Ok(buffer),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "No empty buffers available (attempt {} of {})",
                        attempt,
                        attempts
                    );
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::Disconnected),
            }
        }
        Err(PoolError::Exhausted(attempts))
    }

    /// Hand a completed buffer to the consumer
    pub fn commit_filled(&self, buffer: RawBuffer) -> Result<(), PoolError> {
        self.check_owner(&buffer)?;
        Self::push(&self.filled_tx, buffer, self.capacity)
    }

    /// Take a filled buffer. A zero timeout blocks until one arrives.
    pub fn retrieve_filled(&self, timeout: Duration) -> Option<RawBuffer> {
        if timeout.is_zero() {
            self.filled_rx.recv().ok()
        } else {
            self.filled_rx.recv_timeout(timeout).ok()
        }
    }

    /// Give a buffer back to the empty queue, discarding its contents
    pub fn commit_empty(&self, mut buffer: RawBuffer) -> Result<(), PoolError> {
        self.check_owner(&buffer)?;
        buffer.clear();
        Self::push(&self.empty_tx, buffer, self.capacity)
    }

    /// Drain and discard the empty queue. Returns the number of buffers dropped.
    pub fn release_empty(&self) -> usize {
        self.drain(&self.empty_rx)
    }

    /// Drain and discard the filled queue so stale data never crosses into a new run.
    /// Returns the number of buffers dropped.
    pub fn release_filled(&self) -> usize {
        self.drain(&self.filled_rx)
    }

    /// Allocate fresh buffers until the pool is back at full capacity
    pub fn replenish(&self) -> usize {
        let mut added = 0;
        while self.in_circulation() < self.capacity {
            match self.empty_tx.try_send(RawBuffer::new(self.buffer_size, self.id)) {
                Ok(()) => {
                    self.in_circulation.fetch_add(1, Ordering::SeqCst);
                    added += 1;
                }
                Err(_) => break,
            }
        }
        added
    }

    fn check_owner(&self, buffer: &RawBuffer) -> Result<(), PoolError> {
        if buffer.pool_id == self.id {
            Ok(())
        } else {
            Err(PoolError::Foreign(buffer.pool_id, self.id))
        }
    }

    fn push(queue: &Sender<RawBuffer>, buffer: RawBuffer, capacity: usize) -> Result<(), PoolError> {
        match queue.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Overfull(capacity)),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Disconnected),
        }
    }

    fn drain(&self, queue: &Receiver<RawBuffer>) -> usize {
        let mut count = 0;
        while queue.try_recv().is_ok() {
            count += 1;
        }
        let _ = self
            .in_circulation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
        count
    }
}
