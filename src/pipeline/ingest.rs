//! Ingest buffers, their allocator, and the ingester stage.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam::channel::Sender;

use crate::error::{Result, StoreError};
use crate::pipeline::BufferPayload;

/// Caps the number of ingest buffers outstanding across the pipeline,
/// providing backpressure from the summarizer back to the producer.
///
/// [`BufferAllocator::allocate`] blocks while the cap is reached; buffers
/// release their allocation when dropped.
#[derive(Debug)]
pub struct BufferAllocator {
    state: Mutex<AllocatorState>,
    cv: Condvar,
}

#[derive(Debug)]
struct AllocatorState {
    current_buffers: i64,
    max_buffers: i64,
}

impl BufferAllocator {
    /// Creates an allocator admitting one outstanding buffer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AllocatorState {
                current_buffers: 0,
                max_buffers: 1,
            }),
            cv: Condvar::new(),
        })
    }

    /// Allocates a buffer, blocking until the cap admits one.
    pub fn allocate(self: &Arc<Self>, capacity: usize) -> IngestBuffer {
        let mut state = self.state.lock().unwrap();
        while state.current_buffers >= state.max_buffers {
            state = self.cv.wait(state).unwrap();
        }
        state.current_buffers += 1;
        drop(state);
        IngestBuffer::with_allocator(capacity, Arc::clone(self))
    }

    fn deallocate(&self) {
        let mut state = self.state.lock().unwrap();
        state.current_buffers -= 1;
        self.cv.notify_all();
    }

    /// Adjusts the cap, waking blocked allocations.
    pub fn set_max_buffers(&self, max_buffers: i64) {
        let mut state = self.state.lock().unwrap();
        state.max_buffers = max_buffers;
        self.cv.notify_all();
    }

    /// Buffers currently allocated and not yet dropped.
    pub fn outstanding(&self) -> i64 {
        self.state.lock().unwrap().current_buffers
    }
}

/// A fixed-capacity batch of raw points, stored as parallel arrays.
#[derive(Debug)]
pub struct IngestBuffer {
    timestamps: Vec<i64>,
    values: Vec<f64>,
    capacity: usize,
    allocator: Option<Arc<BufferAllocator>>,
}

impl IngestBuffer {
    /// Creates an unmanaged buffer (no allocator accounting).
    pub fn new(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            allocator: None,
        }
    }

    fn with_allocator(capacity: usize, allocator: Arc<BufferAllocator>) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            allocator: Some(allocator),
        }
    }

    /// Appends a point; false when the buffer is full.
    pub fn append(&mut self, timestamp: i64, value: f64) -> bool {
        if self.is_full() {
            return false;
        }
        self.timestamps.push(timestamp);
        self.values.push(value);
        true
    }

    /// True once `capacity` points are buffered.
    pub fn is_full(&self) -> bool {
        self.timestamps.len() == self.capacity
    }

    /// Number of buffered points.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// True when no points are buffered.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// The point at `pos`, if buffered.
    pub fn get(&self, pos: usize) -> Option<(i64, f64)> {
        Some((*self.timestamps.get(pos)?, *self.values.get(pos)?))
    }

    /// Buffered timestamps.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Buffered values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Drops the first `count` points, shifting the rest to the front.
    pub fn truncate_head(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.timestamps.drain(..count);
        self.values.drain(..count);
    }
}

impl Drop for IngestBuffer {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.deallocate();
        }
    }
}

/// First pipeline stage: batches appended points into ingest buffers and
/// hands full buffers to the summarizer queue.
pub struct Ingester {
    active: Option<IngestBuffer>,
    allocator: Arc<BufferAllocator>,
    buffer_capacity: usize,
    summarizer_queue: Sender<BufferPayload>,
}

impl Ingester {
    /// Creates an ingester feeding the given summarizer queue.
    pub fn new(summarizer_queue: Sender<BufferPayload>) -> Self {
        Self {
            active: None,
            allocator: BufferAllocator::new(),
            buffer_capacity: 0,
            summarizer_queue,
        }
    }

    /// The allocator throttling this ingester.
    pub fn allocator(&self) -> &Arc<BufferAllocator> {
        &self.allocator
    }

    /// Sets the capacity of subsequently allocated buffers.
    pub fn set_buffer_capacity(&mut self, capacity: usize) {
        self.buffer_capacity = capacity;
    }

    /// Buffers one point, blocking on the allocator when no buffer is free.
    pub fn append(&mut self, timestamp: i64, value: f64) -> Result<()> {
        let allocator = &self.allocator;
        let capacity = self.buffer_capacity;
        let buffer = self
            .active
            .get_or_insert_with(|| allocator.allocate(capacity));
        buffer.append(timestamp, value);
        if buffer.is_full() {
            self.push_active()?;
        }
        Ok(())
    }

    fn push_active(&mut self) -> Result<()> {
        if let Some(buffer) = self.active.take() {
            if !buffer.is_empty() {
                self.summarizer_queue
                    .send(BufferPayload::Data(buffer))
                    .map_err(|_| StoreError::InvalidState("summarizer queue closed"))?;
            }
        }
        Ok(())
    }

    /// Pushes any active buffer followed by a flush or shutdown sentinel.
    pub fn flush(&mut self, shutdown: bool) -> Result<()> {
        self.push_active()?;
        let sentinel = if shutdown {
            BufferPayload::Shutdown
        } else {
            BufferPayload::Flush
        };
        self.summarizer_queue
            .send(sentinel)
            .map_err(|_| StoreError::InvalidState("summarizer queue closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_buffer_append_and_truncate() {
        let mut buffer = IngestBuffer::new(4);
        for i in 0..4 {
            assert!(buffer.append(i, i as f64));
        }
        assert!(buffer.is_full());
        assert!(!buffer.append(5, 5.0));

        buffer.truncate_head(3);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(0), Some((3, 3.0)));
    }

    #[test]
    fn test_allocator_accounting_via_drop() {
        let allocator = BufferAllocator::new();
        allocator.set_max_buffers(2);
        let a = allocator.allocate(4);
        let b = allocator.allocate(4);
        assert_eq!(allocator.outstanding(), 2);
        drop(a);
        assert_eq!(allocator.outstanding(), 1);
        drop(b);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_allocator_blocks_until_release() {
        let allocator = BufferAllocator::new();
        allocator.set_max_buffers(1);
        let held = allocator.allocate(4);

        let contender = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                let _buffer = allocator.allocate(4);
            })
        };
        // The contender cannot finish while the first buffer is held.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());

        drop(held);
        contender.join().unwrap();
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_ingester_pushes_full_buffers_and_sentinel() {
        let (tx, rx) = unbounded();
        let mut ingester = Ingester::new(tx);
        ingester.set_buffer_capacity(10);
        ingester.allocator().set_max_buffers(100);

        for i in 0..20 {
            ingester.append(i, i as f64).unwrap();
        }
        ingester.flush(false).unwrap();

        let buffers: Vec<BufferPayload> = rx.try_iter().collect();
        assert_eq!(buffers.len(), 3);
        match &buffers[0] {
            BufferPayload::Data(buffer) => {
                assert_eq!(buffer.len(), 10);
                assert_eq!(buffer.timestamps()[0], 0);
                assert_eq!(buffer.timestamps()[9], 9);
            }
            _ => panic!("expected a data buffer"),
        }
        match &buffers[1] {
            BufferPayload::Data(buffer) => {
                assert_eq!(buffer.timestamps()[0], 10);
                assert_eq!(buffer.timestamps()[9], 19);
            }
            _ => panic!("expected a data buffer"),
        }
        assert!(matches!(buffers[2], BufferPayload::Flush));
    }

    #[test]
    fn test_ingester_shutdown_sentinel() {
        let (tx, rx) = unbounded();
        let mut ingester = Ingester::new(tx);
        ingester.set_buffer_capacity(10);
        ingester.flush(true).unwrap();
        let buffers: Vec<BufferPayload> = rx.try_iter().collect();
        assert_eq!(buffers.len(), 1);
        assert!(matches!(buffers[0], BufferPayload::Shutdown));
    }
}
