//! The per-stream processing pipeline.
//!
//! ```text
//! Append -> Ingester -> [summarizerQ] -> Summarizer -> [writerQ] -> Writer
//!              |                                                      |
//!              WAL (always, before append returns)        [mergerQ] -> Merger
//! ```
//!
//! Stages are worker threads connected by bounded queues. Flush and
//! shutdown travel through the same queues as data, as dedicated sentinel
//! variants, and a per-stage barrier turns their arrival into a quiescent
//! point: after the barrier walk every element appended so far is persisted
//! and every due merge is committed.

pub mod ingest;
pub mod merger;
pub mod summarizer;
pub mod writer;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::agg::SummaryWindow;
use crate::error::{Result, StoreError};
use crate::manager::StreamWindowManager;
use crate::storage::codec;
use crate::wal::Wal;
use crate::window::GenericWindowing;

use self::ingest::{IngestBuffer, Ingester};
use self::merger::{MergeEvent, Merger};
use self::summarizer::Summarizer;
use self::writer::Writer;

/// Capacity of every inter-stage queue.
pub(crate) const QUEUE_SIZE: usize = 100;

/// Item on the summarizer queue.
pub enum BufferPayload {
    /// A batch of raw points.
    Data(IngestBuffer),
    /// Flush sentinel: quiesce and keep running.
    Flush,
    /// Shutdown sentinel: quiesce and exit.
    Shutdown,
}

/// Item on the writer queue.
pub enum WindowPayload {
    /// A freshly summarized window.
    Data(SummaryWindow),
    /// Flush sentinel.
    Flush,
    /// Shutdown sentinel.
    Shutdown,
}

/// Item on the merger queue.
pub enum EventPayload {
    /// Announcement of a persisted window.
    Data(MergeEvent),
    /// Flush sentinel.
    Flush,
    /// Shutdown sentinel.
    Shutdown,
}

/// Barrier slot owned by one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The summarizer stage.
    Summarizer = 0,
    /// The writer stage.
    Writer = 1,
    /// The merger stage.
    Merger = 2,
}

/// One-shot quiescence signals, one slot per stage. A flush pushes a
/// sentinel down a stage's queue and waits on that stage's slot; the stage
/// notifies it once the sentinel is reached.
pub struct Barrier {
    slots: [(Sender<()>, Receiver<()>); 3],
}

impl Barrier {
    /// Creates a barrier with all three slots clear.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| bounded(1)),
        }
    }

    /// Signals the stage's slot.
    pub fn notify(&self, stage: Stage) {
        let _ = self.slots[stage as usize].0.send(());
    }

    /// Blocks until the stage's slot is signalled.
    pub fn wait(&self, stage: Stage) {
        let _ = self.slots[stage as usize].1.recv();
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

/// First worker error recorded anywhere in the pipeline; surfaced to the
/// next driving call.
#[derive(Clone, Default)]
pub(crate) struct FaultSlot(Arc<Mutex<Option<StoreError>>>);

impl FaultSlot {
    pub(crate) fn set(&self, error: StoreError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            warn!("pipeline worker fault: {error}");
            *slot = Some(error);
        }
    }

    pub(crate) fn take(&self) -> Option<StoreError> {
        self.0.lock().unwrap().take()
    }
}

/// The staged append pipeline of one stream.
pub struct Pipeline {
    manager: Arc<StreamWindowManager>,
    wal: Option<Mutex<Wal>>,
    ingester: Mutex<Ingester>,
    summarizer: Mutex<Option<Summarizer>>,
    writer: Arc<Writer>,
    merger: Arc<Merger>,
    barrier: Arc<Barrier>,
    windowing: Arc<Mutex<GenericWindowing>>,
    buffer_size: AtomicI64,
    num_elements: AtomicI64,
    last_timestamp: AtomicI64,
    summarizer_rx: Mutex<Option<Receiver<BufferPayload>>>,
    writer_tx: Sender<WindowPayload>,
    writer_rx: Mutex<Option<Receiver<WindowPayload>>>,
    merger_tx: Sender<EventPayload>,
    merger_rx: Mutex<Option<Receiver<EventPayload>>>,
    partial_tx: Sender<IngestBuffer>,
    partial_rx: Receiver<IngestBuffer>,
    fault: FaultSlot,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Assembles an unbuffered pipeline over the given manager, windowing
    /// and optional WAL. Call [`Pipeline::set_buffer_size`] for buffered
    /// ingestion and [`Pipeline::run`] to spawn the stage workers.
    pub fn new(
        manager: Arc<StreamWindowManager>,
        windowing: GenericWindowing,
        wal: Option<Wal>,
    ) -> Self {
        let (summarizer_tx, summarizer_rx) = bounded(QUEUE_SIZE);
        let (writer_tx, writer_rx) = bounded(QUEUE_SIZE);
        let (merger_tx, merger_rx) = bounded(QUEUE_SIZE);
        let (partial_tx, partial_rx) = bounded(QUEUE_SIZE);
        let barrier = Arc::new(Barrier::new());
        let windowing = Arc::new(Mutex::new(windowing));

        let ingester = Ingester::new(summarizer_tx);
        let summarizer = Summarizer::new(Arc::clone(&manager), Arc::clone(&barrier));
        let writer = Arc::new(Writer::new(Arc::clone(&manager), Arc::clone(&barrier)));
        let merger = Arc::new(Merger::new(
            Arc::clone(&manager),
            Arc::clone(&windowing),
            Arc::clone(&barrier),
            1,
        ));

        Self {
            manager,
            wal: wal.map(Mutex::new),
            ingester: Mutex::new(ingester),
            summarizer: Mutex::new(Some(summarizer)),
            writer,
            merger,
            barrier,
            windowing,
            buffer_size: AtomicI64::new(0),
            num_elements: AtomicI64::new(0),
            last_timestamp: AtomicI64::new(0),
            summarizer_rx: Mutex::new(Some(summarizer_rx)),
            writer_tx,
            writer_rx: Mutex::new(Some(writer_rx)),
            merger_tx,
            merger_rx: Mutex::new(Some(merger_rx)),
            partial_tx,
            partial_rx,
            fault: FaultSlot::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Elements appended so far.
    pub fn num_elements(&self) -> i64 {
        self.num_elements.load(Ordering::Acquire)
    }

    /// Configures buffered ingestion: each ingest buffer covers the longest
    /// windowing prefix not exceeding `each_buffer_size` elements, so full
    /// buffers summarize with no partial tail.
    pub fn set_buffer_size(&self, each_buffer_size: i64) -> Result<()> {
        let lengths = self
            .windowing
            .lock()
            .unwrap()
            .windows_covering_upto(each_buffer_size);
        if each_buffer_size > 0 && lengths.is_empty() {
            return Err(StoreError::Conflict(each_buffer_size));
        }
        let capacity: i64 = lengths.iter().sum();
        let mut summarizer = self.summarizer.lock().unwrap();
        let summarizer = summarizer
            .as_mut()
            .ok_or(StoreError::InvalidState("pipeline already running"))?;
        summarizer.set_window_lengths(lengths);
        self.ingester
            .lock()
            .unwrap()
            .set_buffer_capacity(capacity as usize);
        self.buffer_size.store(capacity, Ordering::Release);
        Ok(())
    }

    /// Caps outstanding ingest buffers.
    pub fn set_num_buffers(&self, num_buffers: i64) {
        self.ingester
            .lock()
            .unwrap()
            .allocator()
            .set_max_buffers(num_buffers);
    }

    /// Sets how many window arrivals the merger bundles per commit.
    pub fn set_windows_per_batch(&self, windows_per_batch: i64) {
        self.merger.set_windows_per_batch(windows_per_batch);
    }

    /// Spawns the summarizer, writer and merger workers.
    pub fn run(&self) -> Result<()> {
        let summarizer = self
            .summarizer
            .lock()
            .unwrap()
            .take()
            .ok_or(StoreError::InvalidState("pipeline already running"))?;
        let summarizer_rx = self.summarizer_rx.lock().unwrap().take();
        let writer_rx = self.writer_rx.lock().unwrap().take();
        let merger_rx = self.merger_rx.lock().unwrap().take();
        let (Some(summarizer_rx), Some(writer_rx), Some(merger_rx)) =
            (summarizer_rx, writer_rx, merger_rx)
        else {
            return Err(StoreError::InvalidState("pipeline already running"));
        };

        let mut workers = self.workers.lock().unwrap();
        {
            let writer_queue = self.writer_tx.clone();
            let partial_buffers = self.partial_tx.clone();
            let fault = self.fault.clone();
            workers.push(thread::Builder::new().name("summarizer".into()).spawn(
                move || summarizer.run(summarizer_rx, writer_queue, partial_buffers, fault),
            )?);
        }
        {
            let writer = Arc::clone(&self.writer);
            let merger_queue = self.merger_tx.clone();
            let fault = self.fault.clone();
            workers.push(
                thread::Builder::new()
                    .name("writer".into())
                    .spawn(move || writer.run(writer_rx, merger_queue, fault))?,
            );
        }
        {
            let merger = Arc::clone(&self.merger);
            let fault = self.fault.clone();
            workers.push(
                thread::Builder::new()
                    .name("merger".into())
                    .spawn(move || merger.run(merger_rx, fault))?,
            );
        }
        Ok(())
    }

    /// Appends one point: clamps out-of-order timestamps, routes through the
    /// buffered or unbuffered path, and logs the point to the WAL.
    pub fn append(&self, timestamp: i64, value: f64) -> Result<()> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        let mut timestamp = timestamp;
        let last = self.last_timestamp.load(Ordering::Acquire);
        if timestamp < last {
            warn!(timestamp, last, "out of order append, clamping");
            timestamp = last + 1;
        }

        if self.buffer_size.load(Ordering::Acquire) > 0 {
            self.ingester.lock().unwrap().append(timestamp, value)?;
        } else {
            let count = self.num_elements.load(Ordering::Acquire);
            self.append_unbuffered(timestamp, value, count)?;
        }

        let index = self.num_elements.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_timestamp.store(timestamp, Ordering::Release);
        if let Some(wal) = &self.wal {
            wal.lock()
                .unwrap()
                .append(index as u64, &codec::encode_point(timestamp, value))?;
        }
        Ok(())
    }

    /// Feeds a single-point window through the writer and merger
    /// synchronously, bypassing the queues. `count` is the element's
    /// zero-based position in the stream.
    fn append_unbuffered(&self, timestamp: i64, value: f64, count: i64) -> Result<()> {
        let mut window = SummaryWindow::new(timestamp, timestamp, count, count);
        self.manager
            .insert_into_summary_window(&mut window, timestamp, value);
        let event = self.writer.process(window)?;
        self.merger.process(event)
    }

    /// Quiesces the pipeline stage by stage, then drains partial buffers
    /// synchronously and syncs the WAL. With `shutdown` the workers exit
    /// after quiescing.
    pub fn flush(&self, shutdown: bool) -> Result<()> {
        debug!(shutdown, "flushing pipeline");
        if self.ingester.lock().unwrap().flush(shutdown).is_err() {
            return Err(self.take_fault());
        }
        self.barrier.wait(Stage::Summarizer);

        let window_sentinel = if shutdown {
            WindowPayload::Shutdown
        } else {
            WindowPayload::Flush
        };
        if self.writer_tx.send(window_sentinel).is_err() {
            return Err(self.take_fault());
        }
        self.barrier.wait(Stage::Writer);

        let event_sentinel = if shutdown {
            EventPayload::Shutdown
        } else {
            EventPayload::Flush
        };
        if self.merger_tx.send(event_sentinel).is_err() {
            return Err(self.take_fault());
        }
        self.barrier.wait(Stage::Merger);

        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }

        // Partial tails merge one point at a time; no batching while the
        // queues are quiet.
        let saved_batch = self.merger.windows_per_batch();
        self.merger.set_windows_per_batch(1);
        let drained = self.drain_partial_buffers();
        self.merger.set_windows_per_batch(saved_batch);
        drained?;

        if let Some(wal) = &self.wal {
            debug!("syncing WAL");
            wal.lock().unwrap().sync()?;
        }
        Ok(())
    }

    fn take_fault(&self) -> StoreError {
        self.fault
            .take()
            .unwrap_or(StoreError::InvalidState("pipeline worker exited"))
    }

    /// Re-appends the points of every partial buffer through the unbuffered
    /// path, undoing their earlier count bookkeeping first.
    fn drain_partial_buffers(&self) -> Result<()> {
        while let Ok(buffer) = self.partial_rx.try_recv() {
            debug!(points = buffer.len(), "draining partial ingest buffer");
            self.num_elements
                .fetch_sub(buffer.len() as i64, Ordering::AcqRel);
            for i in 0..buffer.len() {
                let (timestamp, value) = buffer
                    .get(i)
                    .ok_or(StoreError::InvalidState("partial buffer shrank"))?;
                let count = self.num_elements.load(Ordering::Acquire);
                self.append_unbuffered(timestamp, value, count)?;
                self.num_elements.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Reloads counters from the WAL and the durable stage counters.
    pub fn prime_up(&self) -> Result<()> {
        let wal = self
            .wal
            .as_ref()
            .ok_or(StoreError::InvalidState("cannot prime without a WAL"))?;
        {
            let mut wal = wal.lock().unwrap();
            let last_index = wal.last_index();
            if last_index > 0 {
                let (timestamp, _) = codec::decode_point(&wal.read(last_index)?)?;
                self.last_timestamp.store(timestamp, Ordering::Release);
            }
            self.num_elements.store(last_index as i64, Ordering::Release);
            if let Some(summarizer) = self.summarizer.lock().unwrap().as_mut() {
                summarizer.set_num_elements(last_index as i64);
            }
        }
        self.writer.prime_up()?;
        self.merger.prime_up()
    }

    /// Replays the WAL past the durable counters: windows persisted but not
    /// merged are re-announced to the merger, points never persisted are
    /// re-appended unbuffered.
    pub fn restore(&self) -> Result<()> {
        let wal = self
            .wal
            .as_ref()
            .ok_or(StoreError::InvalidState("cannot restore without a WAL"))?;
        let merger_n = self.merger.num_elements();
        let writer_n = self.writer.num_elements();
        let append_n = self.num_elements.load(Ordering::Acquire);

        for n in merger_n + 1..=writer_n {
            let payload = wal.lock().unwrap().read(n as u64)?;
            let (timestamp, _) = codec::decode_point(&payload)?;
            // Only entries at a window boundary name a persisted window.
            match self.manager.summary_window(timestamp) {
                Ok(window) => self.merger.process(MergeEvent {
                    id: window.id(),
                    size: window.size(),
                })?,
                Err(StoreError::WindowNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for n in writer_n + 1..=append_n {
            let payload = wal.lock().unwrap().read(n as u64)?;
            let (timestamp, value) = codec::decode_point(&payload)?;
            self.append_unbuffered(timestamp, value, n - 1)?;
        }
        if append_n > writer_n {
            debug!(replayed = append_n - writer_n, "replayed unpersisted WAL entries");
        }
        Ok(())
    }

    /// Joins every spawned worker.
    pub(crate) fn join_workers(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}
