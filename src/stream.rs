//! One append-only stream: its pipeline, landmark lifecycle and queries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::agg::op::{AggResult, OpSet, QueryParams};
use crate::agg::LandmarkWindow;
use crate::error::{Result, StoreError};
use crate::manager::StreamWindowManager;
use crate::pipeline::Pipeline;
use crate::storage::codec::StreamMeta;
use crate::storage::{Backend, BackingStore};
use crate::wal::{Wal, WalConfig};
use crate::window::GenericWindowing;

/// Tuning knobs for a stream's pipeline.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Elements each ingest buffer should cover (0 for unbuffered).
    pub each_buffer_size: i64,
    /// Cap on outstanding ingest buffers.
    pub num_buffers: i64,
    /// Window arrivals bundled into one merge commit.
    pub windows_per_batch: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            each_buffer_size: 32,
            num_buffers: 8,
            windows_per_batch: 8,
        }
    }
}

/// An append-only numeric stream backed by summary windows.
///
/// Created through [`crate::Db::new_stream`]; appends are single-writer.
pub struct Stream {
    stream_id: i64,
    manager: Arc<StreamWindowManager>,
    pipeline: Pipeline,
    landmark: Mutex<Option<LandmarkWindow>>,
    running: AtomicBool,
    meta: StreamMeta,
}

impl Stream {
    /// Assembles a stream from its persisted description. `wal_dir` is the
    /// database directory; `None` runs without a WAL (tests only).
    pub(crate) fn assemble(
        wal_dir: Option<&Path>,
        meta: StreamMeta,
        backend: Arc<dyn Backend>,
        cache_enabled: bool,
    ) -> Result<Self> {
        let operators = OpSet::new(&meta.operators);
        let store = BackingStore::new(backend, cache_enabled);
        let manager = Arc::new(StreamWindowManager::new(meta.id, operators, store));
        let wal = match wal_dir {
            Some(dir) => Some(Wal::open(
                dir.join(format!("wal-{}", meta.id)),
                WalConfig::default(),
            )?),
            None => None,
        };
        let windowing = GenericWindowing::new(meta.windowing.sequence());
        let pipeline = Pipeline::new(Arc::clone(&manager), windowing, wal);
        Ok(Self {
            stream_id: meta.id,
            manager,
            pipeline,
            landmark: Mutex::new(None),
            running: AtomicBool::new(false),
            meta,
        })
    }

    /// This stream's id.
    pub fn id(&self) -> i64 {
        self.stream_id
    }

    /// The persisted stream description.
    pub(crate) fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// The stream's window catalogue.
    pub fn manager(&self) -> &Arc<StreamWindowManager> {
        &self.manager
    }

    /// Applies pipeline tuning; must precede [`Stream::run`].
    pub fn set_config(&self, config: &StoreConfig) -> Result<()> {
        self.pipeline.set_buffer_size(config.each_buffer_size)?;
        self.pipeline.set_num_buffers(config.num_buffers);
        self.pipeline.set_windows_per_batch(config.windows_per_batch);
        Ok(())
    }

    /// Spawns the pipeline workers; appends are admitted afterwards.
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(StoreError::InvalidState("stream already running"));
        }
        self.pipeline.run()
    }

    /// Rebuilds in-memory state from the backing store and replays the WAL
    /// past the durable stage counters.
    pub(crate) fn prime_up(&self) -> Result<()> {
        self.manager.prime_up()?;
        self.pipeline.prime_up()?;
        self.pipeline.restore()
    }

    /// Appends one point. Timestamps must be non-decreasing; stragglers are
    /// clamped forward. While a landmark is open the point is retained
    /// verbatim in the landmark window instead of entering the pipeline.
    pub fn append(&self, timestamp: i64, value: f64) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(StoreError::InvalidState("stream is not running"));
        }
        let mut landmark = self.landmark.lock().unwrap();
        if let Some(window) = landmark.as_mut() {
            window.insert(timestamp, value);
            return Ok(());
        }
        drop(landmark);
        self.pipeline.append(timestamp, value)
    }

    /// Opens a landmark window at `timestamp`.
    pub fn start_landmark(&self, timestamp: i64) -> Result<()> {
        let mut landmark = self.landmark.lock().unwrap();
        if landmark.is_some() {
            return Err(StoreError::InvalidState("landmark already open"));
        }
        *landmark = Some(LandmarkWindow::new(timestamp));
        Ok(())
    }

    /// Closes the open landmark window at `timestamp` and persists it.
    pub fn end_landmark(&self, timestamp: i64) -> Result<()> {
        let mut window = self
            .landmark
            .lock()
            .unwrap()
            .take()
            .ok_or(StoreError::InvalidState("no open landmark"))?;
        window.close(timestamp);
        debug!(
            stream = self.stream_id,
            points = window.landmarks.len(),
            "closing landmark window"
        );
        self.manager.put_landmark_window(&window)
    }

    /// Quiesces the pipeline: all appended points persisted, due merges
    /// committed, WAL synced.
    pub fn flush(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(StoreError::InvalidState("stream is not running"));
        }
        self.pipeline.flush(false)
    }

    /// Flushes, shuts the pipeline workers down and joins them. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.pipeline.flush(true)?;
        self.pipeline.join_workers();
        Ok(())
    }

    /// Answers an approximate range-aggregate query over `[t0, t1]`.
    ///
    /// A running stream is flushed first so the answer reflects every
    /// acknowledged append.
    pub fn query(
        &self,
        op_name: &str,
        t0: i64,
        t1: i64,
        params: &QueryParams,
    ) -> Result<AggResult> {
        let op = self
            .manager
            .operators()
            .op(op_name)
            .ok_or_else(|| StoreError::UnknownOperator(op_name.to_string()))?;
        if self.running.load(Ordering::Acquire) {
            self.flush()?;
        }
        let summary_windows = self.manager.summary_windows_in_range(t0, t1)?;
        let landmark_windows = self.manager.landmark_windows_in_range(t0, t1)?;
        Ok(op.query(&summary_windows, &landmark_windows, t0, t1, params))
    }
}
