//! Cairn - a time-series summary store for append-only numeric streams.
//!
//! Instead of retaining raw points, cairn keeps a dynamically re-bucketed
//! collection of *summary windows* whose sizes grow with age according to a
//! user-chosen windowing (exponential or power-law). Storage stays sublinear
//! in stream length while queries near the present remain precise and queries
//! far in the past degrade gracefully with bounded error. A *landmark*
//! facility preserves exact values over explicitly marked intervals.
//!
//! # Components
//!
//! - [`Db`] / [`Stream`]: the process-level surface; streams accept
//!   `(timestamp, value)` appends and serve range-aggregate queries
//! - [`pipeline::Pipeline`]: the staged ingest -> summarize -> write -> merge
//!   pipeline that maintains the windowing invariant online
//! - [`storage`]: byte-oriented key-value backends (in-memory and LMDB) plus
//!   the typed, cached backing store
//! - [`wal::Wal`]: per-stream write-ahead log used for crash recovery
//!
//! # Example
//!
//! ```rust,ignore
//! use cairn::{Db, QueryParams, WindowingSpec};
//!
//! let db = Db::new("/path/to/store")?;
//! let stream = db.new_stream(&["count", "sum"], WindowingSpec::Exponential { base: 2.0 })?;
//! stream.run()?;
//! for i in 0..100 {
//!     stream.append(i, i as f64)?;
//! }
//! stream.flush()?;
//! let result = stream.query("sum", 0, 99, &QueryParams::default())?;
//! ```

#![deny(missing_docs)]

pub mod agg;
pub mod db;
pub mod error;
pub mod heap;
pub mod manager;
pub mod pipeline;
pub mod storage;
pub mod stream;
pub mod wal;
pub mod window;

pub use agg::op::{AggResult, OpType, QueryParams};
pub use db::Db;
pub use error::{Result, StoreError};
pub use stream::{StoreConfig, Stream};
pub use window::WindowingSpec;

/// Sentinel window id / count marking "none"; all valid ids are larger.
pub const INVALID: i64 = i64::MIN;
