//! Aggregate records: the summary and landmark window types and the data
//! table of operator scalars they carry.

pub mod estimator;
pub mod op;

/// Aggregate scalars carried by every summary window.
///
/// Only the fields of configured operators are meaningful; the rest keep
/// their initial values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataTable {
    /// Number of folded points.
    pub count: f64,
    /// Sum of folded values.
    pub sum: f64,
    /// Maximum of folded values.
    pub max: f64,
}

impl DataTable {
    /// An empty table: zero count and sum, max at its identity.
    pub fn new() -> Self {
        Self {
            count: 0.0,
            sum: 0.0,
            max: -f64::MAX,
        }
    }
}

impl Default for DataTable {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable aggregate over a contiguous count and time range.
///
/// A stream is a list of contiguous summary windows: the count ranges
/// partition `[0, N-1]` and `time_start` strictly increases. The window id
/// is its start timestamp, which is stable across merges (the head of a
/// merge keeps its id).
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryWindow {
    /// First timestamp folded into this window.
    pub time_start: i64,
    /// Last timestamp folded into this window.
    pub time_end: i64,
    /// Index of the first contained element.
    pub count_start: i64,
    /// Index of the last contained element.
    pub count_end: i64,
    /// Operator aggregates over the contained points.
    pub data: DataTable,
}

impl SummaryWindow {
    /// Creates an empty window spanning the given time and count ranges.
    pub fn new(time_start: i64, time_end: i64, count_start: i64, count_end: i64) -> Self {
        Self {
            time_start,
            time_end,
            count_start,
            count_end,
            data: DataTable::new(),
        }
    }

    /// Window id; equals the start timestamp.
    pub fn id(&self) -> i64 {
        self.time_start
    }

    /// Number of elements this window covers.
    pub fn size(&self) -> i64 {
        self.count_end - self.count_start + 1
    }
}

/// A single exactly-retained point inside a landmark window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// Arrival timestamp.
    pub timestamp: i64,
    /// Appended value, stored verbatim.
    pub value: f64,
}

/// A window holding exact values over an explicitly marked interval.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkWindow {
    /// Interval start.
    pub time_start: i64,
    /// Interval end; set when the window is closed.
    pub time_end: i64,
    /// Points retained verbatim, in arrival order.
    pub landmarks: Vec<Landmark>,
}

impl LandmarkWindow {
    /// Opens a landmark window at the given timestamp.
    pub fn new(time_start: i64) -> Self {
        Self {
            time_start,
            time_end: 0,
            landmarks: Vec::new(),
        }
    }

    /// Window id; equals the start timestamp.
    pub fn id(&self) -> i64 {
        self.time_start
    }

    /// Records a point verbatim.
    pub fn insert(&mut self, timestamp: i64, value: f64) {
        self.landmarks.push(Landmark { timestamp, value });
    }

    /// Closes the interval at the given timestamp.
    pub fn close(&mut self, timestamp: i64) {
        self.time_end = timestamp;
    }
}
