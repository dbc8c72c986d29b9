//! Aggregate operators: count, sum and max.

use crate::agg::estimator::{bounds_to_ci, sum_stats};
use crate::agg::{DataTable, LandmarkWindow, SummaryWindow};
use crate::error::{Result, StoreError};

/// Wire tag of an aggregate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    /// Point count.
    Count = 0,
    /// Value sum.
    Sum = 1,
    /// Value maximum.
    Max = 2,
}

impl OpType {
    /// Resolves a string operator name; `None` for unknown names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(OpType::Count),
            "sum" => Some(OpType::Sum),
            "max" => Some(OpType::Max),
            _ => None,
        }
    }

    /// Resolves a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(OpType::Count),
            1 => Some(OpType::Sum),
            2 => Some(OpType::Max),
            _ => None,
        }
    }

    /// The operator's string name.
    pub fn name(&self) -> &'static str {
        match self {
            OpType::Count => "count",
            OpType::Sum => "sum",
            OpType::Max => "max",
        }
    }
}

/// Confidence parameters for approximate queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryParams {
    /// Confidence level of the reported interval, in `[0, 1]`.
    pub confidence_level: f64,
    /// Multiplier on the estimate's standard deviation.
    pub sd_multiplier: f64,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            sd_multiplier: 1.0,
        }
    }
}

/// An aggregate query answer: the estimate plus its error bound (the width
/// of the confidence interval; zero means exact).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggResult {
    /// Estimated aggregates; only the queried operator's field is set.
    pub value: DataTable,
    /// Width of the confidence interval around the estimate.
    pub error: f64,
}

/// An aggregate operator over summary and landmark windows.
pub trait Op: Send + Sync {
    /// This operator's wire tag.
    fn op_type(&self) -> OpType;

    /// Folds one point into a window's data table.
    fn apply(&self, data: &mut DataTable, value: f64, timestamp: i64);

    /// Folds several tables into `ret`.
    fn merge(&self, ret: &mut DataTable, values: &[DataTable]);

    /// Answers a range query from candidate windows overlapping `[t0, t1]`.
    fn query(
        &self,
        windows: &[SummaryWindow],
        landmarks: &[LandmarkWindow],
        t0: i64,
        t1: i64,
        params: &QueryParams,
    ) -> AggResult;
}

struct CountOp;

impl Op for CountOp {
    fn op_type(&self) -> OpType {
        OpType::Count
    }

    fn apply(&self, data: &mut DataTable, _value: f64, _timestamp: i64) {
        data.count += 1.0;
    }

    fn merge(&self, ret: &mut DataTable, values: &[DataTable]) {
        for value in values {
            ret.count += value.count;
        }
    }

    fn query(
        &self,
        windows: &[SummaryWindow],
        landmarks: &[LandmarkWindow],
        t0: i64,
        t1: i64,
        params: &QueryParams,
    ) -> AggResult {
        let (bounds, moments) = sum_stats(t0, t1, windows, landmarks, |d| d.count, |_| 1.0);
        let ci = bounds_to_ci(
            &bounds,
            &moments,
            params.sd_multiplier,
            params.confidence_level,
        );
        let mut value = DataTable::new();
        value.count = ci.mean;
        AggResult {
            value,
            error: ci.upper - ci.lower,
        }
    }
}

struct SumOp;

impl Op for SumOp {
    fn op_type(&self) -> OpType {
        OpType::Sum
    }

    fn apply(&self, data: &mut DataTable, value: f64, _timestamp: i64) {
        data.sum += value;
    }

    fn merge(&self, ret: &mut DataTable, values: &[DataTable]) {
        for value in values {
            ret.sum += value.sum;
        }
    }

    fn query(
        &self,
        windows: &[SummaryWindow],
        landmarks: &[LandmarkWindow],
        t0: i64,
        t1: i64,
        params: &QueryParams,
    ) -> AggResult {
        let (bounds, moments) = sum_stats(t0, t1, windows, landmarks, |d| d.sum, |v| v);
        let ci = bounds_to_ci(
            &bounds,
            &moments,
            params.sd_multiplier,
            params.confidence_level,
        );
        let mut value = DataTable::new();
        value.sum = ci.mean;
        AggResult {
            value,
            error: ci.upper - ci.lower,
        }
    }
}

struct MaxOp;

impl Op for MaxOp {
    fn op_type(&self) -> OpType {
        OpType::Max
    }

    fn apply(&self, data: &mut DataTable, value: f64, _timestamp: i64) {
        data.max = data.max.max(value);
    }

    fn merge(&self, ret: &mut DataTable, values: &[DataTable]) {
        for value in values {
            ret.max = ret.max.max(value.max);
        }
    }

    fn query(
        &self,
        windows: &[SummaryWindow],
        landmarks: &[LandmarkWindow],
        t0: i64,
        t1: i64,
        _params: &QueryParams,
    ) -> AggResult {
        // The max over candidate windows is exact only when a landmark pins
        // it; otherwise a window straddling the interval edge may owe its
        // maximum to a point outside [t0, t1].
        let mut value = DataTable::new();
        let tables: Vec<DataTable> = windows.iter().map(|w| w.data).collect();
        self.merge(&mut value, &tables);

        let mut error = 1.0;
        for window in landmarks {
            for landmark in &window.landmarks {
                if landmark.timestamp >= t0 && landmark.timestamp <= t1 {
                    value.max = value.max.max(landmark.value);
                    error = 0.0;
                }
            }
        }
        AggResult { value, error }
    }
}

fn op_from_type(op_type: OpType) -> Box<dyn Op> {
    match op_type {
        OpType::Count => Box::new(CountOp),
        OpType::Sum => Box::new(SumOp),
        OpType::Max => Box::new(MaxOp),
    }
}

/// The set of operators configured on one stream.
pub struct OpSet {
    ops: Vec<Box<dyn Op>>,
}

impl std::fmt::Debug for OpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpSet")
            .field("ops", &self.ops.iter().map(|op| op.op_type()).collect::<Vec<_>>())
            .finish()
    }
}

impl OpSet {
    /// Builds the set from operator tags.
    pub fn new(op_types: &[OpType]) -> Self {
        Self {
            ops: op_types.iter().map(|&t| op_from_type(t)).collect(),
        }
    }

    /// Builds the set from string names, rejecting unknown ones.
    pub fn from_names(names: &[&str]) -> Result<Self> {
        let mut op_types = Vec::with_capacity(names.len());
        for name in names {
            let op_type = OpType::from_name(name)
                .ok_or_else(|| StoreError::UnknownOperator((*name).to_string()))?;
            op_types.push(op_type);
        }
        Ok(Self::new(&op_types))
    }

    /// Folds one point through every configured operator.
    pub fn insert(&self, data: &mut DataTable, value: f64, timestamp: i64) {
        for op in &self.ops {
            op.apply(data, value, timestamp);
        }
    }

    /// Merges several tables through every configured operator.
    pub fn merge(&self, values: &[DataTable]) -> DataTable {
        let mut merged = DataTable::new();
        for op in &self.ops {
            op.merge(&mut merged, values);
        }
        merged
    }

    /// Looks up a configured operator by name.
    pub fn op(&self, name: &str) -> Option<&dyn Op> {
        let op_type = OpType::from_name(name)?;
        self.ops
            .iter()
            .find(|op| op.op_type() == op_type)
            .map(|op| op.as_ref())
    }

    /// Wire tags of the configured operators, in configuration order.
    pub fn types(&self) -> Vec<OpType> {
        self.ops.iter().map(|op| op.op_type()).collect()
    }
}
