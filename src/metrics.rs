//! Metric Collector
//!
//! Append-only log of per-cycle performance signals (task success,
//! latency, resource cost, error rate) keyed by cycle id.
//! Readers always receive a cloned snapshot, never a live reference.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LoopError, Result};

/// A single named metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// How a vector value (or a window of values) collapses to one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    Last,
}

impl Reduction {
    /// Reduce a slice; None when empty
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let reduced = match self {
            Reduction::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reduction::Sum => values.iter().sum(),
            Reduction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reduction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Last => values[values.len() - 1],
        };
        Some(reduced)
    }
}

impl MetricValue {
    /// Collapse to a scalar
    pub fn reduce(&self, reduction: Reduction) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Vector(values) => reduction.apply(values),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(v: Vec<f64>) -> Self {
        MetricValue::Vector(v)
    }
}

/// Immutable record of one cycle's signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cycle_id: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub values: BTreeMap<String, MetricValue>,
}

impl MetricSample {
    /// Stamp a new sample; every value must be finite
    pub fn new(cycle_id: u64, values: BTreeMap<String, MetricValue>) -> Result<Self> {
        let bad = values.iter().find(|(_, value)| match value {
            MetricValue::Scalar(v) => !v.is_finite(),
            MetricValue::Vector(vs) => vs.iter().any(|v| !v.is_finite()),
        });
        if let Some((name, _)) = bad {
            return Err(LoopError::NonFiniteMetric(name.clone()));
        }

        Ok(Self {
            cycle_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            values,
        })
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }
}

struct MetricLog {
    samples: Vec<Arc<MetricSample>>,
    last_cycle: u64,
}

/// Ordered, append-only metric log
pub struct MetricCollector {
    log: RwLock<MetricLog>,
    /// Oldest samples beyond this are dropped from memory (ordering is kept)
    retention: Option<usize>,
}

impl MetricCollector {
    /// Create an unbounded collector
    pub fn new() -> Self {
        Self {
            log: RwLock::new(MetricLog {
                samples: Vec::new(),
                last_cycle: 0,
            }),
            retention: None,
        }
    }

    /// Create a collector that keeps at most `retention` samples in memory
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: Some(retention.max(1)),
            ..Self::new()
        }
    }

    /// Record a sample for `cycle_id`
    ///
    /// Fails with `InvalidCycle` unless `cycle_id` is greater than the
    /// last recorded one, and with `NonFiniteMetric` on NaN or infinity.
    pub fn record(
        &self,
        cycle_id: u64,
        values: BTreeMap<String, MetricValue>,
    ) -> Result<MetricSample> {
        self.push(MetricSample::new(cycle_id, values)?)
    }

    /// Append a sample built earlier with [`MetricSample::new`]
    pub fn push(&self, sample: MetricSample) -> Result<MetricSample> {
        let mut log = self.log.write();
        if sample.cycle_id <= log.last_cycle {
            return Err(LoopError::InvalidCycle {
                cycle_id: sample.cycle_id,
                last: log.last_cycle,
            });
        }

        log.last_cycle = sample.cycle_id;
        log.samples.push(Arc::new(sample.clone()));

        if let Some(max) = self.retention {
            if log.samples.len() > max {
                let excess = log.samples.len() - max;
                log.samples.drain(..excess);
            }
        }

        debug!(
            "Recorded metrics for cycle {} ({} values)",
            sample.cycle_id,
            sample.values.len()
        );
        Ok(sample)
    }

    /// Last `n` samples, most recent last
    pub fn window(&self, n: usize) -> Vec<MetricSample> {
        let log = self.log.read();
        let start = log.samples.len().saturating_sub(n);
        log.samples[start..].iter().map(|s| (**s).clone()).collect()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<MetricSample> {
        self.log.read().samples.last().map(|s| (**s).clone())
    }

    /// Highest cycle id recorded so far (0 if none)
    pub fn last_cycle(&self) -> u64 {
        self.log.read().last_cycle
    }

    pub fn len(&self) -> usize {
        self.log.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}
