//! Policy Evaluator
//!
//! Scores a policy version against a metric window with a configurable
//! objective. The default objective is a weighted combination of named
//! metric components, each with a direction (maximize/minimize), so the
//! same loop can optimize different goals without code changes.
//!
//! Evaluation is a pure function of its inputs: identical
//! (policy, window, objective, baseline) produce identical records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{ConfigError, LoopError, Result};
use crate::metrics::{MetricSample, Reduction};
use crate::policy::PolicyVersion;

/// Optimization direction for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    fn sign(&self) -> f64 {
        match self {
            Direction::Maximize => 1.0,
            Direction::Minimize => -1.0,
        }
    }
}

/// One weighted term of the objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveComponent {
    /// Metric name as recorded in samples
    pub metric: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub direction: Direction,
    /// Applied to vector-valued metrics before averaging over the window
    #[serde(default)]
    pub reduce: Reduction,
}

fn default_weight() -> f64 {
    1.0
}

impl ObjectiveComponent {
    pub fn maximize(metric: &str, weight: f64) -> Self {
        Self {
            metric: metric.to_string(),
            weight,
            direction: Direction::Maximize,
            reduce: Reduction::Mean,
        }
    }

    pub fn minimize(metric: &str, weight: f64) -> Self {
        Self {
            metric: metric.to_string(),
            weight,
            direction: Direction::Minimize,
            reduce: Reduction::Mean,
        }
    }
}

/// Objective configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    pub components: Vec<ObjectiveComponent>,
    /// Score changes within this band are neutral
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_epsilon() -> f64 {
    0.01
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            components: vec![
                ObjectiveComponent::maximize("task_success", 1.0),
                ObjectiveComponent::minimize("error_rate", 0.5),
                ObjectiveComponent::minimize("latency_ms", 0.001),
                ObjectiveComponent::minimize("resource_cost", 0.1),
            ],
            epsilon: default_epsilon(),
        }
    }
}

impl ObjectiveConfig {
    pub fn new(components: Vec<ObjectiveComponent>, epsilon: f64) -> Self {
        Self { components, epsilon }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.components.is_empty() {
            return Err(ConfigError::InvalidObjective("no components".to_string()));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ConfigError::InvalidObjective(format!(
                "epsilon must be finite and >= 0, got {}",
                self.epsilon
            )));
        }

        let mut seen = BTreeSet::new();
        for component in &self.components {
            if component.metric.trim().is_empty() {
                return Err(ConfigError::InvalidObjective("empty metric name".to_string()));
            }
            if !component.weight.is_finite() {
                return Err(ConfigError::InvalidObjective(format!(
                    "weight for '{}' is not finite",
                    component.metric
                )));
            }
            if !seen.insert(component.metric.as_str()) {
                return Err(ConfigError::InvalidObjective(format!(
                    "duplicate component '{}'",
                    component.metric
                )));
            }
        }
        Ok(())
    }
}

/// Score plus per-component contributions
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveScore {
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
}

/// Scoring capability
pub trait Objective: Send + Sync {
    fn name(&self) -> &str;

    /// Score a metric window; must be deterministic
    fn score(&self, window: &[MetricSample]) -> Result<ObjectiveScore>;
}

/// Weighted sum of window-averaged metric components
pub struct WeightedObjective {
    components: Vec<ObjectiveComponent>,
}

impl WeightedObjective {
    pub fn from_config(config: &ObjectiveConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            components: config.components.clone(),
        })
    }
}

impl Objective for WeightedObjective {
    fn name(&self) -> &str {
        "weighted"
    }

    fn score(&self, window: &[MetricSample]) -> Result<ObjectiveScore> {
        let mut breakdown = BTreeMap::new();
        let mut score = 0.0;

        for component in &self.components {
            let values: Vec<f64> = window
                .iter()
                .filter_map(|s| s.get(&component.metric))
                .filter_map(|v| v.reduce(component.reduce))
                .collect();

            let mean = Reduction::Mean
                .apply(&values)
                .ok_or_else(|| LoopError::MissingMetric(component.metric.clone()))?;

            let contribution = component.weight * component.direction.sign() * mean;
            score += contribution;
            breakdown.insert(component.metric.clone(), contribution);
        }

        Ok(ObjectiveScore { score, breakdown })
    }
}

/// Outcome of comparing a score to the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Reject,
    Neutral,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Reject => "reject",
            Verdict::Neutral => "neutral",
        }
    }
}

/// Immutable result of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub version_id: u64,
    /// Cycle of the most recent sample in the scored window
    pub cycle_id: Option<u64>,
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
    pub verdict: Verdict,
    /// Score the verdict was measured against
    pub baseline: Option<f64>,
}

/// Evaluator bound to an objective and tolerance band
#[derive(Clone)]
pub struct Evaluator {
    objective: Arc<dyn Objective>,
    epsilon: f64,
}

impl Evaluator {
    pub fn new(objective: Arc<dyn Objective>, epsilon: f64) -> Self {
        Self { objective, epsilon }
    }

    /// Build the weighted objective from config
    pub fn from_config(config: &ObjectiveConfig) -> std::result::Result<Self, ConfigError> {
        let objective = WeightedObjective::from_config(config)?;
        Ok(Self::new(Arc::new(objective), config.epsilon))
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn objective_name(&self) -> &str {
        self.objective.name()
    }

    /// Score `policy` on `window` and judge it against `baseline`
    ///
    /// Without a baseline the verdict is neutral.
    pub fn evaluate(
        &self,
        policy: &PolicyVersion,
        window: &[MetricSample],
        baseline: Option<f64>,
    ) -> Result<EvaluationRecord> {
        let ObjectiveScore { score, breakdown } = self.objective.score(window)?;
        // NaN would fall inside the epsilon band and read as neutral
        if !score.is_finite() {
            return Err(LoopError::NonFiniteMetric(format!(
                "{} objective",
                self.objective.name()
            )));
        }

        Ok(EvaluationRecord {
            version_id: policy.version_id,
            cycle_id: window.last().map(|s| s.cycle_id),
            score,
            breakdown,
            verdict: self.verdict(score, baseline),
            baseline,
        })
    }

    pub fn verdict(&self, score: f64, baseline: Option<f64>) -> Verdict {
        match baseline {
            None => Verdict::Neutral,
            Some(base) => {
                let delta = score - base;
                if delta > self.epsilon {
                    Verdict::Accept
                } else if delta < -self.epsilon {
                    Verdict::Reject
                } else {
                    Verdict::Neutral
                }
            }
        }
    }
}

/// One-shot evaluation against an objective config
pub fn evaluate(
    policy: &PolicyVersion,
    window: &[MetricSample],
    config: &ObjectiveConfig,
    baseline: Option<f64>,
) -> Result<EvaluationRecord> {
    Evaluator::from_config(config)?.evaluate(policy, window, baseline)
}
