//! Policy Adapter
//!
//! Proposes candidate parameters from the active policy and the bounded
//! history of its own past evaluations. The baseline strategy perturbs each
//! tunable parameter by a step that shrinks after a streak of rejections
//! and grows after a streak of accepts: the loop's exploration rate is a
//! function of how its previous proposals fared.
//!
//! Strategies are pure over their inputs; all randomness comes from the
//! seed passed in.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::evaluator::{EvaluationRecord, Verdict};
use crate::policy::{ParameterMap, PolicyVersion};

/// Proposal capability
pub trait AdaptationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate parameters for the next version
    fn propose(
        &self,
        active: &PolicyVersion,
        history: &[EvaluationRecord],
        seed: u64,
    ) -> Result<ParameterMap>;

    /// Drop any internal exploration state
    fn reset(&mut self) {}
}

/// Trailing accept/reject streaks, ignoring neutral verdicts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Streaks {
    pub rejections: u32,
    pub accepts: u32,
}

impl Streaks {
    pub fn from_history(history: &[EvaluationRecord]) -> Self {
        let mut streaks = Streaks::default();
        let mut trailing: Option<Verdict> = None;

        for record in history.iter().rev() {
            match (record.verdict, trailing) {
                (Verdict::Neutral, _) => continue,
                (verdict, None) => {
                    trailing = Some(verdict);
                    streaks.bump(verdict);
                }
                (verdict, Some(t)) if verdict == t => streaks.bump(verdict),
                _ => break,
            }
        }

        streaks
    }

    fn bump(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Reject => self.rejections += 1,
            Verdict::Accept => self.accepts += 1,
            Verdict::Neutral => {}
        }
    }
}

/// Inclusive range for a parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamBounds {
    pub min: f64,
    pub max: f64,
}

/// Configuration for the baseline perturbation strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationConfig {
    /// Step with no streak
    pub base_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Multiplier per consecutive rejection (0 < f < 1)
    pub shrink_factor: f64,
    /// Multiplier per consecutive accept (>= 1)
    pub growth_factor: f64,
    /// Per-parameter clamps
    pub bounds: BTreeMap<String, ParamBounds>,
    /// Only these parameters are perturbed (all when None)
    pub tunable: Option<Vec<String>>,
}

impl Default for PerturbationConfig {
    fn default() -> Self {
        Self {
            base_step: 0.1,
            min_step: 0.001,
            max_step: 1.0,
            shrink_factor: 0.5,
            growth_factor: 1.5,
            bounds: BTreeMap::new(),
            tunable: None,
        }
    }
}

impl PerturbationConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidAdapter(format!("{} must be > 0, got {}", name, v)))
            }
        };
        positive("base_step", self.base_step)?;
        positive("min_step", self.min_step)?;
        positive("max_step", self.max_step)?;

        if self.min_step > self.max_step {
            return Err(ConfigError::InvalidAdapter(format!(
                "min_step {} exceeds max_step {}",
                self.min_step, self.max_step
            )));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(ConfigError::InvalidAdapter(format!(
                "shrink_factor must be in (0, 1), got {}",
                self.shrink_factor
            )));
        }
        if !(self.growth_factor.is_finite() && self.growth_factor >= 1.0) {
            return Err(ConfigError::InvalidAdapter(format!(
                "growth_factor must be >= 1, got {}",
                self.growth_factor
            )));
        }
        for (name, bounds) in &self.bounds {
            if !(bounds.min.is_finite() && bounds.max.is_finite() && bounds.min <= bounds.max) {
                return Err(ConfigError::InvalidAdapter(format!("invalid bounds for '{}'", name)));
            }
        }
        Ok(())
    }
}

/// Baseline strategy: history-conditioned random-sign perturbation
#[derive(Debug, Clone)]
pub struct PerturbationStrategy {
    config: PerturbationConfig,
}

impl PerturbationStrategy {
    pub fn new(config: PerturbationConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PerturbationConfig {
        &self.config
    }

    /// Exploration step implied by the evaluation history
    pub fn step_size(&self, history: &[EvaluationRecord]) -> f64 {
        let streaks = Streaks::from_history(history);
        let step = self.config.base_step
            * self.config.shrink_factor.powi(streaks.rejections as i32)
            * self.config.growth_factor.powi(streaks.accepts as i32);
        step.clamp(self.config.min_step, self.config.max_step)
    }

    fn is_tunable(&self, name: &str) -> bool {
        match &self.config.tunable {
            Some(names) => names.iter().any(|n| n == name),
            None => true,
        }
    }
}

impl AdaptationStrategy for PerturbationStrategy {
    fn name(&self) -> &str {
        "perturbation"
    }

    fn propose(
        &self,
        active: &PolicyVersion,
        history: &[EvaluationRecord],
        seed: u64,
    ) -> Result<ParameterMap> {
        let step = self.step_size(history);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut candidate = active.parameters.clone();

        // BTreeMap iteration order keeps draws reproducible
        for (name, value) in candidate.iter_mut() {
            if !self.is_tunable(name) {
                continue;
            }
            let delta = if rng.gen_bool(0.5) { step } else { -step };
            let mut next = *value + delta;
            if let Some(bounds) = self.config.bounds.get(name) {
                next = next.clamp(bounds.min, bounds.max);
            }
            *value = next;
        }

        debug!(
            "Proposed candidate from version {} (step {:.4}, {} history records)",
            active.version_id,
            step,
            history.len()
        );
        Ok(candidate)
    }
}

/// Largest absolute parameter change between two maps
pub fn perturbation_magnitude(from: &ParameterMap, to: &ParameterMap) -> f64 {
    to.iter()
        .filter_map(|(name, value)| from.get(name).map(|prev| (value - prev).abs()))
        .fold(0.0, f64::max)
}
