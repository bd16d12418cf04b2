//! Self-Aware Feedback Loop Controller
//!
//! Drives one cycle at a time:
//! 1. **Collect**: run the agent task under the active policy, record metrics
//! 2. **Evaluate**: score the active policy over its own recent samples
//! 3. **Adapt**: ask the strategy for a candidate, conditioned on its own
//!    evaluation history
//! 4. **Commit**: store the candidate as a new version, run and score it
//! 5. **Accept or reject**: move the active pointer or keep it
//!
//! A cycle that aborts leaves no metric sample, evaluation or stability
//! progress behind; only its cycle id and any committed candidate remain.
//!
//! The controller is the only writer of `CycleState`. Cycles never overlap;
//! a stop request is honored only between cycles, so no half-evaluated
//! candidate is ever made active.
//!
//! Status machine: Running -> Converged (terminal), Running -> Halted
//! (terminal), Running <-> Diverging (recovered by resetting or swapping
//! the strategy).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdaptationStrategy, PerturbationConfig, PerturbationStrategy, Streaks};
use crate::error::{ConfigError, LoopError, Result, TaskError};
use crate::evaluator::{EvaluationRecord, Evaluator, ObjectiveConfig, Verdict};
use crate::metrics::{MetricCollector, MetricSample};
use crate::observability::{LoopEvent, ObservabilitySink};
use crate::persistence::PolicyPersistence;
use crate::policy::{PolicyStore, PolicyVersion};
use crate::runner::{AgentTaskRunner, TaskOutcome};

/// Loop status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Converged,
    Diverging,
    Halted,
}

impl LoopStatus {
    /// No further cycles can ever run
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopStatus::Converged | LoopStatus::Halted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Converged => "converged",
            LoopStatus::Diverging => "diverging",
            LoopStatus::Halted => "halted",
        }
    }
}

/// Why the loop halted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// Task collaborator failed more times in a row than the retry budget
    TaskFailures { consecutive: u32, last_error: String },
    /// Stop signal or explicit halt request
    Requested { message: String },
    /// Policy store contract violated
    StoreInconsistency { message: String },
}

/// The single mutable entity of the loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    /// Last cycle started (0 before the first)
    pub cycle_id: u64,
    pub active_version_id: u64,
    pub consecutive_rejections: u32,
    pub status: LoopStatus,
    pub halt_reason: Option<HaltReason>,
}

/// Which policy an evaluation scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationRole {
    Active,
    Candidate,
}

impl EvaluationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationRole::Active => "active",
            EvaluationRole::Candidate => "candidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EvaluationRole::Active),
            "candidate" => Some(EvaluationRole::Candidate),
            _ => None,
        }
    }
}

/// Evaluation record with its cycle context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub cycle_id: u64,
    pub role: EvaluationRole,
    pub record: EvaluationRecord,
}

/// What a single `step` did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Accepted { cycle_id: u64, version_id: u64, score: f64 },
    /// Adopted within the epsilon band; rejection streak untouched
    Neutral { cycle_id: u64, version_id: u64, score: f64 },
    Rejected { cycle_id: u64, version_id: u64, score: f64 },
    Converged { cycle_id: u64 },
    /// Rejection that pushed the streak to the divergence threshold
    Diverged { cycle_id: u64, version_id: u64 },
    /// Cycle discarded after a recoverable failure
    Aborted { cycle_id: u64, error: LoopError },
    Halted { cycle_id: u64, reason: HaltReason },
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Cycles per `run` call (0 = until a terminal or diverging status)
    pub max_cycles: u64,
    /// Samples scored when evaluating the active policy
    pub evaluation_window: usize,
    /// Candidate evaluations handed to the strategy
    pub history_window: usize,
    /// Consecutive rejections that mark the loop as diverging
    pub divergence_threshold: u32,
    /// Active scores compared for stability
    pub stability_window: usize,
    /// Consecutive stable cycles required to converge
    pub stability_cycles: u32,
    /// Consecutive task failures tolerated before halting
    pub task_retry_budget: u32,
    pub task_timeout_ms: Option<u64>,
    /// Pause between cycles inside `run`
    pub cycle_interval_ms: u64,
    pub seed: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: 100,
            evaluation_window: 5,
            history_window: 10,
            divergence_threshold: 5,
            stability_window: 3,
            stability_cycles: 3,
            task_retry_budget: 3,
            task_timeout_ms: None,
            cycle_interval_ms: 0,
            seed: 0,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let checks: [(&str, bool); 6] = [
            ("evaluation_window must be >= 1", self.evaluation_window >= 1),
            ("history_window must be >= 1", self.history_window >= 1),
            ("divergence_threshold must be >= 1", self.divergence_threshold >= 1),
            ("stability_window must be >= 2", self.stability_window >= 2),
            ("stability_cycles must be >= 1", self.stability_cycles >= 1),
            ("task_timeout_ms must be > 0", self.task_timeout_ms != Some(0)),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((message, _)) => Err(ConfigError::InvalidLoop(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Serializable end-of-run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub run_id: String,
    pub cycles: u64,
    pub versions: usize,
    pub accepted_versions: usize,
    pub active_version_id: u64,
    pub active_score: Option<f64>,
    pub best_score: Option<f64>,
    pub consecutive_rejections: u32,
    pub status: LoopStatus,
    pub halt_reason: Option<HaltReason>,
}

/// Requests a stop at the next cycle boundary
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    runner: Arc<dyn AgentTaskRunner>,
    store: PolicyStore,
    config: LoopConfig,
    objective: ObjectiveConfig,
    evaluator: Option<Evaluator>,
    strategy: Option<Box<dyn AdaptationStrategy>>,
    persistence: Option<Arc<dyn PolicyPersistence>>,
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl ControllerBuilder {
    pub fn new(runner: Arc<dyn AgentTaskRunner>, store: PolicyStore) -> Self {
        Self {
            runner,
            store,
            config: LoopConfig::default(),
            objective: ObjectiveConfig::default(),
            evaluator: None,
            strategy: None,
            persistence: None,
            sinks: Vec::new(),
        }
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn objective(mut self, objective: ObjectiveConfig) -> Self {
        self.objective = objective;
        self
    }

    /// Use a custom objective instead of the weighted config
    pub fn evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn strategy(mut self, strategy: Box<dyn AdaptationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PolicyPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validate configuration and assemble the controller
    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;
        let evaluator = match self.evaluator {
            Some(evaluator) => evaluator,
            None => Evaluator::from_config(&self.objective)?,
        };
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => Box::new(PerturbationStrategy::new(PerturbationConfig::default())?),
        };

        let store = Arc::new(self.store);
        let store_len = store.len() as u64;
        let mut cycle_id = 0;
        let mut audit = Vec::new();

        if let Some(persistence) = &self.persistence {
            sync_store(persistence.as_ref(), &store)?;
            cycle_id = persistence.load_last_cycle()?;
            audit = persistence.load_evaluations()?;
        }

        let candidates: Vec<EvaluationRecord> = audit
            .iter()
            .filter(|e| e.role == EvaluationRole::Candidate)
            .map(|e| e.record.clone())
            .collect();
        let recent = &candidates[candidates.len().saturating_sub(self.config.history_window)..];
        let consecutive_rejections = Streaks::from_history(recent).rejections;
        let adaptation_history: VecDeque<EvaluationRecord> = recent.iter().cloned().collect();
        let best_score = audit
            .iter()
            .map(|e| e.record.score)
            .filter(|score| score.is_finite())
            .reduce(f64::max);

        let (stop_tx, stop_rx) = watch::channel(false);
        let run_id = Uuid::new_v4();

        info!(
            "Feedback loop {} ready: active version {}, resuming after cycle {}",
            run_id,
            store.active_id(),
            cycle_id
        );

        Ok(Controller {
            state: CycleState {
                cycle_id,
                active_version_id: store.active_id(),
                consecutive_rejections,
                status: LoopStatus::Running,
                halt_reason: None,
            },
            config: self.config,
            evaluator,
            strategy,
            runner: self.runner,
            store,
            metrics: Arc::new(MetricCollector::new()),
            trials: Arc::new(MetricCollector::new()),
            persistence: self.persistence,
            sinks: self.sinks,
            adaptation_history,
            active_scores: VecDeque::new(),
            stable_cycles: 0,
            consecutive_failures: 0,
            audit,
            best_score,
            active_since: cycle_id,
            persisted_versions: store_len,
            unsynced_accepted: VecDeque::new(),
            unsynced_active: None,
            run_id,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }
}

/// Write any versions the backend has not seen yet
fn sync_store(persistence: &dyn PolicyPersistence, store: &PolicyStore) -> Result<()> {
    let persisted = persistence.load_versions()?.len();
    if persisted > store.len() {
        return Err(LoopError::Persistence(format!(
            "persisted history ({} versions) is ahead of the store ({})",
            persisted,
            store.len()
        )));
    }
    for version in store.history().iter().skip(persisted) {
        persistence.save_version(version)?;
    }
    for version_id in store.accepted_ids() {
        persistence.save_accepted(version_id)?;
    }
    persistence.save_active(store.active_id())
}

/// Feedback loop controller
pub struct Controller {
    config: LoopConfig,
    evaluator: Evaluator,
    strategy: Box<dyn AdaptationStrategy>,
    runner: Arc<dyn AgentTaskRunner>,
    store: Arc<PolicyStore>,
    /// Samples taken under the active policy
    metrics: Arc<MetricCollector>,
    /// Samples taken under each cycle's candidate
    trials: Arc<MetricCollector>,
    persistence: Option<Arc<dyn PolicyPersistence>>,
    sinks: Vec<Arc<dyn ObservabilitySink>>,
    state: CycleState,
    adaptation_history: VecDeque<EvaluationRecord>,
    active_scores: VecDeque<f64>,
    stable_cycles: u32,
    consecutive_failures: u32,
    audit: Vec<AuditEntry>,
    best_score: Option<f64>,
    /// Last cycle before the active version took over; later main samples
    /// were all taken under it
    active_since: u64,
    /// Versions 1..=n are known to be in the persistence backend
    persisted_versions: u64,
    unsynced_accepted: VecDeque<u64>,
    unsynced_active: Option<u64>,
    run_id: Uuid,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Controller {
    pub fn builder(runner: Arc<dyn AgentTaskRunner>, store: PolicyStore) -> ControllerBuilder {
        ControllerBuilder::new(runner, store)
    }

    /// Copy of the current cycle state
    pub fn state(&self) -> CycleState {
        self.state.clone()
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status
    }

    pub fn halt_reason(&self) -> Option<&HaltReason> {
        self.state.halt_reason.as_ref()
    }

    /// Shared read access for audit collaborators
    pub fn store(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Arc<MetricCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn trials(&self) -> Arc<MetricCollector> {
        Arc::clone(&self.trials)
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Halt on request; takes effect immediately since no cycle is in flight
    pub fn halt(&mut self, message: impl Into<String>) {
        if self.state.status.is_terminal() {
            return;
        }
        self.halt_with(HaltReason::Requested {
            message: message.into(),
        });
    }

    /// Recover from divergence with a fresh exploration history
    ///
    /// Returns false unless the loop was diverging.
    pub fn reset_strategy(&mut self) -> bool {
        if self.state.status != LoopStatus::Diverging {
            return false;
        }
        self.strategy.reset();
        self.recover();
        true
    }

    /// Replace the adaptation strategy; recovers a diverging loop
    pub fn swap_strategy(&mut self, strategy: Box<dyn AdaptationStrategy>) {
        info!("Swapping strategy {} -> {}", self.strategy.name(), strategy.name());
        self.strategy = strategy;
        if self.state.status == LoopStatus::Diverging {
            self.recover();
        }
    }

    fn recover(&mut self) {
        self.adaptation_history.clear();
        self.state.consecutive_rejections = 0;
        self.transition(LoopStatus::Running);
    }

    /// Run cycles until the budget is spent, the loop leaves `Running`,
    /// or a stop is requested
    pub async fn run(&mut self) -> Result<LoopSummary> {
        info!(
            "Feedback loop {} running (strategy: {}, objective: {})",
            self.run_id,
            self.strategy.name(),
            self.evaluator.objective_name()
        );

        let mut executed = 0u64;
        while self.state.status == LoopStatus::Running {
            if self.config.max_cycles > 0 && executed >= self.config.max_cycles {
                info!("Cycle budget of {} exhausted", self.config.max_cycles);
                break;
            }

            if let CycleOutcome::Aborted { cycle_id, error } = self.step().await? {
                warn!("Cycle {} aborted: {}", cycle_id, error);
            }
            executed += 1;

            if self.config.cycle_interval_ms > 0 && self.state.status == LoopStatus::Running {
                let pause = Duration::from_millis(self.config.cycle_interval_ms);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.stop_rx.changed() => {
                        debug!("Stop signal received during cycle pause");
                    }
                }
            }
        }

        let summary = self.summary();
        info!(
            "Feedback loop {} stopped: {} after {} cycles (active version {})",
            self.run_id,
            summary.status.as_str(),
            executed,
            summary.active_version_id
        );
        Ok(summary)
    }

    /// Execute exactly one cycle
    pub async fn step(&mut self) -> Result<CycleOutcome> {
        if self.state.status != LoopStatus::Running {
            return Err(LoopError::NotRunning(self.state.status.as_str().to_string()));
        }

        if *self.stop_rx.borrow() {
            let reason = HaltReason::Requested {
                message: "stop signal".to_string(),
            };
            self.halt_with(reason.clone());
            return Ok(CycleOutcome::Halted {
                cycle_id: self.state.cycle_id,
                reason,
            });
        }

        // Ids are consumed even when the cycle aborts
        let cycle_id = self.state.cycle_id + 1;
        self.state.cycle_id = cycle_id;
        self.persist(|p| p.save_last_cycle(cycle_id));
        debug!("Cycle {} starting (active version {})", cycle_id, self.store.active_id());

        let outcome = match self.run_cycle(cycle_id).await {
            Ok(outcome) => {
                self.consecutive_failures = 0;
                outcome
            }
            Err(e) if e.is_store_inconsistency() => {
                let reason = HaltReason::StoreInconsistency {
                    message: e.to_string(),
                };
                self.halt_with(reason.clone());
                CycleOutcome::Halted { cycle_id, reason }
            }
            Err(e) => self.record_failure(cycle_id, e),
        };

        self.state.active_version_id = self.store.active_id();
        self.emit(LoopEvent::CycleCompleted {
            state: self.state.clone(),
        });
        Ok(outcome)
    }

    async fn run_cycle(&mut self, cycle_id: u64) -> Result<CycleOutcome> {
        // Collect
        let active = self.store.active();
        let outcome = self.run_task(&active).await?;
        let sample = MetricSample::new(cycle_id, outcome.values)?;

        // Evaluate the active policy on its own samples only
        let mut window: Vec<MetricSample> = self
            .metrics
            .window(self.config.evaluation_window - 1)
            .into_iter()
            .filter(|s| s.cycle_id > self.active_since)
            .collect();
        window.push(sample.clone());
        let baseline = self.active_scores.back().copied();
        let active_eval = self.evaluator.evaluate(&active, &window, baseline)?;
        let active_score = active_eval.score;

        // Nothing above is kept unless the cycle completes
        let pending = PendingActive {
            sample,
            evaluation: active_eval,
            stability: self.stability_after(active_score),
        };

        if pending.stability.converged {
            self.commit_active(cycle_id, pending)?;
            self.transition(LoopStatus::Converged);
            return Ok(CycleOutcome::Converged { cycle_id });
        }

        // Adapt
        let history = self.adaptation_history.make_contiguous();
        let parameters =
            self.strategy
                .propose(&active, history, cycle_seed(self.config.seed, cycle_id))?;

        // Commit and trial the candidate
        let candidate = self.store.commit(parameters, active.version_id)?;
        self.flush();

        let trial = self.run_task(&candidate).await?;
        let trial_sample = MetricSample::new(cycle_id, trial.values)?;
        let candidate_eval = self.evaluator.evaluate(
            &candidate,
            std::slice::from_ref(&trial_sample),
            Some(active_score),
        )?;
        let verdict = candidate_eval.verdict;
        let candidate_score = candidate_eval.score;

        self.commit_active(cycle_id, pending)?;
        self.trials.push(trial_sample)?;
        self.adaptation_history.push_back(candidate_eval.clone());
        while self.adaptation_history.len() > self.config.history_window {
            self.adaptation_history.pop_front();
        }
        self.record_evaluation(cycle_id, EvaluationRole::Candidate, candidate_eval);

        let version_id = candidate.version_id;
        match verdict {
            Verdict::Accept | Verdict::Neutral => {
                self.adopt(cycle_id, version_id)?;
                self.track_best(candidate_score);
                if verdict == Verdict::Accept {
                    self.state.consecutive_rejections = 0;
                    info!(
                        "Cycle {}: accepted version {} (score {:.4} vs {:.4})",
                        cycle_id, version_id, candidate_score, active_score
                    );
                    Ok(CycleOutcome::Accepted { cycle_id, version_id, score: candidate_score })
                } else {
                    debug!("Cycle {}: neutral, adopting version {}", cycle_id, version_id);
                    Ok(CycleOutcome::Neutral { cycle_id, version_id, score: candidate_score })
                }
            }
            Verdict::Reject => {
                self.state.consecutive_rejections += 1;
                debug!(
                    "Cycle {}: rejected version {} (score {:.4} vs {:.4}, streak {})",
                    cycle_id,
                    version_id,
                    candidate_score,
                    active_score,
                    self.state.consecutive_rejections
                );

                if self.state.consecutive_rejections >= self.config.divergence_threshold {
                    self.transition(LoopStatus::Diverging);
                    Ok(CycleOutcome::Diverged { cycle_id, version_id })
                } else {
                    Ok(CycleOutcome::Rejected { cycle_id, version_id, score: candidate_score })
                }
            }
        }
    }

    /// Keep the active-side results of a completed cycle
    fn commit_active(&mut self, cycle_id: u64, pending: PendingActive) -> Result<()> {
        self.metrics.push(pending.sample)?;
        self.track_best(pending.evaluation.score);
        self.record_evaluation(cycle_id, EvaluationRole::Active, pending.evaluation);
        self.active_scores = pending.stability.scores;
        self.stable_cycles = pending.stability.stable_cycles;
        Ok(())
    }

    async fn run_task(&self, policy: &PolicyVersion) -> Result<TaskOutcome> {
        let outcome = match self.config.task_timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                match tokio::time::timeout(limit, self.runner.run_task(policy)).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Timeout(limit)),
                }
            }
            None => self.runner.run_task(policy).await,
        };
        Ok(outcome?)
    }

    fn adopt(&mut self, cycle_id: u64, version_id: u64) -> Result<()> {
        self.store.mark_accepted(version_id)?;
        self.store.set_active(version_id)?;
        self.state.active_version_id = version_id;
        self.active_since = cycle_id;
        self.unsynced_accepted.push_back(version_id);
        self.unsynced_active = Some(version_id);
        self.flush();
        Ok(())
    }

    /// Count a recoverable failure; halt once the retry budget is spent
    fn record_failure(&mut self, cycle_id: u64, error: LoopError) -> CycleOutcome {
        self.consecutive_failures += 1;
        warn!(
            "Cycle {} failed ({}/{} retries used): {}",
            cycle_id, self.consecutive_failures, self.config.task_retry_budget, error
        );

        if self.consecutive_failures > self.config.task_retry_budget {
            let reason = HaltReason::TaskFailures {
                consecutive: self.consecutive_failures,
                last_error: error.to_string(),
            };
            self.halt_with(reason.clone());
            CycleOutcome::Halted { cycle_id, reason }
        } else {
            CycleOutcome::Aborted { cycle_id, error }
        }
    }

    /// Stability bookkeeping as it would stand after scoring `score`
    fn stability_after(&self, score: f64) -> Stability {
        let mut scores = self.active_scores.clone();
        scores.push_back(score);
        while scores.len() > self.config.stability_window {
            scores.pop_front();
        }

        let mut stable_cycles = self.stable_cycles;
        if scores.len() >= self.config.stability_window {
            let first = scores.front().copied().unwrap_or(score);
            if (score - first).abs() < self.evaluator.epsilon() {
                stable_cycles += 1;
            } else {
                stable_cycles = 0;
            }
        }

        Stability {
            converged: stable_cycles >= self.config.stability_cycles,
            scores,
            stable_cycles,
        }
    }

    fn track_best(&mut self, score: f64) {
        if self.best_score.map_or(true, |best| score > best) {
            self.best_score = Some(score);
        }
    }

    fn record_evaluation(&mut self, cycle_id: u64, role: EvaluationRole, record: EvaluationRecord) {
        let entry = AuditEntry {
            cycle_id,
            role,
            record,
        };
        self.persist(|p| p.save_evaluation(&entry));
        self.emit(LoopEvent::Evaluation {
            cycle_id,
            role,
            record: entry.record.clone(),
        });
        self.audit.push(entry);
    }

    fn halt_with(&mut self, reason: HaltReason) {
        warn!("Feedback loop halting: {:?}", reason);
        self.state.halt_reason = Some(reason);
        self.transition(LoopStatus::Halted);
    }

    fn transition(&mut self, to: LoopStatus) {
        let from = self.state.status;
        if from == to {
            return;
        }
        self.state.status = to;
        info!("Loop status {} -> {} at cycle {}", from.as_str(), to.as_str(), self.state.cycle_id);
        self.emit(LoopEvent::Transition {
            from,
            to,
            state: self.state.clone(),
        });
    }

    fn emit(&self, event: LoopEvent) {
        for sink in &self.sinks {
            sink.publish(&event);
        }
    }

    /// Best-effort durability; failures never change loop behavior
    fn persist<F>(&self, f: F)
    where
        F: FnOnce(&dyn PolicyPersistence) -> Result<()>,
    {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = f(persistence.as_ref()) {
                warn!("Persistence write failed: {}", e);
            }
        }
    }

    /// Write unsaved versions, then accepted ids and the active pointer
    ///
    /// Versions go out strictly in id order and a failure leaves the rest
    /// queued for the next flush, so the backend never holds a gap or an
    /// accepted id for a version it does not have.
    fn flush(&mut self) {
        if let Some(persistence) = self.persistence.clone() {
            if let Err(e) = self.flush_to(persistence.as_ref()) {
                warn!(
                    "Persistence write failed ({} of {} versions saved): {}",
                    self.persisted_versions,
                    self.store.len(),
                    e
                );
            }
        }
    }

    fn flush_to(&mut self, persistence: &dyn PolicyPersistence) -> Result<()> {
        while self.persisted_versions < self.store.len() as u64 {
            let version = self.store.get(self.persisted_versions + 1)?;
            persistence.save_version(&version)?;
            self.persisted_versions += 1;
        }
        while let Some(&version_id) = self.unsynced_accepted.front() {
            if version_id > self.persisted_versions {
                break;
            }
            persistence.save_accepted(version_id)?;
            self.unsynced_accepted.pop_front();
        }
        if let Some(version_id) = self.unsynced_active {
            if self.unsynced_accepted.is_empty() && version_id <= self.persisted_versions {
                persistence.save_active(version_id)?;
                self.unsynced_active = None;
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> LoopSummary {
        let active_score = self
            .audit
            .iter()
            .rev()
            .find(|e| e.record.version_id == self.state.active_version_id)
            .map(|e| e.record.score);

        LoopSummary {
            run_id: self.run_id.to_string(),
            cycles: self.state.cycle_id,
            versions: self.store.len(),
            accepted_versions: self.store.accepted_ids().len(),
            active_version_id: self.state.active_version_id,
            active_score,
            best_score: self.best_score,
            consecutive_rejections: self.state.consecutive_rejections,
            status: self.state.status,
            halt_reason: self.state.halt_reason.clone(),
        }
    }
}

/// Convergence bookkeeping computed ahead of time
struct Stability {
    scores: VecDeque<f64>,
    stable_cycles: u32,
    converged: bool,
}

/// Active-policy results held back until the cycle completes
struct PendingActive {
    sample: MetricSample,
    evaluation: EvaluationRecord,
    stability: Stability,
}

/// Per-cycle seed derived from the run seed
fn cycle_seed(seed: u64, cycle_id: u64) -> u64 {
    seed ^ cycle_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
