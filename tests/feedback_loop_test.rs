//! End-to-end feedback loop scenarios

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use safla::adapter::perturbation_magnitude;
use safla::{
    AdaptationStrategy, AgentTaskRunner, ChannelSink, Controller, CycleOutcome, EvaluationRecord,
    FnRunner, HaltReason, LoopConfig, LoopError, LoopEvent, LoopStatus, ObjectiveComponent,
    ObjectiveConfig, ParameterMap, PerturbationConfig, PerturbationStrategy, PolicyStore,
    PolicyVersion, TaskError, TaskOutcome,
};

fn reward_objective(epsilon: f64) -> ObjectiveConfig {
    ObjectiveConfig::new(vec![ObjectiveComponent::maximize("reward", 1.0)], epsilon)
}

fn store_at(x: f64) -> PolicyStore {
    PolicyStore::new([("x".to_string(), x)].into_iter().collect())
}

/// reward = -(x - 3)^2
fn quadratic_runner() -> Arc<dyn AgentTaskRunner> {
    Arc::new(FnRunner::new(|policy: &PolicyVersion| {
        let x = policy.param("x").unwrap_or_default();
        Ok(TaskOutcome::new().with_scalar("reward", -(x - 3.0) * (x - 3.0)))
    }))
}

fn constant_runner() -> Arc<dyn AgentTaskRunner> {
    Arc::new(FnRunner::new(|_: &PolicyVersion| {
        Ok(TaskOutcome::new().with_scalar("reward", 1.0))
    }))
}

/// Always proposes x + 1
struct StepUp;

impl AdaptationStrategy for StepUp {
    fn name(&self) -> &str {
        "step-up"
    }

    fn propose(
        &self,
        active: &PolicyVersion,
        _history: &[EvaluationRecord],
        _seed: u64,
    ) -> safla::Result<ParameterMap> {
        let mut params = active.parameters.clone();
        if let Some(x) = params.get_mut("x") {
            *x += 1.0;
        }
        Ok(params)
    }
}

/// Proposes the active parameters unchanged
struct Hold;

impl AdaptationStrategy for Hold {
    fn name(&self) -> &str {
        "hold"
    }

    fn propose(
        &self,
        active: &PolicyVersion,
        _history: &[EvaluationRecord],
        _seed: u64,
    ) -> safla::Result<ParameterMap> {
        Ok(active.parameters.clone())
    }
}

fn quiet_config() -> LoopConfig {
    LoopConfig {
        max_cycles: 30,
        divergence_threshold: 100,
        stability_cycles: 1000,
        ..LoopConfig::default()
    }
}

#[tokio::test]
async fn test_constant_metrics_converge() {
    let mut controller = Controller::builder(constant_runner(), store_at(0.0))
        .objective(reward_objective(0.01))
        .config(LoopConfig {
            max_cycles: 10,
            stability_window: 3,
            stability_cycles: 3,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.status, LoopStatus::Converged);
    // Window fills at cycle 3, then three stable cycles
    assert_eq!(summary.cycles, 5);
    // Converging cycle commits nothing
    assert_eq!(controller.store().len(), 5);

    let err = controller.step().await.unwrap_err();
    assert!(matches!(err, LoopError::NotRunning(_)));
    assert_eq!(controller.store().len(), 5);
    assert_eq!(controller.state().cycle_id, 5);
}

#[tokio::test]
async fn test_repeated_rejections_diverge_without_moving_active() {
    let (sink, mut events) = ChannelSink::new(256);
    let mut controller = Controller::builder(quadratic_runner(), store_at(3.0))
        .objective(reward_objective(0.01))
        .strategy(Box::new(StepUp))
        .config(LoopConfig {
            max_cycles: 10,
            divergence_threshold: 3,
            ..LoopConfig::default()
        })
        .sink(Arc::new(sink))
        .build()
        .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.status, LoopStatus::Diverging);
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.consecutive_rejections, 3);
    assert_eq!(summary.active_version_id, 1);

    let store = controller.store();
    assert_eq!(store.active().param("x"), Some(3.0));
    assert_eq!(store.accepted_ids().into_iter().collect::<Vec<_>>(), vec![1]);
    // Rejected candidates stay in history
    assert_eq!(store.len(), 4);

    let mut saw_diverging = false;
    while let Ok(event) = events.try_recv() {
        if let LoopEvent::Transition { to: LoopStatus::Diverging, state, .. } = event {
            assert_eq!(state.cycle_id, 3);
            saw_diverging = true;
        }
    }
    assert!(saw_diverging);

    // Diverging is not running
    assert!(matches!(controller.step().await, Err(LoopError::NotRunning(_))));
}

#[tokio::test]
async fn test_reset_and_swap_recover_from_divergence() {
    let mut controller = Controller::builder(quadratic_runner(), store_at(3.0))
        .objective(reward_objective(0.01))
        .strategy(Box::new(StepUp))
        .config(LoopConfig {
            max_cycles: 10,
            divergence_threshold: 2,
            stability_cycles: 1000,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    controller.run().await.unwrap();
    assert_eq!(controller.status(), LoopStatus::Diverging);

    assert!(controller.reset_strategy());
    assert_eq!(controller.status(), LoopStatus::Running);
    assert_eq!(controller.state().consecutive_rejections, 0);
    assert!(!controller.reset_strategy());

    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Rejected { cycle_id: 3, .. }));
    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Diverged { cycle_id: 4, .. }));

    controller.swap_strategy(Box::new(Hold));
    assert_eq!(controller.status(), LoopStatus::Running);
    assert_eq!(controller.strategy_name(), "hold");

    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Neutral { cycle_id: 5, .. }));
}

#[tokio::test]
async fn test_task_failures_halt_after_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let runner = Arc::new(FnRunner::new(move |_: &PolicyVersion| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::failed("sandbox unavailable"))
    }));

    let mut controller = Controller::builder(runner, store_at(0.0))
        .objective(reward_objective(0.01))
        .config(LoopConfig {
            max_cycles: 10,
            task_retry_budget: 2,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    assert!(matches!(
        controller.step().await.unwrap(),
        CycleOutcome::Aborted { cycle_id: 1, error: LoopError::Task(_) }
    ));

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.status, LoopStatus::Halted);
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.active_version_id, 1);
    assert_eq!(summary.versions, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    match controller.halt_reason() {
        Some(HaltReason::TaskFailures { consecutive, last_error }) => {
            assert_eq!(*consecutive, 3);
            assert!(last_error.contains("sandbox unavailable"));
        }
        other => panic!("unexpected halt reason {:?}", other),
    }
}

#[tokio::test]
async fn test_task_timeout_counts_as_failure() {
    struct Hang;

    #[async_trait::async_trait]
    impl AgentTaskRunner for Hang {
        async fn run_task(&self, _policy: &PolicyVersion) -> Result<TaskOutcome, TaskError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(TaskOutcome::new())
        }
    }

    let mut controller = Controller::builder(Arc::new(Hang), store_at(0.0))
        .objective(reward_objective(0.01))
        .config(LoopConfig {
            task_timeout_ms: Some(20),
            task_retry_budget: 0,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    let outcome = controller.step().await.unwrap();
    match outcome {
        CycleOutcome::Halted { reason: HaltReason::TaskFailures { last_error, .. }, .. } => {
            assert!(last_error.contains("timed out"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_exploration_shrinks_after_rejections() {
    let strategy = PerturbationStrategy::new(PerturbationConfig::default()).unwrap();
    let mut controller = Controller::builder(quadratic_runner(), store_at(3.0))
        .objective(reward_objective(1e-4))
        .strategy(Box::new(strategy))
        .config(quiet_config())
        .build()
        .unwrap();

    // At the optimum every move is worse
    for cycle_id in 1..=3 {
        let outcome = controller.step().await.unwrap();
        assert!(
            matches!(outcome, CycleOutcome::Rejected { cycle_id: c, .. } if c == cycle_id),
            "cycle {} gave {:?}",
            cycle_id,
            outcome
        );
    }

    let store = controller.store();
    let root = store.get(1).unwrap().parameters;
    let first = perturbation_magnitude(&root, &store.get(2).unwrap().parameters);
    let second = perturbation_magnitude(&root, &store.get(3).unwrap().parameters);
    let third = perturbation_magnitude(&root, &store.get(4).unwrap().parameters);
    assert!(second < first);
    assert!(third < second);
    assert!((first - 0.1).abs() < 1e-9);
    assert!((third - 0.025).abs() < 1e-9);
}

#[tokio::test]
async fn test_version_ids_monotonic_and_rollback_keeps_history() {
    let strategy = PerturbationStrategy::new(PerturbationConfig {
        shrink_factor: 0.9,
        ..PerturbationConfig::default()
    })
    .unwrap();
    let mut controller = Controller::builder(quadratic_runner(), store_at(0.0))
        .objective(reward_objective(0.01))
        .strategy(Box::new(strategy))
        .config(quiet_config())
        .build()
        .unwrap();

    let mut accepted = 0;
    let mut rejected = Vec::new();
    for _ in 0..30 {
        let state = controller.state();
        match controller.step().await.unwrap() {
            CycleOutcome::Accepted { version_id, .. } => {
                accepted += 1;
                assert_eq!(controller.state().active_version_id, version_id);
            }
            CycleOutcome::Rejected { version_id, .. } => {
                // Rollback: the active pointer does not move
                assert_eq!(controller.state().active_version_id, state.active_version_id);
                rejected.push(version_id);
            }
            CycleOutcome::Neutral { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(accepted > 0);

    let store = controller.store();
    let history = store.history();
    assert_eq!(history.len(), 31);
    for (idx, version) in history.iter().enumerate() {
        assert_eq!(version.version_id, idx as u64 + 1);
        if let Some(parent) = version.parent_version_id {
            assert!(parent < version.version_id);
        }
    }

    // Rejected versions are kept but can never become active
    for version_id in rejected {
        assert!(store.get(version_id).is_ok());
        assert!(matches!(store.set_active(version_id), Err(LoopError::NotAccepted(_))));
    }

    // Adaptation moved the policy toward the optimum
    let summary = controller.summary();
    assert!(summary.best_score.unwrap() > -9.0);
    let lineage = store.lineage(summary.active_version_id).unwrap();
    assert_eq!(lineage[0].version_id, 1);
    assert!(lineage.iter().all(|v| store.is_accepted(v.version_id)));
}

#[tokio::test]
async fn test_stop_handle_halts_run_at_boundary() {
    let mut controller = Controller::builder(constant_runner(), store_at(0.0))
        .objective(reward_objective(0.01))
        .config(LoopConfig {
            max_cycles: 0,
            cycle_interval_ms: 10,
            stability_cycles: 1000,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), controller.run())
        .await
        .expect("loop did not stop")
        .unwrap();

    assert_eq!(summary.status, LoopStatus::Halted);
    assert!(summary.cycles >= 1);
    assert!(matches!(summary.halt_reason, Some(HaltReason::Requested { .. })));
    // Every committed candidate finished its cycle
    assert_eq!(controller.store().len() as u64, summary.cycles + 1);
}

#[tokio::test]
async fn test_audit_trail_tags_roles() {
    let mut controller = Controller::builder(quadratic_runner(), store_at(0.0))
        .objective(reward_objective(0.01))
        .config(quiet_config())
        .build()
        .unwrap();

    controller.step().await.unwrap();
    controller.step().await.unwrap();

    let audit = controller.audit();
    assert_eq!(audit.len(), 4);
    assert_eq!(audit[0].role, safla::EvaluationRole::Active);
    assert_eq!(audit[1].role, safla::EvaluationRole::Candidate);
    assert_eq!(audit[1].record.baseline, Some(audit[0].record.score));
    assert!(audit.iter().all(|e| e.cycle_id >= 1 && e.cycle_id <= 2));

    assert_eq!(controller.metrics().len(), 2);
    assert_eq!(controller.trials().len(), 2);
}

/// Proposes `x` values in order, one per candidate already evaluated
struct Scripted(Vec<f64>);

impl AdaptationStrategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn propose(
        &self,
        active: &PolicyVersion,
        history: &[EvaluationRecord],
        _seed: u64,
    ) -> safla::Result<ParameterMap> {
        let mut params = active.parameters.clone();
        let x = self.0[history.len().min(self.0.len() - 1)];
        params.insert("x".to_string(), x);
        Ok(params)
    }
}

#[tokio::test]
async fn test_active_score_uses_only_active_samples() {
    let mut controller = Controller::builder(quadratic_runner(), store_at(0.0))
        .objective(reward_objective(0.01))
        .strategy(Box::new(Scripted(vec![3.0, 1.0])))
        .config(quiet_config())
        .build()
        .unwrap();

    let first = controller.step().await.unwrap();
    assert!(matches!(first, CycleOutcome::Accepted { version_id: 2, .. }));

    // Samples from version 1 (reward -9) must not drag down version 2's baseline
    let second = controller.step().await.unwrap();
    assert!(
        matches!(second, CycleOutcome::Rejected { version_id: 3, .. }),
        "got {:?}",
        second
    );
    assert_eq!(controller.state().active_version_id, 2);
    assert_eq!(controller.store().active().param("x"), Some(3.0));

    let active_eval = &controller.audit()[2];
    assert_eq!(active_eval.role, safla::EvaluationRole::Active);
    assert_eq!(active_eval.record.version_id, 2);
    assert_eq!(active_eval.record.score, 0.0);
}

#[tokio::test]
async fn test_trial_failure_discards_cycle() {
    let runner = Arc::new(FnRunner::new(|policy: &PolicyVersion| {
        if policy.version_id == 1 {
            Ok(TaskOutcome::new().with_scalar("reward", 1.0))
        } else {
            Err(TaskError::failed("candidate crashed"))
        }
    }));

    let mut controller = Controller::builder(runner, store_at(0.0))
        .objective(reward_objective(0.01))
        .config(LoopConfig {
            stability_window: 2,
            stability_cycles: 1,
            task_retry_budget: 10,
            ..LoopConfig::default()
        })
        .build()
        .unwrap();

    for cycle_id in 1..=3 {
        let outcome = controller.step().await.unwrap();
        assert!(
            matches!(outcome, CycleOutcome::Aborted { cycle_id: c, .. } if c == cycle_id),
            "cycle {} gave {:?}",
            cycle_id,
            outcome
        );
    }

    // Aborted cycles leave no samples, evaluations or stability progress
    assert_eq!(controller.status(), LoopStatus::Running);
    assert!(controller.metrics().is_empty());
    assert!(controller.trials().is_empty());
    assert!(controller.audit().is_empty());

    // Committed candidates stay in history, never accepted
    let store = controller.store();
    assert_eq!(store.len(), 4);
    assert_eq!(store.accepted_ids().into_iter().collect::<Vec<_>>(), vec![1]);
    assert_eq!(controller.state().active_version_id, 1);
}

#[tokio::test]
async fn test_nan_candidate_not_adopted() {
    let runner = Arc::new(FnRunner::new(|policy: &PolicyVersion| {
        let reward = if policy.version_id == 1 { 1.0 } else { f64::NAN };
        Ok(TaskOutcome::new().with_scalar("reward", reward))
    }));

    let mut controller = Controller::builder(runner, store_at(0.0))
        .objective(reward_objective(0.01))
        .config(quiet_config())
        .build()
        .unwrap();

    match controller.step().await.unwrap() {
        CycleOutcome::Aborted { cycle_id: 1, error: LoopError::NonFiniteMetric(name) } => {
            assert_eq!(name, "reward");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let store = controller.store();
    assert_eq!(store.active_id(), 1);
    assert_eq!(store.accepted_ids().into_iter().collect::<Vec<_>>(), vec![1]);
    assert!(!store.is_accepted(2));
    assert!(controller.metrics().is_empty());
}

#[tokio::test]
async fn test_neutral_keeps_rejection_streak() {
    // Rejected, then within epsilon of the optimum, then rejected again
    let mut controller = Controller::builder(quadratic_runner(), store_at(3.0))
        .objective(reward_objective(0.01))
        .strategy(Box::new(Scripted(vec![4.0, 3.05, 4.05])))
        .config(quiet_config())
        .build()
        .unwrap();

    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Rejected { version_id: 2, .. }));
    assert_eq!(controller.state().consecutive_rejections, 1);

    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Neutral { version_id: 3, .. }));
    assert_eq!(controller.state().active_version_id, 3);
    assert_eq!(controller.state().consecutive_rejections, 1);

    let outcome = controller.step().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Rejected { version_id: 4, .. }));
    assert_eq!(controller.state().consecutive_rejections, 2);
}
