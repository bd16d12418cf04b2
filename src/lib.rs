//! SAFLA - Self-Aware Feedback Loop Algorithm
//!
//! A recursive, self-evaluating control loop for an autonomous agent. The
//! loop observes the agent's task outcomes, scores its current policy
//! against a configurable objective, proposes a refined policy and keeps
//! it only when it measurably improves on the incumbent.
//!
//! # Components
//!
//! - **Metric Collector**: ordered, append-only per-cycle samples
//! - **Policy Store**: immutable versioned parameters with lineage
//! - **Evaluator**: weighted objective scoring with an epsilon band
//! - **Adapter**: pluggable proposal strategies
//! - **Controller**: the cycle state machine with convergence and
//!   divergence guards
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────── Controller ────────────────┐
//!            │                                            │
//! Runner ──► Metrics ──► Evaluator ──► Adapter ──► Policy Store
//!   ▲                                                     │
//!   └──────────────────── active policy ◄─────────────────┘
//!            │
//!            ├── Persistence (SQLite, optional)
//!            └── Observability sinks (channel, tracing)
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod feedback_loop;
pub mod metrics;
pub mod observability;
pub mod persistence;
pub mod policy;
pub mod runner;

pub use adapter::{AdaptationStrategy, PerturbationConfig, PerturbationStrategy, Streaks};
pub use config::{PersistenceConfig, SaflaConfig};
pub use error::{ConfigError, LoopError, Result, TaskError};
pub use evaluator::{
    Direction, EvaluationRecord, Evaluator, Objective, ObjectiveComponent, ObjectiveConfig,
    Verdict, WeightedObjective,
};
pub use feedback_loop::{
    AuditEntry, Controller, ControllerBuilder, CycleOutcome, CycleState, EvaluationRole,
    HaltReason, LoopConfig, LoopStatus, LoopSummary, StopHandle,
};
pub use metrics::{MetricCollector, MetricSample, MetricValue, Reduction};
pub use observability::{ChannelSink, LoopEvent, ObservabilitySink, TracingSink};
pub use persistence::{restore_store, PolicyPersistence, SqlitePersistence};
pub use policy::{ParameterMap, PolicyStore, PolicyVersion};
pub use runner::{AgentTaskRunner, FnRunner, TaskOutcome};
