//! Agent Task Runner
//!
//! The collaborator that executes the agent's real work under a policy and
//! reports raw outcome signals. The loop never performs task logic itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TaskError;
use crate::metrics::MetricValue;
use crate::policy::PolicyVersion;

/// Raw signals from one task run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub values: BTreeMap<String, MetricValue>,
}

impl TaskOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), MetricValue::Scalar(value));
        self
    }

    pub fn with_vector(mut self, name: &str, values: Vec<f64>) -> Self {
        self.values.insert(name.to_string(), MetricValue::Vector(values));
        self
    }
}

/// Runs the agent's task under a policy
#[async_trait]
pub trait AgentTaskRunner: Send + Sync {
    async fn run_task(&self, policy: &PolicyVersion) -> Result<TaskOutcome, TaskError>;
}

/// Runner backed by a synchronous closure
pub struct FnRunner<F>
where
    F: Fn(&PolicyVersion) -> Result<TaskOutcome, TaskError> + Send + Sync,
{
    f: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&PolicyVersion) -> Result<TaskOutcome, TaskError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> AgentTaskRunner for FnRunner<F>
where
    F: Fn(&PolicyVersion) -> Result<TaskOutcome, TaskError> + Send + Sync,
{
    async fn run_task(&self, policy: &PolicyVersion) -> Result<TaskOutcome, TaskError> {
        (self.f)(policy)
    }
}
