//! Validation steps and the runner that executes them
//!
//! Steps are referenced by name from queue documents and resolved against a
//! [`StepRegistry`] when they run. The runner executes them in order, stops at
//! the first step that does not accept, and treats a step that overruns its
//! time budget as a rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{GatehouseError, Result};
use crate::queue::document::TaskItem;

/// Reference to a registered step, as stored on a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ValidationStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Which queue transition is being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BeforeInsert,
    AfterPop,
}

/// Everything a step may inspect
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub queue: String,
    pub phase: Phase,
    /// Candidate item on insert, working item on finalize
    pub item: TaskItem,
    /// Result supplied to `finalize_working`
    pub result: Option<Value>,
    /// Items currently pending in the queue
    pub pending: Vec<TaskItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepVerdict {
    Accept,
    Reject(String),
    Timeout,
}

impl StepVerdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }
}

/// Executable logic behind a step name
#[async_trait::async_trait]
pub trait StepEvaluator: Send + Sync {
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict;
}

/// Closure adapter for synchronous checks
pub struct FnStep<F>(pub F);

impl<F> std::fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnStep")
    }
}

#[async_trait::async_trait]
impl<F> StepEvaluator for FnStep<F>
where
    F: Fn(&ValidationContext) -> StepVerdict + Send + Sync,
{
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict {
        (self.0)(ctx)
    }
}

/// Payload must be an object carrying every listed field, non-null
#[derive(Debug, Clone)]
pub struct RequiredFields {
    pub fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl StepEvaluator for RequiredFields {
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict {
        let Some(obj) = ctx.item.payload.as_object() else {
            return StepVerdict::reject("payload is not an object");
        };
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| obj.get(f.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            StepVerdict::Accept
        } else {
            StepVerdict::Reject(format!("missing fields: {}", missing.join(", ")))
        }
    }
}

struct NonEmptyPayload;

#[async_trait::async_trait]
impl StepEvaluator for NonEmptyPayload {
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict {
        let empty = match &ctx.item.payload {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        if empty {
            StepVerdict::reject("payload is empty")
        } else {
            StepVerdict::Accept
        }
    }
}

struct UniquePayload;

#[async_trait::async_trait]
impl StepEvaluator for UniquePayload {
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict {
        match ctx
            .pending
            .iter()
            .find(|p| p.kind == ctx.item.kind && p.payload == ctx.item.payload)
        {
            Some(dup) => StepVerdict::Reject(format!("identical item {} already pending", dup.id)),
            None => StepVerdict::Accept,
        }
    }
}

struct ResultSuccess;

#[async_trait::async_trait]
impl StepEvaluator for ResultSuccess {
    async fn evaluate(&self, ctx: &ValidationContext) -> StepVerdict {
        match &ctx.result {
            Some(Value::Bool(true)) => StepVerdict::Accept,
            Some(Value::Object(o)) if o.get("success") == Some(&Value::Bool(true)) => {
                StepVerdict::Accept
            }
            Some(Value::Object(o)) => StepVerdict::Reject(
                o.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("result does not report success")
                    .to_string(),
            ),
            Some(_) => StepVerdict::reject("result does not report success"),
            None => StepVerdict::reject("no result supplied"),
        }
    }
}

struct RegisteredStep {
    description: String,
    evaluator: Arc<dyn StepEvaluator>,
}

/// Table of step names known to the runner
pub struct StepRegistry {
    steps: RwLock<HashMap<String, RegisteredStep>>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StepRegistry {
    /// Registry with no steps at all
    pub fn empty() -> Self {
        Self {
            steps: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with `non_empty_payload`, `unique_payload` and `result_success`
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register(
            "non_empty_payload",
            "payload must not be null or empty",
            NonEmptyPayload,
        );
        registry.register(
            "unique_payload",
            "no identical item of the same kind may be pending",
            UniquePayload,
        );
        registry.register(
            "result_success",
            "finalize result must report success",
            ResultSuccess,
        );
        registry
    }

    /// Register (or replace) a step
    pub fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        evaluator: impl StepEvaluator + 'static,
    ) {
        let name = name.into();
        self.steps.write().insert(
            name.clone(),
            RegisteredStep {
                description: description.into(),
                evaluator: Arc::new(evaluator),
            },
        );
        info!(step = %name, "validation step registered");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.read().contains_key(name)
    }

    pub fn description(&self, name: &str) -> Option<String> {
        self.steps.read().get(name).map(|s| s.description.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Fail with `UnknownStep` for the first name not registered
    pub fn ensure_known(&self, steps: &[ValidationStep]) -> Result<()> {
        let known = self.steps.read();
        match steps.iter().find(|s| !known.contains_key(&s.name)) {
            Some(step) => Err(GatehouseError::UnknownStep(step.name.clone())),
            None => Ok(()),
        }
    }

    fn evaluator(&self, name: &str) -> Option<Arc<dyn StepEvaluator>> {
        self.steps.read().get(name).map(|s| s.evaluator.clone())
    }
}

/// First step that did not accept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub index: usize,
    pub step: String,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Steps that returned a verdict, including the failing one
    pub steps_run: usize,
    pub failure: Option<StepFailure>,
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        self.failure.is_none()
    }

    /// `ValidationRejected` for a failed outcome
    pub fn into_result(self, queue: &str) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some(f) => Err(GatehouseError::ValidationRejected {
                queue: queue.to_string(),
                step: f.step,
                index: f.index,
                reason: f.reason,
            }),
        }
    }
}

/// Runs step lists with a per-step time budget
#[derive(Debug, Clone)]
pub struct ValidationStepRunner {
    registry: Arc<StepRegistry>,
    step_timeout: Duration,
}

impl ValidationStepRunner {
    pub fn new(registry: Arc<StepRegistry>, step_timeout: Duration) -> Self {
        Self {
            registry,
            step_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub async fn run(&self, steps: &[ValidationStep], ctx: &ValidationContext) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        for (index, step) in steps.iter().enumerate() {
            outcome.steps_run += 1;

            let verdict = match self.registry.evaluator(&step.name) {
                Some(evaluator) => {
                    match tokio::time::timeout(self.step_timeout, evaluator.evaluate(ctx)).await {
                        Ok(verdict) => verdict,
                        Err(_) => StepVerdict::Timeout,
                    }
                }
                None => StepVerdict::Reject(format!("step '{}' is not registered", step.name)),
            };

            let (reason, timed_out) = match verdict {
                StepVerdict::Accept => {
                    debug!(queue = %ctx.queue, step = %step.name, index, "step accepted");
                    continue;
                }
                StepVerdict::Reject(reason) => (reason, false),
                StepVerdict::Timeout => (
                    format!("timed out after {}ms", self.step_timeout.as_millis()),
                    true,
                ),
            };

            warn!(queue = %ctx.queue, step = %step.name, index, %reason, "validation step rejected");
            outcome.failure = Some(StepFailure {
                index,
                step: step.name.clone(),
                reason,
                timed_out,
            });
            break;
        }
        outcome
    }
}
