//! TaskQueueEngine: priority queues with a single working slot each
//!
//! Every mutation loads the queue document, validates, and commits through
//! the store's version check. A lost race reloads and repeats the whole
//! operation, validation included, up to the store's retry bound.
//!
//! Per queue the states are `empty`, `has-pending` and `has-working`; at most
//! one item is checked out at a time and a second `pop` is refused rather than
//! handed another item.

pub mod document;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use document::{
    Priority, QueueDocument, QueuePhase, QueuePolicy, QueueState, QueueTotals, TaskItem,
    WorkingSlot,
};

use crate::audit::{AuditRecord, AuditTrail, OperationKind, Outcome};
use crate::error::{GatehouseError, Result};
use crate::store::{blocking, DocumentStore, Snapshot};
use crate::validation::{
    Phase, StepFailure, ValidationContext, ValidationStep, ValidationStepRunner,
};

/// Default document key of the queue set
pub const DEFAULT_QUEUE_SET: &str = "queues/default";

/// Work submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: String,
    pub payload: Value,
    /// Falls back to the queue's default priority
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl NewTask {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Step lists and policy attached to a queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    pub before_insert: Vec<ValidationStep>,
    pub after_pop: Vec<ValidationStep>,
    pub policy: QueuePolicy,
}

/// Data-driven pop filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemFilter {
    pub kind: Option<String>,
    pub min_priority: Option<Priority>,
}

impl ItemFilter {
    pub fn matches(&self, item: &TaskItem) -> bool {
        self.kind.as_deref().map_or(true, |k| item.kind == k)
            && self.min_priority.map_or(true, |p| item.priority >= p)
    }
}

/// How `finalize_working` ended
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// Every after-pop step accepted; the item is gone
    Completed(TaskItem),
    /// A step refused; the item is back in the queue at its original position
    Requeued { item: TaskItem, failure: StepFailure },
}

impl FinalizeOutcome {
    pub fn item(&self) -> &TaskItem {
        match self {
            Self::Completed(item) | Self::Requeued { item, .. } => item,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Read-only view of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub phase: QueuePhase,
    pub pending: usize,
    pub working: Option<TaskItem>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub before_insert_steps: Vec<String>,
    pub after_pop_steps: Vec<String>,
    pub policy: QueuePolicy,
}

impl QueueStatus {
    fn of(name: &str, state: &QueueState) -> Self {
        Self {
            name: name.to_string(),
            phase: state.phase(),
            pending: state.items.len(),
            working: state.working.as_ref().map(|w| w.item.clone()),
            by_priority: state.count_by_priority(),
            before_insert_steps: state.before_insert_steps.iter().map(|s| s.name.clone()).collect(),
            after_pop_steps: state.after_pop_steps.iter().map(|s| s.name.clone()).collect(),
            policy: state.policy.clone(),
        }
    }

    fn absent(name: &str) -> Self {
        Self::of(name, &QueueState::default())
    }
}

/// Outcome of one attempt inside a retry loop
enum Attempt<T> {
    Commit(T, QueueDocument, u64),
    Done(Result<T>),
}

/// Priority/working-item queue engine over one queue-set document
#[derive(Debug, Clone)]
pub struct TaskQueueEngine {
    store: Arc<DocumentStore>,
    runner: ValidationStepRunner,
    audit: Option<Arc<AuditTrail>>,
    key: String,
}

impl TaskQueueEngine {
    pub fn new(store: Arc<DocumentStore>, runner: ValidationStepRunner) -> Self {
        Self {
            store,
            runner,
            audit: None,
            key: DEFAULT_QUEUE_SET.to_string(),
        }
    }

    /// Use another queue-set document
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach validation steps and a policy; unknown step names are refused
    pub async fn configure_queue(&self, queue: &str, spec: QueueSpec) -> Result<()> {
        let result = self.configure_inner(queue, spec).await;
        self.audit_result(OperationKind::ConfigureQueue, queue, &result)?;
        result
    }

    async fn configure_inner(&self, queue: &str, spec: QueueSpec) -> Result<()> {
        let registry = self.runner.registry();
        registry.ensure_known(&spec.before_insert)?;
        registry.ensure_known(&spec.after_pop)?;

        let name = queue.to_string();
        self.update(move |doc| {
            let state = doc.queues.entry(name.clone()).or_default();
            state.before_insert_steps = spec.before_insert.clone();
            state.after_pop_steps = spec.after_pop.clone();
            state.policy = spec.policy.clone();
            doc.touch();
            Ok(())
        })
        .await?;
        info!(queue, "queue configured");
        Ok(())
    }

    /// Validate and insert an item, keeping (priority desc, sequence asc) order
    pub async fn push(&self, queue: &str, task: NewTask) -> Result<TaskItem> {
        let result = self
            .retrying(|| async {
                let snapshot = self.load().await?;
                let mut doc = snapshot.document;
                let state = doc.queues.get(queue).cloned().unwrap_or_default();

                if let Some(max) = state.policy.max_items {
                    if state.items.len() >= max {
                        return Ok(Attempt::Done(Err(GatehouseError::QueueFull {
                            queue: queue.to_string(),
                            max_items: max,
                        })));
                    }
                }

                let priority = task.priority.unwrap_or(state.policy.default_priority);
                let item = TaskItem::new(
                    task.kind.clone(),
                    task.payload.clone(),
                    priority,
                    doc.next_sequence(),
                );
                let ctx = ValidationContext {
                    queue: queue.to_string(),
                    phase: Phase::BeforeInsert,
                    item: item.clone(),
                    result: None,
                    pending: state.items,
                };
                let outcome = self.runner.run(&state.before_insert_steps, &ctx).await;
                if let Err(e) = outcome.into_result(queue) {
                    return Ok(Attempt::Done(Err(e)));
                }

                doc.queues
                    .entry(queue.to_string())
                    .or_default()
                    .insert(item.clone());
                doc.metadata.totals.pushed += 1;
                doc.touch();
                Ok::<_, GatehouseError>(Attempt::Commit(item, doc, snapshot.version))
            })
            .await;

        if let Ok(item) = &result {
            info!(queue, id = %item.id, priority = %item.priority, seq = item.sequence, "item pushed");
        }
        self.audit_result(OperationKind::Push, queue, &result)?;
        result
    }

    /// Check out the head item
    pub async fn pop(&self, queue: &str) -> Result<TaskItem> {
        self.pop_where(queue, |_| true).await
    }

    /// Check out the first item, in queue order, accepted by `filter`
    pub async fn pop_where<F>(&self, queue: &str, filter: F) -> Result<TaskItem>
    where
        F: Fn(&TaskItem) -> bool,
    {
        let result = self
            .retrying(|| async {
                let snapshot = self.load().await?;
                let mut doc = snapshot.document;
                let Some(state) = doc.queues.get_mut(queue) else {
                    return Ok(Attempt::Done(Err(GatehouseError::QueueEmpty(
                        queue.to_string(),
                    ))));
                };
                if let Some(slot) = &state.working {
                    return Ok(Attempt::Done(Err(GatehouseError::WorkingItemConflict {
                        queue: queue.to_string(),
                        item: slot.item.id.clone(),
                    })));
                }
                let Some(mut item) = state.take_first(&filter) else {
                    return Ok(Attempt::Done(Err(GatehouseError::QueueEmpty(
                        queue.to_string(),
                    ))));
                };

                let now = Utc::now();
                item.started_at = Some(now);
                item.updated_at = now;
                state.working = Some(WorkingSlot {
                    item: item.clone(),
                    checked_out_at: now,
                });
                doc.touch();
                Ok::<_, GatehouseError>(Attempt::Commit(item, doc, snapshot.version))
            })
            .await;

        if let Ok(item) = &result {
            info!(queue, id = %item.id, "item checked out");
        }
        self.audit_result(OperationKind::Pop, queue, &result)?;
        result
    }

    /// Run after-pop steps against the working item and `result`.
    ///
    /// On acceptance the item is discarded. On rejection it returns to the
    /// pending list at its original (priority, sequence) position, which is
    /// the head of its tier unless a filter picked it past older items. Its
    /// `attempts` is incremented and `last_rejection` set.
    pub async fn finalize_working(&self, queue: &str, result: Value) -> Result<FinalizeOutcome> {
        let outcome = self
            .retrying(|| async {
                let snapshot = self.load().await?;
                let mut doc = snapshot.document;
                let Some(state) = doc.queues.get(queue) else {
                    return Ok(Attempt::Done(Err(GatehouseError::NoWorkingItem(
                        queue.to_string(),
                    ))));
                };
                let Some(slot) = state.working.clone() else {
                    return Ok(Attempt::Done(Err(GatehouseError::NoWorkingItem(
                        queue.to_string(),
                    ))));
                };

                let ctx = ValidationContext {
                    queue: queue.to_string(),
                    phase: Phase::AfterPop,
                    item: slot.item.clone(),
                    result: Some(result.clone()),
                    pending: state.items.clone(),
                };
                let steps = state.after_pop_steps.clone();
                let validation = self.runner.run(&steps, &ctx).await;

                let state = doc.queues.entry(queue.to_string()).or_default();
                state.working = None;
                let mut item = slot.item;
                let finalized = match validation.failure {
                    None => {
                        doc.metadata.totals.completed += 1;
                        FinalizeOutcome::Completed(item)
                    }
                    Some(failure) => {
                        item.attempts += 1;
                        item.last_rejection = Some(failure.reason.clone());
                        item.started_at = None;
                        item.updated_at = Utc::now();
                        state.reinsert(item.clone());
                        doc.metadata.totals.requeued += 1;
                        FinalizeOutcome::Requeued { item, failure }
                    }
                };
                doc.touch();
                Ok::<_, GatehouseError>(Attempt::Commit(finalized, doc, snapshot.version))
            })
            .await;

        let record = match &outcome {
            Ok(FinalizeOutcome::Completed(item)) => {
                info!(queue, id = %item.id, "working item completed");
                AuditRecord::new(OperationKind::Finalize, queue).detail(format!("completed {}", item.id))
            }
            Ok(FinalizeOutcome::Requeued { item, failure }) => {
                warn!(queue, id = %item.id, step = %failure.step, attempts = item.attempts, "working item requeued");
                AuditRecord::new(OperationKind::Finalize, queue)
                    .outcome(Outcome::Violation)
                    .detail(format!("requeued {}: {}", item.id, failure.reason))
                    .validation(serde_json::to_value(failure)?)
            }
            Err(_) => AuditRecord::from_result(OperationKind::Finalize, queue, &outcome),
        };
        self.audit_record(record)?;
        outcome
    }

    /// Drop a pending or working item
    pub async fn remove(&self, queue: &str, item_id: &str) -> Result<TaskItem> {
        let (name, id) = (queue.to_string(), item_id.to_string());
        let result = self
            .update(move |doc| {
                let missing = || GatehouseError::ItemNotFound {
                    queue: name.clone(),
                    item: id.clone(),
                };
                let state = doc.queues.get_mut(&name).ok_or_else(missing)?;
                let removed = match state.remove(&id) {
                    Some(item) => item,
                    None => match state.working.take() {
                        Some(slot) if slot.item.id == id => slot.item,
                        other => {
                            state.working = other;
                            return Err(missing());
                        }
                    },
                };
                doc.metadata.totals.removed += 1;
                doc.touch();
                Ok(removed)
            })
            .await;

        if let Ok(item) = &result {
            info!(queue, id = %item.id, "item removed");
        }
        self.audit_result(OperationKind::Remove, queue, &result)?;
        result
    }

    /// Head item, without checking it out
    pub async fn peek(&self, queue: &str) -> Result<Option<TaskItem>> {
        let doc = self.load().await?.document;
        Ok(doc.queues.get(queue).and_then(|s| s.items.first().cloned()))
    }

    pub async fn status(&self, queue: &str) -> Result<QueueStatus> {
        let doc = self.load().await?.document;
        Ok(match doc.queues.get(queue) {
            Some(state) => QueueStatus::of(queue, state),
            None => QueueStatus::absent(queue),
        })
    }

    pub async fn status_all(&self) -> Result<Vec<QueueStatus>> {
        let doc = self.load().await?.document;
        Ok(doc
            .queues
            .iter()
            .map(|(name, state)| QueueStatus::of(name, state))
            .collect())
    }

    pub async fn list_queues(&self) -> Result<Vec<String>> {
        let doc = self.load().await?.document;
        Ok(doc.queues.keys().cloned().collect())
    }

    pub async fn totals(&self) -> Result<QueueTotals> {
        Ok(self.load().await?.document.metadata.totals)
    }

    /// Run `attempt` until it commits, finishes, or exhausts the retry bound
    async fn retrying<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Attempt<T>>>,
    {
        let max = self.store.max_commit_retries();
        let mut tries = 0;
        loop {
            tries += 1;
            let (value, doc, expected) = match attempt().await? {
                Attempt::Done(result) => return result,
                Attempt::Commit(value, doc, expected) => (value, doc, expected),
            };
            match self.commit(doc, expected).await {
                Ok(version) => {
                    debug!(key = %self.key, version, "queue document committed");
                    return Ok(value);
                }
                Err(GatehouseError::ConcurrentModification { .. }) if tries < max => {
                    warn!(key = %self.key, attempt = tries, "queue document changed underneath, retrying");
                    tokio::time::sleep(self.store.retry_delay(tries)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load(&self) -> Result<Snapshot<QueueDocument>> {
        let (store, key) = (self.store.clone(), self.key.clone());
        blocking(move || store.load::<QueueDocument>(&key)).await
    }

    async fn commit(&self, mut doc: QueueDocument, expected: u64) -> Result<u64> {
        let (store, key) = (self.store.clone(), self.key.clone());
        blocking(move || store.save(&key, &mut doc, expected)).await
    }

    /// Store-level load/mutate/save with its own conflict retries
    async fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnMut(&mut QueueDocument) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (store, key) = (self.store.clone(), self.key.clone());
        blocking(move || store.update::<QueueDocument, _, _>(&key, mutate))
            .await
            .map(|(value, _)| value)
    }

    fn audit_result<T>(&self, operation: OperationKind, queue: &str, result: &Result<T>) -> Result<()> {
        let mut record = AuditRecord::from_result(operation, queue, result);
        if let Err(GatehouseError::ValidationRejected { step, index, reason, .. }) =
            result.as_ref().map_err(GatehouseError::root)
        {
            record = record.validation(serde_json::json!({
                "step": step,
                "index": index,
                "reason": reason,
            }));
        }
        self.audit_record(record)
    }

    fn audit_record(&self, record: AuditRecord) -> Result<()> {
        if let Some(audit) = &self.audit {
            audit.record(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FraudSettings, StoreSettings};
    use crate::validation::{FnStep, StepRegistry, StepVerdict};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine() -> (TempDir, TaskQueueEngine) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path(), &StoreSettings::default()).unwrap());
        let registry = StepRegistry::with_builtins();
        registry.register(
            "reject_all",
            "",
            FnStep(|_: &ValidationContext| StepVerdict::reject("closed")),
        );
        let runner = ValidationStepRunner::new(Arc::new(registry), Duration::from_secs(1));
        (dir, TaskQueueEngine::new(store, runner))
    }

    #[tokio::test]
    async fn test_push_pop_order() {
        let (_dir, engine) = engine();
        engine.push("q", NewTask::new("t", json!("a")).priority(Priority::Low)).await.unwrap();
        engine.push("q", NewTask::new("t", json!("b")).priority(Priority::High)).await.unwrap();
        engine.push("q", NewTask::new("t", json!("c"))).await.unwrap();

        let head = engine.peek("q").await.unwrap().unwrap();
        assert_eq!(head.payload, json!("b"));

        let b = engine.pop("q").await.unwrap();
        assert_eq!(b.payload, json!("b"));
        assert!(b.started_at.is_some());
        let status = engine.status("q").await.unwrap();
        assert_eq!(status.phase, QueuePhase::HasWorking);
        assert_eq!(status.pending, 2);
    }

    #[tokio::test]
    async fn test_second_pop_conflicts() {
        let (_dir, engine) = engine();
        engine.push("q", NewTask::new("t", json!(1))).await.unwrap();
        engine.push("q", NewTask::new("t", json!(2))).await.unwrap();

        let first = engine.pop("q").await.unwrap();
        let err = engine.pop("q").await.unwrap_err();
        assert!(matches!(
            err,
            GatehouseError::WorkingItemConflict { ref item, .. } if *item == first.id
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_and_missing_queue() {
        let (_dir, engine) = engine();
        assert!(matches!(engine.pop("nope").await, Err(GatehouseError::QueueEmpty(_))));
        assert!(matches!(
            engine.finalize_working("nope", json!(true)).await,
            Err(GatehouseError::NoWorkingItem(_))
        ));
        assert!(engine.peek("nope").await.unwrap().is_none());
        assert_eq!(engine.status("nope").await.unwrap().phase, QueuePhase::Empty);
    }

    #[tokio::test]
    async fn test_pop_where_filter() {
        let (_dir, engine) = engine();
        engine.push("q", NewTask::new("build", json!(1)).priority(Priority::High)).await.unwrap();
        engine.push("q", NewTask::new("deploy", json!(2))).await.unwrap();

        let filter = ItemFilter {
            kind: Some("deploy".into()),
            min_priority: None,
        };
        let item = engine.pop_where("q", |i| filter.matches(i)).await.unwrap();
        assert_eq!(item.kind, "deploy");
    }

    #[tokio::test]
    async fn test_finalize_completes_and_requeues() {
        let (_dir, engine) = engine();
        engine
            .configure_queue(
                "q",
                QueueSpec {
                    after_pop: vec![ValidationStep::new("result_success")],
                    ..QueueSpec::default()
                },
            )
            .await
            .unwrap();
        engine.push("q", NewTask::new("t", json!("x"))).await.unwrap();

        engine.pop("q").await.unwrap();
        let outcome = engine.finalize_working("q", json!({"success": false})).await.unwrap();
        let FinalizeOutcome::Requeued { item, failure } = outcome else {
            panic!("expected requeue");
        };
        assert_eq!(item.attempts, 1);
        assert_eq!(failure.step, "result_success");

        let again = engine.pop("q").await.unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.sequence, item.sequence);
        let done = engine.finalize_working("q", json!({"success": true})).await.unwrap();
        assert!(done.is_completed());

        let totals = engine.totals().await.unwrap();
        assert_eq!((totals.pushed, totals.requeued, totals.completed), (1, 1, 1));
        assert_eq!(engine.status("q").await.unwrap().phase, QueuePhase::Empty);
    }

    #[tokio::test]
    async fn test_configure_rejects_unknown_step() {
        let (_dir, engine) = engine();
        let err = engine
            .configure_queue(
                "q",
                QueueSpec {
                    before_insert: vec![ValidationStep::new("ghost")],
                    ..QueueSpec::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::UnknownStep(ref s) if s == "ghost"));
        assert!(engine.list_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_and_default_priority() {
        let (_dir, engine) = engine();
        engine
            .configure_queue(
                "q",
                QueueSpec {
                    policy: QueuePolicy {
                        default_priority: Priority::High,
                        max_items: Some(1),
                    },
                    ..QueueSpec::default()
                },
            )
            .await
            .unwrap();

        let item = engine.push("q", NewTask::new("t", json!(1))).await.unwrap();
        assert_eq!(item.priority, Priority::High);
        assert!(matches!(
            engine.push("q", NewTask::new("t", json!(2))).await,
            Err(GatehouseError::QueueFull { max_items: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let (_dir, engine) = engine();
        let a = engine.push("q", NewTask::new("t", json!(1))).await.unwrap();
        let b = engine.push("q", NewTask::new("t", json!(2))).await.unwrap();

        assert_eq!(engine.remove("q", &b.id).await.unwrap().id, b.id);
        engine.pop("q").await.unwrap();
        assert_eq!(engine.remove("q", &a.id).await.unwrap().id, a.id);
        assert_eq!(engine.status("q").await.unwrap().phase, QueuePhase::Empty);
        assert!(matches!(
            engine.remove("q", &a.id).await,
            Err(GatehouseError::ItemNotFound { .. })
        ));
        assert_eq!(engine.totals().await.unwrap().removed, 2);
    }

    #[tokio::test]
    async fn test_lock_wait_does_not_stall_the_runtime() {
        let (dir, engine) = engine();
        let lock_path = dir.path().join("queues/default.json.lock");
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        let held = std::fs::File::create(&lock_path).unwrap();
        fs2::FileExt::lock_exclusive(&held).unwrap();

        let pusher = engine.clone();
        let push = tokio::spawn(async move { pusher.push("q", NewTask::new("t", json!(1))).await });
        // single-threaded runtime: this timer only fires if the push yields
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!push.is_finished());

        fs2::FileExt::unlock(&held).unwrap();
        let item = push.await.unwrap().unwrap();
        assert_eq!(item.sequence, 1);
    }

    #[tokio::test]
    async fn test_every_call_is_audited() {
        let (_dir, engine) = engine();
        let audit = Arc::new(AuditTrail::new(FraudSettings::default()));
        let engine = engine.with_audit(audit.clone());

        engine
            .configure_queue(
                "q",
                QueueSpec {
                    before_insert: vec![ValidationStep::new("reject_all")],
                    ..QueueSpec::default()
                },
            )
            .await
            .unwrap();
        assert!(engine.push("q", NewTask::new("t", json!(1))).await.is_err());
        assert!(engine.pop("q").await.is_err());

        let log = audit.get_audit_log(&Default::default());
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].operation, OperationKind::Push);
        assert_eq!(log[1].outcome, Outcome::Violation);
        assert_eq!(log[1].validation.as_ref().unwrap()["step"], "reject_all");
        assert_eq!(log[2].outcome, Outcome::Error);
    }
}
