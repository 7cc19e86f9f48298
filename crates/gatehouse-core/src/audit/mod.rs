//! Append-only audit trail with hash chaining and fraud detection
//!
//! [`AuditTrail::record`] never drops an event silently: when a log file is
//! configured the event is written and flushed before it becomes visible in
//! memory, and a write failure is returned to the caller. Observers run after
//! the append commits.

pub mod event;
pub mod fraud;

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

pub use event::{AuditEvent, AuditFilter, AuditRecord, AuditStats, OperationKind, Outcome};
pub use fraud::{
    Assessment, Detection, FraudDetector, Observation, PatternKind, Severity, SuspiciousPattern,
};

use crate::config::{AuditSettings, FraudSettings};
use crate::error::{GatehouseError, Result, ResultExt};

/// Synchronous hook notified after events commit
pub trait AuditObserver: Send + Sync {
    fn on_event(&self, _event: &AuditEvent) {}

    /// A suspicious pattern was created or entered a higher severity tier
    fn on_escalation(&self, _pattern: &SuspiciousPattern) {}
}

#[derive(Debug, Default)]
struct TrailState {
    events: VecDeque<AuditEvent>,
    next_sequence: u64,
    last_hash: String,
    total: u64,
    operation_counts: std::collections::BTreeMap<OperationKind, u64>,
    violations: u64,
    errors: u64,
    targets: HashMap<String, u64>,
}

impl TrailState {
    fn absorb(&mut self, event: &AuditEvent) {
        self.total += 1;
        *self.operation_counts.entry(event.operation).or_default() += 1;
        match event.outcome {
            Outcome::Violation => self.violations += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Success => {}
        }
        *self.targets.entry(event.target.clone()).or_default() += 1;
        self.next_sequence = event.sequence + 1;
        self.last_hash = event.hash.clone();
    }
}

/// Audit trail and the fraud detector watching it
pub struct AuditTrail {
    state: Mutex<TrailState>,
    detector: Mutex<FraudDetector>,
    log_path: Option<PathBuf>,
    max_entries: Option<usize>,
    observers: RwLock<Vec<Arc<dyn AuditObserver>>>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("events", &self.state.lock().events.len())
            .field("log_path", &self.log_path)
            .field("max_entries", &self.max_entries)
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl AuditTrail {
    /// In-memory trail
    pub fn new(fraud: FraudSettings) -> Self {
        Self {
            state: Mutex::new(TrailState {
                next_sequence: 1,
                ..TrailState::default()
            }),
            detector: Mutex::new(FraudDetector::new(fraud)),
            log_path: None,
            max_entries: None,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Trail appending to a JSONL file, continuing any events already in it
    pub fn open(path: impl AsRef<Path>, fraud: FraudSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut trail = Self::new(fraud);

        if path.exists() {
            let file = std::fs::File::open(&path)?;
            let mut state = trail.state.lock();
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => {
                        state.absorb(&event);
                        state.events.push_back(event);
                    }
                    Err(e) => warn!(line = n + 1, error = %e, "skipping malformed audit line"),
                }
            }
            debug!(events = state.events.len(), path = %path.display(), "audit trail replayed");
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        trail.log_path = Some(path);
        Ok(trail)
    }

    pub fn from_settings(audit: &AuditSettings, fraud: FraudSettings) -> Result<Self> {
        let trail = match &audit.log_path {
            Some(path) => Self::open(path, fraud).context("opening audit log")?,
            None => Self::new(fraud),
        };
        Ok(trail.with_max_entries(audit.max_entries))
    }

    /// Cap the in-memory window; totals keep counting dropped events
    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self.trim(&mut self.state.lock());
        self
    }

    pub fn add_observer(&self, observer: Arc<dyn AuditObserver>) {
        self.observers.write().push(observer);
    }

    /// Seal and append one event
    pub fn record(&self, record: AuditRecord) -> Result<AuditEvent> {
        let event = {
            let mut state = self.state.lock();
            let event = AuditEvent::seal(record, state.next_sequence, state.last_hash.clone());
            if let Some(path) = &self.log_path {
                append_line(path, &event)
                    .with_context(|| format!("appending to audit log {}", path.display()))?;
            }
            state.absorb(&event);
            state.events.push_back(event.clone());
            self.trim(&mut state);
            event
        };

        debug!(
            seq = event.sequence,
            operation = %event.operation,
            target = %event.target,
            outcome = ?event.outcome,
            "audit event recorded"
        );
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
        Ok(event)
    }

    /// Ask the fraud detector about an operation about to run
    pub fn assess(&self, observation: &Observation<'_>) -> Assessment {
        let assessment = self.detector.lock().observe(observation);
        self.notify_escalations(&assessment);
        assessment
    }

    /// Tell the fraud detector the manifest refused a path
    pub fn record_rejection(&self, path: &str, caller: Option<&str>, frozen: bool) -> Assessment {
        let assessment = self.detector.lock().record_rejection(path, caller, frozen);
        self.notify_escalations(&assessment);
        assessment
    }

    fn notify_escalations(&self, assessment: &Assessment) {
        let observers = self.observers.read();
        for pattern in assessment.escalations() {
            for observer in observers.iter() {
                observer.on_escalation(pattern);
            }
        }
    }

    pub fn fraud_enabled(&self) -> bool {
        self.detector.lock().enabled()
    }

    pub fn suspicious_patterns(&self) -> Vec<SuspiciousPattern> {
        self.detector.lock().patterns()
    }

    /// Events in the in-memory window matching `filter`, oldest first
    pub fn get_audit_log(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let state = self.state.lock();
        let mut matched: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn get_stats(&self) -> AuditStats {
        let state = self.state.lock();
        let mut top: Vec<(String, u64)> = state
            .targets
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);

        AuditStats {
            total_operations: state.total,
            operation_counts: state.operation_counts.clone(),
            violations: state.violations,
            errors: state.errors,
            top_targets: top,
            suspicious_patterns: self.suspicious_patterns(),
        }
    }

    /// Events currently held in memory
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events ever recorded, including ones trimmed from memory
    pub fn total_recorded(&self) -> u64 {
        self.state.lock().total
    }

    /// Check every held event's hash and its link to the one before
    pub fn verify_chain(&self) -> Result<()> {
        let state = self.state.lock();
        let mut prev: Option<&AuditEvent> = None;
        for event in state.events.iter() {
            if event.compute_hash() != event.hash {
                return Err(GatehouseError::IntegrityViolation(format!(
                    "audit event {} does not match its hash",
                    event.sequence
                )));
            }
            if let Some(prev) = prev {
                if event.prev_hash != prev.hash || event.sequence != prev.sequence + 1 {
                    return Err(GatehouseError::IntegrityViolation(format!(
                        "audit chain broken between events {} and {}",
                        prev.sequence, event.sequence
                    )));
                }
            }
            prev = Some(event);
        }
        Ok(())
    }

    fn trim(&self, state: &mut TrailState) {
        if let Some(max) = self.max_entries {
            while state.events.len() > max {
                state.events.pop_front();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, sequence: u64, target: &str) {
        let mut state = self.state.lock();
        if let Some(e) = state.events.iter_mut().find(|e| e.sequence == sequence) {
            e.target = target.to_string();
        }
    }
}

fn append_line(path: &Path, event: &AuditEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        events: AtomicUsize,
        escalations: AtomicUsize,
    }

    impl AuditObserver for Counting {
        fn on_event(&self, _event: &AuditEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_escalation(&self, _pattern: &SuspiciousPattern) {
            self.escalations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn write(target: &str) -> AuditRecord {
        AuditRecord::new(OperationKind::Write, target)
    }

    #[test]
    fn test_record_chains_events() {
        let trail = AuditTrail::new(FraudSettings::default());
        let a = trail.record(write("a")).unwrap();
        let b = trail.record(write("b")).unwrap();

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(b.prev_hash, a.hash);
        assert!(trail.verify_chain().is_ok());

        trail.tamper(1, "evil");
        assert!(matches!(
            trail.verify_chain(),
            Err(GatehouseError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_stats_and_filter() {
        let trail = AuditTrail::new(FraudSettings::default());
        trail.record(write("docs/a.md")).unwrap();
        trail.record(write("docs/a.md")).unwrap();
        trail
            .record(write("layer/x").outcome(Outcome::Violation).caller(Some("bot")))
            .unwrap();
        trail
            .record(AuditRecord::new(OperationKind::Push, "builds").outcome(Outcome::Error))
            .unwrap();

        let stats = trail.get_stats();
        assert_eq!(stats.total_operations, 4);
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.operation_counts[&OperationKind::Write], 3);
        assert_eq!(stats.top_targets[0], ("docs/a.md".to_string(), 2));

        let violations = trail.get_audit_log(&AuditFilter::new().outcome(Outcome::Violation));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].caller.as_deref(), Some("bot"));

        let last = trail.get_audit_log(&AuditFilter::new().limit(2));
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].sequence, 4);
    }

    #[test]
    fn test_max_entries_keeps_totals() {
        let trail = AuditTrail::new(FraudSettings::default()).with_max_entries(Some(2));
        for i in 0..5 {
            trail.record(write(&format!("f{i}"))).unwrap();
        }
        assert_eq!(trail.len(), 2);
        assert_eq!(trail.total_recorded(), 5);
        assert!(trail.verify_chain().is_ok());
    }

    #[test]
    fn test_jsonl_persistence_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/trail.jsonl");

        {
            let trail = AuditTrail::open(&path, FraudSettings::default()).unwrap();
            trail.record(write("a")).unwrap();
            trail.record(write("b")).unwrap();
        }

        let reopened = AuditTrail::open(&path, FraudSettings::default()).unwrap();
        assert_eq!(reopened.len(), 2);
        let c = reopened.record(write("c")).unwrap();
        assert_eq!(c.sequence, 3);
        assert!(reopened.verify_chain().is_ok());

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[test]
    fn test_persistence_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.jsonl");
        let trail = AuditTrail::open(&path, FraudSettings::default()).unwrap();
        // a directory where the log file should be makes appends fail
        std::fs::create_dir(&path).unwrap();

        let err = trail.record(write("a")).unwrap_err();
        assert!(matches!(err.root(), GatehouseError::Io(_)));
        assert!(trail.is_empty());
    }

    #[test]
    fn test_observers() {
        let trail = AuditTrail::new(FraudSettings {
            privileged_callers: vec![],
            ..FraudSettings::default()
        });
        let counting = Arc::new(Counting::default());
        trail.add_observer(counting.clone());

        trail.record(write("a")).unwrap();
        let mut obs = Observation::new("admin/x", OperationKind::Write);
        obs.administrative = true;
        assert!(trail.assess(&obs).blocking().is_some());
        // same tier again: no new escalation
        trail.assess(&obs);

        assert_eq!(counting.events.load(Ordering::SeqCst), 1);
        assert_eq!(counting.escalations.load(Ordering::SeqCst), 1);
        assert_eq!(trail.suspicious_patterns().len(), 1);
    }
}
