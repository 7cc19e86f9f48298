//! Audit event types, filters and statistics

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fraud::SuspiciousPattern;
use crate::error::GatehouseError;

/// Operation an audit event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Write,
    Mkdir,
    Push,
    Pop,
    Finalize,
    Remove,
    ConfigureQueue,
    Register,
    UpdateEntity,
    RemoveEntity,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Write => "write",
            Self::Mkdir => "mkdir",
            Self::Push => "push",
            Self::Pop => "pop",
            Self::Finalize => "finalize",
            Self::Remove => "remove",
            Self::ConfigureQueue => "configure_queue",
            Self::Register => "register",
            Self::UpdateEntity => "update_entity",
            Self::RemoveEntity => "remove_entity",
        }
    }

    /// File operations go through the gate
    pub fn is_file_operation(self) -> bool {
        matches!(self, Self::Create | Self::Write | Self::Mkdir)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Refused by policy: validation, structure or fraud
    Violation,
    Error,
}

impl Outcome {
    pub fn of_error(err: &GatehouseError) -> Self {
        if err.is_violation() {
            Self::Violation
        } else {
            Self::Error
        }
    }
}

/// An event about to be appended; sealed into an [`AuditEvent`] by the trail
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub operation: OperationKind,
    pub target: String,
    pub caller: Option<String>,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub validation: Option<serde_json::Value>,
}

impl AuditRecord {
    pub fn new(operation: OperationKind, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
            caller: None,
            outcome: Outcome::Success,
            detail: None,
            validation: None,
        }
    }

    /// Outcome and detail taken from an operation result
    pub fn from_result<T>(
        operation: OperationKind,
        target: impl Into<String>,
        result: &crate::Result<T>,
    ) -> Self {
        let record = Self::new(operation, target);
        match result {
            Ok(_) => record,
            Err(e) => record.outcome(Outcome::of_error(e)).detail(e.to_string()),
        }
    }

    pub fn caller(mut self, caller: Option<&str>) -> Self {
        self.caller = caller.map(str::to_string);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn validation(mut self, validation: serde_json::Value) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Immutable record of one gated operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: OperationKind,
    pub target: String,
    #[serde(default)]
    pub caller: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub validation: Option<serde_json::Value>,
    /// Hash of the preceding event, empty for the first
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEvent {
    pub(crate) fn seal(record: AuditRecord, sequence: u64, prev_hash: String) -> Self {
        let mut event = Self {
            sequence,
            timestamp: Utc::now(),
            operation: record.operation,
            target: record.target,
            caller: record.caller,
            outcome: record.outcome,
            detail: record.detail,
            validation: record.validation,
            prev_hash,
            hash: String::new(),
        };
        event.hash = event.compute_hash();
        event
    }

    /// BLAKE3 over every field except `hash`
    pub fn compute_hash(&self) -> String {
        let body = serde_json::json!([
            self.sequence,
            self.timestamp.to_rfc3339(),
            self.operation,
            self.target,
            self.caller,
            self.outcome,
            self.detail,
            self.validation,
            self.prev_hash,
        ]);
        blake3::hash(body.to_string().as_bytes()).to_hex().to_string()
    }
}

/// Selection over the audit log; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub operation: Option<OperationKind>,
    pub outcome: Option<Outcome>,
    pub target_prefix: Option<String>,
    pub caller: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: OperationKind) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn target_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.target_prefix = Some(prefix.into());
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.operation.map_or(true, |op| event.operation == op)
            && self.outcome.map_or(true, |o| event.outcome == o)
            && self
                .target_prefix
                .as_deref()
                .map_or(true, |p| event.target.starts_with(p))
            && self
                .caller
                .as_deref()
                .map_or(true, |c| event.caller.as_deref() == Some(c))
            && self.since.map_or(true, |t| event.timestamp >= t)
            && self.until.map_or(true, |t| event.timestamp <= t)
    }
}

/// Aggregate view of the trail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_operations: u64,
    pub operation_counts: std::collections::BTreeMap<OperationKind, u64>,
    pub violations: u64,
    pub errors: u64,
    /// Ten most accessed targets, most accessed first
    pub top_targets: Vec<(String, u64)>,
    pub suspicious_patterns: Vec<SuspiciousPattern>,
}
