//! Error types for Gatehouse Core
//!
//! Every component returns [`GatehouseError`]. Validation and structure outcomes
//! are carried as typed variants so callers can react programmatically; only
//! persistence failures and retry exhaustion are meant to be treated as fatal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::fraud::{PatternKind, Severity};

/// Result type alias for Gatehouse operations
pub type Result<T> = std::result::Result<T, GatehouseError>;

/// Main error type for Gatehouse operations
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// A named validation step refused a queue transition
    #[error("validation step '{step}' (#{index}) rejected transition on queue '{queue}': {reason}")]
    ValidationRejected {
        queue: String,
        step: String,
        index: usize,
        reason: String,
    },

    /// The queue already has an item checked out
    #[error("queue '{queue}' already has working item {item}")]
    WorkingItemConflict { queue: String, item: String },

    /// No eligible item in the queue
    #[error("queue '{0}' has no eligible item")]
    QueueEmpty(String),

    /// `finalize_working` called while nothing is checked out
    #[error("queue '{0}' has no working item")]
    NoWorkingItem(String),

    /// Item id not present in the queue
    #[error("item {item} not found in queue '{queue}'")]
    ItemNotFound { queue: String, item: String },

    /// Queue reached its configured capacity
    #[error("queue '{queue}' is full ({max_items} items)")]
    QueueFull { queue: String, max_items: usize },

    /// Optimistic version check failed at commit time
    #[error("concurrent modification of '{key}': expected version {expected}, found {found}")]
    ConcurrentModification {
        key: String,
        expected: u64,
        found: u64,
    },

    /// Path refused by the structure manifest
    #[error("structure violation at '{path}' ({kind}): {message}")]
    StructureViolation {
        path: String,
        kind: StructureViolationKind,
        message: String,
    },

    /// Critical suspicious pattern matched the operation
    #[error("operation on '{path}' blocked: {kind} pattern at {severity} severity")]
    FraudSuspected {
        path: String,
        kind: PatternKind,
        severity: Severity,
    },

    /// Target of a `create` already exists
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("name '{name}' already registered for type '{entity_type}'")]
    DuplicateName { entity_type: String, name: String },

    #[error("parent entity '{0}' does not exist")]
    UnknownParent(String),

    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    #[error("entity '{id}' still has {children} child entities")]
    EntityHasChildren { id: String, children: usize },

    /// Registry mutation could not be committed within the retry bound
    #[error("registration failed after {attempts} attempts: {reason}")]
    RegistrationFailed { attempts: usize, reason: String },

    /// Step name not present in the step registry
    #[error("unknown validation step '{0}'")]
    UnknownStep(String),

    #[error("invalid document key '{0}'")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// On-disk or in-memory data failed an integrity check
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Persistence-layer failure; always fatal to the current call
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<GatehouseError>,
    },
}

/// Why the structure manifest refused a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureViolationKind {
    FrozenDirectory,
    MissingType,
    UnknownType,
    DisallowedExtension,
    OutsideRoot,
    /// Inside the document store or the audit log
    ProtectedPath,
}

impl fmt::Display for StructureViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::FrozenDirectory => "frozen-directory",
            Self::MissingType => "missing-type",
            Self::UnknownType => "unknown-type",
            Self::DisallowedExtension => "disallowed-extension",
            Self::OutsideRoot => "outside-root",
            Self::ProtectedPath => "protected-path",
        };
        f.write_str(label)
    }
}

impl GatehouseError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, with any context layers removed
    pub fn root(&self) -> &GatehouseError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the caller may reasonably retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::WorkingItemConflict { .. }
                | Self::QueueEmpty(_)
                | Self::ConcurrentModification { .. }
                | Self::QueueFull { .. }
        )
    }

    /// Short machine-readable label, used in audit records
    pub fn label(&self) -> &'static str {
        match self.root() {
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::WorkingItemConflict { .. } => "working_item_conflict",
            Self::QueueEmpty(_) => "queue_empty",
            Self::NoWorkingItem(_) => "no_working_item",
            Self::ItemNotFound { .. } => "item_not_found",
            Self::QueueFull { .. } => "queue_full",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::StructureViolation { .. } => "structure_violation",
            Self::FraudSuspected { .. } => "fraud_suspected",
            Self::AlreadyExists(_) => "already_exists",
            Self::DuplicateName { .. } => "duplicate_name",
            Self::UnknownParent(_) => "unknown_parent",
            Self::EntityNotFound(_) => "entity_not_found",
            Self::EntityHasChildren { .. } => "entity_has_children",
            Self::RegistrationFailed { .. } => "registration_failed",
            Self::UnknownStep(_) => "unknown_step",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidConfig(_) => "invalid_config",
            Self::IntegrityViolation(_) => "integrity_violation",
            Self::Io(_) => "io_failure",
            Self::Serialization(_) => "serialization",
            Self::WithContext { .. } => "error",
        }
    }

    /// Whether this is a policy refusal rather than a processing error
    pub fn is_violation(&self) -> bool {
        matches!(
            self.root(),
            Self::ValidationRejected { .. }
                | Self::StructureViolation { .. }
                | Self::FraudSuspected { .. }
        )
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
