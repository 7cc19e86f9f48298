//! Queue document: the persisted form of a queue set

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatehouseError, Result};
use crate::store::Versioned;
use crate::validation::ValidationStep;

/// Priority tier, `Low < Medium < High < Critical`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Highest tier first
    pub const ORDER: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            other => Err(GatehouseError::InvalidConfig(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// A unit of queued work; mutated only by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub priority: Priority,
    /// Insertion order, unique within the document
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Rejected finalize attempts
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_rejection: Option<String>,
}

impl TaskItem {
    pub fn new(kind: impl Into<String>, payload: Value, priority: Priority, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            priority,
            sequence,
            created_at: now,
            updated_at: now,
            started_at: None,
            attempts: 0,
            last_rejection: None,
        }
    }
}

/// The item currently checked out of a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingSlot {
    pub item: TaskItem,
    pub checked_out_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Tier used when a push names none
    pub default_priority: Priority,
    /// Pending items beyond which pushes fail with `QueueFull`
    pub max_items: Option<usize>,
}

/// One named queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueState {
    pub items: Vec<TaskItem>,
    pub working: Option<WorkingSlot>,
    pub before_insert_steps: Vec<ValidationStep>,
    pub after_pop_steps: Vec<ValidationStep>,
    pub policy: QueuePolicy,
}

/// Lifecycle state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    Empty,
    HasPending,
    HasWorking,
}

impl QueueState {
    pub fn phase(&self) -> QueuePhase {
        if self.working.is_some() {
            QueuePhase::HasWorking
        } else if self.items.is_empty() {
            QueuePhase::Empty
        } else {
            QueuePhase::HasPending
        }
    }

    /// Insert after every item of equal or higher priority
    pub fn insert(&mut self, item: TaskItem) {
        let at = self
            .items
            .iter()
            .position(|i| i.priority < item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
    }

    /// Put a returning item back at its own (priority, sequence) slot.
    ///
    /// An item that was the head of its tier when checked out lands at the
    /// head again; one picked past older items by a filter lands behind them.
    pub fn reinsert(&mut self, item: TaskItem) {
        let at = self
            .items
            .iter()
            .position(|i| {
                i.priority < item.priority
                    || (i.priority == item.priority && i.sequence > item.sequence)
            })
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
    }

    /// Remove and return the first item accepted by `filter`
    pub fn take_first<F>(&mut self, filter: F) -> Option<TaskItem>
    where
        F: Fn(&TaskItem) -> bool,
    {
        let at = self.items.iter().position(filter)?;
        Some(self.items.remove(at))
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskItem> {
        let at = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(at))
    }

    /// Whether items are sorted by priority desc, sequence asc
    pub fn is_ordered(&self) -> bool {
        self.items.windows(2).all(|w| {
            w[0].priority > w[1].priority
                || (w[0].priority == w[1].priority && w[0].sequence < w[1].sequence)
        })
    }

    pub fn count_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.priority).or_default() += 1;
        }
        counts
    }
}

/// Lifetime counters across the whole document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTotals {
    pub pushed: u64,
    pub completed: u64,
    pub requeued: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueMetadata {
    pub version: u64,
    pub totals: QueueTotals,
    /// Highest sequence number handed out
    pub last_sequence: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A set of named queues persisted as one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDocument {
    pub metadata: QueueMetadata,
    pub queues: BTreeMap<String, QueueState>,
    pub priority_order: Vec<Priority>,
}

impl Default for QueueDocument {
    fn default() -> Self {
        Self {
            metadata: QueueMetadata::default(),
            queues: BTreeMap::new(),
            priority_order: Priority::ORDER.to_vec(),
        }
    }
}

impl Versioned for QueueDocument {
    fn version(&self) -> u64 {
        self.metadata.version
    }

    fn set_version(&mut self, version: u64) {
        self.metadata.version = version;
    }
}

impl QueueDocument {
    /// Next insertion sequence number, recorded as handed out
    pub fn next_sequence(&mut self) -> u64 {
        self.metadata.last_sequence += 1;
        self.metadata.last_sequence
    }

    pub fn touch(&mut self) {
        self.metadata.updated_at = Some(Utc::now());
    }
}
