//! Human and JSON output

use serde::Serialize;

use gatehouse_core::audit::{AuditEvent, AuditStats};
use gatehouse_core::queue::QueueStatus;
use gatehouse_core::{Entity, GateReceipt, TaskItem};

pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `value` as JSON, or run `human` for plain output
    pub fn value<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }

    pub fn item(&self, verb: &str, item: &TaskItem) -> anyhow::Result<()> {
        self.value(item, || {
            println!(
                "{verb} {} [{}] kind={} seq={}",
                item.id, item.priority, item.kind, item.sequence
            );
            if item.attempts > 0 {
                println!(
                    "  attempts: {} (last rejection: {})",
                    item.attempts,
                    item.last_rejection.as_deref().unwrap_or("-")
                );
            }
        })
    }
}

pub fn status(s: &QueueStatus) {
    println!("QUEUE: {} ({:?})", s.name, s.phase);
    println!("  pending: {}", s.pending);
    for (priority, count) in s.by_priority.iter().rev() {
        println!("    {priority:<8} {count}");
    }
    if let Some(item) = &s.working {
        println!("  working: {} [{}] kind={}", item.id, item.priority, item.kind);
    }
    if !s.before_insert_steps.is_empty() {
        println!("  before insert: {}", s.before_insert_steps.join(", "));
    }
    if !s.after_pop_steps.is_empty() {
        println!("  after pop: {}", s.after_pop_steps.join(", "));
    }
}

pub fn entity(e: &Entity) {
    match &e.parent_id {
        Some(parent) => println!("{} {} '{}' (parent {parent})", e.id, e.entity_type, e.name),
        None => println!("{} {} '{}'", e.id, e.entity_type, e.name),
    }
}

pub fn receipt(r: &GateReceipt) {
    println!("{} {} ({} bytes)", r.operation, r.relative, r.bytes);
    if let Some(from) = &r.routed_from {
        println!("  routed from {from}");
    }
    if let Some(backup) = &r.backup {
        println!("  backup: {}", backup.display());
    }
    for w in &r.warnings {
        println!("  warning: {w}");
    }
}

pub fn event(e: &AuditEvent) {
    println!(
        "#{:<5} {} {:<15} {:<9} {}{}",
        e.sequence,
        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
        e.operation,
        format!("{:?}", e.outcome).to_lowercase(),
        e.target,
        e.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
    );
}

pub fn stats(s: &AuditStats) {
    println!("OPERATIONS: {}", s.total_operations);
    for (op, count) in &s.operation_counts {
        println!("  {op:<15} {count}");
    }
    println!("VIOLATIONS: {}", s.violations);
    println!("ERRORS: {}", s.errors);
    if !s.top_targets.is_empty() {
        println!("TOP TARGETS:");
        for (target, count) in &s.top_targets {
            println!("  {target:<40} {count}");
        }
    }
    if !s.suspicious_patterns.is_empty() {
        println!("SUSPICIOUS PATTERNS:");
        for p in &s.suspicious_patterns {
            println!(
                "  [{:?}] {} {} x{}: {}",
                p.severity, p.kind, p.subject, p.occurrences, p.description
            );
        }
    }
}
