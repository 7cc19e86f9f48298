//! Gatehouse Core - governed task queues and gated file operations
//!
//! Gatehouse controls how pending work flows through validation gates and
//! where artifacts may be written.
//!
//! # Architecture
//!
//! Components, leaves first:
//!
//! 1. **Document store** (`store`): versioned JSON documents, atomic replace-on-write
//! 2. **Structure manifest** (`manifest`): frozen regions, type requirements, type routes
//! 3. **Audit trail** (`audit`): hash-chained event log and sliding-window fraud detector
//! 4. **Registry** (`registry`): named entities, unique per type, with parent links
//! 5. **Validation** (`validation`): named, pluggable steps run in order with a time budget
//! 6. **Task queues** (`queue`): priority queues with one working item each
//! 7. **File gate** (`gate`): the only way artifacts get created or written
//!
//! # Quick Start
//!
//! ```no_run
//! use gatehouse_core::{Gatehouse, GatehouseConfig};
//! use gatehouse_core::queue::{NewTask, Priority};
//! use gatehouse_core::gate::FileRequest;
//!
//! # async fn demo() -> gatehouse_core::Result<()> {
//! let gh = Gatehouse::open(GatehouseConfig::new().with_root("./artifacts"))?;
//!
//! gh.queues()
//!     .push("builds", NewTask::new("build", serde_json::json!({"target": "web"})).priority(Priority::High))
//!     .await?;
//! let item = gh.queues().pop("builds").await?;
//! gh.queues().finalize_working("builds", serde_json::json!({"success": true})).await?;
//!
//! gh.gate()
//!     .write(FileRequest::new("reports/build.md").content(format!("built {}", item.id)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod manifest;
pub mod queue;
pub mod registry;
pub mod store;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use audit::{AuditEvent, AuditFilter, AuditStats, AuditTrail};
pub use config::{EnforcementMode, GatehouseConfig};
pub use error::{GatehouseError, Result, ResultExt};
pub use gate::{FileOperationGate, FileRequest, GateReceipt};
pub use manifest::StructureManifest;
pub use queue::{FinalizeOutcome, NewTask, Priority, TaskItem, TaskQueueEngine};
pub use registry::{Entity, Registry};
pub use store::DocumentStore;
pub use validation::{StepRegistry, ValidationStepRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Every component, wired from one configuration
#[derive(Debug)]
pub struct Gatehouse {
    config: GatehouseConfig,
    store: Arc<DocumentStore>,
    audit: Arc<AuditTrail>,
    steps: Arc<StepRegistry>,
    queues: TaskQueueEngine,
    registry: Registry,
    gate: FileOperationGate,
}

impl Gatehouse {
    /// Open with the built-in validation steps
    pub fn open(config: GatehouseConfig) -> Result<Self> {
        Self::open_with_steps(config, Arc::new(StepRegistry::with_builtins()))
    }

    /// Open with a caller-supplied step registry
    pub fn open_with_steps(config: GatehouseConfig, steps: Arc<StepRegistry>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(
            DocumentStore::open(config.store_root(), &config.store).context("opening document store")?,
        );
        let audit = Arc::new(AuditTrail::from_settings(&config.audit, config.fraud.clone())?);
        let manifest = Arc::new(match &config.manifest_key {
            Some(key) => StructureManifest::load(&store, key).context("loading structure manifest")?,
            None => StructureManifest::empty(),
        });

        let runner = ValidationStepRunner::new(
            steps.clone(),
            Duration::from_millis(config.validation.step_timeout_ms),
        );
        let queues = TaskQueueEngine::new(store.clone(), runner).with_audit(audit.clone());
        let registry = Registry::new(store.clone()).with_audit(audit.clone());
        let gate = FileOperationGate::from_config(&config, manifest, audit.clone())?;

        info!(
            root = %gate.root().display(),
            store = %store.root().display(),
            mode = config.enforcement.mode.as_str(),
            "gatehouse opened"
        );
        Ok(Self {
            config,
            store,
            audit,
            steps,
            queues,
            registry,
            gate,
        })
    }

    pub fn config(&self) -> &GatehouseConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    /// Engine over the default queue set
    pub fn queues(&self) -> &TaskQueueEngine {
        &self.queues
    }

    /// Engine over another queue-set document
    pub fn queue_set(&self, key: impl Into<String>) -> TaskQueueEngine {
        self.queues.clone().with_key(key)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gate(&self) -> &FileOperationGate {
        &self.gate
    }

    /// Recompile the manifest from the store and hand it to the gate
    pub fn reload_manifest(&self) -> Result<()> {
        if let Some(key) = &self.config.manifest_key {
            let manifest = StructureManifest::load(&self.store, key)?;
            self.gate.replace_manifest(Arc::new(manifest));
        }
        Ok(())
    }
}
