//! FileOperationGate: the single entry point for artifact creation
//!
//! Every call resolves the path under the root, checks it against the
//! structure manifest, asks the fraud detector, performs the write atomically,
//! and appends exactly one audit event whatever the outcome.
//!
//! The document store and the audit log may sit under the root; paths inside
//! them are refused in every enforcement mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditTrail, Observation, OperationKind};
use crate::config::{EnforcementMode, GateSettings, GatehouseConfig};
use crate::error::{GatehouseError, Result, StructureViolationKind};
use crate::manifest::{Glob, StructureManifest};
use crate::store::{blocking, normalize, write_atomic};

/// A gated file operation
#[derive(Debug, Clone, Default)]
pub struct FileRequest {
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub declared_type: Option<String>,
    pub caller: Option<String>,
}

impl FileRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    pub fn declared_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.declared_type = Some(artifact_type.into());
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// What a successful operation did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReceipt {
    /// Absolute path written
    pub path: PathBuf,
    /// Root-relative, `/`-separated
    pub relative: String,
    pub operation: OperationKind,
    pub bytes: u64,
    /// Violations let through by the enforcement mode, and low-severity detections
    pub warnings: Vec<String>,
    pub backup: Option<PathBuf>,
    /// Requested path when the artifact was routed into its type's directory
    pub routed_from: Option<String>,
}

/// Gate over one artifact root
#[derive(Debug)]
pub struct FileOperationGate {
    root: PathBuf,
    manifest: RwLock<Arc<StructureManifest>>,
    audit: Arc<AuditTrail>,
    mode: EnforcementMode,
    exempt: Vec<Glob>,
    protected: Vec<PathBuf>,
    settings: GateSettings,
}

impl FileOperationGate {
    /// Gate over `root` (created if missing) in strict mode
    pub fn new(
        root: impl AsRef<Path>,
        manifest: Arc<StructureManifest>,
        audit: Arc<AuditTrail>,
    ) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: absolute(root)?,
            manifest: RwLock::new(manifest),
            audit,
            mode: EnforcementMode::Strict,
            exempt: Vec::new(),
            protected: Vec::new(),
            settings: GateSettings::default(),
        })
    }

    pub fn from_config(
        config: &GatehouseConfig,
        manifest: Arc<StructureManifest>,
        audit: Arc<AuditTrail>,
    ) -> Result<Self> {
        let protected = std::iter::once(config.store_root()).chain(config.audit.log_path.clone());
        Ok(Self::new(&config.root, manifest, audit)?
            .with_enforcement(config.enforcement.mode)
            .with_exempt_paths(&config.enforcement.exempt_paths)?
            .with_protected_paths(protected)?
            .with_settings(config.gate.clone()))
    }

    pub fn with_enforcement(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_exempt_paths(mut self, patterns: &[String]) -> Result<Self> {
        self.exempt = patterns
            .iter()
            .map(|p| Glob::region(p))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Refuse any target at or below these paths
    pub fn with_protected_paths<I, P>(mut self, paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            self.protected.push(absolute(path.as_ref())?);
        }
        Ok(self)
    }

    pub fn with_settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// Swap in a recompiled manifest
    pub fn replace_manifest(&self, manifest: Arc<StructureManifest>) {
        *self.manifest.write() = manifest;
        info!("structure manifest replaced");
    }

    /// Create a new file; fails if it already exists
    pub async fn create(&self, request: FileRequest) -> Result<GateReceipt> {
        self.gated(OperationKind::Create, request).await
    }

    /// Create or replace a file
    pub async fn write(&self, request: FileRequest) -> Result<GateReceipt> {
        self.gated(OperationKind::Write, request).await
    }

    /// Create a directory and its parents; succeeds if it already exists
    pub async fn mkdir(&self, request: FileRequest) -> Result<GateReceipt> {
        self.gated(OperationKind::Mkdir, request).await
    }

    async fn gated(&self, operation: OperationKind, request: FileRequest) -> Result<GateReceipt> {
        let resolved = self.resolve(&request.path);
        let target = match &resolved {
            Ok((_, relative)) => relative.clone(),
            Err(_) => request.path.display().to_string(),
        };
        let result = match resolved {
            Ok((path, relative)) => self.perform(operation, &request, path, relative).await,
            Err(e) => Err(e),
        };

        let mut record = AuditRecord::from_result(
            operation,
            result.as_ref().map_or(target, |r| r.relative.clone()),
            &result,
        )
        .caller(request.caller.as_deref());
        if let Ok(receipt) = &result {
            if !receipt.warnings.is_empty() {
                record = record.detail(receipt.warnings.join("; "));
            }
        }
        if let Err(e) = self.audit.record(record) {
            error!(operation = %operation, error = %e, "audit append failed");
            return Err(e);
        }

        match &result {
            Ok(r) => info!(operation = %operation, path = %r.relative, bytes = r.bytes, "file operation committed"),
            Err(e) => warn!(operation = %operation, path = %request.path.display(), error = %e, "file operation refused"),
        }
        result
    }

    async fn perform(
        &self,
        operation: OperationKind,
        request: &FileRequest,
        mut path: PathBuf,
        mut relative: String,
    ) -> Result<GateReceipt> {
        let manifest = self.manifest.read().clone();
        let declared = request.declared_type.as_deref();
        let caller = request.caller.as_deref();
        let is_file = operation != OperationKind::Mkdir;
        let mut warnings = Vec::new();
        let mut routed_from = None;

        if self.settings.auto_route && is_file && !relative.contains('/') {
            if let Some(route) = declared.and_then(|t| manifest.route_for_type(t)) {
                let routed = format!("{}/{}", route.dir.trim_matches('/'), relative);
                debug!(from = %relative, to = %routed, "artifact routed by type");
                (path, relative) = self.resolve(Path::new(&routed))?;
                routed_from = Some(request.path.display().to_string());
            }
        }

        let exempt = self.exempt.iter().any(|g| g.is_match(&relative));
        if !exempt && self.mode != EnforcementMode::Bypass {
            let violations = manifest.violations(&relative, declared, is_file);
            for v in &violations {
                self.audit.record_rejection(
                    &relative,
                    caller,
                    v.kind == StructureViolationKind::FrozenDirectory,
                );
            }
            if let Some(first) = violations.first() {
                if self.mode.blocks() {
                    return Err(first.clone().into_error(&relative));
                }
                for v in violations {
                    if self.mode == EnforcementMode::Warn {
                        warn!(path = %relative, kind = %v.kind, "structure violation allowed in warn mode");
                    } else {
                        debug!(path = %relative, kind = %v.kind, "structure violation recorded in monitor mode");
                    }
                    warnings.push(format!("{}: {}", v.kind, v.message));
                }
            }
        }

        let bytes = if is_file { request.content.len() as u64 } else { 0 };
        let observation = Observation {
            path: &relative,
            operation,
            caller,
            administrative: manifest.classify(&relative).administrative,
            bytes: is_file.then_some(bytes),
            max_bytes: declared
                .and_then(|t| manifest.route_for_type(t))
                .and_then(|r| r.max_bytes),
        };
        let assessment = self.audit.assess(&observation);
        if let Some(hit) = assessment.blocking() {
            return Err(GatehouseError::FraudSuspected {
                path: relative,
                kind: hit.pattern.kind,
                severity: hit.observed,
            });
        }
        warnings.extend(assessment.warnings());

        let mut backup = None;
        match operation {
            OperationKind::Mkdir => tokio::fs::create_dir_all(&path).await?,
            OperationKind::Create => {
                if tokio::fs::try_exists(&path).await? {
                    return Err(GatehouseError::AlreadyExists(relative));
                }
                self.write_file(&path, &request.content).await?;
            }
            _ => {
                if self.settings.backup_on_write && tokio::fs::try_exists(&path).await? {
                    let copy = backup_path(&path);
                    tokio::fs::copy(&path, &copy).await?;
                    debug!(backup = %copy.display(), "existing file backed up");
                    backup = Some(copy);
                }
                self.write_file(&path, &request.content).await?;
            }
        }

        Ok(GateReceipt {
            path,
            relative,
            operation,
            bytes,
            warnings,
            backup,
            routed_from,
        })
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        let target = path.to_path_buf();
        let bytes = content.to_vec();
        blocking(move || write_atomic(&target, &bytes)).await
    }

    /// Absolute path and root-relative form, or `OutsideRoot`
    fn resolve(&self, requested: &Path) -> Result<(PathBuf, String)> {
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let path = normalize(&joined);
        let outside = || GatehouseError::StructureViolation {
            path: requested.display().to_string(),
            kind: StructureViolationKind::OutsideRoot,
            message: format!("resolves outside {}", self.root.display()),
        };

        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| outside())?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if self.escapes_through_link(&path) {
            return Err(outside());
        }
        if self.is_protected(&path) {
            return Err(GatehouseError::StructureViolation {
                path: relative,
                kind: StructureViolationKind::ProtectedPath,
                message: "gatehouse state is only changed through its owning component".to_string(),
            });
        }
        Ok((path, relative))
    }

    /// Whether `path`, lexically or through symlinks, lies in a protected path
    fn is_protected(&self, path: &Path) -> bool {
        if self.protected.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        let Some(real) = real_path(path) else {
            return false;
        };
        self.protected.iter().any(|p| {
            let p = p.canonicalize().unwrap_or_else(|_| p.clone());
            real.starts_with(p)
        })
    }

    /// Whether the nearest existing ancestor of `path` canonicalises outside the root
    fn escapes_through_link(&self, path: &Path) -> bool {
        let Ok(root) = self.root.canonicalize() else {
            return false;
        };
        let mut probe = Some(path);
        while let Some(candidate) = probe {
            if candidate.symlink_metadata().is_ok() {
                return candidate
                    .canonicalize()
                    .map_or(false, |real| !real.starts_with(&root));
            }
            probe = candidate.parent();
        }
        false
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&std::env::current_dir()?.join(path))
    })
}

/// `path` with its nearest existing ancestor resolved through symlinks
fn real_path(path: &Path) -> Option<PathBuf> {
    let mut probe = path;
    let mut rest = Vec::new();
    while probe.symlink_metadata().is_err() {
        rest.push(probe.file_name()?.to_os_string());
        probe = probe.parent()?;
    }
    let mut real = probe.canonicalize().ok()?;
    real.extend(rest.iter().rev());
    Some(real)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".backup.{}", Utc::now().timestamp_millis()));
    path.with_file_name(name)
}
