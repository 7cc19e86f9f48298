//! Gatehouse configuration
//!
//! A single [`GatehouseConfig`] is handed to [`crate::Gatehouse::open`], which
//! builds every component from it. Nothing in the crate reads global state.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatehouseError, Result};

/// Environment variable overriding `enforcement.mode`
pub const ENV_ENFORCEMENT: &str = "GATEHOUSE_ENFORCEMENT";
/// Environment variable overriding `store.root`
pub const ENV_STORE_ROOT: &str = "GATEHOUSE_STORE_ROOT";
/// Environment variable overriding `validation.step_timeout_ms`
pub const ENV_STEP_TIMEOUT_MS: &str = "GATEHOUSE_STEP_TIMEOUT_MS";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatehouseConfig {
    /// Artifact root every gated path is resolved against
    pub root: PathBuf,

    /// Document store configuration
    pub store: StoreSettings,

    /// Structure enforcement configuration
    pub enforcement: EnforcementSettings,

    /// Validation step configuration
    pub validation: ValidationSettings,

    /// Fraud detection configuration
    pub fraud: FraudSettings,

    /// Audit trail configuration
    pub audit: AuditSettings,

    /// File gate configuration
    pub gate: GateSettings,

    /// Structure manifest document key, if any
    pub manifest_key: Option<String>,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            store: StoreSettings::default(),
            enforcement: EnforcementSettings::default(),
            validation: ValidationSettings::default(),
            fraud: FraudSettings::default(),
            audit: AuditSettings::default(),
            gate: GateSettings::default(),
            manifest_key: None,
        }
    }
}

impl GatehouseConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the artifact root; the store root follows unless set explicitly
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the document store root
    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store.root = Some(root.into());
        self
    }

    /// Set the enforcement mode
    pub fn with_enforcement(mut self, mode: EnforcementMode) -> Self {
        self.enforcement.mode = mode;
        self
    }

    /// Add an exempt path glob
    pub fn with_exempt_path(mut self, pattern: impl Into<String>) -> Self {
        self.enforcement.exempt_paths.push(pattern.into());
        self
    }

    /// Set the per-step validation timeout
    pub fn with_step_timeout_ms(mut self, ms: u64) -> Self {
        self.validation.step_timeout_ms = ms;
        self
    }

    /// Enable or disable fraud detection
    pub fn with_fraud_detection(mut self, enabled: bool) -> Self {
        self.fraud.enabled = enabled;
        self
    }

    /// Persist the audit trail to a JSONL file
    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit.log_path = Some(path.into());
        self
    }

    /// Set the structure manifest document key
    pub fn with_manifest(mut self, key: impl Into<String>) -> Self {
        self.manifest_key = Some(key.into());
        self
    }

    /// Directory holding queue, registry and manifest documents
    pub fn store_root(&self) -> PathBuf {
        self.store
            .root
            .clone()
            .unwrap_or_else(|| self.root.join(".gatehouse"))
    }

    /// Load configuration from a TOML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content).map_err(|e| {
                GatehouseError::InvalidConfig(format!("{}: {}", path.display(), e))
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `GATEHOUSE_*` environment overrides
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(mode) = std::env::var(ENV_ENFORCEMENT) {
            self.enforcement.mode = mode.parse()?;
        }
        if let Ok(root) = std::env::var(ENV_STORE_ROOT) {
            self.store.root = Some(PathBuf::from(root));
        }
        if let Ok(ms) = std::env::var(ENV_STEP_TIMEOUT_MS) {
            self.validation.step_timeout_ms = ms.trim().parse().map_err(|_| {
                GatehouseError::InvalidConfig(format!("{ENV_STEP_TIMEOUT_MS}={ms}"))
            })?;
        }
        Ok(self)
    }

    /// Reject settings no component can operate with
    pub fn validate(&self) -> Result<()> {
        if self.store.max_commit_retries == 0 {
            return Err(invalid("store.max_commit_retries must be at least 1"));
        }
        if self.validation.step_timeout_ms == 0 {
            return Err(invalid("validation.step_timeout_ms must be positive"));
        }
        let f = &self.fraud;
        if f.window_secs == 0 {
            return Err(invalid("fraud.window_secs must be positive"));
        }
        if f.rapid_access_threshold == 0
            || f.rapid_access_threshold >= f.rapid_access_high
            || f.rapid_access_high >= f.rapid_access_critical
        {
            return Err(invalid(
                "fraud thresholds must satisfy 0 < rapid_access_threshold < rapid_access_high < rapid_access_critical",
            ));
        }
        if f.baseline_multiplier <= 1.0 {
            return Err(invalid("fraud.baseline_multiplier must exceed 1.0"));
        }
        if f.rejection_threshold == 0 {
            return Err(invalid("fraud.rejection_threshold must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> GatehouseError {
    GatehouseError::InvalidConfig(msg.to_string())
}

/// Document store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store directory; defaults to `<root>/.gatehouse`
    pub root: Option<PathBuf>,

    /// Reload-and-retry bound on version conflicts
    pub max_commit_retries: usize,

    /// Upper bound on waiting for the cross-process commit lease
    pub lock_timeout_ms: u64,

    /// Base delay before retrying a conflicted commit; doubled per attempt, jittered
    pub retry_backoff_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: None,
            max_commit_retries: 5,
            lock_timeout_ms: 2_000,
            retry_backoff_ms: 5,
        }
    }
}

/// How structure violations are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Violations block the operation
    #[default]
    Strict,
    /// Violations proceed with a warning on the receipt
    Warn,
    /// Violations proceed and are only recorded
    Monitor,
    /// Structure checks are skipped
    Bypass,
}

impl EnforcementMode {
    /// Whether a structure violation stops the operation
    pub fn blocks(self) -> bool {
        matches!(self, Self::Strict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Monitor => "monitor",
            Self::Bypass => "bypass",
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "monitor" => Ok(Self::Monitor),
            "bypass" => Ok(Self::Bypass),
            other => Err(GatehouseError::InvalidConfig(format!(
                "unknown enforcement mode '{other}'"
            ))),
        }
    }
}

/// Structure enforcement settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementSettings {
    pub mode: EnforcementMode,

    /// Globs (relative to root) that skip structure checks
    pub exempt_paths: Vec<String>,
}

/// Validation runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Maximum duration of a single step
    pub step_timeout_ms: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 5_000,
        }
    }
}

/// Fraud detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudSettings {
    pub enabled: bool,

    /// Sliding window length
    pub window_secs: u64,

    /// Accesses to one path within the window that open a `rapid_access` pattern
    pub rapid_access_threshold: usize,

    /// Accesses within the window that raise it to high severity
    pub rapid_access_high: usize,

    /// Accesses within the window that raise it to critical severity
    pub rapid_access_critical: usize,

    /// Rejections of one path within the window that open an `unauthorized_path` pattern
    pub rejection_threshold: usize,

    /// Spike factor over a caller's baseline rate that counts as an anomaly
    pub baseline_multiplier: f64,

    /// Operations a caller needs before its baseline is trusted
    pub baseline_min_ops: usize,

    /// Callers allowed into administrative areas
    pub privileged_callers: Vec<String>,
}

impl Default for FraudSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            rapid_access_threshold: 10,
            rapid_access_high: 50,
            rapid_access_critical: 500,
            rejection_threshold: 3,
            baseline_multiplier: 5.0,
            baseline_min_ops: 20,
            privileged_callers: Vec::new(),
        }
    }
}

/// Audit trail settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// JSONL file the trail is appended to
    pub log_path: Option<PathBuf>,

    /// In-memory cap; oldest events are dropped beyond it
    pub max_entries: Option<usize>,
}

/// File gate settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Copy an existing file aside before `write` replaces it
    pub backup_on_write: bool,

    /// Route bare typed file names into the type's directory
    pub auto_route: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatehouseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enforcement.mode, EnforcementMode::Strict);
        assert_eq!(config.store.max_commit_retries, 5);
        assert_eq!(config.validation.step_timeout_ms, 5_000);
        assert_eq!(config.store_root(), PathBuf::from("./.gatehouse"));
    }

    #[test]
    fn test_builder() {
        let config = GatehouseConfig::new()
            .with_root("/srv/artifacts")
            .with_enforcement(EnforcementMode::Warn)
            .with_exempt_path("scratch/**")
            .with_step_timeout_ms(250);

        assert_eq!(config.enforcement.mode, EnforcementMode::Warn);
        assert_eq!(config.enforcement.exempt_paths, vec!["scratch/**"]);
        assert_eq!(config.validation.step_timeout_ms, 250);
        assert_eq!(
            config.store_root(),
            PathBuf::from("/srv/artifacts/.gatehouse")
        );
    }

    #[test]
    fn test_partial_toml() {
        let config: GatehouseConfig = toml::from_str(
            r#"
            root = "/data"

            [enforcement]
            mode = "monitor"

            [fraud]
            rapid_access_threshold = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.enforcement.mode, EnforcementMode::Monitor);
        assert_eq!(config.fraud.rapid_access_threshold, 4);
        assert_eq!(config.fraud.rapid_access_high, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = GatehouseConfig::default();
        config.fraud.rapid_access_high = 5;
        assert!(matches!(
            config.validate(),
            Err(GatehouseError::InvalidConfig(_))
        ));

        let mut config = GatehouseConfig::default();
        config.store.max_commit_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("WARN".parse::<EnforcementMode>().unwrap(), EnforcementMode::Warn);
        assert!("loose".parse::<EnforcementMode>().is_err());
        assert!(EnforcementMode::Strict.blocks());
        assert!(!EnforcementMode::Monitor.blocks());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.json");

        let config = GatehouseConfig::new().with_enforcement(EnforcementMode::Bypass);
        config.to_file(&path).unwrap();

        let loaded = GatehouseConfig::from_file(&path).unwrap();
        assert_eq!(loaded.enforcement.mode, EnforcementMode::Bypass);
    }
}
