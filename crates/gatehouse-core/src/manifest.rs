//! Structure manifest: where artifacts may be created, by path and type
//!
//! The manifest document is compiled once into glob matchers. Paths handed to
//! [`StructureManifest::classify`] are root-relative and `/`-separated.
//!
//! Glob syntax: `*` matches within one segment, `**` across segments, `?` one
//! character. Region globs (frozen, type-required, administrative, exempt)
//! also cover everything beneath the matched path; allow patterns match the
//! path itself only.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatehouseError, Result, StructureViolationKind};
use crate::store::{DocumentStore, Versioned};

/// Manifest document as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestDocument {
    pub metadata: ManifestMetadata,
    pub frozen: Vec<FrozenRule>,
    /// Exceptions honoured inside every frozen region
    pub allow_in_frozen: Vec<String>,
    pub type_required: Vec<String>,
    pub administrative: Vec<String>,
    pub types: BTreeMap<String, TypeRoute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestMetadata {
    pub version: u64,
    pub description: Option<String>,
}

impl Versioned for ManifestDocument {
    fn version(&self) -> u64 {
        self.metadata.version
    }

    fn set_version(&mut self, version: u64) {
        self.metadata.version = version;
    }
}

/// A frozen region and its own exceptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenRule {
    pub path: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Canonical destination and constraints of an artifact type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRoute {
    pub dir: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl TypeRoute {
    /// Whether `path` carries one of the listed extensions (any, if none listed)
    pub fn accepts_extension(&self, path: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        self.extensions.iter().any(|ext| {
            let ext = ext.trim_start_matches('.');
            name.len() > ext.len() + 1
                && name.ends_with(ext)
                && name.as_bytes()[name.len() - ext.len() - 1] == b'.'
        })
    }
}

/// Compiled glob pattern
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
    specificity: usize,
}

impl Glob {
    /// Match the path exactly
    pub fn new(pattern: &str) -> Result<Self> {
        Self::compile(pattern, false)
    }

    /// Match the path or anything beneath it
    pub fn region(pattern: &str) -> Result<Self> {
        Self::compile(pattern, true)
    }

    fn compile(pattern: &str, region: bool) -> Result<Self> {
        let trimmed = pattern.trim_matches('/');
        let mut source = String::from("^");
        let mut chars = trimmed.chars().peekable();
        let mut specificity = 0;
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        source.push_str("(?:.*/)?");
                    } else {
                        source.push_str(".*");
                    }
                }
                '*' => source.push_str("[^/]*"),
                '?' => source.push_str("[^/]"),
                other => {
                    specificity += 1;
                    source.push_str(&regex::escape(&other.to_string()));
                }
            }
        }
        if region {
            source.push_str("(?:/.*)?");
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| {
            GatehouseError::InvalidConfig(format!("bad glob '{pattern}': {e}"))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            specificity,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn compile_all(patterns: &[String], region: bool) -> Result<Vec<Glob>> {
    patterns
        .iter()
        .map(|p| Glob::compile(p, region))
        .collect()
}

#[derive(Debug, Clone)]
struct CompiledFrozen {
    rule: FrozenRule,
    region: Glob,
    allow: Vec<Glob>,
}

/// How the manifest sees one path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub frozen: bool,
    /// Most specific frozen rule covering the path, allowed or not
    pub frozen_rule: Option<String>,
    pub frozen_message: Option<String>,
    /// Allow pattern that lifted the freeze
    pub allowed_by: Option<String>,
    pub requires_type: bool,
    pub administrative: bool,
}

/// One reason the manifest refuses a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: StructureViolationKind,
    pub message: String,
}

impl Violation {
    pub fn into_error(self, path: &str) -> GatehouseError {
        GatehouseError::StructureViolation {
            path: path.to_string(),
            kind: self.kind,
            message: self.message,
        }
    }
}

/// Compiled structure manifest
#[derive(Debug, Clone)]
pub struct StructureManifest {
    frozen: Vec<CompiledFrozen>,
    allow_in_frozen: Vec<Glob>,
    type_required: Vec<Glob>,
    administrative: Vec<Glob>,
    types: BTreeMap<String, TypeRoute>,
}

impl Default for StructureManifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl StructureManifest {
    /// A manifest with no rules: every path is unrestricted
    pub fn empty() -> Self {
        Self {
            frozen: Vec::new(),
            allow_in_frozen: Vec::new(),
            type_required: Vec::new(),
            administrative: Vec::new(),
            types: BTreeMap::new(),
        }
    }

    pub fn compile(doc: &ManifestDocument) -> Result<Self> {
        let mut frozen = doc
            .frozen
            .iter()
            .map(|rule| {
                Ok(CompiledFrozen {
                    region: Glob::region(&rule.path)?,
                    allow: compile_all(&rule.allow, false)?,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // Most specific first, so the first hit is the longest match.
        frozen.sort_by(|a, b| b.region.specificity.cmp(&a.region.specificity));

        debug!(
            frozen = frozen.len(),
            types = doc.types.len(),
            "structure manifest compiled"
        );
        Ok(Self {
            frozen,
            allow_in_frozen: compile_all(&doc.allow_in_frozen, false)?,
            type_required: compile_all(&doc.type_required, true)?,
            administrative: compile_all(&doc.administrative, true)?,
            types: doc.types.clone(),
        })
    }

    /// Load and compile the manifest stored under `key`
    pub fn load(store: &DocumentStore, key: &str) -> Result<Self> {
        let snapshot = store.load::<ManifestDocument>(key)?;
        Self::compile(&snapshot.document)
    }

    pub fn classify(&self, path: &str) -> Classification {
        let mut out = Classification {
            requires_type: self.type_required.iter().any(|g| g.is_match(path)),
            administrative: self.administrative.iter().any(|g| g.is_match(path)),
            ..Classification::default()
        };

        if let Some(hit) = self.frozen.iter().find(|f| f.region.is_match(path)) {
            out.frozen_rule = Some(hit.rule.path.clone());
            out.frozen_message = hit.rule.message.clone();
            out.allowed_by = hit
                .allow
                .iter()
                .chain(self.allow_in_frozen.iter())
                .find(|g| g.is_match(path))
                .map(|g| g.pattern().to_string());
            out.frozen = out.allowed_by.is_none();
        }
        out
    }

    /// Canonical directory route of an artifact type
    pub fn route_for_type(&self, artifact_type: &str) -> Option<&TypeRoute> {
        self.types.get(artifact_type)
    }

    /// Every rule the path breaks, in the order they are checked.
    ///
    /// `is_file` is false for directory creation, which skips extension checks.
    pub fn violations(
        &self,
        path: &str,
        declared_type: Option<&str>,
        is_file: bool,
    ) -> Vec<Violation> {
        let class = self.classify(path);
        let mut found = Vec::new();

        if class.frozen {
            let rule = class.frozen_rule.unwrap_or_default();
            found.push(Violation {
                kind: StructureViolationKind::FrozenDirectory,
                message: class
                    .frozen_message
                    .unwrap_or_else(|| format!("'{rule}' is frozen")),
            });
        }

        match declared_type {
            None if class.requires_type && is_file => found.push(Violation {
                kind: StructureViolationKind::MissingType,
                message: "an artifact type must be declared for this path".to_string(),
            }),
            Some(ty) => match self.route_for_type(ty) {
                Some(route) if is_file && !route.accepts_extension(path) => {
                    found.push(Violation {
                        kind: StructureViolationKind::DisallowedExtension,
                        message: format!(
                            "type '{ty}' accepts only {}",
                            route.extensions.join(", ")
                        ),
                    })
                }
                None if class.requires_type => found.push(Violation {
                    kind: StructureViolationKind::UnknownType,
                    message: format!("artifact type '{ty}' is not declared in the manifest"),
                }),
                _ => {}
            },
            None => {}
        }
        found
    }

    /// Frozen rules, most specific first
    pub fn frozen_directories(&self) -> impl Iterator<Item = &FrozenRule> {
        self.frozen.iter().map(|f| &f.rule)
    }

    pub fn types(&self) -> &BTreeMap<String, TypeRoute> {
        &self.types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> StructureManifest {
        let doc: ManifestDocument = serde_json::from_value(serde_json::json!({
            "frozen": [
                { "path": "layer", "message": "layer is frozen", "allow": ["layer/themes/*"] },
                { "path": "layer/themes/core", "message": "core theme is sealed" },
                { "path": "vendor/**" }
            ],
            "allow_in_frozen": ["**/README.md"],
            "type_required": ["gen"],
            "administrative": ["config/secrets"],
            "types": {
                "report": { "dir": "gen/reports", "extensions": ["md", ".json"], "max_bytes": 1024 },
                "log": { "dir": "gen/logs" }
            }
        }))
        .unwrap();
        StructureManifest::compile(&doc).unwrap()
    }

    #[test]
    fn test_glob_syntax() {
        let g = Glob::new("src/*.rs").unwrap();
        assert!(g.is_match("src/lib.rs"));
        assert!(!g.is_match("src/a/lib.rs"));

        let g = Glob::new("src/**/*.rs").unwrap();
        assert!(g.is_match("src/lib.rs"));
        assert!(g.is_match("src/a/b/lib.rs"));

        let g = Glob::new("v?.txt").unwrap();
        assert!(g.is_match("v1.txt"));
        assert!(!g.is_match("v10.txt"));

        let g = Glob::region("docs").unwrap();
        assert!(g.is_match("docs"));
        assert!(g.is_match("docs/a/b.md"));
        assert!(!g.is_match("docs2/a.md"));
    }

    #[test]
    fn test_unknown_paths_unrestricted() {
        let m = manifest();
        let c = m.classify("src/main.rs");
        assert!(!c.frozen);
        assert!(!c.requires_type);
        assert!(m.violations("src/main.rs", None, true).is_empty());
    }

    #[test]
    fn test_frozen_and_allow_pattern() {
        let m = manifest();
        let c = m.classify("layer/new.ts");
        assert!(c.frozen);
        assert_eq!(c.frozen_message.as_deref(), Some("layer is frozen"));

        let c = m.classify("layer/themes/dark");
        assert!(!c.frozen);
        assert_eq!(c.allowed_by.as_deref(), Some("layer/themes/*"));

        // allow pattern covers that pattern only, not deeper paths
        assert!(m.classify("layer/themes/dark/x.ts").frozen);
        // global exception
        assert!(!m.classify("layer/README.md").frozen);
    }

    #[test]
    fn test_longest_frozen_rule_wins() {
        let m = manifest();
        let c = m.classify("layer/themes/core");
        assert!(c.frozen);
        assert_eq!(c.frozen_rule.as_deref(), Some("layer/themes/core"));
        assert_eq!(c.frozen_message.as_deref(), Some("core theme is sealed"));
    }

    #[test]
    fn test_type_checks() {
        let m = manifest();
        let kinds = |path: &str, ty: Option<&str>| -> Vec<StructureViolationKind> {
            m.violations(path, ty, true).into_iter().map(|v| v.kind).collect()
        };

        assert_eq!(kinds("gen/out.md", None), vec![StructureViolationKind::MissingType]);
        assert!(kinds("gen/reports/out.md", Some("report")).is_empty());
        assert!(kinds("gen/reports/out.json", Some("report")).is_empty());
        assert_eq!(
            kinds("gen/reports/out.exe", Some("report")),
            vec![StructureViolationKind::DisallowedExtension]
        );
        assert_eq!(
            kinds("gen/x.bin", Some("blob")),
            vec![StructureViolationKind::UnknownType]
        );
        // unknown type outside a type-required region is ignored
        assert!(kinds("misc/x.bin", Some("blob")).is_empty());
        // directories never need a type
        assert!(m.violations("gen/new", None, false).is_empty());
    }

    #[test]
    fn test_routes_and_admin() {
        let m = manifest();
        assert_eq!(m.route_for_type("report").unwrap().dir, "gen/reports");
        assert!(m.route_for_type("missing").is_none());
        assert!(m.classify("config/secrets/db.toml").administrative);
        assert_eq!(m.frozen_directories().next().unwrap().path, "layer/themes/core");
        assert_eq!(m.types().len(), 2);
    }

    #[test]
    fn test_extension_matching() {
        let route = TypeRoute {
            dir: "d".into(),
            extensions: vec![".md".into()],
            max_bytes: None,
        };
        assert!(route.accepts_extension("d/a.md"));
        assert!(!route.accepts_extension("d/amd"));
        assert!(!route.accepts_extension("d/.md"));
    }
}
