//! Gate, manifest, audit and registry working together

use gatehouse_core::audit::{AuditFilter, OperationKind, Outcome, PatternKind};
use gatehouse_core::error::StructureViolationKind;
use gatehouse_core::manifest::ManifestDocument;
use gatehouse_core::queue::NewTask;
use gatehouse_core::{EnforcementMode, FileRequest, Gatehouse, GatehouseConfig, GatehouseError};
use serde_json::json;
use tempfile::TempDir;

fn manifest() -> ManifestDocument {
    serde_json::from_value(json!({
        "metadata": { "description": "test layout" },
        "frozen": [
            { "path": "core", "message": "core is frozen", "allow": ["core/generated/**"] }
        ],
        "type_required": ["artifacts"],
        "types": {
            "report": { "dir": "artifacts/reports", "extensions": ["md"] }
        }
    }))
    .unwrap()
}

fn open(mode: EnforcementMode) -> (TempDir, Gatehouse) {
    let dir = TempDir::new().unwrap();
    let config = GatehouseConfig::new()
        .with_root(dir.path())
        .with_enforcement(mode)
        .with_manifest("manifest");
    let gh = Gatehouse::open(config).unwrap();
    gh.store().save("manifest", &mut manifest(), 0).unwrap();
    gh.reload_manifest().unwrap();
    (dir, gh)
}

#[tokio::test]
async fn frozen_path_depends_on_enforcement_mode() {
    let (dir, gh) = open(EnforcementMode::Strict);
    let err = gh
        .gate()
        .write(FileRequest::new("core/lib.rs").content("fn main() {}"))
        .await
        .unwrap_err();
    assert!(err.is_violation());
    assert!(matches!(
        err,
        GatehouseError::StructureViolation { kind: StructureViolationKind::FrozenDirectory, .. }
    ));
    assert!(!dir.path().join("core/lib.rs").exists());

    // allow-listed carve-out inside the frozen region
    gh.gate()
        .write(FileRequest::new("core/generated/schema.rs").content("//"))
        .await
        .unwrap();

    for mode in [EnforcementMode::Warn, EnforcementMode::Monitor] {
        let (dir, gh) = open(mode);
        let receipt = gh
            .gate()
            .write(FileRequest::new("core/lib.rs").content("fn main() {}"))
            .await
            .unwrap();
        assert!(!receipt.warnings.is_empty());
        assert!(dir.path().join("core/lib.rs").exists());
        let log = gh.audit().get_audit_log(&AuditFilter::new().operation(OperationKind::Write));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, Outcome::Success);
        assert!(log[0].detail.as_deref().unwrap_or("").contains("frozen-directory"));
    }
}

#[tokio::test]
async fn type_rules_for_required_regions() {
    let (_dir, gh) = open(EnforcementMode::Strict);

    let missing = gh.gate().create(FileRequest::new("artifacts/reports/a.md")).await;
    assert!(matches!(
        missing,
        Err(GatehouseError::StructureViolation { kind: StructureViolationKind::MissingType, .. })
    ));

    let wrong_ext = gh
        .gate()
        .create(FileRequest::new("artifacts/reports/a.txt").declared_type("report"))
        .await;
    assert!(matches!(
        wrong_ext,
        Err(GatehouseError::StructureViolation { kind: StructureViolationKind::DisallowedExtension, .. })
    ));

    let unknown = gh
        .gate()
        .create(FileRequest::new("artifacts/x.md").declared_type("poem"))
        .await;
    assert!(matches!(
        unknown,
        Err(GatehouseError::StructureViolation { kind: StructureViolationKind::UnknownType, .. })
    ));

    gh.gate()
        .create(FileRequest::new("artifacts/reports/a.md").declared_type("report").content("# a"))
        .await
        .unwrap();
}

#[tokio::test]
async fn every_gate_call_appends_exactly_one_event() {
    let (_dir, gh) = open(EnforcementMode::Strict);
    let calls = [
        gh.gate().create(FileRequest::new("notes/a.txt").content("a")).await.is_ok(),
        gh.gate().create(FileRequest::new("notes/a.txt").content("a")).await.is_ok(),
        gh.gate().write(FileRequest::new("core/x.rs")).await.is_ok(),
        gh.gate().write(FileRequest::new("../outside.txt")).await.is_ok(),
        gh.gate().mkdir(FileRequest::new("notes/sub")).await.is_ok(),
    ];
    assert_eq!(calls, [true, false, false, false, true]);

    let log = gh.audit().get_audit_log(&AuditFilter::default());
    assert_eq!(log.len(), calls.len());
    let outcomes: Vec<Outcome> = log.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Success,
            Outcome::Error,
            Outcome::Violation,
            Outcome::Violation,
            Outcome::Success
        ]
    );
    assert!(gh.audit().verify_chain().is_ok());

    let stats = gh.audit().get_stats();
    assert_eq!(stats.total_operations, 5);
    assert_eq!(stats.violations, 2);
}

#[tokio::test]
async fn burst_of_writes_is_flagged_as_rapid_access() {
    let (_dir, gh) = open(EnforcementMode::Strict);
    let burst = 25;
    for i in 0..burst {
        gh.gate()
            .write(FileRequest::new("notes/hot.txt").content(format!("{i}")))
            .await
            .unwrap();
    }

    let patterns = gh.audit().suspicious_patterns();
    let rapid = patterns
        .iter()
        .find(|p| p.kind == PatternKind::RapidAccess && p.subject == "notes/hot.txt")
        .expect("rapid access pattern");
    assert_eq!(rapid.occurrences, burst);
    assert_eq!(gh.audit().get_stats().suspicious_patterns.len(), patterns.len());
}

#[tokio::test]
async fn registry_round_trip_and_duplicates() {
    let (_dir, gh) = open(EnforcementMode::Strict);
    let epic = gh.registry().register("epic", "checkout", "payment flow", None).unwrap();
    let story = gh
        .registry()
        .register("story", "pay by card", "", Some(&epic))
        .unwrap();

    let found = gh.registry().find("story", "pay by card").unwrap().unwrap();
    assert_eq!(found.id, story);
    assert_eq!(found.parent_id.as_deref(), Some(epic.as_str()));
    assert_eq!(gh.registry().children_of(&epic).unwrap().len(), 1);

    assert!(matches!(
        gh.registry().register("epic", "checkout", "again", None),
        Err(GatehouseError::DuplicateName { .. })
    ));
    let log = gh
        .audit()
        .get_audit_log(&AuditFilter::new().operation(OperationKind::Register));
    assert_eq!(log.len(), 3);
    assert_eq!(log[2].outcome, Outcome::Error);
}

#[tokio::test]
async fn gate_cannot_rewrite_store_documents() {
    for mode in [
        EnforcementMode::Strict,
        EnforcementMode::Warn,
        EnforcementMode::Monitor,
        EnforcementMode::Bypass,
    ] {
        let dir = TempDir::new().unwrap();
        let gh = Gatehouse::open(GatehouseConfig::new().with_root(dir.path()).with_enforcement(mode))
            .unwrap();
        gh.queues()
            .push("q", NewTask::new("build", json!({"target": "web"})))
            .await
            .unwrap();
        gh.registry().register("epic", "checkout", "", None).unwrap();

        let forged = r#"{"metadata":{"version":99},"queues":{}}"#;
        for target in [".gatehouse/queues/default.json", ".gatehouse/registry.json"] {
            let err = gh
                .gate()
                .write(FileRequest::new(target).content(forged))
                .await
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    GatehouseError::StructureViolation { kind: StructureViolationKind::ProtectedPath, .. }
                ),
                "{mode:?} {target}: {err}"
            );
        }

        assert_eq!(gh.queues().status("q").await.unwrap().pending, 1);
        assert!(gh.registry().find("epic", "checkout").unwrap().is_some());
    }
}
