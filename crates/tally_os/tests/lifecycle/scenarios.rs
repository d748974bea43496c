#![forbid(unsafe_code)]

mod support;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tally_engines::digest::sha256_hex;
use tally_kernel_contracts::audit::{AuditAction, AuditSeverity};
use tally_kernel_contracts::batch::{BatchId, BatchStatus};
use tally_kernel_contracts::report::{ArtifactKey, ReportStatus};
use tally_kernel_contracts::security::TenantId;
use tally_os::{
    ConcurrencyConflict, EmissionConfig, EmissionError, EmitOutcome, ValidationError,
};
use tally_storage::artifact::{
    ArtifactStore, ArtifactStoreError, FsArtifactStore, InMemoryArtifactStore,
};
use tally_storage::repo::{AuditLogRepo, ReportTablesRepo};
use tally_storage::StorageError;

use support::{bid, eid, manager, Harness};

fn emitted(outcome: &Option<Result<EmitOutcome, EmissionError>>) -> tally_os::EmittedReport {
    match outcome {
        Some(Ok(EmitOutcome::Emitted(r))) => r.clone(),
        other => panic!("expected an emitted report, got {other:?}"),
    }
}

/// Wraps the in-memory store; `put` fails while `failing` is set.
#[derive(Default)]
struct FlakyArtifactStore {
    inner: InMemoryArtifactStore,
    failing: AtomicBool,
}

impl ArtifactStore for FlakyArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ArtifactStoreError::Io {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "object store unavailable"),
            });
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner.get(key)
    }

    fn exists(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError> {
        self.inner.exists(key)
    }
}

/// Flips one byte on write, as a corrupting storage backend would.
#[derive(Default)]
struct CorruptingArtifactStore {
    inner: InMemoryArtifactStore,
}

impl ArtifactStore for CorruptingArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        let mut damaged = bytes.to_vec();
        if let Some(b) = damaged.first_mut() {
            *b ^= 0xFF;
        }
        self.inner.put(key, &damaged)
    }

    fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner.get(key)
    }

    fn exists(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError> {
        self.inner.exists(key)
    }
}

#[test]
fn at_life_01_three_completed_two_inactivated_emits_and_verifies() {
    let (h, mem) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 5);

    for (i, id) in e.iter().take(3).enumerate() {
        let out = h.complete(&c, id, 60 + i as i64 * 10);
        assert_eq!(out.status, BatchStatus::Active);
        assert!(out.emission.is_none());
    }
    assert_eq!(h.inactivate(&c, &e[3]).status, BatchStatus::Active);

    let last = h.inactivate(&c, &e[4]);
    assert_eq!(last.decision.target, BatchStatus::Completed);
    assert_eq!(last.status, BatchStatus::Emitted);
    let report = emitted(&last.emission);
    assert_eq!(report.version.0, 1);
    assert_eq!(report.artifact_key.as_str(), "reports/tenant_a/batch_1/v1");

    let bytes = mem.get(&report.artifact_key).unwrap();
    assert_eq!(report.content_hash.as_str(), sha256_hex(&bytes));
    assert_eq!(report.byte_len, bytes.len() as u64);

    let status = h.read.get_batch_report_status(Some(&c), &bid("batch_1")).unwrap();
    assert_eq!(status.status, BatchStatus::Emitted);
    assert_eq!(status.report_id, Some(report.report_id));
    assert_eq!(status.content_hash, Some(report.content_hash.clone()));
    assert!(status.issued_at.is_some());

    let verdict = h.read.verify_report(Some(&c), report.report_id).unwrap();
    assert!(verdict.valid);
    assert_eq!(verdict.stored_hash, verdict.computed_hash);

    assert_eq!(
        h.audit_actions(&c, "batch_1"),
        vec![AuditAction::StatusRecomputed, AuditAction::AutoEmit]
    );
}

#[test]
fn at_life_02_all_inactivated_cancels_and_emit_is_rejected() {
    let (h, mem) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 3);
    let mut last = None;
    for id in &e {
        last = Some(h.inactivate(&c, id));
    }
    let last = last.unwrap();
    assert_eq!(last.status, BatchStatus::Cancelled);
    assert!(last.emission.is_none());

    let out = h.emission().emit(Some(&c), &bid("batch_1"), h.now());
    assert!(matches!(
        out,
        Err(EmissionError::Validation(ValidationError::WrongBatchState {
            actual: "cancelled",
            ..
        }))
    ));
    assert!(mem.is_empty());
}

#[test]
fn at_life_03_sequential_second_emit_returns_existing_report() {
    let (h, _) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    let first = emitted(&h.complete(&c, &e[0], 75).emission);

    let again = h.emission().emit(Some(&c), &bid("batch_1"), h.now()).unwrap();
    assert_eq!(
        again,
        EmitOutcome::Conflict(ConcurrencyConflict::AlreadyEmitted {
            report_id: first.report_id
        })
    );
    assert_eq!(h.read.list_reports_for_batch(Some(&c), &bid("batch_1")).len(), 1);
}

#[test]
fn at_life_04_corrupted_artifact_fails_verification() {
    let (h, mem) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 2);
    h.complete(&c, &e[0], 50);
    let report = emitted(&h.complete(&c, &e[1], 90).emission);

    mem.overwrite_raw(&report.artifact_key, b"{\"tampered\":true}".to_vec());
    let verdict = h.read.verify_report(Some(&c), report.report_id).unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.stored_hash, report.content_hash.as_str());
    assert_ne!(verdict.stored_hash, verdict.computed_hash);

    let status = h.read.get_batch_report_status(Some(&c), &bid("batch_1")).unwrap();
    assert_eq!(status.content_hash, Some(report.content_hash));
}

#[test]
fn at_life_05_artifact_write_failure_leaves_batch_completed_then_retry_emits() {
    let flaky = Arc::new(FlakyArtifactStore::default());
    flaky.failing.store(true, Ordering::SeqCst);
    let h = Harness::with(flaky.clone(), EmissionConfig::mvp_v1());
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);

    let out = h.complete(&c, &e[0], 80);
    assert_eq!(out.status, BatchStatus::Completed);
    match &out.emission {
        Some(Err(err)) => {
            assert!(matches!(err, EmissionError::StorageFailure(_)));
            assert!(err.is_retryable());
        }
        other => panic!("expected storage failure, got {other:?}"),
    }
    assert!(h
        .store
        .read(Some(&c), |txn| txn.issued_report_for_batch(&bid("batch_1")).is_none()));
    let failed = h.store.read(Some(&c), |txn| {
        txn.audit_rows_for_batch(&bid("batch_1"))
            .into_iter()
            .filter(|e| e.action == AuditAction::EmitFailed)
            .map(|e| (e.severity, e.payload.get("failure").map(str::to_string)))
            .collect::<Vec<_>>()
    });
    assert_eq!(
        failed,
        vec![(AuditSeverity::Error, Some("storage_failure".to_string()))]
    );

    flaky.failing.store(false, Ordering::SeqCst);
    let retry = h
        .recompute
        .recompute(Some(&c), &bid("batch_1"), h.now())
        .unwrap();
    assert!(!retry.decision.changed());
    assert_eq!(retry.status, BatchStatus::Emitted);
    let report = emitted(&retry.emission);
    assert!(h.read.verify_report(Some(&c), report.report_id).unwrap().valid);
}

#[test]
fn at_life_06_verify_after_write_mismatch_aborts_before_flip() {
    let h = Harness::with(
        Arc::new(CorruptingArtifactStore::default()),
        EmissionConfig::mvp_v1(),
    );
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);

    let out = h.complete(&c, &e[0], 40);
    assert_eq!(out.status, BatchStatus::Completed);
    match &out.emission {
        Some(Err(err)) => {
            assert!(err.is_integrity_alert());
            assert!(!err.is_retryable());
        }
        other => panic!("expected integrity mismatch, got {other:?}"),
    }
    let severities = h.store.read(Some(&c), |txn| {
        txn.audit_rows_for_batch(&bid("batch_1"))
            .into_iter()
            .filter(|e| e.action == AuditAction::EmitFailed)
            .map(|e| e.severity)
            .collect::<Vec<_>>()
    });
    assert_eq!(severities, vec![AuditSeverity::Critical]);
    assert!(h.read.list_reports_for_batch(Some(&c), &bid("batch_1")).is_empty());
}

#[test]
fn at_life_07_reset_supersedes_and_reissues_under_new_key() {
    let (h, mem) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 2);
    h.complete(&c, &e[0], 70);
    let v1 = emitted(&h.complete(&c, &e[1], 80).emission);

    let reset = h
        .emission()
        .reset_batch(Some(&c), &bid("batch_1"), "score appeal upheld", h.now())
        .unwrap();
    assert_eq!(reset.superseded_report_id, Some(v1.report_id));
    let status = h.read.get_batch_report_status(Some(&c), &bid("batch_1")).unwrap();
    assert_eq!(status.status, BatchStatus::Active);
    assert_eq!(status.report_id, None);

    assert_eq!(h.reset_evaluation(&c, &e[1]).status, BatchStatus::Active);
    let v2 = emitted(&h.complete(&c, &e[1], 95).emission);
    assert_eq!(v2.version.0, 2);
    assert_eq!(v2.artifact_key.as_str(), "reports/tenant_a/batch_1/v2");
    assert_ne!(v2.content_hash, v1.content_hash);

    let history = h.read.list_reports_for_batch(Some(&c), &bid("batch_1"));
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, ReportStatus::Superseded);
    assert_eq!(history[1].status, ReportStatus::Issued);
    assert_eq!(history[1].supersedes, Some(v1.report_id));

    assert!(mem.exists(&v1.artifact_key).unwrap());
    assert!(h.read.verify_report(Some(&c), v1.report_id).unwrap().valid);
    assert!(h.read.verify_report(Some(&c), v2.report_id).unwrap().valid);

    let actions = h.audit_actions(&c, "batch_1");
    assert!(actions.contains(&AuditAction::BatchReset));
    assert_eq!(
        actions.iter().filter(|a| **a == AuditAction::AutoEmit).count(),
        2
    );
}

#[test]
fn at_life_08_reset_requires_emitted_batch() {
    let (h, _) = Harness::in_memory();
    let c = manager("tenant_a");
    h.release(&c, "batch_1", 2);
    let out = h
        .emission()
        .reset_batch(Some(&c), &bid("batch_1"), "premature", h.now());
    assert!(matches!(
        out,
        Err(EmissionError::Validation(ValidationError::WrongBatchState {
            expected: "emitted",
            ..
        }))
    ));
}

#[test]
fn at_life_09_emitted_batch_is_frozen() {
    let (h, _) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    emitted(&h.complete(&c, &e[0], 88).emission);

    let out = h
        .store
        .transaction(Some(&c), |txn| txn.reset_evaluation(&e[0], h.now()));
    assert!(matches!(out, Err(StorageError::ImmutableBatch { .. })));

    let again = h
        .recompute
        .recompute(Some(&c), &bid("batch_1"), h.now())
        .unwrap();
    assert!(!again.decision.changed());
    assert!(again.emission.is_none());
    assert_eq!(again.status, BatchStatus::Emitted);
}

#[test]
fn at_life_10_missing_or_foreign_context_sees_nothing() {
    let (h, _) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    let report = emitted(&h.complete(&c, &e[0], 66).emission);

    assert_eq!(h.read.get_batch_report_status(None, &bid("batch_1")), None);
    assert!(h.read.list_reports_for_batch(None, &bid("batch_1")).is_empty());
    assert!(matches!(
        h.read.verify_report(None, report.report_id),
        Err(EmissionError::Validation(ValidationError::UnknownReport { .. }))
    ));

    let other = manager("tenant_b");
    assert_eq!(h.read.get_batch_report_status(Some(&other), &bid("batch_1")), None);
    assert!(matches!(
        h.recompute.recompute(Some(&other), &bid("batch_1"), h.now()),
        Err(EmissionError::Validation(ValidationError::UnknownBatch { .. }))
    ));
    assert!(matches!(
        h.recompute.recompute_for_evaluation(None, &eid("batch_1_e1"), h.now()),
        Err(EmissionError::Validation(ValidationError::UnknownEvaluation { .. }))
    ));
}

#[test]
fn at_life_11_completed_batch_reopens_when_evaluation_is_reset() {
    let flaky = Arc::new(FlakyArtifactStore::default());
    flaky.failing.store(true, Ordering::SeqCst);
    let h = Harness::with(flaky, EmissionConfig::mvp_v1());
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    assert_eq!(h.complete(&c, &e[0], 50).status, BatchStatus::Completed);

    let reopened = h.reset_evaluation(&c, &e[0]);
    assert_eq!(reopened.decision.path, vec![BatchStatus::Active]);
    assert_eq!(reopened.status, BatchStatus::Active);
    let batch = h.store.read(Some(&c), |txn| {
        use tally_storage::repo::BatchTablesRepo;
        txn.batch_row(&bid("batch_1")).cloned()
    });
    assert_eq!(batch.unwrap().completed_at, None);
}

#[test]
fn at_life_12_oversized_batch_is_refused() {
    let mut cfg = EmissionConfig::mvp_v1();
    cfg.max_evaluations_per_batch = 2;
    let h = Harness::with(Arc::new(InMemoryArtifactStore::new()), cfg);
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 3);
    h.complete(&c, &e[0], 10);
    h.complete(&c, &e[1], 20);
    let out = h.complete(&c, &e[2], 30);
    assert_eq!(out.status, BatchStatus::Completed);
    assert!(matches!(
        out.emission,
        Some(Err(EmissionError::Validation(ValidationError::BatchTooLarge {
            total: 3,
            max: 2,
            ..
        })))
    ));
}

#[test]
fn at_life_13_filesystem_artifacts_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let fs_store = Arc::new(FsArtifactStore::new(dir.path()));
    let h = Harness::with(fs_store, EmissionConfig::mvp_v1());
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    let report = emitted(&h.complete(&c, &e[0], 77).emission);

    assert!(dir
        .path()
        .join("reports/tenant_a/batch_1/v1")
        .is_file());
    assert!(h.read.verify_report(Some(&c), report.report_id).unwrap().valid);
}

#[test]
fn at_life_14_look_alike_ids_in_two_tenants_keep_separate_artifacts() {
    assert!(TenantId::new("t/a").is_err());
    assert!(BatchId::new("a/b").is_err());

    let (h, _) = Harness::in_memory();
    let (c1, c2) = (manager("t"), manager("t.a"));
    let e1 = h.release(&c1, "a.b", 1);
    let e2 = h.release(&c2, "b", 1);
    let r1 = emitted(&h.complete(&c1, &e1[0], 10).emission);
    let r2 = emitted(&h.complete(&c2, &e2[0], 90).emission);

    assert_ne!(r1.artifact_key, r2.artifact_key);
    assert_ne!(r1.content_hash, r2.content_hash);
    assert!(h.read.verify_report(Some(&c1), r1.report_id).unwrap().valid);
    assert!(h.read.verify_report(Some(&c2), r2.report_id).unwrap().valid);
}

#[test]
fn at_life_15_ids_that_cannot_form_a_key_are_refused_before_release() {
    for raw in ["batch one", "batch/1", "..", "batch\\1"] {
        assert!(BatchId::new(raw).is_err(), "{raw:?} accepted");
    }
    assert!(TenantId::new("tenant a").is_err());
    let (h, _) = Harness::in_memory();
    let c = manager("tenant_a");
    let e = h.release(&c, "batch-1.v2", 1);
    assert!(emitted(&h.complete(&c, &e[0], 40).emission)
        .artifact_key
        .as_str()
        .ends_with("/tenant_a/batch-1.v2/v1"));
}

#[test]
fn at_life_16_deleted_artifact_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let fs_store = Arc::new(FsArtifactStore::new(dir.path()));
    let h = Harness::with(fs_store, EmissionConfig::mvp_v1());
    let c = manager("tenant_a");
    let e = h.release(&c, "batch_1", 1);
    let report = emitted(&h.complete(&c, &e[0], 77).emission);

    std::fs::remove_file(dir.path().join(report.artifact_key.as_str())).unwrap();

    let verdict = h.read.verify_report(Some(&c), report.report_id).unwrap();
    assert!(!verdict.valid);
    assert!(verdict.artifact_missing);
    assert!(verdict.computed_hash.is_empty());
    assert_eq!(verdict.stored_hash, report.content_hash.as_str());
}
