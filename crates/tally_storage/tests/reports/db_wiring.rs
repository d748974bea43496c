#![forbid(unsafe_code)]

use tally_kernel_contracts::batch::{BatchId, BatchRecord};
use tally_kernel_contracts::report::{
    ArtifactKey, ContentHash, ReportId, ReportRowInput, ReportStatus, ReportVersion,
};
use tally_kernel_contracts::security::{ActorId, SecurityContext, TenantId};
use tally_kernel_contracts::MonotonicTimeNs;
use tally_storage::repo::{BatchTablesRepo, ReportTablesRepo};
use tally_storage::store::REPORTS_BATCH_UNIQUE;
use tally_storage::{StorageError, StoreHandle};

fn ctx() -> SecurityContext {
    SecurityContext::system_for(
        TenantId::new("tenant_a").unwrap(),
        ActorId::new("system.auto_emit").unwrap(),
    )
}

fn bid(id: &str) -> BatchId {
    BatchId::new(id).unwrap()
}

fn report_input(
    batch_id: &str,
    version: u32,
    supersedes: Option<ReportId>,
    hash_char: char,
) -> ReportRowInput {
    let tenant = TenantId::new("tenant_a").unwrap();
    ReportRowInput::v1(
        bid(batch_id),
        tenant.clone(),
        ReportVersion(version),
        ContentHash::new(hash_char.to_string().repeat(64)).unwrap(),
        ArtifactKey::versioned("reports", &tenant, &bid(batch_id), ReportVersion(version)).unwrap(),
        128,
        supersedes,
        MonotonicTimeNs(10 + u64::from(version)),
        ActorId::new("system.auto_emit").unwrap(),
    )
    .unwrap()
}

fn store_with_batch(id: &str) -> StoreHandle {
    let h = StoreHandle::new_in_memory();
    h.transaction(Some(&ctx()), |txn| {
        txn.insert_batch_row(
            BatchRecord::released_v1(
                bid(id),
                TenantId::new("tenant_a").unwrap(),
                MonotonicTimeNs(1),
            )
            .unwrap(),
        )
    })
    .unwrap();
    h
}

#[test]
fn at_report_db_01_one_issued_report_per_batch() {
    let h = store_with_batch("batch_1");
    let c = ctx();
    let first = h
        .transaction(Some(&c), |txn| txn.insert_report_row(report_input("batch_1", 1, None, 'a')))
        .unwrap();

    let second = h.transaction(Some(&c), |txn| {
        txn.insert_report_row(report_input("batch_1", 1, None, 'b'))
    });
    assert_eq!(
        second,
        Err(StorageError::DuplicateKey {
            table: REPORTS_BATCH_UNIQUE,
            key: first.0.to_string(),
        })
    );
    assert_eq!(
        h.read(Some(&c), |txn| txn.report_rows_for_batch(&bid("batch_1")).len()),
        1
    );
}

#[test]
fn at_report_db_02_report_requires_existing_batch() {
    let h = store_with_batch("batch_1");
    let out = h.transaction(Some(&ctx()), |txn| {
        txn.insert_report_row(report_input("batch_missing", 1, None, 'a'))
    });
    assert!(matches!(
        out,
        Err(StorageError::ForeignKeyViolation {
            table: "reports.batch_id",
            ..
        })
    ));
}

#[test]
fn at_report_db_03_reports_are_append_only() {
    let h = store_with_batch("batch_1");
    let c = ctx();
    let id = h
        .transaction(Some(&c), |txn| txn.insert_report_row(report_input("batch_1", 1, None, 'a')))
        .unwrap();
    let out = h.transaction(Some(&c), |txn| txn.attempt_overwrite_report_row(id));
    assert_eq!(out, Err(StorageError::AppendOnlyViolation { table: "reports" }));
}

#[test]
fn at_report_db_04_supersede_frees_slot_and_links_versions() {
    let h = store_with_batch("batch_1");
    let c = ctx();
    let v1 = h
        .transaction(Some(&c), |txn| txn.insert_report_row(report_input("batch_1", 1, None, 'a')))
        .unwrap();

    let superseded = h
        .transaction(Some(&c), |txn| {
            txn.supersede_issued_report(&bid("batch_1"), MonotonicTimeNs(20))
        })
        .unwrap();
    assert_eq!(superseded, Some(v1));
    assert!(h.read(Some(&c), |txn| txn
        .issued_report_for_batch(&bid("batch_1"))
        .is_none()));

    let next = h
        .read(Some(&c), |txn| txn.next_report_version(&bid("batch_1")))
        .unwrap();
    assert_eq!(next, (ReportVersion(2), Some(v1)));

    let v2 = h
        .transaction(Some(&c), |txn| {
            txn.insert_report_row(report_input("batch_1", 2, Some(v1), 'b'))
        })
        .unwrap();

    let history: Vec<(ReportId, ReportStatus, u32)> = h.read(Some(&c), |txn| {
        txn.report_rows_for_batch(&bid("batch_1"))
            .into_iter()
            .map(|r| (r.report_id, r.status, r.version.0))
            .collect()
    });
    assert_eq!(
        history,
        vec![(v1, ReportStatus::Superseded, 1), (v2, ReportStatus::Issued, 2)]
    );
    let issued = h.read(Some(&c), |txn| {
        txn.issued_report_for_batch(&bid("batch_1")).map(|r| r.report_id)
    });
    assert_eq!(issued, Some(v2));
}

#[test]
fn at_report_db_05_version_must_follow_history() {
    let h = store_with_batch("batch_1");
    let out = h.transaction(Some(&ctx()), |txn| {
        txn.insert_report_row(report_input("batch_1", 2, Some(ReportId(7)), 'a'))
    });
    assert!(matches!(out, Err(StorageError::ContractViolation(_))));
}

#[test]
fn at_report_db_06_supersede_without_issued_report_is_noop() {
    let h = store_with_batch("batch_1");
    let out = h
        .transaction(Some(&ctx()), |txn| {
            txn.supersede_issued_report(&bid("batch_1"), MonotonicTimeNs(5))
        })
        .unwrap();
    assert_eq!(out, None);
}
