#![forbid(unsafe_code)]

use idmap_contracts::mapping::PrimaryKey;
use idmap_contracts::MonotonicTimeNs;
use idmap_storage::audit::{
    MappingAuditEventInput, MappingAuditEventType, MappingAuditLedger, AUDIT_TABLE,
};
use idmap_storage::table::StorageError;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_audit(tag: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir()
        .join(format!("idmap-audit-test-{tag}-{suffix}"))
        .join("audit.jsonl")
}

fn ev(t: u64, event_type: MappingAuditEventType, pk: Option<u64>) -> MappingAuditEventInput {
    MappingAuditEventInput::v1(
        MonotonicTimeNs(t),
        "non_association_mappings",
        event_type,
        pk.map(PrimaryKey::Numeric),
        "detail",
    )
    .unwrap()
}

#[test]
fn at_audit_ledger_db_01_event_ids_increase_and_filter_by_primary() {
    let ledger = MappingAuditLedger::new_in_memory();
    let e1 = ledger
        .append(ev(1, MappingAuditEventType::CreateCommitted, Some(1)))
        .unwrap();
    let e2 = ledger
        .append(ev(2, MappingAuditEventType::MergeApplied, None))
        .unwrap();
    let e3 = ledger
        .append(ev(3, MappingAuditEventType::Deleted, Some(1)))
        .unwrap();
    assert_eq!((e1, e2, e3), (1, 2, 3));

    let for_one = ledger.events_for_primary(&PrimaryKey::Numeric(1)).unwrap();
    assert_eq!(for_one.len(), 2);
    assert_eq!(for_one[1].event_type, MappingAuditEventType::Deleted);
    assert_eq!(ledger.events().unwrap().len(), 3);
}

#[test]
fn at_audit_ledger_db_02_invalid_event_is_rejected() {
    assert!(MappingAuditEventInput::v1(
        MonotonicTimeNs(0),
        "non_association_mappings",
        MappingAuditEventType::Deleted,
        None,
        "",
    )
    .is_err());
    assert!(MappingAuditEventInput::v1(
        MonotonicTimeNs(1),
        " ",
        MappingAuditEventType::Deleted,
        None,
        "",
    )
    .is_err());
}

#[test]
fn at_audit_ledger_db_03_file_backed_events_survive_reopen() {
    let path = temp_audit("reopen");
    let ledger = MappingAuditLedger::open(&path).unwrap();
    ledger
        .append(ev(1, MappingAuditEventType::CreateCommitted, Some(1)))
        .unwrap();
    ledger
        .append(ev(2, MappingAuditEventType::MergeRejected, None))
        .unwrap();
    ledger.close().unwrap();

    let reopened = MappingAuditLedger::open(&path).unwrap();
    assert_eq!(reopened.path(), Some(path.as_path()));
    let events = reopened.events().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_type, MappingAuditEventType::MergeRejected);
    let next = reopened
        .append(ev(3, MappingAuditEventType::Deleted, Some(1)))
        .unwrap();
    assert_eq!(next, 3);
    assert_eq!(
        reopened
            .events_for_primary(&PrimaryKey::Numeric(1))
            .unwrap()
            .len(),
        2
    );
    reopened.close().unwrap();
    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_audit_ledger_db_04_corrupt_audit_file_fails_open() {
    let path = temp_audit("corrupt");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "not an event\n").unwrap();
    match MappingAuditLedger::open(&path) {
        Err(StorageError::Unavailable { table, .. }) => assert_eq!(table, AUDIT_TABLE),
        other => panic!("expected unavailable ledger, got {other:?}"),
    }
    let _ = fs::remove_dir_all(path.parent().unwrap());
}
