#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use idmap_contracts::mapping::{
    IdentityId, MappingKind, MappingRecord, MappingRecordInput, NonAssociationKey,
    NonAssociationRecord, PairSequence, PrimaryKey,
};
use idmap_contracts::MonotonicTimeNs;
use idmap_storage::journal::JournaledMappingStore;
use idmap_storage::repo::{MappingStore, NonAssociationStore};
use idmap_storage::table::{InsertOutcome, RekeyOutcome, SecondaryKeyUpdate, StorageError};

const TABLE: &str = "non_association_mappings";

fn temp_journal(tag: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir()
        .join(format!("idmap-journal-test-{tag}-{suffix}"))
        .join("non_association.jsonl")
}

fn cleanup(path: &PathBuf) {
    if let Some(parent) = path.parent() {
        let _ = fs::remove_dir_all(parent);
    }
}

fn id(v: &str) -> IdentityId {
    IdentityId::new(v).unwrap()
}

fn key(first: &str, second: &str, seq: u32) -> NonAssociationKey {
    NonAssociationKey::new(id(first), id(second), PairSequence(seq)).unwrap()
}

fn row(pk: u64, first: &str, second: &str, seq: u32) -> NonAssociationRecord {
    let input = MappingRecordInput::v1(
        PrimaryKey::Numeric(pk),
        key(first, second, seq),
        MappingKind::MigrationCreated,
        None,
    )
    .unwrap();
    MappingRecord::from_input_v1(input, MonotonicTimeNs(pk * 10)).unwrap()
}

fn journal_lines(path: &PathBuf) -> usize {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

#[test]
fn at_journal_db_01_mutations_survive_close_and_reopen() {
    let path = temp_journal("replay");
    let s: JournaledMappingStore<NonAssociationKey> =
        JournaledMappingStore::open(&path, TABLE).unwrap();
    s.insert(row(1, "A", "C", 1)).unwrap();
    s.insert(row(2, "B", "C", 1)).unwrap();
    s.insert(row(3, "D", "E", 1)).unwrap();
    assert!(s.delete(&PrimaryKey::Numeric(3)).unwrap());
    let out = s
        .rekey(&[SecondaryKeyUpdate {
            primary_key: PrimaryKey::Numeric(1),
            secondary_key: key("Z", "C", 1),
        }])
        .unwrap();
    assert!(matches!(out, RekeyOutcome::Applied(_)));
    s.close().unwrap();

    let reopened: JournaledMappingStore<NonAssociationKey> =
        JournaledMappingStore::open(&path, TABLE).unwrap();
    assert_eq!(reopened.row_count().unwrap(), 2);
    let merged = reopened
        .find_by_secondary(&key("Z", "C", 1))
        .unwrap()
        .unwrap();
    assert_eq!(merged.primary_key, PrimaryKey::Numeric(1));
    assert_eq!(merged.created_at, MonotonicTimeNs(10));
    assert!(reopened.find_by_secondary(&key("A", "C", 1)).unwrap().is_none());
    assert!(reopened.find_by_primary(&PrimaryKey::Numeric(3)).unwrap().is_none());
    assert_eq!(reopened.find_by_identity(&id("C")).unwrap().len(), 2);
    reopened.close().unwrap();
    cleanup(&path);
}

#[test]
fn at_journal_db_02_rejected_writes_and_absent_deletes_are_not_journaled() {
    let path = temp_journal("noop");
    let s: JournaledMappingStore<NonAssociationKey> =
        JournaledMappingStore::open(&path, TABLE).unwrap();
    s.insert(row(1, "A", "B", 1)).unwrap();
    assert!(matches!(
        s.insert(row(2, "A", "B", 1)).unwrap(),
        InsertOutcome::SecondaryKeyTaken(_)
    ));
    assert!(!s.delete(&PrimaryKey::Numeric(7)).unwrap());
    assert_eq!(journal_lines(&path), 1);
    s.close().unwrap();
    cleanup(&path);
}

#[test]
fn at_journal_db_03_tampered_entry_fails_open() {
    let path = temp_journal("tamper");
    let s: JournaledMappingStore<NonAssociationKey> =
        JournaledMappingStore::open(&path, TABLE).unwrap();
    s.insert(row(1, "A", "B", 1)).unwrap();
    s.close().unwrap();

    let original = fs::read_to_string(&path).unwrap();
    fs::write(&path, original.replace("\"A\"", "\"Q\"")).unwrap();

    let reopened = JournaledMappingStore::<NonAssociationKey>::open(&path, TABLE);
    match reopened {
        Err(StorageError::Unavailable { table, reason }) => {
            assert_eq!(table, TABLE);
            assert!(reason.contains("digest mismatch"));
        }
        other => panic!("expected unavailable store, got {other:?}"),
    }
    cleanup(&path);
}

#[test]
fn at_journal_db_04_unparseable_line_fails_open() {
    let path = temp_journal("garbage");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "{not json}\n").unwrap();

    let reopened = JournaledMappingStore::<NonAssociationKey>::open(&path, TABLE);
    assert!(matches!(reopened, Err(StorageError::Unavailable { .. })));
    cleanup(&path);
}
