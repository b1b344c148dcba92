#![forbid(unsafe_code)]

use idmap_contracts::mapping::{
    BatchLabel, LegacyKey, LegacyKeyField, LegacyMappingRecord, MappingKind, MappingRecord,
    MappingRecordInput, PrimaryKey,
};
use idmap_contracts::MonotonicTimeNs;
use idmap_storage::repo::MappingStore;
use idmap_storage::table::{
    InsertOutcome, MappingTableStore, RekeyOutcome, SecondaryKeyUpdate, StorageError,
};

fn legacy(id: u64) -> LegacyKey {
    LegacyKey::single(LegacyKeyField::Numeric(id)).unwrap()
}

fn row(pk: u64, legacy_id: u64, label: Option<&str>, t: u64) -> LegacyMappingRecord {
    let input = MappingRecordInput::v1(
        PrimaryKey::Numeric(pk),
        legacy(legacy_id),
        MappingKind::MigrationCreated,
        label.map(|l| BatchLabel::new(l).unwrap()),
    )
    .unwrap();
    MappingRecord::from_input_v1(input, MonotonicTimeNs(t)).unwrap()
}

fn store() -> MappingTableStore<LegacyKey> {
    MappingTableStore::new_in_memory("legacy_account_mappings")
}

#[test]
fn at_mapping_table_db_01_insert_then_lookup_by_both_keys() {
    let s = store();
    let r = row(1, 100, None, 10);
    assert_eq!(s.insert(r.clone()).unwrap(), InsertOutcome::Inserted(r.clone()));

    assert_eq!(s.find_by_primary(&PrimaryKey::Numeric(1)).unwrap(), Some(r.clone()));
    assert_eq!(s.find_by_secondary(&legacy(100)).unwrap(), Some(r));
    assert_eq!(s.find_by_primary(&PrimaryKey::Numeric(2)).unwrap(), None);
    assert_eq!(s.find_by_secondary(&legacy(200)).unwrap(), None);
}

#[test]
fn at_mapping_table_db_02_natural_key_uniqueness_reports_existing() {
    let s = store();
    let first = row(1, 100, None, 10);
    s.insert(first.clone()).unwrap();

    let out = s.insert(row(2, 100, None, 11)).unwrap();
    assert_eq!(out, InsertOutcome::SecondaryKeyTaken(first));
    assert_eq!(s.row_count().unwrap(), 1);
}

#[test]
fn at_mapping_table_db_03_primary_key_uniqueness_reports_existing() {
    let s = store();
    let first = row(1, 100, None, 10);
    s.insert(first.clone()).unwrap();

    let out = s.insert(row(1, 101, None, 11)).unwrap();
    assert_eq!(out, InsertOutcome::PrimaryKeyTaken(first));
    assert_eq!(s.find_by_secondary(&legacy(101)).unwrap(), None);
}

#[test]
fn at_mapping_table_db_04_delete_is_idempotent_and_frees_natural_key() {
    let s = store();
    s.insert(row(1, 100, None, 10)).unwrap();

    assert!(s.delete(&PrimaryKey::Numeric(1)).unwrap());
    assert!(!s.delete(&PrimaryKey::Numeric(1)).unwrap());
    assert!(!s.delete(&PrimaryKey::Numeric(99)).unwrap());

    let again = row(2, 100, None, 12);
    assert_eq!(s.insert(again.clone()).unwrap(), InsertOutcome::Inserted(again));
}

#[test]
fn at_mapping_table_db_05_label_scan_pages_lazily_and_restarts() {
    let s = store();
    for pk in 1..=7 {
        let label = if pk % 2 == 0 { "run_even" } else { "run_odd" };
        s.insert(row(pk, 100 + pk, Some(label), pk * 10)).unwrap();
    }
    s.insert(row(50, 500, None, 500)).unwrap();

    let label = BatchLabel::new("run_odd").unwrap();
    let mut scan = s.scan_by_label(&label, 2);
    let first_pass: Vec<PrimaryKey> = scan
        .by_ref()
        .map(|r| r.unwrap().primary_key)
        .collect();
    assert_eq!(
        first_pass,
        vec![
            PrimaryKey::Numeric(1),
            PrimaryKey::Numeric(3),
            PrimaryKey::Numeric(5),
            PrimaryKey::Numeric(7),
        ]
    );
    assert!(scan.next().is_none());

    scan.restart();
    assert_eq!(scan.next().unwrap().unwrap().primary_key, PrimaryKey::Numeric(1));

    let missing = BatchLabel::new("run_missing").unwrap();
    assert_eq!(s.scan_by_label(&missing, 2).count(), 0);
}

#[test]
fn at_mapping_table_db_06_rekey_allows_swap_inside_one_batch() {
    let s = store();
    s.insert(row(1, 100, None, 10)).unwrap();
    s.insert(row(2, 200, None, 11)).unwrap();

    let out = s
        .rekey(&[
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(1),
                secondary_key: legacy(200),
            },
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(2),
                secondary_key: legacy(100),
            },
        ])
        .unwrap();
    assert!(matches!(out, RekeyOutcome::Applied(ref rows) if rows.len() == 2));

    assert_eq!(
        s.find_by_secondary(&legacy(200)).unwrap().unwrap().primary_key,
        PrimaryKey::Numeric(1)
    );
    let moved = s.find_by_secondary(&legacy(100)).unwrap().unwrap();
    assert_eq!(moved.primary_key, PrimaryKey::Numeric(2));
    assert_eq!(moved.created_at, MonotonicTimeNs(11));
}

#[test]
fn at_mapping_table_db_07_rekey_collision_changes_nothing() {
    let s = store();
    s.insert(row(1, 100, None, 10)).unwrap();
    s.insert(row(2, 200, None, 11)).unwrap();
    s.insert(row(3, 300, None, 12)).unwrap();

    let out = s
        .rekey(&[
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(1),
                secondary_key: legacy(150),
            },
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(2),
                secondary_key: legacy(300),
            },
        ])
        .unwrap();
    match out {
        RekeyOutcome::SecondaryKeyTaken {
            primary_key,
            existing,
        } => {
            assert_eq!(primary_key, PrimaryKey::Numeric(2));
            assert_eq!(existing.primary_key, PrimaryKey::Numeric(3));
        }
        other => panic!("expected collision, got {other:?}"),
    }
    assert!(s.find_by_secondary(&legacy(150)).unwrap().is_none());
    assert!(s.find_by_secondary(&legacy(100)).unwrap().is_some());

    let missing = s
        .rekey(&[SecondaryKeyUpdate {
            primary_key: PrimaryKey::Numeric(9),
            secondary_key: legacy(900),
        }])
        .unwrap();
    assert_eq!(missing, RekeyOutcome::NotFound(PrimaryKey::Numeric(9)));
}

#[test]
fn at_mapping_table_db_08_invalid_rows_fail_closed() {
    let s = store();
    let mut bad = row(1, 100, None, 10);
    bad.created_at = MonotonicTimeNs(0);
    assert!(matches!(
        s.insert(bad),
        Err(StorageError::ContractViolation(_))
    ));

    s.insert(row(2, 200, None, 11)).unwrap();
    let dup_batch = s.rekey(&[
        SecondaryKeyUpdate {
            primary_key: PrimaryKey::Numeric(2),
            secondary_key: legacy(201),
        },
        SecondaryKeyUpdate {
            primary_key: PrimaryKey::Numeric(2),
            secondary_key: legacy(202),
        },
    ]);
    assert!(matches!(dup_batch, Err(StorageError::ContractViolation(_))));
    assert_eq!(s.row_count().unwrap(), 1);
}

#[test]
fn at_mapping_table_db_09_label_page_resumes_strictly_after_cursor() {
    let s = store();
    for pk in [2, 4, 6, 8, 10] {
        s.insert(row(pk, 200 + pk, Some("run_a"), pk)).unwrap();
    }
    s.insert(row(5, 305, Some("run_b"), 5)).unwrap();

    let label = BatchLabel::new("run_a").unwrap();
    let pks = |page: Vec<LegacyMappingRecord>| -> Vec<PrimaryKey> {
        page.into_iter().map(|r| r.primary_key).collect()
    };
    assert_eq!(
        pks(s.label_page(&label, None, 2).unwrap()),
        vec![PrimaryKey::Numeric(2), PrimaryKey::Numeric(4)]
    );
    // Cursor need not be a stored key; the page starts at the next greater one.
    assert_eq!(
        pks(s.label_page(&label, Some(&PrimaryKey::Numeric(5)), 2).unwrap()),
        vec![PrimaryKey::Numeric(6), PrimaryKey::Numeric(8)]
    );
    assert_eq!(
        pks(s.label_page(&label, Some(&PrimaryKey::Numeric(8)), 5).unwrap()),
        vec![PrimaryKey::Numeric(10)]
    );
    assert!(s
        .label_page(&label, Some(&PrimaryKey::Numeric(10)), 5)
        .unwrap()
        .is_empty());
    // Text keys order after every numeric key.
    assert!(s
        .label_page(&label, Some(&PrimaryKey::text("svc-1").unwrap()), 5)
        .unwrap()
        .is_empty());
}

#[test]
fn at_mapping_table_db_10_max_created_at_follows_rows() {
    let s = store();
    assert_eq!(s.max_created_at().unwrap(), None);
    s.insert(row(1, 101, None, 40)).unwrap();
    s.insert(row(2, 102, None, 15)).unwrap();
    assert_eq!(s.max_created_at().unwrap(), Some(MonotonicTimeNs(40)));
    assert!(s.delete(&PrimaryKey::Numeric(1)).unwrap());
    assert_eq!(s.max_created_at().unwrap(), Some(MonotonicTimeNs(15)));
}
