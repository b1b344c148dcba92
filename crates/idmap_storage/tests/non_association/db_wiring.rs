#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use idmap_contracts::mapping::{
    IdentityId, MappingKind, MappingRecord, MappingRecordInput, NonAssociationKey,
    NonAssociationRecord, PairSequence, PrimaryKey,
};
use idmap_contracts::MonotonicTimeNs;
use idmap_storage::repo::{MappingStore, NonAssociationStore};
use idmap_storage::table::{InsertOutcome, MappingTableStore, RekeyOutcome, SecondaryKeyUpdate};

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
        MappingKind::LegacyCreated,
        None,
    )
    .unwrap();
    MappingRecord::from_input_v1(input, MonotonicTimeNs(pk * 10)).unwrap()
}

fn store() -> MappingTableStore<NonAssociationKey> {
    MappingTableStore::new_in_memory("non_association_mappings")
}

#[test]
fn at_non_association_db_01_identity_lookup_reads_both_slots_in_key_order() {
    let s = store();
    s.insert(row(3, "C", "A", 1)).unwrap();
    s.insert(row(1, "A", "B", 1)).unwrap();
    s.insert(row(2, "B", "C", 1)).unwrap();

    let hits: Vec<PrimaryKey> = s
        .find_by_identity(&id("A"))
        .unwrap()
        .into_iter()
        .map(|r| r.primary_key)
        .collect();
    assert_eq!(hits, vec![PrimaryKey::Numeric(1), PrimaryKey::Numeric(3)]);
    assert!(s.find_by_identity(&id("Z")).unwrap().is_empty());
}

#[test]
fn at_non_association_db_02_rekey_with_missing_row_is_all_or_nothing() {
    let s = store();
    s.insert(row(1, "A", "B", 1)).unwrap();

    let out = s
        .rekey(&[
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(1),
                secondary_key: key("X", "B", 1),
            },
            SecondaryKeyUpdate {
                primary_key: PrimaryKey::Numeric(2),
                secondary_key: key("X", "C", 1),
            },
        ])
        .unwrap();
    assert_eq!(out, RekeyOutcome::NotFound(PrimaryKey::Numeric(2)));
    assert!(s.find_by_secondary(&key("A", "B", 1)).unwrap().is_some());
    assert!(s.find_by_secondary(&key("X", "B", 1)).unwrap().is_none());
}

#[test]
fn at_non_association_db_03_same_pair_with_distinct_sequences_coexist() {
    let s = store();
    assert!(matches!(
        s.insert(row(1, "A", "B", 1)).unwrap(),
        InsertOutcome::Inserted(_)
    ));
    assert!(matches!(
        s.insert(row(2, "A", "B", 2)).unwrap(),
        InsertOutcome::Inserted(_)
    ));
    assert!(matches!(
        s.insert(row(3, "A", "B", 2)).unwrap(),
        InsertOutcome::SecondaryKeyTaken(_)
    ));
}

#[test]
fn at_non_association_db_04_racing_inserts_have_exactly_one_winner() {
    let s = Arc::new(store());
    let handles: Vec<_> = (1..=8)
        .map(|pk| {
            let s = Arc::clone(&s);
            thread::spawn(move || s.insert(row(pk, "A", "B", 1)).unwrap())
        })
        .collect();

    let outcomes: Vec<InsertOutcome<NonAssociationKey>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, InsertOutcome::Inserted(_)))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(s.row_count().unwrap(), 1);
}
