#![forbid(unsafe_code)]

use idmap_contracts::mapping::{CreateOutcome, MappingRecord, MappingRecordInput, NaturalKey};
use idmap_contracts::{MonotonicTimeNs, Validate};
use idmap_storage::repo::MappingStore;
use idmap_storage::table::{InsertOutcome, StorageError};

/// Idempotent, race-tolerant create for any mapping table.
///
/// An identical re-submission returns the stored record; any other collision on either
/// key becomes `CreateOutcome::Conflict` carrying the stored record and the rejected input.
#[derive(Debug, Default)]
pub struct DuplicateSafeCreator;

impl DuplicateSafeCreator {
    pub fn create<K, S>(
        store: &S,
        input: MappingRecordInput<K>,
        now: MonotonicTimeNs,
    ) -> Result<CreateOutcome<K>, StorageError>
    where
        K: NaturalKey,
        S: MappingStore<K> + ?Sized,
    {
        input.validate()?;

        if let Some(existing) = store.find_by_secondary(&input.secondary_key)? {
            if existing.matches_input(&input) {
                return Ok(CreateOutcome::Created {
                    record: existing,
                    was_new: false,
                });
            }
        }

        let record = MappingRecord::from_input_v1(input.clone(), now)?;
        match store.insert(record)? {
            InsertOutcome::Inserted(record) => Ok(CreateOutcome::Created {
                record,
                was_new: true,
            }),
            InsertOutcome::SecondaryKeyTaken(_) | InsertOutcome::PrimaryKeyTaken(_) => {
                Self::resolve_conflict(store, input)
            }
        }
    }

    // The collision may have been detected at commit time; read the winner back by
    // primary key first, then by natural key.
    fn resolve_conflict<K, S>(
        store: &S,
        duplicate: MappingRecordInput<K>,
    ) -> Result<CreateOutcome<K>, StorageError>
    where
        K: NaturalKey,
        S: MappingStore<K> + ?Sized,
    {
        let existing = match store.find_by_primary(&duplicate.primary_key)? {
            Some(r) => Some(r),
            None => store.find_by_secondary(&duplicate.secondary_key)?,
        };
        match existing {
            Some(record) if record.matches_input(&duplicate) => Ok(CreateOutcome::Created {
                record,
                was_new: false,
            }),
            existing => Ok(CreateOutcome::Conflict {
                existing,
                duplicate,
            }),
        }
    }
}
