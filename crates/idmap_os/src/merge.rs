#![forbid(unsafe_code)]

use idmap_contracts::mapping::{
    IdentityId, MergeOutcome, NonAssociationKey, NonAssociationRecord, PairSequence, PrimaryKey,
    SequenceOutcome, ValidationFailure, ValidationReason,
};
use idmap_storage::repo::NonAssociationStore;
use idmap_storage::table::{RekeyOutcome, SecondaryKeyUpdate, StorageError};

type NaMergeOutcome = MergeOutcome<NonAssociationKey>;

fn rejected(reason: ValidationReason, record: Option<NonAssociationRecord>) -> NaMergeOutcome {
    MergeOutcome::Rejected(ValidationFailure { reason, record })
}

/// Rewrites identity slots of non-association records.
///
/// Every candidate is validated before anything is written, and the rewrite lands through a
/// single `rekey` batch, so a merge either updates all matching records or none of them.
#[derive(Debug, Default)]
pub struct IdentityMergeEngine;

impl IdentityMergeEngine {
    pub fn merge_identity<S>(
        store: &S,
        old: &IdentityId,
        new: &IdentityId,
    ) -> Result<NaMergeOutcome, StorageError>
    where
        S: NonAssociationStore + ?Sized,
    {
        if old == new {
            return Ok(rejected(ValidationReason::IdentitiesWouldBeEqual, None));
        }

        let candidates = store.find_by_identity(old)?;
        if candidates.is_empty() {
            return Ok(MergeOutcome::Updated {
                count: 0,
                records: Vec::new(),
            });
        }

        let mut updates = Vec::with_capacity(candidates.len());
        for record in &candidates {
            let next = record.secondary_key.with_identity_replaced(old, new);
            if next.is_self_paired() {
                return Ok(rejected(
                    ValidationReason::IdentitiesWouldBeEqual,
                    Some(record.clone()),
                ));
            }
            updates.push(SecondaryKeyUpdate {
                primary_key: record.primary_key.clone(),
                secondary_key: next,
            });
        }

        match store.rekey(&updates)? {
            RekeyOutcome::Applied(records) => Ok(MergeOutcome::Updated {
                count: records.len(),
                records,
            }),
            RekeyOutcome::SecondaryKeyTaken { primary_key, .. } => Ok(rejected(
                ValidationReason::KeyWouldCollide,
                find_candidate(&candidates, &primary_key),
            )),
            RekeyOutcome::NotFound(primary_key) => Ok(rejected(
                ValidationReason::RecordRemovedDuringUpdate,
                find_candidate(&candidates, &primary_key),
            )),
        }
    }

    /// Same as `merge_identity`, refused outright when either identifier is excluded.
    pub fn update_list<S>(
        store: &S,
        old: &IdentityId,
        new: &IdentityId,
        exclude_list: &[IdentityId],
    ) -> Result<NaMergeOutcome, StorageError>
    where
        S: NonAssociationStore + ?Sized,
    {
        if exclude_list.contains(old) {
            return Ok(rejected(ValidationReason::OldIdentityInExcludeList, None));
        }
        if exclude_list.contains(new) {
            return Ok(rejected(ValidationReason::NewIdentityInExcludeList, None));
        }
        Self::merge_identity(store, old, new)
    }

    pub fn set_sequence<S>(
        store: &S,
        primary_key: &PrimaryKey,
        sequence: PairSequence,
    ) -> Result<SequenceOutcome<NonAssociationKey>, StorageError>
    where
        S: NonAssociationStore + ?Sized,
    {
        let Some(record) = store.find_by_primary(primary_key)? else {
            return Ok(SequenceOutcome::NotFound);
        };
        if record.secondary_key.sequence == sequence {
            return Ok(SequenceOutcome::Updated(record));
        }

        let update = SecondaryKeyUpdate {
            primary_key: record.primary_key.clone(),
            secondary_key: record.secondary_key.with_sequence(sequence),
        };
        match store.rekey(std::slice::from_ref(&update))? {
            RekeyOutcome::Applied(rows) => match rows.into_iter().next() {
                Some(row) => Ok(SequenceOutcome::Updated(row)),
                None => Ok(SequenceOutcome::NotFound),
            },
            RekeyOutcome::NotFound(_) => Ok(SequenceOutcome::NotFound),
            RekeyOutcome::SecondaryKeyTaken { .. } => {
                Ok(SequenceOutcome::Rejected(ValidationFailure {
                    reason: ValidationReason::KeyWouldCollide,
                    record: Some(record),
                }))
            }
        }
    }
}

fn find_candidate(
    candidates: &[NonAssociationRecord],
    primary_key: &PrimaryKey,
) -> Option<NonAssociationRecord> {
    candidates
        .iter()
        .find(|r| r.primary_key == *primary_key)
        .cloned()
}
