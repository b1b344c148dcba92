#![forbid(unsafe_code)]

use std::marker::PhantomData;

use idmap_contracts::mapping::{
    BatchLabel, CommonPartyPair, CreateOutcome, DeleteOutcome, IdentityId, LookupOutcome,
    MappingRecord, MappingRecordInput, MergeOutcome, NaturalKey, NonAssociationKey,
    NonAssociationRecord, PairSequence, PrimaryKey, SequenceOutcome,
};
use idmap_contracts::ContractViolation;
use idmap_storage::audit::{
    MappingAuditEventInput, MappingAuditEventType, MappingAuditLedger, AUDIT_TABLE,
};
use idmap_storage::repo::{LabelScan, MappingStore, NonAssociationStore};
use idmap_storage::table::StorageError;

use crate::clock::MappingClock;
use crate::common_party::CommonPartyFinder;
use crate::config::{MappingServiceConfig, SCAN_PAGE_SIZE_MAX};
use crate::create::DuplicateSafeCreator;
use crate::merge::IdentityMergeEngine;

/// Runtime facade over one mapping table.
///
/// Owns the injected store and clock, assigns `created_at` on create, and records one
/// audit event for every state-changing or rejected operation. Lookups are not audited.
///
/// The audit event is appended after the store call returns. An `Err` whose table is
/// `AUDIT_TABLE` therefore means the store outcome already stands and only its audit
/// record is missing.
#[derive(Debug)]
pub struct MappingService<K, S, C> {
    config: MappingServiceConfig,
    store: S,
    clock: C,
    audit: MappingAuditLedger,
    _key: PhantomData<fn() -> K>,
}

impl<K, S, C> MappingService<K, S, C>
where
    K: NaturalKey,
    S: MappingStore<K>,
    C: MappingClock,
{
    pub fn new(config: MappingServiceConfig, store: S, clock: C) -> Result<Self, StorageError> {
        Self::with_audit_ledger(config, store, clock, MappingAuditLedger::new_in_memory())
    }

    /// Also moves `clock` past the newest stored `created_at`, so records created by this
    /// service always sort after those already persisted.
    pub fn with_audit_ledger(
        config: MappingServiceConfig,
        store: S,
        clock: C,
        audit: MappingAuditLedger,
    ) -> Result<Self, StorageError> {
        if config.scan_page_size == 0 || config.scan_page_size > SCAN_PAGE_SIZE_MAX {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_service_config.scan_page_size",
                reason: "must be within 1..=10000",
            }
            .into());
        }
        if let Some(newest) = store.max_created_at()? {
            clock.advance_past(newest);
        }
        Ok(Self {
            config,
            store,
            clock,
            audit,
            _key: PhantomData,
        })
    }

    pub fn config(&self) -> &MappingServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn audit(&self) -> &MappingAuditLedger {
        &self.audit
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn into_parts(self) -> (S, MappingAuditLedger) {
        (self.store, self.audit)
    }

    pub fn create(&self, input: MappingRecordInput<K>) -> Result<CreateOutcome<K>, StorageError> {
        let now = self.clock.now();
        let out = DuplicateSafeCreator::create(&self.store, input, now)?;
        let (event_type, primary_key, detail) = match &out {
            CreateOutcome::Created {
                record,
                was_new: true,
            } => (
                MappingAuditEventType::CreateCommitted,
                record.primary_key.clone(),
                format!("key={}", record.secondary_key.describe()),
            ),
            CreateOutcome::Created {
                record,
                was_new: false,
            } => (
                MappingAuditEventType::CreateResubmitted,
                record.primary_key.clone(),
                format!("key={}", record.secondary_key.describe()),
            ),
            CreateOutcome::Conflict {
                existing,
                duplicate,
            } => (
                MappingAuditEventType::CreateConflict,
                duplicate.primary_key.clone(),
                match existing {
                    Some(e) => format!(
                        "key={} existing_primary={}",
                        duplicate.secondary_key.describe(),
                        e.primary_key
                    ),
                    None => format!("key={} existing=unresolved", duplicate.secondary_key.describe()),
                },
            ),
        };
        self.emit(event_type, Some(primary_key), detail)?;
        Ok(out)
    }

    pub fn get_by_primary(&self, primary_key: &PrimaryKey) -> Result<LookupOutcome<K>, StorageError> {
        Ok(self.store.find_by_primary(primary_key)?.into())
    }

    pub fn get_by_secondary(&self, secondary_key: &K) -> Result<LookupOutcome<K>, StorageError> {
        Ok(self.store.find_by_secondary(secondary_key)?.into())
    }

    pub fn delete(&self, primary_key: &PrimaryKey) -> Result<DeleteOutcome, StorageError> {
        let (out, event_type) = if self.store.delete(primary_key)? {
            (DeleteOutcome::Deleted, MappingAuditEventType::Deleted)
        } else {
            (DeleteOutcome::AlreadyAbsent, MappingAuditEventType::DeleteAbsent)
        };
        self.emit(event_type, Some(primary_key.clone()), String::new())?;
        Ok(out)
    }

    /// Lazy walk over one batch, `config.scan_page_size` rows per store round trip.
    pub fn scan_batch(&self, label: &BatchLabel) -> LabelScan<'_, K, S> {
        self.store.scan_by_label(label, self.config.scan_page_size)
    }

    pub fn records_in_batch(&self, label: &BatchLabel) -> Result<Vec<MappingRecord<K>>, StorageError> {
        self.scan_batch(label).collect()
    }

    /// Most recent migration-created record of the batch; ties on `created_at` go to the
    /// greater primary key.
    pub fn latest_migrated(&self, label: &BatchLabel) -> Result<LookupOutcome<K>, StorageError> {
        let mut latest: Option<MappingRecord<K>> = None;
        for row in self.scan_batch(label) {
            let row = row?;
            if !row.mapping_kind.is_migrated() {
                continue;
            }
            let newer = match &latest {
                Some(cur) => {
                    (row.created_at, &row.primary_key) > (cur.created_at, &cur.primary_key)
                }
                None => true,
            };
            if newer {
                latest = Some(row);
            }
        }
        Ok(latest.into())
    }

    fn emit(
        &self,
        event_type: MappingAuditEventType,
        primary_key: Option<PrimaryKey>,
        detail: String,
    ) -> Result<(), StorageError> {
        MappingAuditEventInput::v1(
            self.clock.now(),
            self.store.table_name(),
            event_type,
            primary_key,
            detail,
        )
        .map_err(StorageError::from)
        .and_then(|input| self.audit.append(input))
        .map(|_| ())
        .map_err(|err| StorageError::Unavailable {
            table: AUDIT_TABLE,
            reason: format!(
                "{event_type:?} already applied to the store; audit append failed: {err}"
            ),
        })
    }
}

impl<S, C> MappingService<NonAssociationKey, S, C>
where
    S: NonAssociationStore,
    C: MappingClock,
{
    pub fn merge_identity(
        &self,
        old: &IdentityId,
        new: &IdentityId,
    ) -> Result<MergeOutcome<NonAssociationKey>, StorageError> {
        let out = IdentityMergeEngine::merge_identity(&self.store, old, new)?;
        self.emit_merge(&out, format!("old={old} new={new}"))?;
        Ok(out)
    }

    pub fn update_list(
        &self,
        old: &IdentityId,
        new: &IdentityId,
        exclude_list: &[IdentityId],
    ) -> Result<MergeOutcome<NonAssociationKey>, StorageError> {
        let out = IdentityMergeEngine::update_list(&self.store, old, new, exclude_list)?;
        self.emit_merge(
            &out,
            format!("old={old} new={new} excluded={}", exclude_list.len()),
        )?;
        Ok(out)
    }

    pub fn set_sequence(
        &self,
        primary_key: &PrimaryKey,
        sequence: PairSequence,
    ) -> Result<SequenceOutcome<NonAssociationKey>, StorageError> {
        let out = IdentityMergeEngine::set_sequence(&self.store, primary_key, sequence)?;
        let (event_type, detail) = match &out {
            SequenceOutcome::Updated(_) => (
                MappingAuditEventType::SequenceUpdated,
                format!("sequence={}", sequence.0),
            ),
            SequenceOutcome::NotFound => (
                MappingAuditEventType::SequenceRejected,
                "record not found".to_string(),
            ),
            SequenceOutcome::Rejected(failure) => (
                MappingAuditEventType::SequenceRejected,
                failure.reason.message().to_string(),
            ),
        };
        self.emit(event_type, Some(primary_key.clone()), detail)?;
        Ok(out)
    }

    pub fn find_common(
        &self,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError> {
        CommonPartyFinder::find_common(&self.store, a, b)
    }

    pub fn find_common_pairs(
        &self,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Vec<CommonPartyPair>, StorageError> {
        CommonPartyFinder::find_common_pairs(&self.store, a, b)
    }

    fn emit_merge(
        &self,
        out: &MergeOutcome<NonAssociationKey>,
        detail: String,
    ) -> Result<(), StorageError> {
        match out {
            MergeOutcome::Updated { count, .. } => self.emit(
                MappingAuditEventType::MergeApplied,
                None,
                format!("{detail} count={count}"),
            ),
            MergeOutcome::Rejected(failure) => self.emit(
                MappingAuditEventType::MergeRejected,
                failure.record.as_ref().map(|r| r.primary_key.clone()),
                format!("{detail} reason={}", failure.reason.message()),
            ),
        }
    }
}
