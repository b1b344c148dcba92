#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use idmap_contracts::mapping::{
    BatchLabel, IdentityId, MappingRecord, NaturalKey, NonAssociationKey, NonAssociationRecord,
    PrimaryKey,
};
use idmap_contracts::MonotonicTimeNs;

use crate::table::{InsertOutcome, RekeyOutcome, SecondaryKeyUpdate, StorageError};

/// Keyed record store for one mapping table.
///
/// Both uniqueness constraints (primary key, natural key) are enforced by the store and
/// reported through `InsertOutcome`; backend faults surface as `StorageError::Unavailable`.
pub trait MappingStore<K: NaturalKey> {
    fn table_name(&self) -> &'static str;

    fn insert(&self, record: MappingRecord<K>) -> Result<InsertOutcome<K>, StorageError>;

    fn find_by_primary(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Option<MappingRecord<K>>, StorageError>;

    fn find_by_secondary(&self, secondary_key: &K)
        -> Result<Option<MappingRecord<K>>, StorageError>;

    /// Returns whether a row was removed. Deleting an absent key is not an error.
    fn delete(&self, primary_key: &PrimaryKey) -> Result<bool, StorageError>;

    /// Up to `limit` rows of `label` with a primary key greater than `after`,
    /// ascending by primary key.
    fn label_page(
        &self,
        label: &BatchLabel,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<MappingRecord<K>>, StorageError>;

    /// Highest `created_at` among stored rows; `None` for an empty table.
    fn max_created_at(&self) -> Result<Option<MonotonicTimeNs>, StorageError>;

    /// Replaces the natural key of several rows as one unit: either every update
    /// lands or none does.
    fn rekey(&self, updates: &[SecondaryKeyUpdate<K>]) -> Result<RekeyOutcome<K>, StorageError>;

    fn scan_by_label(&self, label: &BatchLabel, page_size: usize) -> LabelScan<'_, K, Self>
    where
        Self: Sized,
    {
        LabelScan::new(self, label.clone(), page_size)
    }
}

/// Lookup of non-association rows by either identity slot.
pub trait NonAssociationStore: MappingStore<NonAssociationKey> {
    /// Every row holding `identity` in either slot, ascending by primary key.
    fn find_by_identity(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError>;
}

/// Lazy, page-at-a-time walk over one batch label. `restart` rewinds to the first row.
pub struct LabelScan<'a, K, S: ?Sized> {
    store: &'a S,
    label: BatchLabel,
    page_size: usize,
    cursor: Option<PrimaryKey>,
    buffered: VecDeque<MappingRecord<K>>,
    exhausted: bool,
}

impl<'a, K: NaturalKey, S: MappingStore<K> + ?Sized> LabelScan<'a, K, S> {
    pub fn new(store: &'a S, label: BatchLabel, page_size: usize) -> Self {
        Self {
            store,
            label,
            page_size: page_size.max(1),
            cursor: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn label(&self) -> &BatchLabel {
        &self.label
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffered.clear();
        self.exhausted = false;
    }
}

impl<K: NaturalKey, S: MappingStore<K> + ?Sized> Iterator for LabelScan<'_, K, S> {
    type Item = Result<MappingRecord<K>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffered.pop_front() {
            return Some(Ok(row));
        }
        if self.exhausted {
            return None;
        }
        match self
            .store
            .label_page(&self.label, self.cursor.as_ref(), self.page_size)
        {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                if let Some(last) = page.last() {
                    self.cursor = Some(last.primary_key.clone());
                }
                self.buffered.extend(page);
                self.buffered.pop_front().map(Ok)
            }
            Err(err) => {
                self.exhausted = true;
                Some(Err(err))
            }
        }
    }
}

impl<K: NaturalKey, S: MappingStore<K> + ?Sized> MappingStore<K> for Arc<S> {
    fn table_name(&self) -> &'static str {
        (**self).table_name()
    }

    fn insert(&self, record: MappingRecord<K>) -> Result<InsertOutcome<K>, StorageError> {
        (**self).insert(record)
    }

    fn find_by_primary(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        (**self).find_by_primary(primary_key)
    }

    fn find_by_secondary(
        &self,
        secondary_key: &K,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        (**self).find_by_secondary(secondary_key)
    }

    fn delete(&self, primary_key: &PrimaryKey) -> Result<bool, StorageError> {
        (**self).delete(primary_key)
    }

    fn label_page(
        &self,
        label: &BatchLabel,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<MappingRecord<K>>, StorageError> {
        (**self).label_page(label, after, limit)
    }

    fn max_created_at(&self) -> Result<Option<MonotonicTimeNs>, StorageError> {
        (**self).max_created_at()
    }

    fn rekey(&self, updates: &[SecondaryKeyUpdate<K>]) -> Result<RekeyOutcome<K>, StorageError> {
        (**self).rekey(updates)
    }
}

impl<S: NonAssociationStore + ?Sized> NonAssociationStore for Arc<S> {
    fn find_by_identity(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError> {
        (**self).find_by_identity(identity)
    }
}
