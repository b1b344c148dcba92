#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use idmap_contracts::mapping::{
    BatchLabel, IdentityId, MappingRecord, NaturalKey, NonAssociationKey, NonAssociationRecord,
    PrimaryKey,
};
use idmap_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use serde::{Deserialize, Serialize};

use crate::repo::{MappingStore, NonAssociationStore};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ContractViolation(ContractViolation),
    /// Infrastructure fault of the backing store. Never retried by the core.
    Unavailable { table: &'static str, reason: String },
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ContractViolation(v) => write!(f, "contract violation: {v}"),
            StorageError::Unavailable { table, reason } => {
                write!(f, "store unavailable ({table}): {reason}")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<K> {
    Inserted(MappingRecord<K>),
    SecondaryKeyTaken(MappingRecord<K>),
    PrimaryKeyTaken(MappingRecord<K>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryKeyUpdate<K> {
    pub primary_key: PrimaryKey,
    pub secondary_key: K,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RekeyOutcome<K> {
    /// Records after the rewrite, in request order.
    Applied(Vec<MappingRecord<K>>),
    NotFound(PrimaryKey),
    SecondaryKeyTaken {
        primary_key: PrimaryKey,
        existing: MappingRecord<K>,
    },
}

#[derive(Debug)]
struct MappingTable<K> {
    rows: BTreeMap<PrimaryKey, MappingRecord<K>>,
    // Unique natural-key index: secondary_key -> primary_key.
    by_secondary: BTreeMap<K, PrimaryKey>,
}

impl<K: NaturalKey> MappingTable<K> {
    fn insert(&mut self, record: MappingRecord<K>) -> InsertOutcome<K> {
        if let Some(owner) = self.by_secondary.get(&record.secondary_key) {
            if let Some(existing) = self.rows.get(owner) {
                return InsertOutcome::SecondaryKeyTaken(existing.clone());
            }
        }
        if let Some(existing) = self.rows.get(&record.primary_key) {
            return InsertOutcome::PrimaryKeyTaken(existing.clone());
        }
        self.by_secondary
            .insert(record.secondary_key.clone(), record.primary_key.clone());
        self.rows.insert(record.primary_key.clone(), record.clone());
        InsertOutcome::Inserted(record)
    }

    fn remove(&mut self, primary_key: &PrimaryKey) -> Option<MappingRecord<K>> {
        let removed = self.rows.remove(primary_key)?;
        self.by_secondary.remove(&removed.secondary_key);
        Some(removed)
    }

    fn rekey(&mut self, updates: &[SecondaryKeyUpdate<K>]) -> RekeyOutcome<K> {
        let mut next = Vec::with_capacity(updates.len());
        for u in updates {
            let Some(current) = self.rows.get(&u.primary_key) else {
                return RekeyOutcome::NotFound(u.primary_key.clone());
            };
            next.push(current.with_secondary_key(u.secondary_key.clone()));
        }

        // Keys released by rows in this batch may be claimed by other rows in the same batch.
        let moving: BTreeSet<&PrimaryKey> = updates.iter().map(|u| &u.primary_key).collect();
        let mut claimed: BTreeMap<&K, &PrimaryKey> = BTreeMap::new();
        for row in &next {
            if let Some(owner) = self.by_secondary.get(&row.secondary_key) {
                if !moving.contains(owner) {
                    if let Some(existing) = self.rows.get(owner) {
                        return RekeyOutcome::SecondaryKeyTaken {
                            primary_key: row.primary_key.clone(),
                            existing: existing.clone(),
                        };
                    }
                }
            }
            if let Some(other) = claimed.insert(&row.secondary_key, &row.primary_key) {
                if let Some(existing) = self.rows.get(other) {
                    return RekeyOutcome::SecondaryKeyTaken {
                        primary_key: row.primary_key.clone(),
                        existing: existing.clone(),
                    };
                }
            }
        }

        for row in &next {
            if let Some(current) = self.rows.get(&row.primary_key) {
                self.by_secondary.remove(&current.secondary_key);
            }
        }
        for row in &next {
            self.by_secondary
                .insert(row.secondary_key.clone(), row.primary_key.clone());
            self.rows.insert(row.primary_key.clone(), row.clone());
        }
        RekeyOutcome::Applied(next)
    }
}

/// In-memory mapping table with a unique primary index and a unique natural-key index.
///
/// All methods take `&self`; one table lock stands in for the database's own
/// uniqueness enforcement, so concurrent callers observe exactly one winner per key.
#[derive(Debug)]
pub struct MappingTableStore<K> {
    table: &'static str,
    inner: Mutex<MappingTable<K>>,
}

impl<K: NaturalKey> MappingTableStore<K> {
    pub fn new_in_memory(table: &'static str) -> Self {
        Self {
            table,
            inner: Mutex::new(MappingTable {
                rows: BTreeMap::new(),
                by_secondary: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MappingTable<K>>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Unavailable {
            table: self.table,
            reason: "table lock poisoned".to_string(),
        })
    }

    pub fn row_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.rows.len())
    }

    /// Snapshot of every row in ascending primary-key order.
    pub fn rows(&self) -> Result<Vec<MappingRecord<K>>, StorageError> {
        Ok(self.lock()?.rows.values().cloned().collect())
    }

    pub(crate) fn remove_row(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        Ok(self.lock()?.remove(primary_key))
    }
}

impl<K: NaturalKey> MappingStore<K> for MappingTableStore<K> {
    fn table_name(&self) -> &'static str {
        self.table
    }

    fn insert(&self, record: MappingRecord<K>) -> Result<InsertOutcome<K>, StorageError> {
        record.validate()?;
        Ok(self.lock()?.insert(record))
    }

    fn find_by_primary(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        Ok(self.lock()?.rows.get(primary_key).cloned())
    }

    fn find_by_secondary(&self, secondary_key: &K) -> Result<Option<MappingRecord<K>>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .by_secondary
            .get(secondary_key)
            .and_then(|pk| inner.rows.get(pk))
            .cloned())
    }

    fn delete(&self, primary_key: &PrimaryKey) -> Result<bool, StorageError> {
        Ok(self.remove_row(primary_key)?.is_some())
    }

    fn label_page(
        &self,
        label: &BatchLabel,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<MappingRecord<K>>, StorageError> {
        let inner = self.lock()?;
        let lower = match after {
            Some(a) => Bound::Excluded(a),
            None => Bound::Unbounded,
        };
        let page = inner
            .rows
            .range::<PrimaryKey, _>((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| r.batch_label.as_ref() == Some(label))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    fn max_created_at(&self) -> Result<Option<MonotonicTimeNs>, StorageError> {
        Ok(self.lock()?.rows.values().map(|r| r.created_at).max())
    }

    fn rekey(&self, updates: &[SecondaryKeyUpdate<K>]) -> Result<RekeyOutcome<K>, StorageError> {
        let mut seen = BTreeSet::new();
        for u in updates {
            u.secondary_key.validate()?;
            if !seen.insert(&u.primary_key) {
                return Err(StorageError::ContractViolation(
                    ContractViolation::InvalidValue {
                        field: "secondary_key_update.primary_key",
                        reason: "must be unique within one rekey batch",
                    },
                ));
            }
        }
        Ok(self.lock()?.rekey(updates))
    }
}

impl NonAssociationStore for MappingTableStore<NonAssociationKey> {
    fn find_by_identity(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .rows
            .values()
            .filter(|r| r.secondary_key.references(identity))
            .cloned()
            .collect())
    }
}
