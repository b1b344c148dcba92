#![forbid(unsafe_code)]

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use idmap_contracts::mapping::{
    BatchLabel, IdentityId, MappingRecord, NaturalKey, NonAssociationKey, NonAssociationRecord,
    PrimaryKey,
};
use idmap_contracts::MonotonicTimeNs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::repo::{MappingStore, NonAssociationStore};
use crate::table::{
    InsertOutcome, MappingTableStore, RekeyOutcome, SecondaryKeyUpdate, StorageError,
};

const JOURNAL_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalOp<K> {
    Insert(MappingRecord<K>),
    Delete(PrimaryKey),
    Rekey(Vec<SecondaryKeyUpdate<K>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry<K> {
    schema_version: u8,
    op: JournalOp<K>,
    op_sha256: String,
}

/// Append-only journal handle. `File` in production; tests swap in handles that fail.
pub(crate) trait JournalFile: Write + fmt::Debug + Send {
    fn byte_len(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl JournalFile for File {
    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Writes `line` plus a newline and syncs. On any failure the file is cut back to its
/// previous length, so a failed append never leaves a partial or replayable line.
pub(crate) fn append_line(file: &mut dyn JournalFile, line: &[u8]) -> Result<(), String> {
    let start = file.byte_len().map_err(|err| format!("failed to stat journal: {err}"))?;
    let written = file
        .write_all(line)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.flush())
        .and_then(|_| file.sync());
    match written {
        Ok(()) => Ok(()),
        Err(err) => match file.truncate_to(start) {
            Ok(()) => Err(format!("append failed: {err}")),
            Err(rollback) => Err(format!(
                "append failed: {err}; truncating back to {start} bytes also failed: {rollback}"
            )),
        },
    }
}

pub(crate) fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().append(true).create(true).open(path)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Durable mapping table: an in-memory table rebuilt from a JSON-lines journal on `open`.
///
/// Each acknowledged mutation has been appended and synced to the journal. Mutations are
/// serialized on the journal handle; reads go straight to the in-memory table.
#[derive(Debug)]
pub struct JournaledMappingStore<K> {
    path: PathBuf,
    table: MappingTableStore<K>,
    journal: Mutex<Box<dyn JournalFile>>,
}

impl<K: NaturalKey> JournaledMappingStore<K> {
    pub fn open(path: impl AsRef<Path>, table: &'static str) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| StorageError::Unavailable { table, reason };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    unavailable(format!(
                        "failed to create journal directory '{}': {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }

        let store = MappingTableStore::new_in_memory(table);
        if path.exists() {
            replay_journal(&path, &store)?;
        }

        let journal = open_for_append(&path).map_err(|err| {
                unavailable(format!(
                    "failed opening journal '{}' for append: {}",
                    path.display(),
                    err
                ))
            })?;

        Ok(Self {
            path,
            table: store,
            journal: Mutex::new(Box::new(journal)),
        })
    }

    /// Flushes the journal and releases the handle.
    pub fn close(self) -> Result<(), StorageError> {
        let table = self.table.table_name();
        let mut file = self
            .journal
            .into_inner()
            .map_err(|_| StorageError::Unavailable {
                table,
                reason: "journal lock poisoned".to_string(),
            })?;
        file.sync().map_err(|err| StorageError::Unavailable {
            table,
            reason: format!("failed syncing journal '{}': {}", self.path.display(), err),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> Result<usize, StorageError> {
        self.table.row_count()
    }

    fn lock_journal(&self) -> Result<MutexGuard<'_, Box<dyn JournalFile>>, StorageError> {
        self.journal.lock().map_err(|_| StorageError::Unavailable {
            table: self.table.table_name(),
            reason: "journal lock poisoned".to_string(),
        })
    }

    fn append(&self, file: &mut dyn JournalFile, op: JournalOp<K>) -> Result<(), StorageError> {
        let table = self.table.table_name();
        let op_json = serde_json::to_vec(&op).map_err(|err| StorageError::Unavailable {
            table,
            reason: format!("failed to encode journal op: {err}"),
        })?;
        let entry = JournalEntry {
            schema_version: JOURNAL_SCHEMA_VERSION,
            op_sha256: sha256_hex(&op_json),
            op,
        };
        let line = serde_json::to_string(&entry).map_err(|err| StorageError::Unavailable {
            table,
            reason: format!("failed to encode journal entry: {err}"),
        })?;
        append_line(file, line.as_bytes()).map_err(|reason| StorageError::Unavailable {
            table,
            reason: format!("failed writing journal '{}': {}", self.path.display(), reason),
        })
    }
}

fn replay_journal<K: NaturalKey>(
    path: &Path,
    store: &MappingTableStore<K>,
) -> Result<(), StorageError> {
    let table = store.table_name();
    let unavailable = |reason: String| StorageError::Unavailable { table, reason };

    let file = File::open(path).map_err(|err| {
        unavailable(format!(
            "failed to open journal '{}': {}",
            path.display(),
            err
        ))
    })?;
    for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
        let line_no = line_no + 1;
        let line = line_result.map_err(|err| {
            unavailable(format!(
                "failed reading journal '{}' at line {}: {}",
                path.display(),
                line_no,
                err
            ))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry<K> = serde_json::from_str(&line).map_err(|err| {
            unavailable(format!(
                "failed parsing journal '{}' at line {}: {}",
                path.display(),
                line_no,
                err
            ))
        })?;
        if entry.schema_version != JOURNAL_SCHEMA_VERSION {
            return Err(unavailable(format!(
                "unsupported journal schema_version={} at line {}",
                entry.schema_version, line_no
            )));
        }
        let op_json = serde_json::to_vec(&entry.op)
            .map_err(|err| unavailable(format!("failed to re-encode line {line_no}: {err}")))?;
        if sha256_hex(&op_json) != entry.op_sha256 {
            return Err(unavailable(format!(
                "journal digest mismatch at line {line_no}"
            )));
        }

        let applied = match entry.op {
            JournalOp::Insert(record) => {
                matches!(store.insert(record)?, InsertOutcome::Inserted(_))
            }
            JournalOp::Delete(primary_key) => {
                store.delete(&primary_key)?;
                true
            }
            JournalOp::Rekey(updates) => {
                matches!(store.rekey(&updates)?, RekeyOutcome::Applied(_))
            }
        };
        if !applied {
            return Err(unavailable(format!(
                "journal replay rejected by table constraints at line {line_no}"
            )));
        }
    }
    Ok(())
}

impl<K: NaturalKey> MappingStore<K> for JournaledMappingStore<K> {
    fn table_name(&self) -> &'static str {
        self.table.table_name()
    }

    fn insert(&self, record: MappingRecord<K>) -> Result<InsertOutcome<K>, StorageError> {
        let mut file = self.lock_journal()?;
        let out = self.table.insert(record)?;
        if let InsertOutcome::Inserted(row) = &out {
            if let Err(err) = self.append(&mut **file, JournalOp::Insert(row.clone())) {
                self.table.remove_row(&row.primary_key)?;
                return Err(err);
            }
        }
        Ok(out)
    }

    fn find_by_primary(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        self.table.find_by_primary(primary_key)
    }

    fn find_by_secondary(
        &self,
        secondary_key: &K,
    ) -> Result<Option<MappingRecord<K>>, StorageError> {
        self.table.find_by_secondary(secondary_key)
    }

    fn delete(&self, primary_key: &PrimaryKey) -> Result<bool, StorageError> {
        let mut file = self.lock_journal()?;
        let Some(removed) = self.table.remove_row(primary_key)? else {
            return Ok(false);
        };
        if let Err(err) = self.append(&mut **file, JournalOp::Delete(primary_key.clone())) {
            self.table.insert(removed)?;
            return Err(err);
        }
        Ok(true)
    }

    fn label_page(
        &self,
        label: &BatchLabel,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<MappingRecord<K>>, StorageError> {
        self.table.label_page(label, after, limit)
    }

    fn max_created_at(&self) -> Result<Option<MonotonicTimeNs>, StorageError> {
        self.table.max_created_at()
    }

    fn rekey(&self, updates: &[SecondaryKeyUpdate<K>]) -> Result<RekeyOutcome<K>, StorageError> {
        let mut file = self.lock_journal()?;
        // Mutations hold the journal lock, so these rows cannot move underneath us.
        let mut previous = Vec::with_capacity(updates.len());
        for u in updates {
            if let Some(row) = self.table.find_by_primary(&u.primary_key)? {
                previous.push(SecondaryKeyUpdate {
                    primary_key: row.primary_key,
                    secondary_key: row.secondary_key,
                });
            }
        }
        let out = self.table.rekey(updates)?;
        if matches!(out, RekeyOutcome::Applied(_)) {
            if let Err(err) = self.append(&mut **file, JournalOp::Rekey(updates.to_vec())) {
                self.table.rekey(&previous)?;
                return Err(err);
            }
        }
        Ok(out)
    }
}

impl NonAssociationStore for JournaledMappingStore<NonAssociationKey> {
    fn find_by_identity(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError> {
        self.table.find_by_identity(identity)
    }
}
