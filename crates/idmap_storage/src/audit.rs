#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use idmap_contracts::mapping::PrimaryKey;
use idmap_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use serde::{Deserialize, Serialize};

use crate::journal::{append_line, open_for_append, JournalFile};
use crate::table::StorageError;

pub const AUDIT_TABLE: &str = "mapping_audit_events";

const AUDIT_JOURNAL_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AuditJournalLine {
    schema_version: u8,
    event: MappingAuditEvent,
}

fn unavailable(reason: String) -> StorageError {
    StorageError::Unavailable {
        table: AUDIT_TABLE,
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingAuditEventType {
    CreateCommitted,
    CreateResubmitted,
    CreateConflict,
    Deleted,
    DeleteAbsent,
    MergeApplied,
    MergeRejected,
    SequenceUpdated,
    SequenceRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingAuditEventInput {
    pub created_at: MonotonicTimeNs,
    pub table: String,
    pub event_type: MappingAuditEventType,
    pub primary_key: Option<PrimaryKey>,
    pub detail: String,
}

impl MappingAuditEventInput {
    pub fn v1(
        created_at: MonotonicTimeNs,
        table: &str,
        event_type: MappingAuditEventType,
        primary_key: Option<PrimaryKey>,
        detail: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            created_at,
            table: table.to_string(),
            event_type,
            primary_key,
            detail: detail.into(),
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for MappingAuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_audit_event_input.created_at",
                reason: "must be > 0",
            });
        }
        if self.table.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_audit_event_input.table",
                reason: "must not be empty",
            });
        }
        if self.detail.len() > 1024 {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_audit_event_input.detail",
                reason: "exceeds max length",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingAuditEvent {
    pub event_id: u64,
    pub created_at: MonotonicTimeNs,
    pub table: String,
    pub event_type: MappingAuditEventType,
    pub primary_key: Option<PrimaryKey>,
    pub detail: String,
}

#[derive(Debug)]
struct AuditRows {
    events: Vec<MappingAuditEvent>,
    next_event_id: u64,
    sink: Option<Box<dyn JournalFile>>,
}

/// Append-only operation history for mapping tables.
///
/// `new_in_memory` keeps events for the life of the process. `open` backs the ledger
/// with a JSON-lines file: past events are loaded on open and every append is synced
/// before it is acknowledged.
#[derive(Debug)]
pub struct MappingAuditLedger {
    path: Option<PathBuf>,
    inner: Mutex<AuditRows>,
}

impl Default for MappingAuditLedger {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl MappingAuditLedger {
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(AuditRows {
                events: Vec::new(),
                next_event_id: 1,
                sink: None,
            }),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    unavailable(format!(
                        "failed to create audit directory '{}': {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }

        let events = if path.exists() {
            load_events(&path)?
        } else {
            Vec::new()
        };
        let next_event_id = events
            .last()
            .map_or(1, |e| e.event_id.saturating_add(1));
        let file = open_for_append(&path).map_err(|err| {
            unavailable(format!(
                "failed opening audit journal '{}' for append: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(AuditRows {
                events,
                next_event_id,
                sink: Some(Box::new(file)),
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flushes the backing file, if any.
    pub fn close(self) -> Result<(), StorageError> {
        let rows = self
            .inner
            .into_inner()
            .map_err(|_| unavailable("audit lock poisoned".to_string()))?;
        match rows.sink {
            Some(mut file) => file
                .sync()
                .map_err(|err| unavailable(format!("failed syncing audit journal: {err}"))),
            None => Ok(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AuditRows>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| unavailable("audit lock poisoned".to_string()))
    }

    pub fn append(&self, input: MappingAuditEventInput) -> Result<u64, StorageError> {
        input.validate()?;
        let mut rows = self.lock()?;
        let event = MappingAuditEvent {
            event_id: rows.next_event_id,
            created_at: input.created_at,
            table: input.table,
            event_type: input.event_type,
            primary_key: input.primary_key,
            detail: input.detail,
        };
        if let Some(file) = rows.sink.as_mut() {
            let line = serde_json::to_string(&AuditJournalLine {
                schema_version: AUDIT_JOURNAL_SCHEMA_VERSION,
                event: event.clone(),
            })
            .map_err(|err| unavailable(format!("failed to encode audit event: {err}")))?;
            append_line(&mut **file, line.as_bytes())
                .map_err(|reason| unavailable(format!("failed writing audit journal: {reason}")))?;
        }
        let event_id = event.event_id;
        rows.next_event_id = event_id.saturating_add(1);
        rows.events.push(event);
        Ok(event_id)
    }

    pub fn events(&self) -> Result<Vec<MappingAuditEvent>, StorageError> {
        Ok(self.lock()?.events.clone())
    }

    pub fn events_for_primary(
        &self,
        primary_key: &PrimaryKey,
    ) -> Result<Vec<MappingAuditEvent>, StorageError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.primary_key.as_ref() == Some(primary_key))
            .cloned()
            .collect())
    }
}

fn load_events(path: &Path) -> Result<Vec<MappingAuditEvent>, StorageError> {
    let file = File::open(path).map_err(|err| {
        unavailable(format!(
            "failed to open audit journal '{}': {}",
            path.display(),
            err
        ))
    })?;
    let mut events: Vec<MappingAuditEvent> = Vec::new();
    for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
        let line_no = line_no + 1;
        let line = line_result
            .map_err(|err| unavailable(format!("failed reading audit line {line_no}: {err}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditJournalLine = serde_json::from_str(&line)
            .map_err(|err| unavailable(format!("failed parsing audit line {line_no}: {err}")))?;
        if entry.schema_version != AUDIT_JOURNAL_SCHEMA_VERSION {
            return Err(unavailable(format!(
                "unsupported audit schema_version={} at line {}",
                entry.schema_version, line_no
            )));
        }
        if let Some(prev) = events.last() {
            if entry.event.event_id <= prev.event_id {
                return Err(unavailable(format!(
                    "audit event_id not increasing at line {line_no}"
                )));
            }
        }
        events.push(entry.event);
    }
    Ok(events)
}
