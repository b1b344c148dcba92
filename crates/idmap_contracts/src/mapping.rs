#![forbid(unsafe_code)]

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const MAPPING_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

const MAX_ID_LEN: usize = 128;
const MAX_LEGACY_KEY_FIELDS: usize = 3;

fn validate_text(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    Ok(())
}

fn validate_numeric(field: &'static str, value: u64) -> Result<(), ContractViolation> {
    if value == 0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be > 0",
        });
    }
    Ok(())
}

/// New-service identifier of a correlation record.
///
/// Numeric keys order before text keys; within a variant the natural order applies,
/// which is also the insertion order for sequence-issued ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    Numeric(u64),
    Text(String),
}

impl PrimaryKey {
    pub fn numeric(v: u64) -> Result<Self, ContractViolation> {
        validate_numeric("primary_key", v)?;
        Ok(Self::Numeric(v))
    }

    pub fn text(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_text("primary_key", &v)?;
        Ok(Self::Text(v))
    }

    /// All-digit input becomes a numeric key, anything else a text key.
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = raw.parse::<u64>() {
                return Self::numeric(v);
            }
        }
        Self::text(raw)
    }
}

impl Validate for PrimaryKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            PrimaryKey::Numeric(v) => validate_numeric("primary_key", *v),
            PrimaryKey::Text(v) => validate_text("primary_key", v),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Numeric(v) => write!(f, "{v}"),
            PrimaryKey::Text(v) => f.write_str(v),
        }
    }
}

/// Legacy natural key of a mapping table. Implemented by every key shape a table can use.
pub trait NaturalKey:
    Validate + Clone + fmt::Debug + Ord + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LegacyKeyField {
    Numeric(u64),
    Text(String),
}

impl LegacyKeyField {
    fn validate_field(&self) -> Result<(), ContractViolation> {
        match self {
            LegacyKeyField::Numeric(v) => validate_numeric("legacy_key.field", *v),
            LegacyKeyField::Text(v) => validate_text("legacy_key.field", v),
        }
    }
}

impl fmt::Display for LegacyKeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyKeyField::Numeric(v) => write!(f, "{v}"),
            LegacyKeyField::Text(v) => f.write_str(v),
        }
    }
}

/// Legacy key of one to three fields: a single legacy id or a small composite.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LegacyKey(Vec<LegacyKeyField>);

impl LegacyKey {
    pub fn single(field: LegacyKeyField) -> Result<Self, ContractViolation> {
        Self::composite(vec![field])
    }

    pub fn composite(fields: Vec<LegacyKeyField>) -> Result<Self, ContractViolation> {
        let k = Self(fields);
        k.validate()?;
        Ok(k)
    }

    pub fn fields(&self) -> &[LegacyKeyField] {
        &self.0
    }
}

impl Validate for LegacyKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() || self.0.len() > MAX_LEGACY_KEY_FIELDS {
            return Err(ContractViolation::InvalidValue {
                field: "legacy_key",
                reason: "must have between 1 and 3 fields",
            });
        }
        for field in &self.0 {
            field.validate_field()?;
        }
        Ok(())
    }
}

impl NaturalKey for LegacyKey {
    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        format!("({})", parts.join(", "))
    }
}

/// External identifier held in one slot of a non-association key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_text("identity_id", &v)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for IdentityId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("identity_id", &self.0)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairSequence(pub u32);

/// `(first_identity, second_identity, sequence)`; the two identities never match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NonAssociationKey {
    pub first_identity: IdentityId,
    pub second_identity: IdentityId,
    pub sequence: PairSequence,
}

impl NonAssociationKey {
    pub fn new(
        first_identity: IdentityId,
        second_identity: IdentityId,
        sequence: PairSequence,
    ) -> Result<Self, ContractViolation> {
        let k = Self {
            first_identity,
            second_identity,
            sequence,
        };
        k.validate()?;
        Ok(k)
    }

    pub fn references(&self, identity: &IdentityId) -> bool {
        self.first_identity == *identity || self.second_identity == *identity
    }

    /// The identity paired with `identity`, if `identity` sits in either slot.
    pub fn counterpart(&self, identity: &IdentityId) -> Option<&IdentityId> {
        if self.first_identity == *identity {
            Some(&self.second_identity)
        } else if self.second_identity == *identity {
            Some(&self.first_identity)
        } else {
            None
        }
    }

    /// Substitutes `new` into every slot holding `old`. The result is not validated;
    /// callers decide what a self-paired outcome means.
    pub fn with_identity_replaced(&self, old: &IdentityId, new: &IdentityId) -> Self {
        let swap = |slot: &IdentityId| {
            if slot == old {
                new.clone()
            } else {
                slot.clone()
            }
        };
        Self {
            first_identity: swap(&self.first_identity),
            second_identity: swap(&self.second_identity),
            sequence: self.sequence,
        }
    }

    pub fn with_sequence(&self, sequence: PairSequence) -> Self {
        Self {
            first_identity: self.first_identity.clone(),
            second_identity: self.second_identity.clone(),
            sequence,
        }
    }

    pub fn is_self_paired(&self) -> bool {
        self.first_identity == self.second_identity
    }
}

impl Validate for NonAssociationKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.first_identity.validate()?;
        self.second_identity.validate()?;
        if self.is_self_paired() {
            return Err(ContractViolation::InvalidValue {
                field: "non_association_key",
                reason: "first_identity and second_identity must differ",
            });
        }
        Ok(())
    }
}

impl NaturalKey for NonAssociationKey {
    fn describe(&self) -> String {
        format!(
            "({}, {}, {})",
            self.first_identity, self.second_identity, self.sequence.0
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingKind {
    LegacyCreated,
    ServiceCreated,
    MigrationCreated,
}

impl MappingKind {
    pub fn is_migrated(self) -> bool {
        match self {
            MappingKind::MigrationCreated => true,
            MappingKind::LegacyCreated | MappingKind::ServiceCreated => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MappingKind::LegacyCreated => "LEGACY_CREATED",
            MappingKind::ServiceCreated => "SERVICE_CREATED",
            MappingKind::MigrationCreated => "MIGRATION_CREATED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LEGACY_CREATED" => Some(MappingKind::LegacyCreated),
            "SERVICE_CREATED" => Some(MappingKind::ServiceCreated),
            "MIGRATION_CREATED" => Some(MappingKind::MigrationCreated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchLabel(String);

impl BatchLabel {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_text("batch_label", &v)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for BatchLabel {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("batch_label", &self.0)
    }
}

/// Client-submitted record; `created_at` is assigned on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecordInput<K> {
    pub schema_version: SchemaVersion,
    pub primary_key: PrimaryKey,
    pub secondary_key: K,
    pub mapping_kind: MappingKind,
    pub batch_label: Option<BatchLabel>,
}

impl<K: NaturalKey> MappingRecordInput<K> {
    pub fn v1(
        primary_key: PrimaryKey,
        secondary_key: K,
        mapping_kind: MappingKind,
        batch_label: Option<BatchLabel>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: MAPPING_CONTRACT_VERSION,
            primary_key,
            secondary_key,
            mapping_kind,
            batch_label,
        };
        r.validate()?;
        Ok(r)
    }
}

impl<K: NaturalKey> Validate for MappingRecordInput<K> {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != MAPPING_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_record_input.schema_version",
                reason: "must match MAPPING_CONTRACT_VERSION",
            });
        }
        self.primary_key.validate()?;
        self.secondary_key.validate()?;
        if let Some(label) = &self.batch_label {
            label.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord<K> {
    pub schema_version: SchemaVersion,
    pub primary_key: PrimaryKey,
    pub secondary_key: K,
    pub mapping_kind: MappingKind,
    pub batch_label: Option<BatchLabel>,
    pub created_at: MonotonicTimeNs,
}

impl<K: NaturalKey> MappingRecord<K> {
    pub fn from_input_v1(
        input: MappingRecordInput<K>,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: MAPPING_CONTRACT_VERSION,
            primary_key: input.primary_key,
            secondary_key: input.secondary_key,
            mapping_kind: input.mapping_kind,
            batch_label: input.batch_label,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }

    /// Field-for-field equality with a submission, ignoring `created_at`.
    pub fn matches_input(&self, input: &MappingRecordInput<K>) -> bool {
        self.primary_key == input.primary_key
            && self.secondary_key == input.secondary_key
            && self.mapping_kind == input.mapping_kind
            && self.batch_label == input.batch_label
    }

    pub fn with_secondary_key(&self, secondary_key: K) -> Self {
        Self {
            secondary_key,
            ..self.clone()
        }
    }
}

impl<K: NaturalKey> Validate for MappingRecord<K> {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != MAPPING_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_record.schema_version",
                reason: "must match MAPPING_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "mapping_record.created_at",
                reason: "must be > 0",
            });
        }
        self.primary_key.validate()?;
        self.secondary_key.validate()?;
        if let Some(label) = &self.batch_label {
            label.validate()?;
        }
        Ok(())
    }
}

pub type LegacyMappingRecord = MappingRecord<LegacyKey>;
pub type NonAssociationRecord = MappingRecord<NonAssociationKey>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateOutcome<K> {
    /// `was_new == false` means an identical record was already stored.
    Created {
        record: MappingRecord<K>,
        was_new: bool,
    },
    /// `existing` is `None` when the colliding record vanished before it could be read.
    Conflict {
        existing: Option<MappingRecord<K>>,
        duplicate: MappingRecordInput<K>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupOutcome<K> {
    Found(MappingRecord<K>),
    NotFound,
}

impl<K> LookupOutcome<K> {
    pub fn found(self) -> Option<MappingRecord<K>> {
        match self {
            LookupOutcome::Found(r) => Some(r),
            LookupOutcome::NotFound => None,
        }
    }
}

impl<K> From<Option<MappingRecord<K>>> for LookupOutcome<K> {
    fn from(v: Option<MappingRecord<K>>) -> Self {
        match v {
            Some(r) => LookupOutcome::Found(r),
            None => LookupOutcome::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationReason {
    IdentitiesWouldBeEqual,
    OldIdentityInExcludeList,
    NewIdentityInExcludeList,
    KeyWouldCollide,
    RecordRemovedDuringUpdate,
}

impl ValidationReason {
    pub fn message(self) -> &'static str {
        match self {
            ValidationReason::IdentitiesWouldBeEqual => {
                "would result in both identities being equal"
            }
            ValidationReason::OldIdentityInExcludeList => "old identifier is in the list",
            ValidationReason::NewIdentityInExcludeList => "new identifier is in the list",
            ValidationReason::KeyWouldCollide => "would collide with an existing record key",
            ValidationReason::RecordRemovedDuringUpdate => {
                "record was removed while the update was in progress"
            }
        }
    }
}

/// Rejected invariant; `record` is the stored record that could not be rewritten, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure<K> {
    pub reason: ValidationReason,
    pub record: Option<MappingRecord<K>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome<K> {
    Updated {
        count: usize,
        records: Vec<MappingRecord<K>>,
    },
    Rejected(ValidationFailure<K>),
}

impl<K> MergeOutcome<K> {
    pub fn updated_count(&self) -> Option<usize> {
        match self {
            MergeOutcome::Updated { count, .. } => Some(*count),
            MergeOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceOutcome<K> {
    Updated(MappingRecord<K>),
    NotFound,
    Rejected(ValidationFailure<K>),
}

/// Two records linking the queried identities to one shared third identity
/// under the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonPartyPair {
    pub common_identity: IdentityId,
    pub with_first: NonAssociationRecord,
    pub with_second: NonAssociationRecord,
}
