//! # Core Type Definitions
//!
//! This module contains the types shared by every stage of an export or an
//! import:
//! - Attribute values (`AttributeValue`, `AttributeMap`)
//! - Records (`Record`) as stored and as carried through an archive
//! - Link rows (`LinkRow`)
//! - Error types (`ProvarcError`, `ErrorKind`)
//!
//! ## Determinism Guarantees
//!
//! Maps use `BTreeMap` so that serialized archives list keys in a stable order.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// ATTRIBUTE VALUES
// =============================================================================

/// A structured value stored on a record field or in a node attribute set.
///
/// Timestamps are always UTC with microsecond precision; use
/// [`AttributeValue::timestamp`] to build one from any timezone-aware value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

/// A per-node attribute set.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

impl AttributeValue {
    /// Build a timestamp value, normalized to UTC and truncated to microseconds.
    #[must_use]
    pub fn timestamp<Tz: chrono::TimeZone>(value: DateTime<Tz>) -> Self {
        Self::Timestamp(value.with_timezone(&Utc).trunc_subsecs(6))
    }

    /// Build a text value.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Get the value as a string slice, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a record identifier, if it is a non-negative integer.
    #[must_use]
    pub fn as_id(&self) -> Option<u64> {
        match self {
            Self::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Follow a dotted path (`source.license`) through nested maps.
    #[must_use]
    pub fn lookup_path<'a>(map: &'a AttributeMap, path: &str) -> Option<&'a AttributeValue> {
        let mut parts = path.split('.');
        let mut current = map.get(parts.next()?)?;
        for part in parts {
            match current {
                Self::Map(inner) => current = inner.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A record of a registered entity type.
///
/// The store-assigned identity is never part of `fields`; it travels
/// alongside the record (as a map key) and is not portable between stores.
/// Foreign-key fields hold the referenced record's identity as an integer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: BTreeMap<String, AttributeValue>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder-style foreign-key setter.
    #[must_use]
    pub fn with_ref(mut self, name: impl Into<String>, target: Option<u64>) -> Self {
        self.set_ref(name, target);
        self
    }

    /// Set a field in place.
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.fields.insert(name.into(), value);
    }

    /// Set a foreign-key field in place. `None` stores a null reference.
    pub fn set_ref(&mut self, name: impl Into<String>, target: Option<u64>) {
        let value = match target {
            Some(id) => AttributeValue::Integer(id as i64),
            None => AttributeValue::Null,
        };
        self.fields.insert(name.into(), value);
    }

    /// Get a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.fields.get(name)
    }

    /// Get a text field.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_str)
    }

    /// Get a foreign-key field as a record identity.
    #[must_use]
    pub fn reference(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(AttributeValue::as_id)
    }
}

// =============================================================================
// LINKS
// =============================================================================

/// A directed, labeled provenance edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkRow {
    pub input: u64,
    pub output: u64,
    pub label: String,
}

impl LinkRow {
    #[must_use]
    pub fn new(input: u64, output: u64, label: impl Into<String>) -> Self {
        Self {
            input,
            output,
            label: label.into(),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Which side of a licensing policy rejected a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseRule {
    /// The license is not in the allow-list (or failed the allow predicate).
    NotAllowed,
    /// The license is in the deny-list (or matched the deny predicate).
    Forbidden,
}

impl std::fmt::Display for LicenseRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAllowed => write!(f, "is not in the list of allowed licenses"),
            Self::Forbidden => write!(f, "is in the list of forbidden licenses"),
        }
    }
}

/// Coarse classification of a [`ProvarcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecognized or corrupt archive.
    Format,
    /// Archive format version differs from the importer's.
    VersionMismatch,
    /// Unknown entity type, unsupported field, dependency-order violation.
    Schema,
    /// Dangling node reference, unresolved foreign key, missing payload.
    ReferentialIntegrity,
    /// Label or input conflict while merging links.
    LinkConflict,
    /// A node's license failed the export policy.
    Licensing,
    /// An exported node has no payload subtree in the source repository.
    CorruptSourceRepository,
    /// The record store refused or failed an operation.
    Storage,
    /// Filesystem or network I/O failed.
    Io,
    /// The profile could not be loaded.
    Config,
}

/// Errors raised by export and import.
///
/// Every variant carries the identifiers an operator needs to act on it.
#[derive(Debug, Error)]
pub enum ProvarcError {
    #[error("Unrecognized archive format: {0}")]
    UnrecognizedArchiveFormat(String),

    #[error("Archive member missing: {0}")]
    MissingArchiveMember(String),

    #[error("{algorithm} sum for extracted file '{file}' is {actual}, archive declares {expected}")]
    ChecksumMismatch {
        file: String,
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Archive format version is {found}, but only version {expected} can be imported")]
    IncompatibleArchiveVersion { found: String, expected: String },

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown field '{field}' for entity type {entity_type}")]
    UnknownField { entity_type: String, field: String },

    #[error("Field {entity_type}.{field} has storage type {storage_type}, which has no export rule")]
    UnsupportedFieldType {
        entity_type: String,
        field: String,
        storage_type: String,
    },

    #[error("Entity type {entity_type} requires {requires}, which would be loaded later")]
    DependencyOrderViolation {
        entity_type: String,
        requires: String,
    },

    #[error("Archive identifies {entity_type} records by {declared:?}, this store by {expected:?}")]
    UniqueIdentifierMismatch {
        entity_type: String,
        declared: Option<String>,
        expected: Option<String>,
    },

    #[error("Unknown conversion marker '{0}'")]
    UnknownConversionMarker(String),

    #[error("Archive refers to {} node(s) with unknown UUID: {}", uuids.len(), uuids.join(", "))]
    DanglingReference { uuids: Vec<String> },

    #[error("Field {entity_type}.{field} refers to archive record {local_id}, which cannot be resolved")]
    UnresolvedForeignKey {
        entity_type: String,
        field: String,
        local_id: u64,
    },

    #[error("Link {input} -> {output} ({label}) refers to unknown node(s)")]
    UnresolvedLinkEndpoint {
        input: String,
        output: String,
        label: String,
    },

    #[error("Group {group} refers to unknown node {node}")]
    UnresolvedGroupMember { group: String, node: String },

    #[error("Payload folder for node {uuid} is missing from the archive")]
    MissingPayload { uuid: String },

    #[error("Link {input} -> {output} already exists with label '{existing_label}', refusing to relabel it '{new_label}'")]
    LinkLabelConflict {
        input: u64,
        output: u64,
        existing_label: String,
        new_label: String,
    },

    #[error("Node {output} already has an input link '{label}' from {existing_input}, not from {new_input}")]
    LinkInputConflict {
        output: u64,
        label: String,
        existing_input: u64,
        new_input: u64,
    },

    #[error("Node {uuid} (pk {pk}) is licensed under '{license}', which {rule}")]
    LicensingViolation {
        pk: u64,
        uuid: String,
        license: String,
        rule: LicenseRule,
    },

    #[error("Repository folder for node {uuid} not found at {path:?}")]
    CorruptSourceRepository { uuid: String, path: PathBuf },

    #[error("Record not found: {entity_type} {id}")]
    RecordNotFound { entity_type: String, id: u64 },

    #[error("Duplicate {field} '{value}' for entity type {entity_type}")]
    UniquenessViolation {
        entity_type: String,
        field: String,
        value: String,
    },

    #[error("Group name '{name}' already taken for type '{type_string}'")]
    GroupNameTaken { name: String, type_string: String },

    #[error("Output {0:?} already exists")]
    OutputExists(PathBuf),

    #[error("Symlink loop: {path:?} points back to {ancestor:?}")]
    SymlinkLoop { path: PathBuf, ancestor: PathBuf },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProvarcError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnrecognizedArchiveFormat(_)
            | Self::MissingArchiveMember(_)
            | Self::ChecksumMismatch { .. }
            | Self::Serialization(_) => ErrorKind::Format,
            Self::IncompatibleArchiveVersion { .. } => ErrorKind::VersionMismatch,
            Self::UnknownEntityType(_)
            | Self::UnknownField { .. }
            | Self::UnsupportedFieldType { .. }
            | Self::DependencyOrderViolation { .. }
            | Self::UniqueIdentifierMismatch { .. }
            | Self::UnknownConversionMarker(_) => ErrorKind::Schema,
            Self::DanglingReference { .. }
            | Self::UnresolvedForeignKey { .. }
            | Self::UnresolvedLinkEndpoint { .. }
            | Self::UnresolvedGroupMember { .. }
            | Self::MissingPayload { .. } => ErrorKind::ReferentialIntegrity,
            Self::LinkLabelConflict { .. } | Self::LinkInputConflict { .. } => {
                ErrorKind::LinkConflict
            }
            Self::LicensingViolation { .. } => ErrorKind::Licensing,
            Self::CorruptSourceRepository { .. } => ErrorKind::CorruptSourceRepository,
            Self::RecordNotFound { .. }
            | Self::UniquenessViolation { .. }
            | Self::GroupNameTaken { .. }
            | Self::Storage(_) => ErrorKind::Storage,
            Self::OutputExists(_) | Self::SymlinkLoop { .. } | Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn timestamp_is_normalized_to_utc_micros() {
        let offset = FixedOffset::east_opt(2 * 3600).expect("offset");
        let local = offset
            .with_ymd_and_hms(2015, 6, 1, 12, 0, 0)
            .single()
            .expect("valid time")
            + chrono::Duration::nanoseconds(1_234_567);

        let value = AttributeValue::timestamp(local);
        let AttributeValue::Timestamp(ts) = value else {
            unreachable!("timestamp constructor returns a timestamp")
        };
        assert_eq!(ts.timestamp_subsec_nanos(), 1_234_000);
        assert_eq!(ts, local - chrono::Duration::nanoseconds(567));
    }

    #[test]
    fn lookup_path_descends_maps() {
        let mut source = AttributeMap::new();
        source.insert("license".into(), AttributeValue::text("CC0"));
        let mut attrs = AttributeMap::new();
        attrs.insert("source".into(), AttributeValue::Map(source));

        assert_eq!(
            AttributeValue::lookup_path(&attrs, "source.license"),
            Some(&AttributeValue::text("CC0"))
        );
        assert_eq!(AttributeValue::lookup_path(&attrs, "source.missing"), None);
        assert_eq!(AttributeValue::lookup_path(&attrs, "nope.license"), None);
    }

    #[test]
    fn record_builder_and_references() {
        let record = Record::new()
            .with("uuid", "abc")
            .with_ref("user", Some(7))
            .with_ref("dbcomputer", None);

        assert_eq!(record.text("uuid"), Some("abc"));
        assert_eq!(record.reference("user"), Some(7));
        assert_eq!(record.reference("dbcomputer"), None);
        assert_eq!(record.get("dbcomputer"), Some(&AttributeValue::Null));
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let err = ProvarcError::LinkInputConflict {
            output: 1,
            label: "result".into(),
            existing_input: 2,
            new_input: 3,
        };
        assert_eq!(err.kind(), ErrorKind::LinkConflict);

        let err = ProvarcError::DanglingReference {
            uuids: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.kind(), ErrorKind::ReferentialIntegrity);
        assert!(err.to_string().contains("2 node(s)"));
        assert!(err.to_string().contains("a, b"));
    }
}
