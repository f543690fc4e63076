//! # Archive Documents
//!
//! The two structured files at the root of every archive:
//!
//! - `metadata.json`: format version, producer version, field info and the
//!   unique-identifier map.
//! - `data.json`: records per type (keyed by archive-local id), per-node
//!   attribute sets with their conversion markers, links as UUID triples and
//!   group memberships as UUID lists.
//!
//! Archive-local ids are the source store's record identities. They only
//! have meaning inside one archive.

use crate::primitives::{EXPORT_VERSION, PRODUCER_VERSION};
use crate::schema::{FieldsInfo, UniqueIdentifiers};
use crate::types::ProvarcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// METADATA
// =============================================================================

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub export_version: String,
    pub provarc_version: String,
    pub all_fields_info: FieldsInfo,
    pub unique_identifiers: UniqueIdentifiers,
}

impl MetadataDocument {
    /// Metadata for an archive written by this build.
    #[must_use]
    pub fn current(all_fields_info: FieldsInfo, unique_identifiers: UniqueIdentifiers) -> Self {
        Self {
            export_version: EXPORT_VERSION.to_string(),
            provarc_version: PRODUCER_VERSION.to_string(),
            all_fields_info,
            unique_identifiers,
        }
    }

    /// Parse the document, refusing any format version but the current one.
    ///
    /// The version is read on its own first, so an archive from another
    /// format version is rejected even if the rest of it would not parse.
    pub fn parse(text: &str) -> Result<Self, ProvarcError> {
        #[derive(Deserialize)]
        struct VersionHeader {
            #[serde(default)]
            export_version: Value,
        }

        let header: VersionHeader = serde_json::from_str(text)
            .map_err(|e| ProvarcError::Serialization(format!("metadata.json: {}", e)))?;
        let found = match header.export_version {
            Value::Null => String::new(),
            Value::String(version) => version,
            other => other.to_string(),
        };
        if found != EXPORT_VERSION {
            return Err(ProvarcError::IncompatibleArchiveVersion {
                found,
                expected: EXPORT_VERSION.to_string(),
            });
        }

        serde_json::from_str(text)
            .map_err(|e| ProvarcError::Serialization(format!("metadata.json: {}", e)))
    }
}

// =============================================================================
// DATA
// =============================================================================

/// A link between two nodes, by stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkTriple {
    pub input: String,
    pub output: String,
    pub label: String,
}

/// Contents of `data.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDocument {
    /// Entity type → archive-local id → serialized fields.
    pub export_data: BTreeMap<String, BTreeMap<u64, Value>>,
    /// Node archive-local id → serialized attribute set.
    pub node_attributes: BTreeMap<u64, Value>,
    /// Node archive-local id → conversion markers. Absent when none are needed.
    pub node_attributes_conversion: BTreeMap<u64, Value>,
    pub links_uuid: Vec<LinkTriple>,
    /// Group UUID → member node UUIDs.
    pub groups_uuid: BTreeMap<String, Vec<String>>,
}

impl DataDocument {
    pub fn parse(text: &str) -> Result<Self, ProvarcError> {
        serde_json::from_str(text)
            .map_err(|e| ProvarcError::Serialization(format!("data.json: {}", e)))
    }

    /// Total number of records over all entity types.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.export_data.values().map(BTreeMap::len).sum()
    }
}

/// Render a document the way archives store it.
pub fn to_json<T: Serialize>(document: &T) -> Result<String, ProvarcError> {
    serde_json::to_string_pretty(document).map_err(|e| ProvarcError::Serialization(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_round_trip() {
        let mut info = FieldsInfo::new();
        info.insert("user".into(), BTreeMap::new());
        let mut uids = UniqueIdentifiers::new();
        uids.insert("user".into(), Some("email".into()));
        uids.insert("link".into(), None);

        let doc = MetadataDocument::current(info, uids);
        let text = to_json(&doc).unwrap();
        assert_eq!(MetadataDocument::parse(&text).unwrap(), doc);
    }

    #[test]
    fn version_is_checked_before_the_rest() {
        let text = json!({"export_version": "0.0", "garbage": true}).to_string();
        match MetadataDocument::parse(&text).unwrap_err() {
            ProvarcError::IncompatibleArchiveVersion { found, expected } => {
                assert_eq!(found, "0.0");
                assert_eq!(expected, EXPORT_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn numeric_version_is_still_a_version_mismatch() {
        let text = json!({"export_version": 0.2, "all_fields_info": 7}).to_string();
        let err = MetadataDocument::parse(&text).unwrap_err();
        assert!(matches!(
            err,
            ProvarcError::IncompatibleArchiveVersion { ref found, .. } if found == "0.2"
        ));

        let text = json!({"provarc_version": "x"}).to_string();
        assert!(matches!(
            MetadataDocument::parse(&text),
            Err(ProvarcError::IncompatibleArchiveVersion { ref found, .. }) if found.is_empty()
        ));
    }

    #[test]
    fn data_document_uses_string_keys_on_disk() {
        let mut doc = DataDocument::default();
        doc.export_data
            .entry("node".into())
            .or_default()
            .insert(12, json!({"uuid": "u"}));
        doc.links_uuid.push(LinkTriple {
            input: "a".into(),
            output: "b".into(),
            label: "result".into(),
        });

        let text = to_json(&doc).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["export_data"]["node"]["12"]["uuid"], json!("u"));

        let back = DataDocument::parse(&text).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.record_count(), 1);
    }
}
