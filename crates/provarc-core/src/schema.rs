//! # Schema Introspection
//!
//! A closed registry of entity types and the field-info description written
//! into every archive.
//!
//! Entity types are never resolved from archive data: an archive that names a
//! type the registry does not hold is rejected with
//! [`ProvarcError::UnknownEntityType`].
//!
//! ## Field Info
//!
//! Each exported field is described as one of:
//! - `{}`: a plain value
//! - `{"convert_type": "date"}`: a value stored through a conversion marker
//! - `{"requires": <type>, "related_name": <name>}`: a foreign key

use crate::primitives::{ATTRIBUTE_TYPE, COMPUTER_TYPE, GROUP_TYPE, LINK_TYPE, NODE_TYPE, USER_TYPE};
use crate::types::{AttributeValue, ProvarcError, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Conversion marker for timestamp fields.
pub const DATE_CONVERSION: &str = "date";

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// How a field is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageType {
    Text,
    Integer,
    Float,
    Boolean,
    Uuid,
    DateTime,
    /// Raw bytes. No export rule exists for this storage type.
    Binary,
    ForeignKey {
        target: String,
        related_name: String,
    },
}

impl StorageType {
    /// Foreign key to `target`, reachable back from it as `related_name`.
    #[must_use]
    pub fn foreign_key(target: &str, related_name: &str) -> Self {
        Self::ForeignKey {
            target: target.to_string(),
            related_name: related_name.to_string(),
        }
    }

    fn accepts(&self, value: &AttributeValue) -> bool {
        match (self, value) {
            (_, AttributeValue::Null) => true,
            (Self::Text | Self::Uuid, AttributeValue::Text(_))
            | (Self::Integer | Self::ForeignKey { .. }, AttributeValue::Integer(_))
            | (Self::Float, AttributeValue::Float(_) | AttributeValue::Integer(_))
            | (Self::Boolean, AttributeValue::Bool(_))
            | (Self::DateTime, AttributeValue::Timestamp(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "boolean"),
            Self::Uuid => write!(f, "uuid"),
            Self::DateTime => write!(f, "datetime"),
            Self::Binary => write!(f, "binary"),
            Self::ForeignKey { target, .. } => write!(f, "foreign key to {}", target),
        }
    }
}

/// A declared field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub storage: StorageType,
    pub nullable: bool,
    /// Excluded fields are stored but never written to an archive.
    pub exported: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: &str, storage: StorageType) -> Self {
        Self {
            name: name.to_string(),
            storage,
            nullable: true,
            exported: true,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn excluded(mut self) -> Self {
        self.exported = false;
        self
    }

    /// Target type and related name if this field is a foreign key.
    #[must_use]
    pub fn foreign_key(&self) -> Option<(&str, &str)> {
        match &self.storage {
            StorageType::ForeignKey {
                target,
                related_name,
            } => Some((target, related_name)),
            _ => None,
        }
    }
}

/// A registered entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub tag: String,
    /// Stable identifier field, or `None` for derived types.
    pub unique_identifier: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    #[must_use]
    pub fn new(tag: &str, unique_identifier: Option<&str>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            tag: tag.to_string(),
            unique_identifier: unique_identifier.map(str::to_string),
            fields,
        }
    }

    /// Look up a declared field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All foreign-key fields, as `(field, target)` pairs.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.foreign_key().map(|(target, _)| (f.name.as_str(), target)))
    }

    /// Check a record against this descriptor.
    ///
    /// Every field must be declared and hold a value its storage type accepts,
    /// required fields must be present, and the unique identifier must be text.
    pub fn validate(&self, record: &Record) -> Result<(), ProvarcError> {
        for (name, value) in &record.fields {
            let field = self.field(name).ok_or_else(|| ProvarcError::UnknownField {
                entity_type: self.tag.clone(),
                field: name.clone(),
            })?;
            if !field.storage.accepts(value) {
                return Err(ProvarcError::Storage(format!(
                    "{}.{} expects {}, got {:?}",
                    self.tag, name, field.storage, value
                )));
            }
        }
        for field in self.fields.iter().filter(|f| !f.nullable) {
            if matches!(record.get(&field.name), None | Some(AttributeValue::Null)) {
                return Err(ProvarcError::Storage(format!(
                    "{}.{} is required",
                    self.tag, field.name
                )));
            }
        }
        match &self.unique_identifier {
            Some(uid) if record.text(uid).is_none() => Err(ProvarcError::Storage(format!(
                "{} record has no unique identifier '{}'",
                self.tag, uid
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// TYPE REGISTRY
// =============================================================================

/// Closed registry of entity types, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry holding the six standard entity types.
    #[must_use]
    pub fn standard() -> Self {
        use StorageType as S;

        let mut registry = Self::new();
        registry.register(TypeDescriptor::new(
            USER_TYPE,
            Some("email"),
            vec![
                FieldDescriptor::new("email", S::Text).required(),
                FieldDescriptor::new("first_name", S::Text),
                FieldDescriptor::new("last_name", S::Text),
                FieldDescriptor::new("institution", S::Text),
                FieldDescriptor::new("password", S::Text).excluded(),
                FieldDescriptor::new("date_joined", S::DateTime).excluded(),
            ],
        ));
        registry.register(TypeDescriptor::new(
            COMPUTER_TYPE,
            Some("uuid"),
            vec![
                FieldDescriptor::new("uuid", S::Uuid).required(),
                FieldDescriptor::new("name", S::Text).required(),
                FieldDescriptor::new("hostname", S::Text),
                FieldDescriptor::new("description", S::Text),
                FieldDescriptor::new("transport_type", S::Text),
                FieldDescriptor::new("scheduler_type", S::Text),
                FieldDescriptor::new("metadata", S::Text),
                FieldDescriptor::new("enabled", S::Boolean),
            ],
        ));
        registry.register(TypeDescriptor::new(
            NODE_TYPE,
            Some("uuid"),
            vec![
                FieldDescriptor::new("uuid", S::Uuid).required(),
                FieldDescriptor::new("node_type", S::Text).required(),
                FieldDescriptor::new("label", S::Text),
                FieldDescriptor::new("description", S::Text),
                FieldDescriptor::new("ctime", S::DateTime),
                FieldDescriptor::new("mtime", S::DateTime),
                FieldDescriptor::new("public", S::Boolean),
                FieldDescriptor::new("user", S::foreign_key(USER_TYPE, "dbnodes")).required(),
                FieldDescriptor::new("dbcomputer", S::foreign_key(COMPUTER_TYPE, "dbnodes")),
            ],
        ));
        registry.register(TypeDescriptor::new(
            GROUP_TYPE,
            Some("uuid"),
            vec![
                FieldDescriptor::new("uuid", S::Uuid).required(),
                FieldDescriptor::new("name", S::Text).required(),
                FieldDescriptor::new("type_string", S::Text),
                FieldDescriptor::new("description", S::Text),
                FieldDescriptor::new("time", S::DateTime),
                FieldDescriptor::new("user", S::foreign_key(USER_TYPE, "dbgroups")),
            ],
        ));
        registry.register(TypeDescriptor::new(
            LINK_TYPE,
            None,
            vec![
                FieldDescriptor::new("input", S::foreign_key(NODE_TYPE, "output_links")).required(),
                FieldDescriptor::new("output", S::foreign_key(NODE_TYPE, "input_links")).required(),
                FieldDescriptor::new("label", S::Text),
            ],
        ));
        registry.register(TypeDescriptor::new(
            ATTRIBUTE_TYPE,
            None,
            vec![
                FieldDescriptor::new("dbnode", S::foreign_key(NODE_TYPE, "dbattributes")).required(),
                FieldDescriptor::new("key", S::Text).required(),
                FieldDescriptor::new("datatype", S::Text),
                FieldDescriptor::new("tval", S::Text),
                FieldDescriptor::new("ival", S::Integer),
                FieldDescriptor::new("fval", S::Float),
                FieldDescriptor::new("bval", S::Boolean),
                FieldDescriptor::new("dval", S::DateTime),
            ],
        ));
        registry
    }

    /// Register (or replace) an entity type.
    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.tag.clone(), descriptor);
    }

    /// Look up an entity type by tag.
    pub fn get(&self, tag: &str) -> Result<&TypeDescriptor, ProvarcError> {
        self.types
            .get(tag)
            .ok_or_else(|| ProvarcError::UnknownEntityType(tag.to_string()))
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }
}

// =============================================================================
// FIELD INFO
// =============================================================================

/// Archive-level description of one exported field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
}

/// Entity type → field name → field info.
pub type FieldsInfo = BTreeMap<String, BTreeMap<String, FieldInfo>>;

/// Entity type → stable identifier field (`None` for derived types).
pub type UniqueIdentifiers = BTreeMap<String, Option<String>>;

/// Describe every type reachable from `seeds` through foreign keys.
///
/// Worklist over the type graph with a visited set; cycles are legal.
pub fn describe_schema(
    registry: &TypeRegistry,
    seeds: &[&str],
) -> Result<(FieldsInfo, UniqueIdentifiers), ProvarcError> {
    let mut fields_info = FieldsInfo::new();
    let mut unique_identifiers = UniqueIdentifiers::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = seeds.iter().map(|s| (*s).to_string()).collect();

    while let Some(tag) = queue.pop_front() {
        if !visited.insert(tag.clone()) {
            continue;
        }
        let descriptor = registry.get(&tag)?;
        let mut described = BTreeMap::new();

        for field in descriptor.fields.iter().filter(|f| f.exported) {
            let info = match &field.storage {
                StorageType::Text
                | StorageType::Integer
                | StorageType::Float
                | StorageType::Boolean
                | StorageType::Uuid => FieldInfo::default(),
                StorageType::DateTime => FieldInfo {
                    convert_type: Some(DATE_CONVERSION.to_string()),
                    ..FieldInfo::default()
                },
                StorageType::ForeignKey {
                    target,
                    related_name,
                } => {
                    if !visited.contains(target) {
                        queue.push_back(target.clone());
                    }
                    FieldInfo {
                        requires: Some(target.clone()),
                        related_name: Some(related_name.clone()),
                        ..FieldInfo::default()
                    }
                }
                StorageType::Binary => {
                    return Err(ProvarcError::UnsupportedFieldType {
                        entity_type: tag.clone(),
                        field: field.name.clone(),
                        storage_type: field.storage.to_string(),
                    });
                }
            };
            described.insert(field.name.clone(), info);
        }

        unique_identifiers.insert(tag.clone(), descriptor.unique_identifier.clone());
        fields_info.insert(tag, described);
    }

    Ok((fields_info, unique_identifiers))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::primitives::EXPORT_SEEDS;

    #[test]
    fn standard_schema_reaches_all_types() {
        let registry = TypeRegistry::standard();
        let (info, uids) = describe_schema(&registry, &EXPORT_SEEDS).unwrap();

        let types: Vec<&str> = info.keys().map(String::as_str).collect();
        assert_eq!(
            types,
            vec!["attribute", "computer", "group", "link", "node", "user"]
        );
        assert_eq!(uids["user"].as_deref(), Some("email"));
        assert_eq!(uids["node"].as_deref(), Some("uuid"));
        assert_eq!(uids["link"], None);
        assert_eq!(uids["attribute"], None);
    }

    #[test]
    fn field_info_shapes() {
        let registry = TypeRegistry::standard();
        let (info, _) = describe_schema(&registry, &["node"]).unwrap();

        assert_eq!(info["node"]["label"], FieldInfo::default());
        assert_eq!(info["node"]["ctime"].convert_type.as_deref(), Some("date"));
        assert_eq!(info["node"]["user"].requires.as_deref(), Some("user"));
        assert_eq!(info["node"]["user"].related_name.as_deref(), Some("dbnodes"));
        // discovered transitively through node.user and node.dbcomputer
        assert!(info.contains_key("user"));
        assert!(info.contains_key("computer"));
    }

    #[test]
    fn excluded_fields_are_not_described() {
        let registry = TypeRegistry::standard();
        let (info, _) = describe_schema(&registry, &["user"]).unwrap();
        assert!(!info["user"].contains_key("password"));
        assert!(!info["user"].contains_key("date_joined"));
        assert!(info["user"].contains_key("email"));
    }

    #[test]
    fn cyclic_types_terminate() {
        let mut registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new(
            "a",
            Some("uuid"),
            vec![
                FieldDescriptor::new("uuid", StorageType::Uuid),
                FieldDescriptor::new("peer", StorageType::foreign_key("b", "as")),
            ],
        ));
        registry.register(TypeDescriptor::new(
            "b",
            Some("uuid"),
            vec![
                FieldDescriptor::new("uuid", StorageType::Uuid),
                FieldDescriptor::new("peer", StorageType::foreign_key("a", "bs")),
                FieldDescriptor::new("self_ref", StorageType::foreign_key("b", "children")),
            ],
        ));

        let (info, _) = describe_schema(&registry, &["a"]).unwrap();
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn binary_field_is_unsupported() {
        let mut registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new(
            "blob",
            None,
            vec![FieldDescriptor::new("bytes", StorageType::Binary)],
        ));

        let err = describe_schema(&registry, &["blob"]).unwrap_err();
        match err {
            ProvarcError::UnsupportedFieldType {
                entity_type,
                field,
                storage_type,
            } => {
                assert_eq!(entity_type, "blob");
                assert_eq!(field, "bytes");
                assert_eq!(storage_type, "binary");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_seed_is_rejected() {
        let registry = TypeRegistry::standard();
        assert!(matches!(
            describe_schema(&registry, &["workflow"]),
            Err(ProvarcError::UnknownEntityType(t)) if t == "workflow"
        ));
    }

    #[test]
    fn validate_rejects_unknown_and_mistyped_fields() {
        let registry = TypeRegistry::standard();
        let user = registry.get("user").unwrap();

        let ok = Record::new().with("email", "a@b.c").with("first_name", "Ada");
        assert!(user.validate(&ok).is_ok());

        let unknown = Record::new().with("email", "a@b.c").with("shoe_size", 42_i64);
        assert!(matches!(
            user.validate(&unknown),
            Err(ProvarcError::UnknownField { .. })
        ));

        let mistyped = Record::new().with("email", 3_i64);
        assert!(user.validate(&mistyped).is_err());

        let missing = Record::new().with("first_name", "Ada");
        assert!(user.validate(&missing).is_err());
    }
}
