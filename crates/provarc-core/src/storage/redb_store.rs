//! # redb-backed Record Store
//!
//! The store holding typed records, provenance links, per-node attribute
//! sets, group memberships and node state tags.
//!
//! All access goes through a transaction:
//! - [`StoreReader`] wraps a redb read transaction (snapshot isolation).
//! - [`StoreWriter`] wraps the single redb write transaction. Dropping it
//!   without calling [`StoreWriter::commit`] rolls every change back.
//!
//! Read operations are shared: they are implemented once over
//! [`TableSource`], so a writer sees its own uncommitted changes.
//!
//! ## Invariants enforced on write
//! - Every record validates against its registered [`TypeDescriptor`].
//! - Stable identifiers are unique per type.
//! - Foreign keys point at existing records.
//! - Group names are unique per group type tag.
//! - A link's (input, output) pair carries one label, and an output has at
//!   most one input per label.

use crate::primitives::{GROUP_TYPE, NODE_TYPE};
use crate::schema::{TypeDescriptor, TypeRegistry};
use crate::types::{AttributeMap, LinkRow, ProvarcError, Record};
use redb::{
    Database, Key, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable,
    ReadableTableMetadata, Table, TableDefinition, Value, WriteTransaction,
};
use std::collections::BTreeMap;
use std::path::Path;

/// Records: (entity type, id) -> postcard-encoded `Record`
const RECORDS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("records");

/// Stable identifier index: (entity type, identifier) -> id
const UNIQUE_INDEX: TableDefinition<(&str, &str), u64> = TableDefinition::new("unique_index");

/// Incoming links: (output, input) -> label
const LINKS_IN: TableDefinition<(u64, u64), &str> = TableDefinition::new("links_in");

/// Outgoing links: (input, output) -> label
const LINKS_OUT: TableDefinition<(u64, u64), &str> = TableDefinition::new("links_out");

/// Node attribute sets: node id -> postcard-encoded `AttributeMap`
const ATTRIBUTES: TableDefinition<u64, &[u8]> = TableDefinition::new("attributes");

/// Group membership: (group id, node id) -> ()
const GROUP_MEMBERS: TableDefinition<(u64, u64), ()> = TableDefinition::new("group_members");

/// Group names: (type string, name) -> group id
const GROUP_NAMES: TableDefinition<(&str, &str), u64> = TableDefinition::new("group_names");

/// Node state tags: node id -> state
const NODE_STATES: TableDefinition<u64, &str> = TableDefinition::new("node_states");

/// Counters: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_ID_KEY: &str = "next_id";

fn db_err(e: impl std::fmt::Display) -> ProvarcError {
    ProvarcError::Storage(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProvarcError> {
    postcard::from_bytes(bytes).map_err(|e| ProvarcError::Serialization(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProvarcError> {
    postcard::to_allocvec(value).map_err(|e| ProvarcError::Serialization(e.to_string()))
}

// =============================================================================
// STORE
// =============================================================================

/// A record store backed by a redb database file.
pub struct Store {
    db: Database,
    registry: TypeRegistry,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a store holding the entity types of `registry`.
    pub fn open(path: impl AsRef<Path>, registry: TypeRegistry) -> Result<Self, ProvarcError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;

        // Create every table up front so readers never see a missing table.
        {
            let write_txn = db.begin_write().map_err(db_err)?;
            let _ = write_txn.open_table(RECORDS).map_err(db_err)?;
            let _ = write_txn.open_table(UNIQUE_INDEX).map_err(db_err)?;
            let _ = write_txn.open_table(LINKS_IN).map_err(db_err)?;
            let _ = write_txn.open_table(LINKS_OUT).map_err(db_err)?;
            let _ = write_txn.open_table(ATTRIBUTES).map_err(db_err)?;
            let _ = write_txn.open_table(GROUP_MEMBERS).map_err(db_err)?;
            let _ = write_txn.open_table(GROUP_NAMES).map_err(db_err)?;
            let _ = write_txn.open_table(NODE_STATES).map_err(db_err)?;
            let _ = write_txn.open_table(METADATA).map_err(db_err)?;
            write_txn.commit().map_err(db_err)?;
        }

        Ok(Self { db, registry })
    }

    /// Open or create a store with the standard entity types.
    pub fn open_standard(path: impl AsRef<Path>) -> Result<Self, ProvarcError> {
        Self::open(path, TypeRegistry::standard())
    }

    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Begin a read-only snapshot.
    pub fn begin_read(&self) -> Result<StoreReader<'_>, ProvarcError> {
        Ok(StoreTxn {
            txn: self.db.begin_read().map_err(db_err)?,
            registry: &self.registry,
        })
    }

    /// Begin the write transaction.
    pub fn begin_write(&self) -> Result<StoreWriter<'_>, ProvarcError> {
        Ok(StoreTxn {
            txn: self.db.begin_write().map_err(db_err)?,
            registry: &self.registry,
        })
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Anything tables can be opened from for reading.
pub trait TableSource {
    type Table<'a, K: Key + 'static, V: Value + 'static>: ReadableTable<K, V>
    where
        Self: 'a;

    fn open<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<K, V>,
    ) -> Result<Self::Table<'_, K, V>, ProvarcError>;
}

impl TableSource for ReadTransaction {
    type Table<'a, K: Key + 'static, V: Value + 'static>
        = ReadOnlyTable<K, V>
    where
        Self: 'a;

    fn open<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<K, V>,
    ) -> Result<Self::Table<'_, K, V>, ProvarcError> {
        self.open_table(definition).map_err(db_err)
    }
}

impl TableSource for WriteTransaction {
    type Table<'a, K: Key + 'static, V: Value + 'static>
        = Table<'a, K, V>
    where
        Self: 'a;

    fn open<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<K, V>,
    ) -> Result<Self::Table<'_, K, V>, ProvarcError> {
        self.open_table(definition).map_err(db_err)
    }
}

/// A transaction on a [`Store`].
pub struct StoreTxn<'s, T> {
    txn: T,
    registry: &'s TypeRegistry,
}

/// A read-only snapshot of a [`Store`].
pub type StoreReader<'s> = StoreTxn<'s, ReadTransaction>;

/// The write transaction of a [`Store`].
pub type StoreWriter<'s> = StoreTxn<'s, WriteTransaction>;

/// How a link relates to the links already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The same edge with the same label is already stored.
    Existing,
    /// The edge is not stored and conflicts with nothing.
    New,
}

// =============================================================================
// READS
// =============================================================================

impl<T: TableSource> StoreTxn<'_, T> {
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        self.registry
    }

    /// Fetch one record.
    pub fn get_record(&self, entity_type: &str, id: u64) -> Result<Option<Record>, ProvarcError> {
        let table = self.txn.open(RECORDS)?;
        match table.get((entity_type, id)).map_err(db_err)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist.
    pub fn require_record(&self, entity_type: &str, id: u64) -> Result<Record, ProvarcError> {
        self.get_record(entity_type, id)?
            .ok_or_else(|| ProvarcError::RecordNotFound {
                entity_type: entity_type.to_string(),
                id,
            })
    }

    /// Fetch the records with the given ids. Missing ids are skipped.
    pub fn get_records(
        &self,
        entity_type: &str,
        ids: &[u64],
    ) -> Result<BTreeMap<u64, Record>, ProvarcError> {
        let table = self.txn.open(RECORDS)?;
        let mut out = BTreeMap::new();
        for &id in ids {
            if let Some(bytes) = table.get((entity_type, id)).map_err(db_err)? {
                out.insert(id, decode(bytes.value())?);
            }
        }
        Ok(out)
    }

    /// All records of one type, in id order.
    pub fn records(&self, entity_type: &str) -> Result<BTreeMap<u64, Record>, ProvarcError> {
        let table = self.txn.open(RECORDS)?;
        let mut out = BTreeMap::new();
        for entry in table
            .range((entity_type, 0u64)..=(entity_type, u64::MAX))
            .map_err(db_err)?
        {
            let (key, value) = entry.map_err(db_err)?;
            out.insert(key.value().1, decode(value.value())?);
        }
        Ok(out)
    }

    /// Number of records of one type.
    pub fn count(&self, entity_type: &str) -> Result<usize, ProvarcError> {
        let table = self.txn.open(RECORDS)?;
        let mut count = 0;
        for entry in table
            .range((entity_type, 0u64)..=(entity_type, u64::MAX))
            .map_err(db_err)?
        {
            entry.map_err(db_err)?;
            count += 1;
        }
        Ok(count)
    }

    /// Resolve one stable identifier.
    pub fn find_by_unique(
        &self,
        entity_type: &str,
        identifier: &str,
    ) -> Result<Option<u64>, ProvarcError> {
        let table = self.txn.open(UNIQUE_INDEX)?;
        Ok(table
            .get((entity_type, identifier))
            .map_err(db_err)?
            .map(|v| v.value()))
    }

    /// Resolve a set of stable identifiers. Unknown identifiers are skipped.
    pub fn find_many_by_unique(
        &self,
        entity_type: &str,
        identifiers: &[String],
    ) -> Result<BTreeMap<String, u64>, ProvarcError> {
        let table = self.txn.open(UNIQUE_INDEX)?;
        let mut out = BTreeMap::new();
        for identifier in identifiers {
            if let Some(id) = table
                .get((entity_type, identifier.as_str()))
                .map_err(db_err)?
            {
                out.insert(identifier.clone(), id.value());
            }
        }
        Ok(out)
    }

    /// Stable identifier of a stored record.
    pub fn unique_of(&self, entity_type: &str, id: u64) -> Result<Option<String>, ProvarcError> {
        let descriptor = self.registry.get(entity_type)?;
        let Some(field) = &descriptor.unique_identifier else {
            return Ok(None);
        };
        Ok(self
            .get_record(entity_type, id)?
            .and_then(|r| r.text(field).map(str::to_string)))
    }

    /// Links whose output is `node`.
    pub fn input_links(&self, node: u64) -> Result<Vec<LinkRow>, ProvarcError> {
        let table = self.txn.open(LINKS_IN)?;
        let mut out = Vec::new();
        for entry in table
            .range((node, 0u64)..=(node, u64::MAX))
            .map_err(db_err)?
        {
            let (key, label) = entry.map_err(db_err)?;
            let (output, input) = key.value();
            out.push(LinkRow::new(input, output, label.value()));
        }
        Ok(out)
    }

    /// Links whose input is `node`.
    pub fn output_links(&self, node: u64) -> Result<Vec<LinkRow>, ProvarcError> {
        let table = self.txn.open(LINKS_OUT)?;
        let mut out = Vec::new();
        for entry in table
            .range((node, 0u64)..=(node, u64::MAX))
            .map_err(db_err)?
        {
            let (key, label) = entry.map_err(db_err)?;
            let (input, output) = key.value();
            out.push(LinkRow::new(input, output, label.value()));
        }
        Ok(out)
    }

    /// Label of the link `input -> output`, if stored.
    pub fn link_label(&self, input: u64, output: u64) -> Result<Option<String>, ProvarcError> {
        let table = self.txn.open(LINKS_OUT)?;
        Ok(table
            .get((input, output))
            .map_err(db_err)?
            .map(|v| v.value().to_string()))
    }

    /// Number of stored links.
    pub fn link_count(&self) -> Result<u64, ProvarcError> {
        let table = self.txn.open(LINKS_OUT)?;
        table.len().map_err(db_err)
    }

    /// Classify a link against the stored ones.
    ///
    /// Fails on a label conflict (same edge, other label) or an input
    /// conflict (same output and label, other input).
    pub fn classify_link(&self, link: &LinkRow) -> Result<LinkStatus, ProvarcError> {
        if let Some(existing_label) = self.link_label(link.input, link.output)? {
            if existing_label == link.label {
                return Ok(LinkStatus::Existing);
            }
            return Err(ProvarcError::LinkLabelConflict {
                input: link.input,
                output: link.output,
                existing_label,
                new_label: link.label.clone(),
            });
        }
        if let Some(other) = self
            .input_links(link.output)?
            .into_iter()
            .find(|l| l.label == link.label)
        {
            return Err(ProvarcError::LinkInputConflict {
                output: link.output,
                label: link.label.clone(),
                existing_input: other.input,
                new_input: link.input,
            });
        }
        Ok(LinkStatus::New)
    }

    /// Attribute set of a node (empty if none was stored).
    pub fn attributes(&self, node: u64) -> Result<AttributeMap, ProvarcError> {
        let table = self.txn.open(ATTRIBUTES)?;
        match table.get(node).map_err(db_err)? {
            Some(bytes) => decode(bytes.value()),
            None => Ok(AttributeMap::new()),
        }
    }

    /// Member node ids of a group, in id order.
    pub fn group_members(&self, group: u64) -> Result<Vec<u64>, ProvarcError> {
        let table = self.txn.open(GROUP_MEMBERS)?;
        let mut out = Vec::new();
        for entry in table
            .range((group, 0u64)..=(group, u64::MAX))
            .map_err(db_err)?
        {
            let (key, _) = entry.map_err(db_err)?;
            out.push(key.value().1);
        }
        Ok(out)
    }

    /// Look up a group by type tag and name.
    pub fn group_by_name(
        &self,
        type_string: &str,
        name: &str,
    ) -> Result<Option<u64>, ProvarcError> {
        let table = self.txn.open(GROUP_NAMES)?;
        Ok(table
            .get((type_string, name))
            .map_err(db_err)?
            .map(|v| v.value()))
    }

    /// State tag of a node.
    pub fn node_state(&self, node: u64) -> Result<Option<String>, ProvarcError> {
        let table = self.txn.open(NODE_STATES)?;
        Ok(table
            .get(node)
            .map_err(db_err)?
            .map(|v| v.value().to_string()))
    }
}

// =============================================================================
// WRITES
// =============================================================================

impl StoreWriter<'_> {
    /// Insert a new record, returning its assigned id.
    pub fn insert_record(&mut self, entity_type: &str, record: &Record) -> Result<u64, ProvarcError> {
        let registry = self.registry;
        let descriptor = registry.get(entity_type)?;
        descriptor.validate(record)?;
        self.check_references(descriptor, record)?;

        let unique = descriptor
            .unique_identifier
            .as_deref()
            .and_then(|field| record.text(field));
        if let Some(value) = unique {
            if self.find_by_unique(entity_type, value)?.is_some() {
                return Err(ProvarcError::UniquenessViolation {
                    entity_type: entity_type.to_string(),
                    field: descriptor.unique_identifier.clone().unwrap_or_default(),
                    value: value.to_string(),
                });
            }
        }

        let group_key = if entity_type == GROUP_TYPE {
            let name = record.text("name").unwrap_or_default();
            let type_string = record.text("type_string").unwrap_or_default();
            if self.group_by_name(type_string, name)?.is_some() {
                return Err(ProvarcError::GroupNameTaken {
                    name: name.to_string(),
                    type_string: type_string.to_string(),
                });
            }
            Some((type_string, name))
        } else {
            None
        };

        let id = self.allocate_id()?;
        let bytes = encode(record)?;
        {
            let mut table = self.txn.open_table(RECORDS).map_err(db_err)?;
            table
                .insert((entity_type, id), bytes.as_slice())
                .map_err(db_err)?;
        }
        if let Some(value) = unique {
            let mut table = self.txn.open_table(UNIQUE_INDEX).map_err(db_err)?;
            table.insert((entity_type, value), id).map_err(db_err)?;
        }
        if let Some((type_string, name)) = group_key {
            let mut table = self.txn.open_table(GROUP_NAMES).map_err(db_err)?;
            table.insert((type_string, name), id).map_err(db_err)?;
        }
        Ok(id)
    }

    fn check_references(
        &self,
        descriptor: &TypeDescriptor,
        record: &Record,
    ) -> Result<(), ProvarcError> {
        for (field, target) in descriptor.foreign_keys() {
            let Some(id) = record.reference(field) else {
                continue;
            };
            if self.get_record(target, id)?.is_none() {
                return Err(ProvarcError::RecordNotFound {
                    entity_type: target.to_string(),
                    id,
                });
            }
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<u64, ProvarcError> {
        let mut table = self.txn.open_table(METADATA).map_err(db_err)?;
        let next = table
            .get(NEXT_ID_KEY)
            .map_err(db_err)?
            .map(|v| v.value())
            .unwrap_or(1);
        table
            .insert(NEXT_ID_KEY, next.saturating_add(1))
            .map_err(db_err)?;
        Ok(next)
    }

    /// Store a link between two existing nodes.
    ///
    /// Returns `false` when the identical link is already stored.
    pub fn insert_link(&mut self, link: &LinkRow) -> Result<bool, ProvarcError> {
        for endpoint in [link.input, link.output] {
            if self.get_record(NODE_TYPE, endpoint)?.is_none() {
                return Err(ProvarcError::RecordNotFound {
                    entity_type: NODE_TYPE.to_string(),
                    id: endpoint,
                });
            }
        }
        if self.classify_link(link)? == LinkStatus::Existing {
            return Ok(false);
        }
        {
            let mut table = self.txn.open_table(LINKS_OUT).map_err(db_err)?;
            table
                .insert((link.input, link.output), link.label.as_str())
                .map_err(db_err)?;
        }
        {
            let mut table = self.txn.open_table(LINKS_IN).map_err(db_err)?;
            table
                .insert((link.output, link.input), link.label.as_str())
                .map_err(db_err)?;
        }
        Ok(true)
    }

    /// Replace the attribute set of a node.
    pub fn set_attributes(&mut self, node: u64, attributes: &AttributeMap) -> Result<(), ProvarcError> {
        let bytes = encode(attributes)?;
        let mut table = self.txn.open_table(ATTRIBUTES).map_err(db_err)?;
        table.insert(node, bytes.as_slice()).map_err(db_err)?;
        Ok(())
    }

    /// Add nodes to a group. Nodes already in the group are left alone.
    pub fn add_group_members(&mut self, group: u64, nodes: &[u64]) -> Result<(), ProvarcError> {
        if self.get_record(GROUP_TYPE, group)?.is_none() {
            return Err(ProvarcError::RecordNotFound {
                entity_type: GROUP_TYPE.to_string(),
                id: group,
            });
        }
        let mut table = self.txn.open_table(GROUP_MEMBERS).map_err(db_err)?;
        for &node in nodes {
            table.insert((group, node), ()).map_err(db_err)?;
        }
        Ok(())
    }

    /// Tag a node with a state.
    pub fn set_node_state(&mut self, node: u64, state: &str) -> Result<(), ProvarcError> {
        let mut table = self.txn.open_table(NODE_STATES).map_err(db_err)?;
        table.insert(node, state).map_err(db_err)?;
        Ok(())
    }

    /// Make every change of this transaction durable.
    pub fn commit(self) -> Result<(), ProvarcError> {
        self.txn.commit().map_err(db_err)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::AttributeValue;
    use tempfile::tempdir;

    fn user(email: &str) -> Record {
        Record::new().with("email", email)
    }

    fn node(uuid: &str, user: u64) -> Record {
        Record::new()
            .with("uuid", uuid)
            .with("node_type", "data.int")
            .with_ref("user", Some(user))
    }

    #[test]
    fn insert_and_lookup() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let mut w = store.begin_write().unwrap();
        let u = w.insert_record("user", &user("a@x")).unwrap();
        let n = w.insert_record("node", &node("n1", u)).unwrap();
        w.commit().unwrap();

        let r = store.begin_read().unwrap();
        assert_eq!(r.find_by_unique("node", "n1").unwrap(), Some(n));
        assert_eq!(r.unique_of("user", u).unwrap().as_deref(), Some("a@x"));
        assert_eq!(r.count("node").unwrap(), 1);
        assert_eq!(r.require_record("node", n).unwrap().reference("user"), Some(u));
    }

    #[test]
    fn ids_come_from_one_counter_for_all_types() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        {
            let mut w = store.begin_write().unwrap();
            w.insert_record("user", &user("dropped@x")).unwrap();
        }
        let mut w = store.begin_write().unwrap();
        let u = w.insert_record("user", &user("a@x")).unwrap();
        let n = w.insert_record("node", &node("n1", u)).unwrap();
        let v = w.insert_record("user", &user("b@x")).unwrap();
        w.commit().unwrap();

        // the rolled back insert gave its id back
        assert_eq!((u, n, v), (1, 2, 3));
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        {
            let mut w = store.begin_write().unwrap();
            w.insert_record("user", &user("a@x")).unwrap();
        }

        let r = store.begin_read().unwrap();
        assert_eq!(r.count("user").unwrap(), 0);
        assert_eq!(r.find_by_unique("user", "a@x").unwrap(), None);
    }

    #[test]
    fn writer_reads_its_own_writes() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let mut w = store.begin_write().unwrap();
        let u = w.insert_record("user", &user("a@x")).unwrap();
        assert_eq!(w.find_by_unique("user", "a@x").unwrap(), Some(u));
        assert_eq!(w.records("user").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_identifier_is_rejected() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let mut w = store.begin_write().unwrap();
        w.insert_record("user", &user("a@x")).unwrap();
        let err = w.insert_record("user", &user("a@x")).unwrap_err();
        assert!(matches!(err, ProvarcError::UniquenessViolation { .. }));
    }

    #[test]
    fn dangling_foreign_key_is_rejected() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let mut w = store.begin_write().unwrap();
        let err = w.insert_record("node", &node("n1", 99)).unwrap_err();
        assert!(matches!(err, ProvarcError::RecordNotFound { id: 99, .. }));
    }

    #[test]
    fn group_names_are_unique_per_type() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let group = |uuid: &str, type_string: &str| {
            Record::new()
                .with("uuid", uuid)
                .with("name", "g")
                .with("type_string", type_string)
        };

        let mut w = store.begin_write().unwrap();
        w.insert_record("group", &group("g1", "")).unwrap();
        w.insert_record("group", &group("g2", "other")).unwrap();
        let err = w.insert_record("group", &group("g3", "")).unwrap_err();
        assert!(matches!(err, ProvarcError::GroupNameTaken { .. }));
    }

    #[test]
    fn link_invariants() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open_standard(temp.path().join("db.redb")).expect("open");

        let mut w = store.begin_write().unwrap();
        let u = w.insert_record("user", &user("a@x")).unwrap();
        let x = w.insert_record("node", &node("x", u)).unwrap();
        let y = w.insert_record("node", &node("y", u)).unwrap();
        let z = w.insert_record("node", &node("z", u)).unwrap();

        assert!(w.insert_link(&LinkRow::new(x, y, "result")).unwrap());
        assert!(!w.insert_link(&LinkRow::new(x, y, "result")).unwrap());
        assert!(matches!(
            w.insert_link(&LinkRow::new(x, y, "other")),
            Err(ProvarcError::LinkLabelConflict { .. })
        ));
        assert!(matches!(
            w.insert_link(&LinkRow::new(z, y, "result")),
            Err(ProvarcError::LinkInputConflict { .. })
        ));
        assert!(w.insert_link(&LinkRow::new(z, y, "parameters")).unwrap());

        assert_eq!(w.input_links(y).unwrap().len(), 2);
        assert_eq!(w.output_links(x).unwrap(), vec![LinkRow::new(x, y, "result")]);
        assert_eq!(w.link_count().unwrap(), 2);
    }

    #[test]
    fn attributes_members_and_states() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("db.redb");

        {
            let store = Store::open_standard(&db_path).expect("open");
            let mut w = store.begin_write().unwrap();
            let u = w.insert_record("user", &user("a@x")).unwrap();
            let n = w.insert_record("node", &node("n", u)).unwrap();
            let g = w
                .insert_record("group", &Record::new().with("uuid", "g").with("name", "g"))
                .unwrap();

            let mut attrs = AttributeMap::new();
            attrs.insert("value".into(), AttributeValue::Integer(5));
            w.set_attributes(n, &attrs).unwrap();
            w.add_group_members(g, &[n, n]).unwrap();
            w.set_node_state(n, "IMPORTED").unwrap();
            w.commit().unwrap();
        }

        // Reopen and verify persistence
        let store = Store::open_standard(&db_path).expect("reopen");
        let r = store.begin_read().unwrap();
        let n = r.find_by_unique("node", "n").unwrap().unwrap();
        let g = r.find_by_unique("group", "g").unwrap().unwrap();
        assert_eq!(
            r.attributes(n).unwrap().get("value"),
            Some(&AttributeValue::Integer(5))
        );
        assert_eq!(r.group_members(g).unwrap(), vec![n]);
        assert_eq!(r.node_state(n).unwrap().as_deref(), Some("IMPORTED"));
        assert_eq!(r.group_by_name("", "g").unwrap(), Some(g));
    }

    #[test]
    fn ids_keep_growing_across_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("db.redb");

        let first = {
            let store = Store::open_standard(&db_path).expect("open");
            let mut w = store.begin_write().unwrap();
            let id = w.insert_record("user", &user("a@x")).unwrap();
            w.commit().unwrap();
            id
        };

        let store = Store::open_standard(&db_path).expect("reopen");
        let mut w = store.begin_write().unwrap();
        let second = w.insert_record("user", &user("b@x")).unwrap();
        assert!(second > first);
    }
}
