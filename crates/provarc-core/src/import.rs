//! # Import/Merge Engine
//!
//! Merges an archive into the store behind a [`Session`].
//!
//! ## Phases
//!
//! 1. Extract: stage the archive into a scratch folder.
//! 2. Version check: `metadata.json` must carry the current format version.
//! 3. Referential pre-check: every node UUID named by a link or a group
//!    membership must be in the archive or in the store.
//! 4. Schema check: only known entity types, and a load order consistent
//!    with the archive's foreign keys.
//! 5. Reverse tables: archive-local id → stable identifier, per type.
//! 6. Partition: records whose stable identifier is already stored are
//!    "existing" and left alone; the rest are "new".
//! 7. Materialize new records type by type, remapping foreign keys, moving
//!    node payloads into the repository and restoring attribute sets.
//! 8. Links: remap, classify against stored links, insert the new ones.
//! 9. Group memberships.
//! 10. Bookkeeping group holding every node the import touched.
//! 11. Commit.
//!
//! Phases 3 to 10 run inside one write transaction; any error drops it and
//! the store is left as it was. Payload folders moved into the repository in
//! phase 7 stay where they are. They are keyed by UUID, so running the
//! import again after fixing the problem overwrites them.

use crate::archive::{RemoteFetcher, StagedArchive, UreqFetcher};
use crate::formats::{DataDocument, MetadataDocument, deserialize_map, deserialize_record};
use crate::primitives::{
    ATTRIBUTE_TYPE, DATA_FILE, GROUP_TYPE, IMPORT_GROUP_NAME_FORMAT, IMPORT_GROUP_TYPE,
    IMPORT_ORDER, IMPORTED_STATE, LINK_TYPE, METADATA_FILE, NODE_TYPE, USER_TYPE,
};
use crate::schema::FieldInfo;
use crate::session::Session;
use crate::storage::{LinkStatus, StoreWriter};
use crate::types::{AttributeValue, LinkRow, ProvarcError, Record};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Entity types an archive may describe whose records are derived rather
/// than loaded through [`IMPORT_ORDER`].
const DERIVED_TYPES: [&str; 2] = [LINK_TYPE, ATTRIBUTE_TYPE];

// =============================================================================
// OPTIONS AND REPORT
// =============================================================================

/// Import behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Drop links, group memberships and foreign keys that name records
    /// found neither in the archive nor in the store, instead of failing.
    pub ignore_unknown_nodes: bool,
}

/// Records of one type, as (archive-local id, store id) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportedEntries {
    pub new: Vec<(u64, u64)>,
    pub existing: Vec<(u64, u64)>,
}

/// What an import did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Entity type → new and existing records.
    pub entries: BTreeMap<String, ImportedEntries>,
    /// Newly stored links, as (input, output) store ids.
    pub new_links: Vec<(u64, u64)>,
    /// Name of the bookkeeping group, if one was created.
    pub import_group: Option<String>,
}

impl ImportReport {
    #[must_use]
    pub fn new_count(&self, entity_type: &str) -> usize {
        self.entries.get(entity_type).map_or(0, |e| e.new.len())
    }

    #[must_use]
    pub fn existing_count(&self, entity_type: &str) -> usize {
        self.entries.get(entity_type).map_or(0, |e| e.existing.len())
    }

    fn entry(&mut self, entity_type: &str) -> &mut ImportedEntries {
        self.entries.entry(entity_type.to_string()).or_default()
    }
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

/// Import the archive at `input` (directory, zip, tar, or CIF).
pub fn import_data(
    session: &Session,
    input: &Path,
    options: ImportOptions,
) -> Result<ImportReport, ProvarcError> {
    import_data_with(session, input, options, &UreqFetcher)
}

/// [`import_data`] with an explicit fetcher for remote CIF contents.
pub fn import_data_with(
    session: &Session,
    input: &Path,
    options: ImportOptions,
    fetcher: &dyn RemoteFetcher,
) -> Result<ImportReport, ProvarcError> {
    let staged = StagedArchive::stage(input, session.profile().scratch_dir.as_deref(), fetcher)?;
    import_staged(session, &staged, options)
}

/// Read and check the metadata of a staged archive.
pub fn read_metadata(staged: &StagedArchive) -> Result<MetadataDocument, ProvarcError> {
    MetadataDocument::parse(&staged.read_text(METADATA_FILE)?)
}

/// Import an archive that is already staged.
pub fn import_staged(
    session: &Session,
    staged: &StagedArchive,
    options: ImportOptions,
) -> Result<ImportReport, ProvarcError> {
    // The version gate runs before data.json is even read.
    let metadata = read_metadata(staged)?;
    let data = DataDocument::parse(&staged.read_text(DATA_FILE)?)?;
    info!(
        records = data.record_count(),
        links = data.links_uuid.len(),
        groups = data.groups_uuid.len(),
        "archive loaded"
    );

    let mut merge = Merge {
        session,
        writer: session.store().begin_write()?,
        metadata: &metadata,
        data: &data,
        staged,
        options,
        local_uniques: BTreeMap::new(),
        reverse: BTreeMap::new(),
        report: ImportReport::default(),
    };
    merge.check_references()?;
    merge.check_schema()?;
    merge.build_local_uniques()?;
    let partitions = merge.partition()?;
    merge.materialize(&partitions)?;
    merge.store_links()?;
    merge.store_group_members()?;
    merge.create_import_group(&partitions)?;

    let Merge { writer, report, .. } = merge;
    writer.commit()?;
    info!(
        new_nodes = report.new_count(NODE_TYPE),
        existing_nodes = report.existing_count(NODE_TYPE),
        new_links = report.new_links.len(),
        "import committed"
    );
    Ok(report)
}

// =============================================================================
// MERGE STATE
// =============================================================================

/// New and existing records of one type.
#[derive(Debug, Default)]
struct Partition<'d> {
    /// (local id, record value, stable identifier)
    new: Vec<(u64, &'d Value, String)>,
    /// (local id, store id)
    existing: Vec<(u64, u64)>,
}

struct Merge<'a> {
    session: &'a Session,
    writer: StoreWriter<'a>,
    metadata: &'a MetadataDocument,
    data: &'a DataDocument,
    staged: &'a StagedArchive,
    options: ImportOptions,
    /// Entity type → archive-local id → stable identifier.
    local_uniques: BTreeMap<String, BTreeMap<u64, String>>,
    /// Entity type → stable identifier → store id.
    reverse: BTreeMap<String, BTreeMap<String, u64>>,
    report: ImportReport,
}

impl<'a> Merge<'a> {
    fn unique_field(&self, entity_type: &str) -> Option<&'a str> {
        self.metadata
            .unique_identifiers
            .get(entity_type)
            .and_then(|f| f.as_deref())
    }

    fn fields(&self, entity_type: &str) -> Result<&'a BTreeMap<String, FieldInfo>, ProvarcError> {
        self.metadata
            .all_fields_info
            .get(entity_type)
            .ok_or_else(|| ProvarcError::UnknownEntityType(entity_type.to_string()))
    }

    /// Look up stored records by stable identifier, in batches.
    fn find_stored(
        &self,
        entity_type: &str,
        identifiers: &[String],
    ) -> Result<BTreeMap<String, u64>, ProvarcError> {
        let mut found = BTreeMap::new();
        for chunk in identifiers.chunks(self.session.profile().batch_size.max(1)) {
            found.extend(self.writer.find_many_by_unique(entity_type, chunk)?);
        }
        Ok(found)
    }

    fn node_id(&self, uuid: &str) -> Option<u64> {
        self.reverse.get(NODE_TYPE).and_then(|m| m.get(uuid)).copied()
    }

    // -------------------------------------------------------------------------
    // Phase 3
    // -------------------------------------------------------------------------

    fn check_references(&mut self) -> Result<(), ProvarcError> {
        let mut referenced: BTreeSet<&str> = BTreeSet::new();
        for link in &self.data.links_uuid {
            referenced.insert(&link.input);
            referenced.insert(&link.output);
        }
        for members in self.data.groups_uuid.values() {
            referenced.extend(members.iter().map(String::as_str));
        }

        let uuid_field = self.unique_field(NODE_TYPE).unwrap_or("uuid");
        let archived: BTreeSet<&str> = self
            .data
            .export_data
            .get(NODE_TYPE)
            .into_iter()
            .flat_map(|records| records.values())
            .filter_map(|v| v.get(uuid_field).and_then(Value::as_str))
            .collect();

        let outside: Vec<String> = referenced
            .iter()
            .filter(|u| !archived.contains(*u))
            .map(|u| (*u).to_string())
            .collect();
        let stored = self.find_stored(NODE_TYPE, &outside)?;

        let missing: Vec<String> = outside
            .into_iter()
            .filter(|u| !stored.contains_key(u))
            .collect();
        self.reverse
            .entry(NODE_TYPE.to_string())
            .or_default()
            .extend(stored);

        if !missing.is_empty() {
            if !self.options.ignore_unknown_nodes {
                return Err(ProvarcError::DanglingReference { uuids: missing });
            }
            warn!(count = missing.len(), "ignoring references to unknown nodes");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 4
    // -------------------------------------------------------------------------

    fn check_schema(&self) -> Result<(), ProvarcError> {
        let registry = self.writer.registry();
        let known =
            |ty: &str| (IMPORT_ORDER.contains(&ty) || DERIVED_TYPES.contains(&ty)) && registry.contains(ty);

        for entity_type in self.metadata.all_fields_info.keys() {
            if !known(entity_type) {
                return Err(ProvarcError::UnknownEntityType(entity_type.clone()));
            }
        }
        for entity_type in self.data.export_data.keys() {
            if !IMPORT_ORDER.contains(&entity_type.as_str()) {
                return Err(ProvarcError::UnknownEntityType(entity_type.clone()));
            }
        }

        // records are matched by the store's identifier, never the archive's
        let declared_types = self.metadata.unique_identifiers.keys();
        for entity_type in declared_types.chain(self.data.export_data.keys()) {
            let expected = &registry.get(entity_type)?.unique_identifier;
            let declared = self.unique_field(entity_type);
            if declared != expected.as_deref() {
                return Err(ProvarcError::UniqueIdentifierMismatch {
                    entity_type: entity_type.clone(),
                    declared: declared.map(str::to_string),
                    expected: expected.clone(),
                });
            }
        }

        for (idx, entity_type) in IMPORT_ORDER.iter().enumerate() {
            let Some(fields) = self.metadata.all_fields_info.get(*entity_type) else {
                continue;
            };
            for info in fields.values() {
                let Some(requires) = &info.requires else {
                    continue;
                };
                if !IMPORT_ORDER[..idx].contains(&requires.as_str()) {
                    return Err(ProvarcError::DependencyOrderViolation {
                        entity_type: (*entity_type).to_string(),
                        requires: requires.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phases 5 and 6
    // -------------------------------------------------------------------------

    fn build_local_uniques(&mut self) -> Result<(), ProvarcError> {
        for (entity_type, records) in &self.data.export_data {
            let Some(field) = self.unique_field(entity_type) else {
                continue;
            };
            let mut uniques = BTreeMap::new();
            for (local, value) in records {
                let unique = value.get(field).and_then(Value::as_str).ok_or_else(|| {
                    ProvarcError::Serialization(format!(
                        "{} record {} has no {}",
                        entity_type, local, field
                    ))
                })?;
                uniques.insert(*local, unique.to_string());
            }
            self.local_uniques.insert(entity_type.clone(), uniques);
        }
        Ok(())
    }

    fn partition(&mut self) -> Result<BTreeMap<&'static str, Partition<'a>>, ProvarcError> {
        let data = self.data;
        let mut partitions = BTreeMap::new();
        for entity_type in IMPORT_ORDER {
            let Some(records) = data.export_data.get(entity_type) else {
                continue;
            };
            let uniques = self.local_uniques.get(entity_type).cloned().unwrap_or_default();
            let identifiers: Vec<String> = uniques.values().cloned().collect();
            let stored = self.find_stored(entity_type, &identifiers)?;

            let mut partition = Partition::default();
            for (local, value) in records {
                let unique = uniques.get(local).cloned().unwrap_or_default();
                match stored.get(&unique) {
                    Some(&id) => partition.existing.push((*local, id)),
                    None => partition.new.push((*local, value, unique)),
                }
            }
            debug!(
                entity_type,
                new = partition.new.len(),
                existing = partition.existing.len(),
                "partitioned records"
            );
            self.reverse
                .entry(entity_type.to_string())
                .or_default()
                .extend(stored);
            partitions.insert(entity_type, partition);
        }
        Ok(partitions)
    }

    // -------------------------------------------------------------------------
    // Phase 7
    // -------------------------------------------------------------------------

    fn remap_foreign_keys(
        &self,
        entity_type: &str,
        record: &mut Record,
        fields: &BTreeMap<String, FieldInfo>,
    ) -> Result<(), ProvarcError> {
        for (field, info) in fields {
            let Some(target) = &info.requires else {
                continue;
            };
            let local = match record.get(field) {
                None | Some(AttributeValue::Null) => continue,
                Some(value) => value.as_id().ok_or_else(|| {
                    ProvarcError::Serialization(format!(
                        "{}.{} is not a record reference: {:?}",
                        entity_type, field, value
                    ))
                })?,
            };
            let resolved = self
                .local_uniques
                .get(target)
                .and_then(|m| m.get(&local))
                .and_then(|unique| self.reverse.get(target).and_then(|r| r.get(unique)))
                .copied();
            match resolved {
                Some(id) => record.set_ref(field.clone(), Some(id)),
                None if self.options.ignore_unknown_nodes => {
                    warn!(entity_type, field = %field, local, "dropping unresolved reference");
                    record.set_ref(field.clone(), None);
                }
                None => {
                    return Err(ProvarcError::UnresolvedForeignKey {
                        entity_type: entity_type.to_string(),
                        field: field.clone(),
                        local_id: local,
                    });
                }
            }
        }
        Ok(())
    }

    fn materialize(&mut self, partitions: &BTreeMap<&'static str, Partition<'a>>) -> Result<(), ProvarcError> {
        for entity_type in IMPORT_ORDER {
            let Some(partition) = partitions.get(entity_type) else {
                continue;
            };
            self.report
                .entry(entity_type)
                .existing
                .extend(partition.existing.iter().copied());

            let fields = self.fields(entity_type)?;
            let mut records = Vec::with_capacity(partition.new.len());
            for (local, value, unique) in &partition.new {
                let mut record = deserialize_record(entity_type, value, fields)?;
                self.remap_foreign_keys(entity_type, &mut record, fields)?;
                records.push((*local, unique.as_str(), record));
            }

            let payloads = if entity_type == NODE_TYPE {
                self.locate_payloads(&records)?
            } else {
                Vec::new()
            };

            let mut inserted = Vec::with_capacity(records.len());
            for (local, unique, record) in &records {
                let id = self.writer.insert_record(entity_type, record)?;
                debug!(entity_type, unique, local, id, "inserted record");
                self.reverse
                    .entry(entity_type.to_string())
                    .or_default()
                    .insert((*unique).to_string(), id);
                self.report.entry(entity_type).new.push((*local, id));
                inserted.push((*local, id));
            }

            if entity_type == NODE_TYPE {
                for ((uuid, source), (local, id)) in payloads.iter().zip(&inserted) {
                    self.session
                        .repository()
                        .replace_subtree(uuid, source, true, true)?;
                    self.restore_attributes(*local, *id, uuid)?;
                    self.writer.set_node_state(*id, IMPORTED_STATE)?;
                }
            }
            info!(
                entity_type,
                new = inserted.len(),
                existing = partition.existing.len(),
                "stored records"
            );
        }
        Ok(())
    }

    /// Payload folder of every new node, in the order of `records`.
    fn locate_payloads(
        &self,
        records: &[(u64, &str, Record)],
    ) -> Result<Vec<(String, PathBuf)>, ProvarcError> {
        let mut payloads = Vec::with_capacity(records.len());
        for (_, uuid, _) in records {
            let source = self
                .staged
                .payload(uuid)?
                .ok_or_else(|| ProvarcError::MissingPayload {
                    uuid: (*uuid).to_string(),
                })?;
            payloads.push(((*uuid).to_string(), source));
        }
        Ok(payloads)
    }

    fn restore_attributes(&mut self, local: u64, id: u64, uuid: &str) -> Result<(), ProvarcError> {
        let values = self.data.node_attributes.get(&local).ok_or_else(|| {
            ProvarcError::Serialization(format!("no attribute set for node {}", uuid))
        })?;
        let markers = self
            .data
            .node_attributes_conversion
            .get(&local)
            .unwrap_or(&Value::Null);
        let attributes = deserialize_map(values, markers)?;
        self.writer.set_attributes(id, &attributes)
    }

    // -------------------------------------------------------------------------
    // Phases 8 and 9
    // -------------------------------------------------------------------------

    fn store_links(&mut self) -> Result<(), ProvarcError> {
        let mut queued: Vec<LinkRow> = Vec::new();
        let mut queued_labels: BTreeMap<(u64, u64), String> = BTreeMap::new();
        let mut queued_inputs: BTreeMap<(u64, String), u64> = BTreeMap::new();

        for triple in &self.data.links_uuid {
            let (Some(input), Some(output)) = (self.node_id(&triple.input), self.node_id(&triple.output))
            else {
                if self.options.ignore_unknown_nodes {
                    warn!(input = %triple.input, output = %triple.output, label = %triple.label, "dropping link to unknown node");
                    continue;
                }
                return Err(ProvarcError::UnresolvedLinkEndpoint {
                    input: triple.input.clone(),
                    output: triple.output.clone(),
                    label: triple.label.clone(),
                });
            };
            let link = LinkRow::new(input, output, triple.label.clone());

            // Against links queued by this import.
            if let Some(label) = queued_labels.get(&(input, output)) {
                if *label == link.label {
                    continue;
                }
                return Err(ProvarcError::LinkLabelConflict {
                    input,
                    output,
                    existing_label: label.clone(),
                    new_label: link.label,
                });
            }
            if let Some(&other) = queued_inputs.get(&(output, link.label.clone())) {
                return Err(ProvarcError::LinkInputConflict {
                    output,
                    label: link.label,
                    existing_input: other,
                    new_input: input,
                });
            }

            // Against stored links.
            if self.writer.classify_link(&link)? == LinkStatus::Existing {
                continue;
            }
            queued_labels.insert((input, output), link.label.clone());
            queued_inputs.insert((output, link.label.clone()), input);
            queued.push(link);
        }

        info!(count = queued.len(), "storing new links");
        for link in &queued {
            self.writer.insert_link(link)?;
            self.report.new_links.push((link.input, link.output));
        }
        Ok(())
    }

    fn store_group_members(&mut self) -> Result<(), ProvarcError> {
        for (group_uuid, members) in &self.data.groups_uuid {
            let known = self
                .reverse
                .get(GROUP_TYPE)
                .and_then(|m| m.get(group_uuid))
                .copied();
            let group = match known {
                Some(id) => id,
                None => self
                    .writer
                    .find_by_unique(GROUP_TYPE, group_uuid)?
                    .ok_or_else(|| ProvarcError::DanglingReference {
                        uuids: vec![group_uuid.clone()],
                    })?,
            };

            let mut nodes = Vec::with_capacity(members.len());
            for member in members {
                match self.node_id(member) {
                    Some(id) => nodes.push(id),
                    None if self.options.ignore_unknown_nodes => {
                        warn!(group = %group_uuid, node = %member, "dropping unknown group member");
                    }
                    None => {
                        return Err(ProvarcError::UnresolvedGroupMember {
                            group: group_uuid.clone(),
                            node: member.clone(),
                        });
                    }
                }
            }
            debug!(group = %group_uuid, members = nodes.len(), "adding group members");
            self.writer.add_group_members(group, &nodes)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 10
    // -------------------------------------------------------------------------

    fn create_import_group(
        &mut self,
        partitions: &BTreeMap<&'static str, Partition<'a>>,
    ) -> Result<(), ProvarcError> {
        let Some(partition) = partitions.get(NODE_TYPE) else {
            info!("no nodes imported, no import group created");
            return Ok(());
        };
        let mut nodes: BTreeSet<u64> = partition.existing.iter().map(|(_, id)| *id).collect();
        nodes.extend(
            partition
                .new
                .iter()
                .filter_map(|(_, _, uuid)| self.node_id(uuid)),
        );
        if nodes.is_empty() {
            info!("no nodes imported, no import group created");
            return Ok(());
        }

        let owner = match &self.session.profile().default_user_email {
            Some(email) => self.writer.find_by_unique(USER_TYPE, email)?,
            None => None,
        };
        let basename = chrono::Local::now()
            .format(IMPORT_GROUP_NAME_FORMAT)
            .to_string();
        let mut counter = 0u32;
        let name = loop {
            let candidate = if counter == 0 {
                basename.clone()
            } else {
                format!("{}_{}", basename, counter)
            };
            if self
                .writer
                .group_by_name(IMPORT_GROUP_TYPE, &candidate)?
                .is_none()
            {
                break candidate;
            }
            counter += 1;
        };

        let record = Record::new()
            .with("uuid", uuid::Uuid::new_v4().to_string())
            .with("name", name.as_str())
            .with("type_string", IMPORT_GROUP_TYPE)
            .with("time", AttributeValue::timestamp(chrono::Utc::now()))
            .with_ref("user", owner);
        let group = self.writer.insert_record(GROUP_TYPE, &record)?;
        let members: Vec<u64> = nodes.into_iter().collect();
        self.writer.add_group_members(group, &members)?;
        info!(group = %name, nodes = members.len(), "created import group");
        self.report.import_group = Some(name);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::formats::{LinkTriple, to_json};
    use crate::primitives::{EXPORT_SEEDS, NODES_SUBFOLDER};
    use crate::schema::describe_schema;
    use crate::storage::shard;
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const N1: &str = "11111111-0000-4000-8000-000000000001";
    const N2: &str = "22222222-0000-4000-8000-000000000002";
    const GHOST: &str = "99999999-0000-4000-8000-000000000009";

    struct Harness {
        temp: TempDir,
        session: Session,
    }

    impl Harness {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let session = Session::open(Profile::in_dir(&temp.path().join("dest"))).unwrap();
            Self { temp, session }
        }

        /// Write an archive tree with two nodes owned by one user.
        fn archive(&self, links: Vec<LinkTriple>, groups: BTreeMap<String, Vec<String>>) -> PathBuf {
            let root = self.temp.path().join("archive");
            let (info, uids) = describe_schema(&crate::schema::TypeRegistry::standard(), &EXPORT_SEEDS).unwrap();
            let metadata = MetadataDocument::current(info, uids);

            let mut data = DataDocument::default();
            data.export_data.insert(
                USER_TYPE.into(),
                BTreeMap::from([(5, json!({"email": "a@b.c", "first_name": "Ada"}))]),
            );
            data.export_data.insert(
                NODE_TYPE.into(),
                BTreeMap::from([
                    (7, json!({"uuid": N1, "node_type": "data.int", "user": 5, "ctime": "2015-01-02T03:04:05.000006"})),
                    (8, json!({"uuid": N2, "node_type": "calculation.job", "user": 5})),
                ]),
            );
            data.node_attributes.insert(7, json!({"value": 3, "when": "2016-01-01T00:00:00.000000"}));
            data.node_attributes_conversion.insert(7, json!({"when": "date"}));
            data.node_attributes.insert(8, json!({}));
            data.links_uuid = links;
            data.groups_uuid = groups;

            for uuid in [N1, N2] {
                let dir = root.join(NODES_SUBFOLDER).join(shard(uuid).unwrap());
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("payload.txt"), uuid).unwrap();
            }
            fs::write(root.join(METADATA_FILE), to_json(&metadata).unwrap()).unwrap();
            fs::write(root.join(DATA_FILE), to_json(&data).unwrap()).unwrap();
            root
        }

        fn import(&self, root: &Path, ignore: bool) -> Result<ImportReport, ProvarcError> {
            import_data(&self.session, root, ImportOptions {
                ignore_unknown_nodes: ignore,
            })
        }
    }

    fn triple(input: &str, output: &str, label: &str) -> LinkTriple {
        LinkTriple {
            input: input.into(),
            output: output.into(),
            label: label.into(),
        }
    }

    #[test]
    fn import_into_empty_store() {
        let h = Harness::new();
        let root = h.archive(vec![triple(N1, N2, "x")], BTreeMap::new());
        let report = h.import(&root, false).unwrap();

        assert_eq!(report.new_count(USER_TYPE), 1);
        assert_eq!(report.new_count(NODE_TYPE), 2);
        assert_eq!(report.new_links.len(), 1);
        assert!(report.import_group.is_some());

        let r = h.session.store().begin_read().unwrap();
        let user = r.find_by_unique(USER_TYPE, "a@b.c").unwrap().unwrap();
        let n1 = r.find_by_unique(NODE_TYPE, N1).unwrap().unwrap();
        let n2 = r.find_by_unique(NODE_TYPE, N2).unwrap().unwrap();
        assert_eq!(r.require_record(NODE_TYPE, n1).unwrap().reference("user"), Some(user));
        assert_eq!(r.link_label(n1, n2).unwrap().as_deref(), Some("x"));
        assert_eq!(r.node_state(n1).unwrap().as_deref(), Some(IMPORTED_STATE));
        assert!(matches!(r.attributes(n1).unwrap()["when"], AttributeValue::Timestamp(_)));

        let payload = h.session.repository().get_subtree(N2).unwrap().unwrap();
        assert_eq!(fs::read_to_string(payload.join("payload.txt")).unwrap(), N2);

        let group = r
            .group_by_name(IMPORT_GROUP_TYPE, report.import_group.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(r.group_members(group).unwrap(), vec![n1.min(n2), n1.max(n2)]);
    }

    #[test]
    fn second_import_matches_everything() {
        let h = Harness::new();
        let root = h.archive(vec![triple(N1, N2, "x")], BTreeMap::new());
        let first = h.import(&root, false).unwrap();
        let second = h.import(&root, false).unwrap();

        assert_eq!(second.new_count(NODE_TYPE), 0);
        assert_eq!(second.new_count(USER_TYPE), 0);
        assert_eq!(second.existing_count(NODE_TYPE), 2);
        assert_eq!(second.entries[NODE_TYPE].existing, first.entries[NODE_TYPE].new);
        assert!(second.new_links.is_empty());
        assert_ne!(second.import_group, first.import_group);
    }

    #[test]
    fn dangling_link_policy() {
        let h = Harness::new();
        let root = h.archive(vec![triple(GHOST, N1, "x")], BTreeMap::new());

        let err = h.import(&root, false).unwrap_err();
        assert!(matches!(err, ProvarcError::DanglingReference { ref uuids } if uuids == &[GHOST.to_string()]));
        assert_eq!(h.session.status().unwrap().records[NODE_TYPE], 0);

        let report = h.import(&root, true).unwrap();
        assert_eq!(report.new_count(NODE_TYPE), 2);
        assert!(report.new_links.is_empty());
    }

    #[test]
    fn duplicate_labels_within_one_archive_conflict() {
        let h = Harness::new();
        let root = h.archive(vec![triple(N1, N2, "x"), triple(N1, N2, "y")], BTreeMap::new());
        assert!(matches!(
            h.import(&root, false),
            Err(ProvarcError::LinkLabelConflict { .. })
        ));
        assert_eq!(h.session.status().unwrap().links, 0);
    }

    #[test]
    fn missing_payload_aborts_before_insert() {
        let h = Harness::new();
        let root = h.archive(Vec::new(), BTreeMap::new());
        fs::remove_dir_all(root.join(NODES_SUBFOLDER).join(shard(N2).unwrap())).unwrap();

        let err = h.import(&root, false).unwrap_err();
        assert!(matches!(err, ProvarcError::MissingPayload { ref uuid } if uuid == N2));
        assert_eq!(h.session.status().unwrap().records[USER_TYPE], 0);
    }

    #[test]
    fn group_members_attach_to_existing_group() {
        let h = Harness::new();
        let group_uuid = "gggggggg-0000-4000-8000-000000000000";
        {
            let mut w = h.session.store().begin_write().unwrap();
            let group = Record::new()
                .with("uuid", group_uuid)
                .with("name", "selected")
                .with("type_string", "");
            w.insert_record(GROUP_TYPE, &group).unwrap();
            w.commit().unwrap();
        }
        let root = h.archive(
            Vec::new(),
            BTreeMap::from([(group_uuid.to_string(), vec![N1.to_string()])]),
        );
        h.import(&root, false).unwrap();

        let r = h.session.store().begin_read().unwrap();
        let group = r.find_by_unique(GROUP_TYPE, group_uuid).unwrap().unwrap();
        let n1 = r.find_by_unique(NODE_TYPE, N1).unwrap().unwrap();
        assert_eq!(r.group_members(group).unwrap(), vec![n1]);
    }

    #[test]
    fn unknown_types_and_bad_order_are_schema_errors() {
        let h = Harness::new();
        let root = h.archive(Vec::new(), BTreeMap::new());
        let path = root.join(METADATA_FILE);
        let original = fs::read_to_string(&path).unwrap();

        let mut metadata: Value = serde_json::from_str(&original).unwrap();
        metadata["all_fields_info"]["spaceship"] = json!({});
        fs::write(&path, metadata.to_string()).unwrap();
        assert!(matches!(
            h.import(&root, false),
            Err(ProvarcError::UnknownEntityType(t)) if t == "spaceship"
        ));

        let mut metadata: Value = serde_json::from_str(&original).unwrap();
        metadata["all_fields_info"]["user"]["favourite"] =
            json!({"requires": "group", "related_name": "fans"});
        fs::write(&path, metadata.to_string()).unwrap();
        assert!(matches!(
            h.import(&root, false),
            Err(ProvarcError::DependencyOrderViolation { ref entity_type, ref requires })
                if entity_type == "user" && requires == "group"
        ));
    }

    #[test]
    fn archive_cannot_redefine_unique_identifiers() {
        let h = Harness::new();
        let root = h.archive(Vec::new(), BTreeMap::new());
        let path = root.join(METADATA_FILE);
        let original = fs::read_to_string(&path).unwrap();

        let mut metadata: Value = serde_json::from_str(&original).unwrap();
        metadata["unique_identifiers"]["node"] = json!("label");
        fs::write(&path, metadata.to_string()).unwrap();
        let err = h.import(&root, false).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Schema);
        assert!(matches!(
            err,
            ProvarcError::UniqueIdentifierMismatch { ref entity_type, ref declared, ref expected }
                if entity_type == "node"
                    && declared.as_deref() == Some("label")
                    && expected.as_deref() == Some("uuid")
        ));

        let mut metadata: Value = serde_json::from_str(&original).unwrap();
        metadata["unique_identifiers"]
            .as_object_mut()
            .unwrap()
            .remove("user");
        fs::write(&path, metadata.to_string()).unwrap();
        assert!(matches!(
            h.import(&root, false),
            Err(ProvarcError::UniqueIdentifierMismatch { ref entity_type, declared: None, .. })
                if entity_type == "user"
        ));

        let session = &h.session;
        assert_eq!(session.status().unwrap().records[NODE_TYPE], 0);
    }

    #[test]
    fn version_gate_runs_before_data_is_read() {
        let h = Harness::new();
        let root = h.archive(Vec::new(), BTreeMap::new());
        fs::write(root.join(METADATA_FILE), r#"{"export_version": "0.2"}"#).unwrap();
        fs::write(root.join(DATA_FILE), "not json at all").unwrap();

        assert!(matches!(
            h.import(&root, false),
            Err(ProvarcError::IncompatibleArchiveVersion { ref found, .. }) if found == "0.2"
        ));
    }
}
