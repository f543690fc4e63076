//! # Export Engine
//!
//! Writes a dependency-complete subgraph of the store into an archive.
//!
//! Order of work, per export:
//! 1. expand the node selection (ancestors, calculation outputs);
//! 2. run the licensing gate over the expanded nodes;
//! 3. build the foreign-key closure;
//! 4. serialize records, attribute sets, incoming links and the selected
//!    groups' memberships;
//! 5. write `metadata.json` and `data.json`;
//! 6. copy every node's payload subtree to `nodes/<shard>`.
//!
//! A link is exported when its output is exported, whether or not its input
//! is. Importing such an archive into a store that already holds the input
//! reattaches the edge.
//!
//! [`export`] and [`export_zip`] assemble the archive in a scratch location
//! and move it to the output path only once it is complete.

use crate::archive::{ArchiveFolder, DirFolder, ZipFolder, pack_tar_gz};
use crate::closure::{ClosureBuilder, ExpansionPolicy, Selection, expand_node_selection};
use crate::formats::{
    DataDocument, LinkTriple, MetadataDocument, serialize_map, serialize_record, to_json,
};
use crate::license::{LicensePolicy, check_licenses};
use crate::primitives::{DATA_FILE, EXPORT_SEEDS, GROUP_TYPE, METADATA_FILE, NODE_TYPE, NODES_SUBFOLDER};
use crate::schema::describe_schema;
use crate::session::Session;
use crate::storage::shard;
use crate::types::{ProvarcError, Record};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

// =============================================================================
// OPTIONS AND SUMMARY
// =============================================================================

/// How an export selects and filters what it writes.
#[derive(Debug)]
pub struct ExportOptions {
    /// Include every ancestor of a selected node.
    pub also_parents: bool,
    /// Include the direct outputs of selected calculation nodes.
    pub also_calc_outputs: bool,
    pub allowed_licenses: Option<LicensePolicy>,
    pub forbidden_licenses: Option<LicensePolicy>,
    /// Replace an existing output file.
    pub overwrite: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            also_parents: true,
            also_calc_outputs: true,
            allowed_licenses: None,
            forbidden_licenses: None,
            overwrite: false,
        }
    }
}

impl ExportOptions {
    fn expansion(&self) -> ExpansionPolicy {
        ExpansionPolicy {
            also_parents: self.also_parents,
            also_calc_outputs: self.also_calc_outputs,
        }
    }
}

/// What an export wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Entity type → number of exported records.
    pub records: BTreeMap<String, usize>,
    pub links: usize,
    pub groups: usize,
    pub payloads: usize,
    /// Where the archive was written, for file exports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl ExportSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.records.values().sum()
    }

    /// True when nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// =============================================================================
// EXPORT TREE
// =============================================================================

fn node_uuid(id: u64, record: &Record) -> Result<&str, ProvarcError> {
    record
        .text("uuid")
        .ok_or_else(|| ProvarcError::Storage(format!("node {} has no uuid", id)))
}

/// Export `selection` into `folder`.
///
/// Writes nothing (and returns an empty summary) when the selection holds
/// no stored record.
pub fn export_tree(
    session: &Session,
    selection: &Selection,
    folder: &mut dyn ArchiveFolder,
    options: &ExportOptions,
) -> Result<ExportSummary, ProvarcError> {
    let reader = session.store().begin_read()?;
    let (fields_info, unique_identifiers) = describe_schema(reader.registry(), &EXPORT_SEEDS)?;

    let mut seeds = selection.clone();
    let nodes = expand_node_selection(&reader, &selection.nodes(), options.expansion())?;
    check_licenses(
        &reader,
        &nodes,
        options.allowed_licenses.as_ref(),
        options.forbidden_licenses.as_ref(),
    )?;
    seeds.set(NODE_TYPE, nodes);

    let closure = ClosureBuilder::new(
        &reader,
        &fields_info,
        &seeds,
        session.profile().batch_size,
    )
    .run()?;
    if closure.is_empty() {
        info!("no records to export");
        return Ok(ExportSummary::default());
    }

    // Payloads are checked before anything is written.
    let mut payloads = Vec::new();
    for (id, record) in closure.nodes() {
        let uuid = node_uuid(id, record)?;
        let sharded = shard(uuid)?;
        let Some(source) = session.repository().get_subtree(uuid)? else {
            return Err(ProvarcError::CorruptSourceRepository {
                uuid: uuid.to_string(),
                path: session
                    .repository()
                    .root()
                    .join(NODES_SUBFOLDER)
                    .join(sharded),
            });
        };
        payloads.push((Path::new(NODES_SUBFOLDER).join(sharded), source));
    }

    let mut data = DataDocument::default();
    let mut summary = ExportSummary::default();
    for (entity_type, records) in &closure.records {
        let fields = fields_info
            .get(entity_type)
            .ok_or_else(|| ProvarcError::UnknownEntityType(entity_type.clone()))?;
        let serialized: BTreeMap<u64, Value> = records
            .iter()
            .map(|(id, record)| (*id, serialize_record(record, fields)))
            .collect();
        summary.records.insert(entity_type.clone(), serialized.len());
        data.export_data.insert(entity_type.clone(), serialized);
    }
    info!(
        records = summary.total(),
        nodes = payloads.len(),
        "serialized records"
    );

    for (id, record) in closure.nodes() {
        let (attributes, conversion) = serialize_map(&reader.attributes(id)?);
        data.node_attributes.insert(id, attributes);
        if !conversion.is_null() {
            data.node_attributes_conversion.insert(id, conversion);
        }

        let output = node_uuid(id, record)?;
        for link in reader.input_links(id)? {
            let Some(input) = reader.unique_of(NODE_TYPE, link.input)? else {
                warn!(input = link.input, output, "link input has no uuid, skipped");
                continue;
            };
            data.links_uuid.push(LinkTriple {
                input,
                output: output.to_string(),
                label: link.label,
            });
        }
    }
    data.links_uuid.sort();
    summary.links = data.links_uuid.len();

    if let Some(groups) = closure.of_type(GROUP_TYPE) {
        for &group in selection.groups().iter() {
            let Some(record) = groups.get(&group) else {
                continue;
            };
            let uuid = record
                .text("uuid")
                .ok_or_else(|| ProvarcError::Storage(format!("group {} has no uuid", group)))?;
            let mut members = Vec::new();
            for node in reader.group_members(group)? {
                if let Some(member) = reader.unique_of(NODE_TYPE, node)? {
                    members.push(member);
                }
            }
            debug!(group = uuid, members = members.len(), "exporting group members");
            data.groups_uuid.insert(uuid.to_string(), members);
        }
    }
    summary.groups = data.groups_uuid.len();

    let metadata = MetadataDocument::current(fields_info, unique_identifiers);
    folder.write_text(DATA_FILE, &to_json(&data)?)?;
    folder.write_text(METADATA_FILE, &to_json(&metadata)?)?;

    for (dest, source) in &payloads {
        folder.insert_tree(dest, source)?;
    }
    summary.payloads = payloads.len();

    info!(
        records = summary.total(),
        links = summary.links,
        groups = summary.groups,
        "export complete"
    );
    Ok(summary)
}

// =============================================================================
// FILE EXPORTS
// =============================================================================

fn io_err(path: &Path, e: std::io::Error) -> ProvarcError {
    ProvarcError::Io(format!("{}: {}", path.display(), e))
}

fn check_output(outfile: &Path, overwrite: bool) -> Result<(), ProvarcError> {
    if outfile.exists() && !overwrite {
        return Err(ProvarcError::OutputExists(outfile.to_path_buf()));
    }
    Ok(())
}

/// Temporary file next to `outfile`, so the final move is a rename.
fn staging_file(outfile: &Path) -> Result<NamedTempFile, ProvarcError> {
    let dir = match outfile.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".provarc-export-")
        .tempfile_in(dir)
        .map_err(|e| io_err(dir, e))
}

fn persist(staged: NamedTempFile, outfile: &Path) -> Result<(), ProvarcError> {
    staged
        .persist(outfile)
        .map(|_| ())
        .map_err(|e| io_err(outfile, e.error))
}

fn scratch_dir(session: &Session) -> Result<TempDir, ProvarcError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("provarc-export-");
    match &session.profile().scratch_dir {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
    .map_err(|e| ProvarcError::Io(format!("creating scratch folder: {}", e)))
}

/// Export `selection` to a gzip-compressed tar at `outfile`.
///
/// No file is created when nothing is exported.
pub fn export(
    session: &Session,
    selection: &Selection,
    outfile: &Path,
    options: &ExportOptions,
) -> Result<ExportSummary, ProvarcError> {
    check_output(outfile, options.overwrite)?;
    let scratch = scratch_dir(session)?;
    let mut folder = DirFolder::create(scratch.path().join("archive"))?;

    let mut summary = export_tree(session, selection, &mut folder, options)?;
    if summary.is_empty() {
        return Ok(summary);
    }

    let staged = staging_file(outfile)?;
    pack_tar_gz(folder.root(), staged.path())?;
    persist(staged, outfile)?;
    info!(output = %outfile.display(), "archive written");
    summary.output = Some(outfile.to_path_buf());
    Ok(summary)
}

/// Export `selection` to a deflate zip at `outfile`.
///
/// No file is created when nothing is exported.
pub fn export_zip(
    session: &Session,
    selection: &Selection,
    outfile: &Path,
    options: &ExportOptions,
) -> Result<ExportSummary, ProvarcError> {
    check_output(outfile, options.overwrite)?;
    let mut staged = staging_file(outfile)?;

    let mut summary = {
        let file: &mut File = staged.as_file_mut();
        let mut folder = ZipFolder::new(file);
        let summary = export_tree(session, selection, &mut folder, options)?;
        folder.finish()?;
        summary
    };
    if summary.is_empty() {
        return Ok(summary);
    }

    persist(staged, outfile)?;
    info!(output = %outfile.display(), "archive written");
    summary.output = Some(outfile.to_path_buf());
    Ok(summary)
}

// =============================================================================
// TESTS
// =============================================================================
