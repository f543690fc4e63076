//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::ArchiveFormat;
use provarc_core::import::{import_staged, read_metadata};
use provarc_core::primitives::{COMPUTER_TYPE, DATA_FILE, GROUP_TYPE, NODE_TYPE};
use provarc_core::{
    DataDocument, ExportOptions, ImportOptions, LicensePolicy, Profile, ProvarcError, Selection,
    Session, StagedArchive, UreqFetcher, export, export_zip,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// PATH VALIDATION
// =============================================================================

/// Validate an input path: it must exist (file or folder).
fn validate_input_path(path: &Path) -> Result<PathBuf, ProvarcError> {
    path.canonicalize()
        .map_err(|e| ProvarcError::Io(format!("Invalid input path '{}': {}", path.display(), e)))
}

/// Validate an output path: its parent directory must exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, ProvarcError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let canonical_parent = parent.canonicalize().map_err(|e| {
        ProvarcError::Io(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;
    if !canonical_parent.is_dir() {
        return Err(ProvarcError::Io(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }
    let filename = path
        .file_name()
        .ok_or_else(|| ProvarcError::Io("Output path has no filename".to_string()))?;
    Ok(canonical_parent.join(filename))
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Initialize an empty store and repository.
pub fn cmd_init(profile: &Profile, force: bool, json_mode: bool) -> Result<(), ProvarcError> {
    if profile.database.exists() {
        if !force {
            return Err(ProvarcError::OutputExists(profile.database.clone()));
        }
        fs::remove_file(&profile.database)
            .map_err(|e| ProvarcError::Io(format!("{}: {}", profile.database.display(), e)))?;
        if profile.repository.exists() {
            fs::remove_dir_all(&profile.repository).map_err(|e| {
                ProvarcError::Io(format!("{}: {}", profile.repository.display(), e))
            })?;
        }
        info!(database = %profile.database.display(), "wiped existing store");
    }

    Session::open(profile.clone())?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": profile.database,
            "repository": profile.repository,
        }));
    } else {
        println!("Initialized new store at {:?}", profile.database);
        println!("Payload repository at  {:?}", profile.repository);
    }
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show store status.
pub fn cmd_status(profile: &Profile, json_mode: bool) -> Result<(), ProvarcError> {
    let session = Session::open(profile.clone())?;
    let status = session.status()?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": profile.database,
            "repository": profile.repository,
            "records": status.records,
            "links": status.links,
            "payloads": status.payloads,
        }));
        return Ok(());
    }

    println!("Provarc Store Status");
    println!("====================");
    println!("Database:   {:?}", profile.database);
    println!("Repository: {:?}", profile.repository);
    println!();
    for (entity_type, count) in &status.records {
        println!("{:<11} {}", format!("{}s:", entity_type), count);
    }
    println!("{:<11} {}", "links:", status.links);
    println!("{:<11} {}", "payloads:", status.payloads);
    Ok(())
}

// =============================================================================
// EXPORT COMMAND
// =============================================================================

/// What `export` was asked to write.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub nodes: Vec<String>,
    pub groups: Vec<String>,
    pub computers: Vec<String>,
    pub format: ArchiveFormat,
    pub also_parents: bool,
    pub also_calc_outputs: bool,
    pub allowed_licenses: Vec<String>,
    pub forbidden_licenses: Vec<String>,
    pub overwrite: bool,
}

impl ExportRequest {
    fn options(&self) -> ExportOptions {
        let policy = |licenses: &[String]| {
            (!licenses.is_empty()).then(|| LicensePolicy::set(licenses.iter().cloned()))
        };
        ExportOptions {
            also_parents: self.also_parents,
            also_calc_outputs: self.also_calc_outputs,
            allowed_licenses: policy(&self.allowed_licenses),
            forbidden_licenses: policy(&self.forbidden_licenses),
            overwrite: self.overwrite,
        }
    }
}

/// Resolve UUIDs to store ids. Unknown UUIDs are an error.
fn build_selection(session: &Session, request: &ExportRequest) -> Result<Selection, ProvarcError> {
    let reader = session.store().begin_read()?;
    let mut selection = Selection::new();
    let mut missing = Vec::new();
    for (entity_type, uuids) in [
        (NODE_TYPE, &request.nodes),
        (GROUP_TYPE, &request.groups),
        (COMPUTER_TYPE, &request.computers),
    ] {
        for uuid in uuids {
            match reader.find_by_unique(entity_type, uuid)? {
                Some(id) => selection.add(entity_type, id),
                None => missing.push(uuid.clone()),
            }
        }
    }
    if !missing.is_empty() {
        return Err(ProvarcError::DanglingReference { uuids: missing });
    }
    Ok(selection)
}

/// Export the requested records.
pub fn cmd_export(
    profile: &Profile,
    output: &Path,
    request: ExportRequest,
    json_mode: bool,
) -> Result<(), ProvarcError> {
    let validated_output = validate_output_path(output)?;
    let session = Session::open(profile.clone())?;
    let selection = build_selection(&session, &request)?;
    let options = request.options();

    let summary = match request.format {
        ArchiveFormat::Tar => export(&session, &selection, &validated_output, &options)?,
        ArchiveFormat::Zip => export_zip(&session, &selection, &validated_output, &options)?,
    };

    if json_mode {
        print_json(&summary);
        return Ok(());
    }
    if summary.is_empty() {
        println!("Nothing to export");
        return Ok(());
    }
    println!("Exported to {:?}", validated_output);
    for (entity_type, count) in &summary.records {
        println!("  {:<10} {}", entity_type, count);
    }
    println!("  {:<10} {}", "links", summary.links);
    println!("  {:<10} {}", "groups", summary.groups);
    Ok(())
}

// =============================================================================
// IMPORT COMMAND
// =============================================================================

/// Merge an archive into the store.
pub fn cmd_import(
    profile: &Profile,
    input: &Path,
    ignore_unknown_nodes: bool,
    json_mode: bool,
) -> Result<(), ProvarcError> {
    let validated_input = validate_input_path(input)?;
    let session = Session::open(profile.clone())?;
    let staged = StagedArchive::stage(
        &validated_input,
        profile.scratch_dir.as_deref(),
        &UreqFetcher,
    )?;
    let report = import_staged(&session, &staged, ImportOptions {
        ignore_unknown_nodes,
    })?;

    if json_mode {
        print_json(&report);
        return Ok(());
    }
    println!("Imported {:?} ({:?})", validated_input, staged.kind());
    for (entity_type, entries) in &report.entries {
        println!(
            "  {:<10} {} new, {} existing",
            entity_type,
            entries.new.len(),
            entries.existing.len()
        );
    }
    println!("  {:<10} {} new", "links", report.new_links.len());
    if let Some(group) = &report.import_group {
        println!("Import group: {}", group);
    }
    Ok(())
}

// =============================================================================
// INSPECT COMMAND
// =============================================================================

/// What an archive holds.
#[derive(Debug, Serialize)]
struct ArchiveSummary {
    export_version: String,
    provarc_version: String,
    records: BTreeMap<String, usize>,
    links: usize,
    groups: usize,
}

/// Show an archive's metadata and counts.
pub fn cmd_inspect(profile: &Profile, input: &Path, json_mode: bool) -> Result<(), ProvarcError> {
    let validated_input = validate_input_path(input)?;
    let staged = StagedArchive::stage(
        &validated_input,
        profile.scratch_dir.as_deref(),
        &UreqFetcher,
    )?;
    let metadata = read_metadata(&staged)?;
    let data = DataDocument::parse(&staged.read_text(DATA_FILE)?)?;

    let summary = ArchiveSummary {
        export_version: metadata.export_version,
        provarc_version: metadata.provarc_version,
        records: data
            .export_data
            .iter()
            .map(|(entity_type, records)| (entity_type.clone(), records.len()))
            .collect(),
        links: data.links_uuid.len(),
        groups: data.groups_uuid.len(),
    };

    if json_mode {
        print_json(&summary);
        return Ok(());
    }
    println!("Archive {:?} ({:?})", validated_input, staged.kind());
    println!("Format version:   {}", summary.export_version);
    println!("Written by:       provarc {}", summary.provarc_version);
    for (entity_type, count) in &summary.records {
        println!("  {:<10} {}", entity_type, count);
    }
    println!("  {:<10} {}", "links", summary.links);
    println!("  {:<10} {}", "groups", summary.groups);
    Ok(())
}
