//! # Archive Extraction
//!
//! Detects the shape of an input archive and unpacks the members an import
//! needs (`metadata.json`, `data.json`, `nodes/`) into a staging folder.
//!
//! Detection order: directory, tar (plain or gzip, by magic bytes), zip (by
//! magic bytes), then a `.cif` extension. Members that are not regular files
//! or directories (links, devices, fifos) are skipped with a warning. Paths
//! that would escape the staging folder are rejected.

use crate::primitives::{DATA_FILE, METADATA_FILE, NODES_SUBFOLDER};
use crate::storage::copy_tree;
use crate::types::ProvarcError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::{debug, warn};
use zip::ZipArchive;

/// The container shapes an import accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Directory,
    Tar { gzip: bool },
    Zip,
    Cif,
}

fn unrecognized(path: &Path, e: impl std::fmt::Display) -> ProvarcError {
    ProvarcError::UnrecognizedArchiveFormat(format!("{}: {}", path.display(), e))
}

fn io_err(path: &Path, e: io::Error) -> ProvarcError {
    ProvarcError::Io(format!("{}: {}", path.display(), e))
}

/// Work out what kind of archive `path` is.
pub fn detect(path: &Path) -> Result<ArchiveKind, ProvarcError> {
    if path.is_dir() {
        return Ok(ArchiveKind::Directory);
    }
    let mut head = Vec::with_capacity(512);
    File::open(path)
        .map_err(|e| io_err(path, e))?
        .take(512)
        .read_to_end(&mut head)
        .map_err(|e| io_err(path, e))?;

    if head.starts_with(&[0x1f, 0x8b]) {
        return Ok(ArchiveKind::Tar { gzip: true });
    }
    if head.starts_with(b"BZh") {
        return Err(unrecognized(path, "bzip2-compressed archives are not supported"));
    }
    if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        return Err(unrecognized(path, "xz-compressed archives are not supported"));
    }
    if head.get(257..262) == Some(b"ustar".as_slice()) {
        return Ok(ArchiveKind::Tar { gzip: false });
    }
    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        return Ok(ArchiveKind::Zip);
    }
    let is_cif = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cif"));
    if is_cif {
        return Ok(ArchiveKind::Cif);
    }
    Err(unrecognized(path, "not a directory, tar, zip or CIF file"))
}

/// Normalize a member path, refusing anything that could leave the root.
#[must_use]
pub fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Whether an import needs this member.
fn wanted(rel: &Path) -> bool {
    rel == Path::new(METADATA_FILE)
        || rel == Path::new(DATA_FILE)
        || rel.starts_with(NODES_SUBFOLDER)
}

fn write_member(dest: &Path, rel: &Path, reader: &mut dyn Read) -> Result<(), ProvarcError> {
    let target = dest.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut out = File::create(&target).map_err(|e| io_err(&target, e))?;
    io::copy(reader, &mut out).map_err(|e| io_err(&target, e))?;
    Ok(())
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// Copy the archive members of a directory tree into `dest`.
pub fn extract_tree(source: &Path, dest: &Path) -> Result<(), ProvarcError> {
    for name in [METADATA_FILE, DATA_FILE] {
        let from = source.join(name);
        if from.is_file() {
            fs::copy(&from, dest.join(name)).map_err(|e| io_err(&from, e))?;
        }
    }
    let nodes = source.join(NODES_SUBFOLDER);
    if nodes.is_dir() {
        copy_tree(&nodes, &dest.join(NODES_SUBFOLDER))?;
    }
    Ok(())
}

// =============================================================================
// TAR
// =============================================================================

/// Unpack a tar archive, optionally gzip-compressed, into `dest`.
pub fn extract_tar(path: &Path, dest: &Path, gzip: bool) -> Result<(), ProvarcError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    if gzip {
        unpack_tar(path, GzDecoder::new(file), dest)
    } else {
        unpack_tar(path, file, dest)
    }
}

fn unpack_tar<R: Read>(path: &Path, reader: R, dest: &Path) -> Result<(), ProvarcError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(|e| unrecognized(path, e))? {
        let mut entry = entry.map_err(|e| unrecognized(path, e))?;
        let raw = entry
            .path()
            .map_err(|e| unrecognized(path, e))?
            .into_owned();
        let rel = sanitize(&raw)
            .ok_or_else(|| unrecognized(path, format!("unsafe member path {}", raw.display())))?;
        if !wanted(&rel) {
            debug!(member = %rel.display(), "ignoring archive member");
            continue;
        }
        match entry.header().entry_type() {
            EntryType::Directory => {
                let target = dest.join(&rel);
                fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                write_member(dest, &rel, &mut entry)?;
            }
            other => {
                warn!(
                    member = %rel.display(),
                    kind = ?other,
                    "skipping archive member that is not a regular file or directory"
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// ZIP
// =============================================================================

const UNIX_FILE_TYPE_MASK: u32 = 0o170_000;
const UNIX_SYMLINK: u32 = 0o120_000;

/// Unpack a zip archive into `dest`.
pub fn extract_zip(path: &Path, dest: &Path) -> Result<(), ProvarcError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| unrecognized(path, e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| unrecognized(path, e))?;
        let rel = entry
            .enclosed_name()
            .and_then(sanitize)
            .ok_or_else(|| unrecognized(path, format!("unsafe member path {}", entry.name())))?;
        if !wanted(&rel) {
            debug!(member = %rel.display(), "ignoring archive member");
            continue;
        }
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & UNIX_FILE_TYPE_MASK == UNIX_SYMLINK)
        {
            warn!(member = %rel.display(), "skipping symbolic link in archive");
            continue;
        }
        if entry.is_dir() {
            let target = dest.join(&rel);
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
        } else {
            write_member(dest, &rel, &mut entry)?;
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
