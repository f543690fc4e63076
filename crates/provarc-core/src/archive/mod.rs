//! # Archive Containers
//!
//! Writing side: [`ArchiveFolder`] is the folder an export writes into, with
//! a plain directory ([`DirFolder`]) and a deflate zip ([`ZipFolder`])
//! implementation. A finished directory can be packed into a gzip tar with
//! [`pack_tar_gz`].
//!
//! Reading side: [`StagedArchive`] is an input archive unpacked into a scratch
//! folder that is removed when the value is dropped.

pub mod cif;
pub mod extract;

pub use cif::{RemoteFetcher, UreqFetcher};
pub use extract::{ArchiveKind, detect};

use crate::primitives::NODES_SUBFOLDER;
use crate::storage::{copy_tree, shard, walk_tree};
use crate::types::ProvarcError;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use tar::HeaderMode;
use tempfile::TempDir;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn io_err(path: &Path, e: io::Error) -> ProvarcError {
    ProvarcError::Io(format!("{}: {}", path.display(), e))
}

/// Member name inside an archive: `/`-separated, whatever the platform.
fn member_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// WRITING
// =============================================================================

/// A folder an export writes into.
pub trait ArchiveFolder {
    /// Write a text file at `name` (relative to the archive root).
    fn write_text(&mut self, name: &str, text: &str) -> Result<(), ProvarcError>;

    /// Copy the tree at `source` to `dest` (relative to the archive root).
    ///
    /// Symlinks are stored as the content they resolve to.
    fn insert_tree(&mut self, dest: &Path, source: &Path) -> Result<(), ProvarcError>;
}

/// An archive that is a plain directory.
#[derive(Debug, Clone)]
pub struct DirFolder {
    root: PathBuf,
}

impl DirFolder {
    /// Use `root` (created if missing) as the archive root.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, ProvarcError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArchiveFolder for DirFolder {
    fn write_text(&mut self, name: &str, text: &str) -> Result<(), ProvarcError> {
        let path = self.root.join(name);
        fs::write(&path, text).map_err(|e| io_err(&path, e))
    }

    fn insert_tree(&mut self, dest: &Path, source: &Path) -> Result<(), ProvarcError> {
        copy_tree(source, &self.root.join(dest))
    }
}

/// An archive written straight into a zip stream.
pub struct ZipFolder<W: Write + Seek> {
    writer: ZipWriter<W>,
    options: FileOptions,
}

impl<W: Write + Seek> ZipFolder<W> {
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self {
            writer: ZipWriter::new(inner),
            options: FileOptions::default().compression_method(CompressionMethod::Deflated),
        }
    }

    /// Write the central directory and hand back the underlying stream.
    pub fn finish(mut self) -> Result<W, ProvarcError> {
        self.writer
            .finish()
            .map_err(|e| ProvarcError::Io(format!("finalizing zip: {}", e)))
    }
}

impl<W: Write + Seek> ArchiveFolder for ZipFolder<W> {
    fn write_text(&mut self, name: &str, text: &str) -> Result<(), ProvarcError> {
        self.writer
            .start_file(name, self.options)
            .map_err(|e| ProvarcError::Io(format!("{}: {}", name, e)))?;
        self.writer
            .write_all(text.as_bytes())
            .map_err(|e| ProvarcError::Io(format!("{}: {}", name, e)))
    }

    fn insert_tree(&mut self, dest: &Path, source: &Path) -> Result<(), ProvarcError> {
        let base = member_name(dest);
        self.writer
            .add_directory(format!("{}/", base), self.options)
            .map_err(|e| ProvarcError::Io(format!("{}: {}", base, e)))?;
        for entry in walk_tree(source)? {
            let name = format!("{}/{}", base, member_name(&entry.rel));
            if entry.is_dir {
                self.writer
                    .add_directory(format!("{}/", name), self.options)
                    .map_err(|e| ProvarcError::Io(format!("{}: {}", name, e)))?;
                continue;
            }
            let full = source.join(&entry.rel);
            let mut file = File::open(&full).map_err(|e| io_err(&full, e))?;
            self.writer
                .start_file(name.as_str(), self.options)
                .map_err(|e| ProvarcError::Io(format!("{}: {}", name, e)))?;
            io::copy(&mut file, &mut self.writer).map_err(|e| io_err(&full, e))?;
        }
        Ok(())
    }
}

/// Longest fallback name written into a ustar header when the real path is
/// carried by a PAX record.
const USTAR_FALLBACK_LEN: usize = 90;

fn ustar_fallback(name: &str) -> String {
    let tail = name.rsplit('/').next().unwrap_or(name);
    let mut out = String::new();
    for c in tail.chars() {
        if out.len() + c.len_utf8() > USTAR_FALLBACK_LEN {
            break;
        }
        out.push(c);
    }
    out
}

/// Pack the directory `source` into a gzip-compressed tar at `dest`.
///
/// Headers are ustar with deterministic metadata; paths too long for ustar
/// are carried in a PAX `path` record. Symlinks are stored as the content
/// they resolve to.
pub fn pack_tar_gz(source: &Path, dest: &Path) -> Result<(), ProvarcError> {
    let file = File::create(dest).map_err(|e| io_err(dest, e))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for entry in walk_tree(source)? {
        let full = source.join(&entry.rel);
        let meta = fs::metadata(&full).map_err(|e| io_err(&full, e))?;
        let name = member_name(&entry.rel);

        let mut header = tar::Header::new_ustar();
        header.set_metadata_in_mode(&meta, HeaderMode::Deterministic);
        if header.set_path(&name).is_err() {
            builder
                .append_pax_extensions([("path", name.as_bytes())])
                .map_err(|e| io_err(dest, e))?;
            header
                .set_path(ustar_fallback(&name))
                .map_err(|e| io_err(dest, e))?;
        }
        header.set_cksum();

        if entry.is_dir {
            builder
                .append(&header, io::empty())
                .map_err(|e| io_err(dest, e))?;
        } else {
            let file = File::open(&full).map_err(|e| io_err(&full, e))?;
            builder.append(&header, file).map_err(|e| io_err(dest, e))?;
        }
    }

    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(|e| io_err(dest, e))?;
    Ok(())
}

// =============================================================================
// READING
// =============================================================================

/// An input archive unpacked into a scratch folder.
///
/// The scratch folder is removed on drop, on success and failure alike.
#[derive(Debug)]
pub struct StagedArchive {
    scratch: TempDir,
    kind: ArchiveKind,
}

impl StagedArchive {
    /// Detect the shape of `path` and unpack it under `scratch_parent` (or the
    /// system temporary folder).
    pub fn stage(
        path: &Path,
        scratch_parent: Option<&Path>,
        fetcher: &dyn RemoteFetcher,
    ) -> Result<Self, ProvarcError> {
        let kind = detect(path)?;
        let mut builder = tempfile::Builder::new();
        builder.prefix("provarc-import-");
        let scratch = match scratch_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| ProvarcError::Io(format!("creating scratch folder: {}", e)))?;

        info!(input = %path.display(), ?kind, "staging archive");
        match kind {
            ArchiveKind::Directory => extract::extract_tree(path, scratch.path())?,
            ArchiveKind::Tar { gzip } => extract::extract_tar(path, scratch.path(), gzip)?,
            ArchiveKind::Zip => extract::extract_zip(path, scratch.path())?,
            ArchiveKind::Cif => cif::extract_cif(path, scratch.path(), fetcher)?,
        }
        Ok(Self { scratch, kind })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.scratch.path()
    }

    #[must_use]
    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Read a text member.
    pub fn read_text(&self, name: &str) -> Result<String, ProvarcError> {
        let path = self.root().join(name);
        if !path.is_file() {
            return Err(ProvarcError::MissingArchiveMember(name.to_string()));
        }
        fs::read_to_string(&path).map_err(|e| io_err(&path, e))
    }

    /// Names of every member below `prefix`, `/`-separated, sorted.
    pub fn members_under(&self, prefix: &str) -> Result<Vec<String>, ProvarcError> {
        let base = self.root().join(prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        Ok(walk_tree(&base)?
            .into_iter()
            .map(|e| format!("{}/{}", prefix.trim_end_matches('/'), member_name(&e.rel)))
            .collect())
    }

    /// Payload folder of a node, if the archive holds one.
    pub fn payload(&self, uuid: &str) -> Result<Option<PathBuf>, ProvarcError> {
        let path = self.root().join(NODES_SUBFOLDER).join(shard(uuid)?);
        debug!(uuid, present = path.is_dir(), "looking up payload in archive");
        Ok(path.is_dir().then_some(path))
    }
}

// =============================================================================
// TESTS
// =============================================================================
