//! # Payload Repository
//!
//! Per-node binary payload trees, sharded by node UUID:
//!
//! ```text
//! <root>/nodes/<uuid[0..2]>/<uuid[2..4]>/<uuid[4..]>/...
//! ```
//!
//! A subtree belongs to exactly one node. Replacing a subtree is keyed by
//! UUID only, so repeating a replacement after an aborted import converges
//! on the same state.

use crate::primitives::NODES_SUBFOLDER;
use crate::types::ProvarcError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

fn io_err(context: &Path, e: std::io::Error) -> ProvarcError {
    ProvarcError::Io(format!("{}: {}", context.display(), e))
}

/// Relative shard path of a node's payload subtree.
///
/// Identifiers must be at least five characters of ASCII letters, digits or
/// `-`; anything else could escape the repository root.
pub fn shard(uuid: &str) -> Result<PathBuf, ProvarcError> {
    let valid = uuid.len() >= 5 && uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ProvarcError::Serialization(format!(
            "invalid node identifier '{}'",
            uuid
        )));
    }
    Ok(PathBuf::from(&uuid[0..2])
        .join(&uuid[2..4])
        .join(&uuid[4..]))
}

/// Sharded repository of node payload trees.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Open (creating if needed) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProvarcError> {
        let root = root.into();
        let nodes = root.join(NODES_SUBFOLDER);
        fs::create_dir_all(&nodes).map_err(|e| io_err(&nodes, e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subtree_path(&self, uuid: &str) -> Result<PathBuf, ProvarcError> {
        Ok(self.root.join(NODES_SUBFOLDER).join(shard(uuid)?))
    }

    /// UUIDs of every node that has a payload subtree, sorted.
    pub fn list(&self) -> Result<Vec<String>, ProvarcError> {
        let nodes = self.root.join(NODES_SUBFOLDER);
        let mut out = Vec::new();
        for first in sorted_dirs(&nodes)? {
            for second in sorted_dirs(&nodes.join(&first))? {
                for rest in sorted_dirs(&nodes.join(&first).join(&second))? {
                    out.push(format!("{}{}{}", first, second, rest));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Path of a node's payload subtree, if it exists.
    pub fn get_subtree(&self, uuid: &str) -> Result<Option<PathBuf>, ProvarcError> {
        let path = self.subtree_path(uuid)?;
        Ok(path.is_dir().then_some(path))
    }

    /// Path of a node's payload subtree, created empty if missing.
    pub fn ensure_subtree(&self, uuid: &str) -> Result<PathBuf, ProvarcError> {
        let path = self.subtree_path(uuid)?;
        fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Put the tree at `source` in place as the payload of `uuid`.
    ///
    /// With `move_files` the source is renamed into place (falling back to
    /// copy and delete across filesystems). An existing subtree is replaced
    /// when `overwrite` is set and is an error otherwise.
    pub fn replace_subtree(
        &self,
        uuid: &str,
        source: &Path,
        move_files: bool,
        overwrite: bool,
    ) -> Result<PathBuf, ProvarcError> {
        let dest = self.subtree_path(uuid)?;
        if dest.exists() {
            if !overwrite {
                return Err(ProvarcError::OutputExists(dest));
            }
            fs::remove_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        if move_files && fs::rename(source, &dest).is_ok() {
            debug!(uuid, "moved payload subtree into repository");
            return Ok(dest);
        }
        copy_tree(source, &dest)?;
        if move_files {
            fs::remove_dir_all(source).map_err(|e| io_err(source, e))?;
        }
        debug!(uuid, "copied payload subtree into repository");
        Ok(dest)
    }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>, ProvarcError> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if entry.path().is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

fn walk_err(e: walkdir::Error) -> ProvarcError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    if let Some(ancestor) = e.loop_ancestor() {
        return ProvarcError::SymlinkLoop {
            path,
            ancestor: ancestor.to_path_buf(),
        };
    }
    ProvarcError::Io(format!("{}: {}", path.display(), e))
}

/// Recursively copy `source` into `dest`, following symlinks.
///
/// Links are never reproduced as links: the copy holds the content they
/// resolve to. A link back to one of its own ancestors is an error.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<(), ProvarcError> {
    fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    for entry in walk_tree(source)? {
        let to = dest.join(&entry.rel);
        if entry.is_dir {
            fs::create_dir_all(&to).map_err(|e| io_err(&to, e))?;
        } else {
            let from = source.join(&entry.rel);
            fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(())
}

/// One entry of a directory walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the walked root.
    pub rel: PathBuf,
    pub is_dir: bool,
}

/// Every directory and file under `root` (not `root` itself), sorted by
/// path so parents come before their children. Symlinks are followed.
pub fn walk_tree(root: &Path) -> Result<Vec<TreeEntry>, ProvarcError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).min_depth(1) {
        let entry = entry.map_err(walk_err)?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        out.push(TreeEntry {
            rel: rel.to_path_buf(),
            is_dir: entry.file_type().is_dir(),
        });
    }
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================
