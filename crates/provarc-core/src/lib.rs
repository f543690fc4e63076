//! # provarc-core
//!
//! The archive engine for provarc: moves a provenance subgraph from one
//! record store to another through a portable archive.
//!
//! ## Layout
//!
//! - `schema`: entity type registry and archive field info
//! - `formats`: attribute codec, `metadata.json` and `data.json`
//! - `storage`: redb record store and the sharded payload repository
//! - `archive`: folder, tar, zip and CIF containers
//! - `closure`, `license`, `export`, `import`: the algorithm
//!
//! ## Architectural Constraints
//!
//! - Synchronous, single-writer: an import is one redb write transaction
//! - Deterministic: everything that reaches an archive is ordered
//! - Closed: entity types come from the registry, never from archive data

// =============================================================================
// MODULES
// =============================================================================

pub mod archive;
pub mod closure;
pub mod config;
pub mod export;
pub mod formats;
pub mod import;
pub mod license;
pub mod primitives;
pub mod schema;
pub mod session;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    AttributeMap, AttributeValue, ErrorKind, LicenseRule, LinkRow, ProvarcError, Record,
};

// =============================================================================
// RE-EXPORTS: Schema and Formats
// =============================================================================

pub use formats::{DataDocument, LinkTriple, MetadataDocument};
pub use schema::{FieldInfo, FieldsInfo, TypeRegistry, UniqueIdentifiers, describe_schema};

// =============================================================================
// RE-EXPORTS: Storage and Session
// =============================================================================

pub use config::Profile;
pub use session::{Session, StoreStatus};
pub use storage::{Repository, Store};

// =============================================================================
// RE-EXPORTS: Export and Import
// =============================================================================

pub use archive::{ArchiveKind, RemoteFetcher, StagedArchive, UreqFetcher};
pub use closure::{ExpansionPolicy, Selection};
pub use export::{ExportOptions, ExportSummary, export, export_tree, export_zip};
pub use import::{ImportOptions, ImportReport, ImportedEntries, import_data, import_data_with};
pub use license::LicensePolicy;
