//! # Fixed Constants
//!
//! Constants shared by the exporter and the importer.
//!
//! These values define the archive layout and the naming rules for
//! bookkeeping state. They are compiled in and never read from an archive.

/// Archive format version written by the exporter.
///
/// The importer accepts exactly this version and nothing else.
pub const EXPORT_VERSION: &str = "0.1";

/// Producer version string recorded in every metadata document.
pub const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the metadata document at the archive root.
pub const METADATA_FILE: &str = "metadata.json";

/// Name of the data document at the archive root.
pub const DATA_FILE: &str = "data.json";

/// Archive subfolder holding one sharded payload directory per node.
pub const NODES_SUBFOLDER: &str = "nodes";

/// Maximum number of identifiers in a single "identifier in set" lookup.
pub const DEFAULT_BATCH_SIZE: usize = 999;

// =============================================================================
// ENTITY TYPE TAGS
// =============================================================================

pub const USER_TYPE: &str = "user";
pub const COMPUTER_TYPE: &str = "computer";
pub const NODE_TYPE: &str = "node";
pub const GROUP_TYPE: &str = "group";
pub const LINK_TYPE: &str = "link";
pub const ATTRIBUTE_TYPE: &str = "attribute";

/// Load order for independently addressable entity types.
///
/// Link and attribute records are derived and handled outside this list.
pub const IMPORT_ORDER: [&str; 4] = [USER_TYPE, COMPUTER_TYPE, NODE_TYPE, GROUP_TYPE];

/// Types whose field info is described first when building an export.
pub const EXPORT_SEEDS: [&str; 4] = [NODE_TYPE, ATTRIBUTE_TYPE, LINK_TYPE, GROUP_TYPE];

// =============================================================================
// BOOKKEEPING
// =============================================================================

/// Node types beginning with this prefix are treated as calculations.
pub const CALCULATION_TYPE_PREFIX: &str = "calculation.";

/// State tag attached to every node created by an import.
pub const IMPORTED_STATE: &str = "IMPORTED";

/// Type tag of the group created to record which nodes one import touched.
pub const IMPORT_GROUP_TYPE: &str = "provarc.import";

/// `chrono` format for bookkeeping group names (local time).
pub const IMPORT_GROUP_NAME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Attribute path holding a node's declared license.
pub const LICENSE_ATTRIBUTE_PATH: &str = "source.license";

/// Prefix of the files embedded in a CIF container that form the archive.
pub const CIF_EMBEDDED_PREFIX: &str = "aiida/";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::schema::TypeRegistry;

    #[test]
    fn import_order_loads_referenced_types_first() {
        let registry = TypeRegistry::standard();
        for (position, entity_type) in IMPORT_ORDER.iter().enumerate() {
            let descriptor = registry.get(entity_type).unwrap();
            assert!(descriptor.unique_identifier.is_some(), "{entity_type} is derived");
            for (field, target) in descriptor.foreign_keys() {
                let loaded_before = IMPORT_ORDER[..position].contains(&target);
                assert!(loaded_before, "{entity_type}.{field} needs {target} loaded first");
            }
        }
    }

    #[test]
    fn export_seeds_are_registered() {
        let registry = TypeRegistry::standard();
        for entity_type in EXPORT_SEEDS {
            assert!(registry.contains(entity_type), "{entity_type}");
        }
        // derived types never reach the load order
        for derived in [LINK_TYPE, ATTRIBUTE_TYPE] {
            assert!(registry.get(derived).unwrap().unique_identifier.is_none());
            assert!(!IMPORT_ORDER.contains(&derived));
        }
    }
}
