//! # Formats
//!
//! What goes inside an archive: the attribute codec and the two JSON
//! documents. Container handling lives in [`crate::archive`].

pub mod attributes;
pub mod documents;

pub use attributes::{
    FLOAT_CONVERSION, TIMESTAMP_FORMAT, deserialize_map, deserialize_plain, deserialize_record,
    deserialize_value, serialize_map, serialize_record, serialize_value,
};
pub use documents::{DataDocument, LinkTriple, MetadataDocument, to_json};
