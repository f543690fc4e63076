//! # Storage
//!
//! The two halves of a provarc store: structured records in redb and binary
//! payload trees on disk.

pub mod redb_store;
pub mod repository;

pub use redb_store::{LinkStatus, Store, StoreReader, StoreTxn, StoreWriter, TableSource};
pub use repository::{Repository, TreeEntry, copy_tree, shard, walk_tree};
