//! Version fingerprints and physical naming of pre-aggregation tables.
//!
//! A build is identified by its fingerprint: a structure version (what the
//! table looks like) and a content version (which data it holds). Both are
//! short content-addressed hashes from [`version()`], and together with the
//! logical table name they determine the physical table name.

pub mod error;
mod hash;
mod naming;

pub use crate::hash::{VERSION_LEN, content_version, structure_version, version};
pub use crate::naming::{
    MAX_IDENTIFIER_LEN, NamingVersion, ParsedName, VersionEntry, parse_table_name, tables_to_version_entries,
    target_table_name,
};
