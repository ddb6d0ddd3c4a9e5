//! SQLite registry of pre-aggregation builds.
//!
//! The registry is not the source of truth: the physical tables in the
//! target storage are. It remembers when each table was built and which
//! tables are in use, so the pipeline can order generations and decide which
//! old ones are safe to drop. A lost registry is rebuilt from schema listings
//! (with unknown build times).
//!
//! # Architecture
//! - **Version entries**: one per physical table, keyed by logical table name
//!   and fingerprint.
//! - **Leases**: "used" and "touched" marks on physical table names, each with
//!   an expiry.

mod db;
pub mod error;
mod models;
mod registry;

pub use crate::db::Database;
pub use crate::models::LeaseKind;
pub use crate::registry::Registry;
