//! Physical table naming.
//!
//! A physical pre-aggregation table is named after its logical table and its
//! fingerprint: `{schema}.{table}_{structure}_{content}`. The name is a pure
//! function of the [`VersionEntry`] identity, so concurrent builds of the same
//! fingerprint agree on it and a rebuild with new content never touches the
//! table readers are currently using.

use crate::error::{ErrorKind, Result};
use crate::hash::short_hash;
use std::fmt;
use time::OffsetDateTime;

/// Longest identifier most backends accept (PostgreSQL's `NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Schema-evolution tag of the physical naming scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamingVersion {
    /// `{table}_{structure}_{content}`, however long that gets.
    V1,
    /// Like [`V1`](Self::V1), but names over [`MAX_IDENTIFIER_LEN`] get their
    /// table part truncated and suffixed with a hash of the full table name.
    #[default]
    V2,
}
impl NamingVersion {
    pub const ALL: [Self; 2] = [Self::V1, Self::V2];
}
impl fmt::Display for NamingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
        }
    }
}

/// Identity of one build target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Logical table name, optionally schema-qualified.
    pub table_name: String,
    pub structure_version: String,
    pub content_version: String,
    pub last_updated_at: OffsetDateTime,
    pub naming_version: NamingVersion,
    /// End of the data range the build covered, for partitioned builds.
    pub build_range_end: Option<String>,
}
impl VersionEntry {
    pub fn new(
        table_name: impl Into<String>,
        structure_version: impl Into<String>,
        content_version: impl Into<String>,
        last_updated_at: OffsetDateTime,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            structure_version: structure_version.into(),
            content_version: content_version.into(),
            last_updated_at,
            naming_version: NamingVersion::default(),
            build_range_end: None,
        }
    }

    pub fn with_naming_version(mut self, naming_version: NamingVersion) -> Self {
        self.naming_version = naming_version;
        self
    }

    /// Physical table this entry is stored in. See [`target_table_name()`].
    pub fn target_table_name(&self) -> String {
        target_table_name(self)
    }

    /// The `(structure, content)` pair identifying the build.
    pub fn fingerprint(&self) -> (&str, &str) {
        (&self.structure_version, &self.content_version)
    }
}

fn split_schema(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> &str {
    if index >= s.len() {
        return s;
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    &s[..index]
}

/// Table part of a physical name, for a fingerprint suffix of `suffix_len`
/// bytes (`_{structure}_{content}`).
fn table_part(table: &str, suffix_len: usize, naming: NamingVersion) -> String {
    match naming {
        NamingVersion::V1 => table.to_string(),
        NamingVersion::V2 if table.len() + suffix_len <= MAX_IDENTIFIER_LEN => table.to_string(),
        NamingVersion::V2 => {
            let hash = short_hash(table.as_bytes());
            let keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix_len + 1 + hash.len());
            format!("{}_{hash}", floor_char_boundary(table, keep))
        },
    }
}

fn suffix_len(structure: &str, content: &str) -> usize {
    structure.len() + content.len() + 2
}

/// Physical table name of `entry`, qualified with the schema of its logical
/// table name if it has one.
///
/// Deterministic: equal `(table_name, structure_version, content_version,
/// naming_version)` always produce equal names. The build timestamp is not
/// part of the name.
pub fn target_table_name(entry: &VersionEntry) -> String {
    let (schema, table) = split_schema(&entry.table_name);
    let (structure, content) = entry.fingerprint();
    let part = table_part(table, suffix_len(structure, content), entry.naming_version);
    match schema {
        Some(schema) => format!("{schema}.{part}_{structure}_{content}"),
        None => format!("{part}_{structure}_{content}"),
    }
}

/// A physical table name taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub schema: Option<String>,
    /// Table part as it appears in the name (possibly truncated).
    pub table: String,
    pub structure_version: String,
    pub content_version: String,
}
impl ParsedName {
    /// Was this name produced for logical table `table_name` (without schema)
    /// by `naming`?
    pub fn is_for(&self, table_name: &str, naming: NamingVersion) -> bool {
        let suffix = suffix_len(&self.structure_version, &self.content_version);
        table_part(table_name, suffix, naming) == self.table
    }
}

/// Split a physical name into its logical table part and fingerprint.
pub fn parse_table_name(name: &str) -> Result<ParsedName> {
    let (schema, table) = split_schema(name);
    let mut parts = table.rsplitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(content), Some(structure), Some(table))
            if !content.is_empty() && !structure.is_empty() && !table.is_empty() =>
        {
            Ok(ParsedName {
                schema: schema.map(str::to_string),
                table: table.to_string(),
                structure_version: structure.to_string(),
                content_version: content.to_string(),
            })
        },
        _ => exn::bail!(ErrorKind::InvalidName(name.to_string())),
    }
}

/// Recover the generations of `table_name` from a schema listing.
///
/// `listing` holds table names without schema, as returned by a driver's
/// table listing. Names that don't belong to `table_name` are ignored.
/// Timestamps (and range ends) come from `known` entries with the same
/// fingerprint; tables nobody recorded are treated as the oldest.
///
/// Entries are sorted newest first.
pub fn tables_to_version_entries(table_name: &str, listing: &[String], known: &[VersionEntry]) -> Vec<VersionEntry> {
    let (_, logical) = split_schema(table_name);
    let mut entries: Vec<VersionEntry> = listing
        .iter()
        .filter_map(|name| parse_table_name(name).ok())
        .filter_map(|parsed| {
            let naming = NamingVersion::ALL.into_iter().rev().find(|n| parsed.is_for(logical, *n))?;
            let recorded = known.iter().find(|entry| {
                entry.table_name == table_name
                    && entry.fingerprint() == (parsed.structure_version.as_str(), parsed.content_version.as_str())
            });
            Some(VersionEntry {
                table_name: table_name.to_string(),
                structure_version: parsed.structure_version,
                content_version: parsed.content_version,
                last_updated_at: recorded.map_or(OffsetDateTime::UNIX_EPOCH, |e| e.last_updated_at),
                naming_version: naming,
                build_range_end: recorded.and_then(|e| e.build_range_end.clone()),
            })
        })
        .collect();
    entries.sort_by(|a, b| {
        b.last_updated_at
            .cmp(&a.last_updated_at)
            .then_with(|| b.content_version.cmp(&a.content_version))
    });
    entries
}
