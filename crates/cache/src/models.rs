use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use preagg_version::{NamingVersion, VersionEntry};
use time::OffsetDateTime;

const NANOS_PER_MILLI: i128 = 1_000_000;

pub(crate) fn to_millis(at: OffsetDateTime) -> Result<i64> {
    i64::try_from(at.unix_timestamp_nanos() / NANOS_PER_MILLI).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_millis(millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * NANOS_PER_MILLI)
        .or_raise(|| ErrorKind::InvalidData("timestamp"))
}

fn naming_to_db(naming: NamingVersion) -> i64 {
    match naming {
        NamingVersion::V1 => 1,
        NamingVersion::V2 => 2,
    }
}

fn naming_from_db(value: i64) -> Result<NamingVersion> {
    match value {
        1 => Ok(NamingVersion::V1),
        2 => Ok(NamingVersion::V2),
        _ => exn::bail!(ErrorKind::InvalidData("naming version")),
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) table_name: String,
    pub(crate) structure_version: String,
    pub(crate) content_version: String,
    pub(crate) naming_version: i64,
    pub(crate) last_updated_at: i64,
    #[sqlx(default)]
    pub(crate) build_range_end: Option<String>,
}
impl TryFrom<&VersionEntry> for EntryRow {
    type Error = Error;
    fn try_from(entry: &VersionEntry) -> Result<Self> {
        Ok(Self {
            table_name: entry.table_name.clone(),
            structure_version: entry.structure_version.clone(),
            content_version: entry.content_version.clone(),
            naming_version: naming_to_db(entry.naming_version),
            last_updated_at: to_millis(entry.last_updated_at)?,
            build_range_end: entry.build_range_end.clone(),
        })
    }
}
impl TryFrom<EntryRow> for VersionEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(Self {
            table_name: row.table_name,
            structure_version: row.structure_version,
            content_version: row.content_version,
            last_updated_at: from_millis(row.last_updated_at)?,
            naming_version: naming_from_db(row.naming_version)?,
            build_range_end: row.build_range_end,
        })
    }
}

/// What a table lease protects the table for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    /// Readers are querying the table.
    Used,
    /// The table was recently requested (served or built).
    Touched,
}
impl LeaseKind {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            Self::Used => "used",
            Self::Touched => "touched",
        }
    }
}
