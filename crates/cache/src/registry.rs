//! Bookkeeping of built tables and the leases that keep them alive.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{EntryRow, LeaseKind, to_millis};
use exn::ResultExt;
use preagg_version::VersionEntry;
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Registry of pre-aggregation builds.
///
/// Stores the [`VersionEntry`] of every physical table a build produced and
/// time-limited leases marking tables as "used" (readers depend on them) or
/// "touched" (recently requested). Orphan collection consults the leases
/// before dropping anything.
///
/// All expiry checks take `now` explicitly; the registry never reads the
/// clock itself.
#[derive(Debug, Clone)]
pub struct Registry {
    pool: SqlitePool,
}
impl From<&Database> for Registry {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Version entries
    // =========================================================================

    /// Record a finished build, replacing the entry of a previous build with
    /// the same fingerprint.
    pub async fn record(&self, entry: &VersionEntry) -> Result<()> {
        let row = EntryRow::try_from(entry)?;
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(row.table_name)
            .bind(row.structure_version)
            .bind(row.content_version)
            .bind(row.naming_version)
            .bind(row.last_updated_at)
            .bind(row.build_range_end)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn entry(
        &self,
        table_name: impl AsRef<str>,
        structure_version: impl AsRef<str>,
        content_version: impl AsRef<str>,
    ) -> Result<Option<VersionEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_entry.sql"))
            .bind(table_name.as_ref())
            .bind(structure_version.as_ref())
            .bind(content_version.as_ref())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(VersionEntry::try_from).transpose()
    }

    /// Every recorded build of a logical table, newest first.
    pub async fn entries_for(&self, table_name: impl AsRef<str>) -> Result<Vec<VersionEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/list_entries_for_table.sql"))
            .bind(table_name.as_ref())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(VersionEntry::try_from).collect()
    }

    /// Forget a build whose physical table was dropped, along with its leases.
    ///
    /// Returns `true` if an entry was removed.
    pub async fn forget(&self, entry: &VersionEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let deleted = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(&entry.table_name)
            .bind(&entry.structure_version)
            .bind(&entry.content_version)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/delete_leases_for_table.sql"))
            .bind(entry.target_table_name())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(deleted.rows_affected() > 0)
    }

    // =========================================================================
    // Leases
    // =========================================================================

    async fn lease(&self, physical_name: &str, kind: LeaseKind, until: OffsetDateTime) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_lease.sql"))
            .bind(physical_name)
            .bind(kind.as_db_str())
            .bind(to_millis(until)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Mark a physical table as queried by readers until `until`.
    ///
    /// Leases only ever get extended; an earlier `until` is ignored.
    pub async fn mark_used(&self, physical_name: impl AsRef<str>, until: OffsetDateTime) -> Result<()> {
        self.lease(physical_name.as_ref(), LeaseKind::Used, until).await
    }

    /// Mark a physical table as recently requested until `until`.
    pub async fn touch(&self, physical_name: impl AsRef<str>, until: OffsetDateTime) -> Result<()> {
        self.lease(physical_name.as_ref(), LeaseKind::Touched, until).await
    }

    async fn live(&self, kind: LeaseKind, now: OffsetDateTime) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_live_leases.sql"))
            .bind(kind.as_db_str())
            .bind(to_millis(now)?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(names)
    }

    /// Physical tables with a "used" lease still live at `now`.
    pub async fn tables_used(&self, now: OffsetDateTime) -> Result<Vec<String>> {
        self.live(LeaseKind::Used, now).await
    }

    /// Physical tables with a "touched" lease still live at `now`.
    pub async fn tables_touched(&self, now: OffsetDateTime) -> Result<Vec<String>> {
        self.live(LeaseKind::Touched, now).await
    }

    /// Delete leases that expired at or before `now`. Returns how many.
    pub async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/purge_expired_leases.sql"))
            .bind(to_millis(now)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() > 0 {
            tracing::debug!(purged = result.rows_affected(), "Purged expired table leases");
        }
        Ok(result.rows_affected())
    }
}
