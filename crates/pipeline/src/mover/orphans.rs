//! Dropping generations of a table nobody needs anymore.

use crate::error::{ErrorKind, Result};
use preagg_asyncutils::CancelToken;
use preagg_cache::Registry;
use preagg_config::RefreshConfig;
use preagg_driver::DriverHandle;
use preagg_version::{VersionEntry, tables_to_version_entries};
use std::collections::HashSet;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionOptions {
    /// How long superseded generations of one structure stay around.
    pub structure_version_persist_time: Duration,
    /// Keep only leased tables (and the one just built).
    pub drop_without_touch: bool,
}
impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            structure_version_persist_time: Duration::from_secs(24 * 3600),
            drop_without_touch: false,
        }
    }
}
impl From<&RefreshConfig> for RetentionOptions {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            structure_version_persist_time: config.structure_version_persist_time.get(),
            drop_without_touch: config.drop_without_touch,
        }
    }
}

/// Tables that survive collection whatever their age.
#[derive(Debug, Default)]
struct Protected {
    used: Vec<String>,
    touched: Vec<String>,
    /// Builds into the target that haven't finished yet.
    building: Vec<String>,
}

/// Physical names of the generations in `entries` (newest first) to keep.
///
/// `known` holds the registry's entries of the table. A listed table without
/// one but with a live touched lease is being built elsewhere.
fn tables_to_keep(
    entries: &[VersionEntry],
    known: &[VersionEntry],
    built: &VersionEntry,
    protected: &Protected,
    retention: &RetentionOptions,
    now: OffsetDateTime,
) -> HashSet<String> {
    let mut keep: HashSet<String> = protected.used.iter().chain(&protected.building).cloned().collect();
    keep.insert(built.target_table_name());
    if retention.drop_without_touch {
        keep.extend(protected.touched.iter().cloned());
        return keep;
    }
    for entry in entries {
        let name = entry.target_table_name();
        let recorded = known.iter().any(|k| k.fingerprint() == entry.fingerprint());
        if !recorded && protected.touched.contains(&name) {
            keep.insert(name);
        }
    }
    if let Some(newest) = entries.first() {
        keep.insert(newest.target_table_name());
    }
    let cutoff = now - retention.structure_version_persist_time;
    let mut structures = HashSet::new();
    for entry in entries {
        // Newest first, so the first of each structure is its newest.
        if structures.insert(entry.structure_version.as_str()) && entry.last_updated_at >= cutoff {
            keep.insert(entry.target_table_name());
        }
    }
    keep
}

/// Drop every generation of `built.table_name` in the target schema that
/// isn't kept, and forget it in the registry. `building` lists the physical
/// tables still being built into `target`.
///
/// A table that fails to drop is skipped; the next collection retries it.
pub(crate) async fn collect(
    target: &DriverHandle,
    registry: &Registry,
    retention: &RetentionOptions,
    built: &VersionEntry,
    building: Vec<String>,
    ctx: &CancelToken,
) -> Result<Vec<String>> {
    let (Some(schema), _) = preagg_driver::split_table_name(&built.table_name) else {
        return Ok(Vec::new());
    };
    let now = target.now().await.map_err(ErrorKind::driver)?;
    let listing = target.get_tables_query(schema, ctx).await.map_err(ErrorKind::driver)?;
    let known = registry.entries_for(&built.table_name).await.map_err(ErrorKind::registry)?;
    let entries = tables_to_version_entries(&built.table_name, &listing, &known);
    let protected = Protected {
        used: registry.tables_used(now).await.map_err(ErrorKind::registry)?,
        touched: registry.tables_touched(now).await.map_err(ErrorKind::registry)?,
        building,
    };
    let keep = tables_to_keep(&entries, &known, built, &protected, retention, now);

    let mut dropped = Vec::new();
    for entry in entries {
        let table = entry.target_table_name();
        if keep.contains(&table) {
            continue;
        }
        if let Err(err) = target.drop_table(&table, ctx).await {
            tracing::warn!(table, error = ?err, "Unable to drop orphaned table");
            continue;
        }
        registry.forget(&entry).await.map_err(ErrorKind::registry)?;
        dropped.push(table);
    }
    registry.purge_expired(now).await.map_err(ErrorKind::registry)?;
    if !dropped.is_empty() {
        tracing::info!(table = %built.table_name, dropped = dropped.len(), "Dropped orphaned tables");
    }
    Ok(dropped)
}
