//! Choosing how data gets from the source into the target.
//!
//! Strategies are an ordered table of `(predicate, strategy)` rows. The first
//! row whose predicate holds wins; the last row matches everything, so exactly
//! one strategy is always chosen.

use crate::descriptor::BuildDescriptor;
use preagg_driver::{Capabilities, Driver};
use std::fmt;

/// How rows leave the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// Bulk export into CSV files.
    Unload,
    /// A row stream read while the target ingests it.
    Stream,
    /// Rows (or CSV spill files) downloaded in full first.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// The source builds the table itself; no rows cross process boundaries.
    InPlace,
    /// Rows are copied out of the source and uploaded into the target. With
    /// `temp_table` the source builds a temp table first and the copy reads
    /// from it; otherwise the copy reads the bare query.
    Transfer { via: Transfer, temp_table: bool },
    /// The target registers the source as a lazily ingested streaming source.
    StreamingSource { temp_table: bool },
}
impl Strategy {
    pub fn temp_table(&self) -> bool {
        match self {
            Self::InPlace => false,
            Self::Transfer { temp_table, .. } | Self::StreamingSource { temp_table } => *temp_table,
        }
    }
}
impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let via = match self {
            Self::InPlace => return f.write_str("in-place"),
            Self::Transfer { via: Transfer::Unload, .. } => "unload",
            Self::Transfer { via: Transfer::Stream, .. } => "stream",
            Self::Transfer { via: Transfer::Download, .. } => "download",
            Self::StreamingSource { .. } => "streaming-source",
        };
        let temp = if self.temp_table() { "temp-table" } else { "direct" };
        write!(f, "{via}/{temp}")
    }
}

/// Everything strategy selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Situation {
    pub external: bool,
    /// The descriptor or the source driver is read-only.
    pub read_only: bool,
    pub source: Capabilities,
    /// Answer of the source's `is_unload_supported()`.
    pub unload_supported: bool,
    /// Capabilities of the driver the table ends up in. For non-external
    /// builds that is the source itself.
    pub target: Capabilities,
}
impl Situation {
    /// Capabilities are taken from the drivers, never from the descriptor.
    pub fn new(descriptor: &BuildDescriptor, source: &dyn Driver, target: &dyn Driver, unload_supported: bool) -> Self {
        Self {
            external: descriptor.external,
            read_only: descriptor.read_only || source.read_only(),
            source: source.capabilities(),
            unload_supported,
            target: target.capabilities(),
        }
    }

    /// The source can unload and the target can import what it produces.
    fn can_unload(&self) -> bool {
        self.unload_supported && self.target.csv_import
    }
}

struct Rule {
    name: &'static str,
    applies: fn(&Situation) -> bool,
    strategy: Strategy,
}

const fn rule(name: &'static str, applies: fn(&Situation) -> bool, strategy: Strategy) -> Rule {
    Rule { name, applies, strategy }
}

const fn transfer(via: Transfer, temp_table: bool) -> Strategy {
    Strategy::Transfer { via, temp_table }
}

/// In priority order.
static RULES: &[Rule] = &[
    rule("native build", |s| !s.external && !s.read_only, Strategy::InPlace),
    rule("local read-only stream", |s| !s.external && s.target.stream_import, transfer(Transfer::Stream, false)),
    rule("local read-only download", |s| !s.external, transfer(Transfer::Download, false)),
    // From here on every build is external.
    rule(
        "streaming source from query",
        |s| !s.read_only && s.source.streaming_source && s.target.stream_import && s.source.unload_without_temp_table,
        Strategy::StreamingSource { temp_table: false },
    ),
    rule(
        "streaming source from temp table",
        |s| !s.read_only && s.source.streaming_source && s.target.stream_import,
        Strategy::StreamingSource { temp_table: true },
    ),
    rule(
        "unload from query",
        |s| !s.read_only && s.can_unload() && s.source.unload_without_temp_table,
        transfer(Transfer::Unload, false),
    ),
    rule("unload from temp table", |s| !s.read_only && s.can_unload(), transfer(Transfer::Unload, true)),
    rule("read-only unload from query", |s| s.read_only && s.can_unload(), transfer(Transfer::Unload, false)),
    rule(
        "stream from query",
        |s| !s.read_only && s.target.stream_import && s.source.unload_without_temp_table,
        transfer(Transfer::Stream, false),
    ),
    rule("stream from temp table", |s| !s.read_only && s.target.stream_import, transfer(Transfer::Stream, true)),
    rule("read-only stream", |s| s.read_only && s.target.stream_import, transfer(Transfer::Stream, false)),
    rule(
        "download query results",
        |s| !s.read_only && s.source.unload_without_temp_table,
        transfer(Transfer::Download, false),
    ),
    rule("download temp table", |s| !s.read_only, transfer(Transfer::Download, true)),
    rule("read-only download", |_| true, transfer(Transfer::Download, false)),
];

/// Pick the strategy for `situation`.
pub fn select(situation: &Situation) -> Strategy {
    RULES
        .iter()
        .find(|rule| (rule.applies)(situation))
        .map(|rule| {
            tracing::debug!(rule = rule.name, strategy = %rule.strategy, "Selected transfer strategy");
            rule.strategy
        })
        .unwrap_or(transfer(Transfer::Download, false))
}
