//! Pre-aggregation build and replication pipeline.
//!
//! - [`refresh`]: decides whether a pre-aggregation needs a build and hands
//!   it to the [`queue`] of its data source.
//! - [`queue`]: one build per fingerprint, bounded concurrency, bounded
//!   waiting.
//! - [`mover`]: runs a build, moving the rows from the source driver into
//!   the target driver with the best strategy both support, then collects
//!   orphaned generations.
//! - [`descriptor`] and [`partition`]: what a build needs to know.

pub mod descriptor;
pub mod error;
pub mod mover;
pub mod partition;
pub mod queue;
pub mod refresh;

pub use crate::descriptor::BuildDescriptor;
pub use crate::mover::{BuildJob, BuildOutcome, DataMover, Drivers, MoverOptions, Strategy};
pub use crate::partition::{DateRange, PartitionGranularity};
pub use crate::queue::{BuildHandler, BuildQueue, JobStatus, Phase, QueueOptions, QueueSet};
pub use crate::refresh::{DataSources, RefreshEvent, RefreshOptions, RefreshOutcome, RefreshScheduler};

/// Tables refreshed at once by [`RefreshScheduler::refresh_all()`]. Builds
/// are still bounded per data source by their queue.
pub const MAX_REFRESH_CONCURRENCY: usize = 16;
