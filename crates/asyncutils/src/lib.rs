//! Async plumbing shared by every pre-aggregation crate.
//!
//! - [`CancelToken`]: an explicit cancellation context that is handed down
//!   through every driver call. Operations register cancel hooks as they
//!   start and drop them when they finish, so a single
//!   [`cancel()`](CancelToken::cancel) unwinds a deeply nested build.
//! - [`retry()`]: re-run an operation with exponential backoff while its
//!   error is retryable.
//! - [`poll()`]: check an external job until it completes, backing off
//!   between checks and giving up after a deadline.

mod cancel;
mod poll;
mod retry;

pub use crate::cancel::{CancelToken, Cancelable, Canceled, HookGuard};
pub use crate::poll::{PollError, PollOptions, poll};
pub use crate::retry::{RetryPolicy, retry};
