//! Stable exit codes for worker CLI commands.

/// Command succeeded; for `run`, the worker drained the queue and exited on
/// the idle window.
pub const OK: i32 = 0;
/// Command failed due to invalid configuration or usage.
pub const INVALID: i32 = 1;
/// The worker hit an unrecoverable environment failure (git, queue layout,
/// ledger) and stopped.
pub const FATAL: i32 = 2;
