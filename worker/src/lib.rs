//! Concurrent merge-train worker.
//!
//! This crate implements a queue-driven merge worker: each worker claims task
//! payloads from a shared filesystem queue, runs an external tool on an
//! isolated git branch, decides between merge, quarantine, and failure, and
//! appends every decision to a schema-validated audit ledger. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (decision policy, task identity,
//!   idle/retry accounting). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (queue filesystem protocol, git,
//!   process execution, ledger writes). Isolated to enable scripting in tests.
//!
//! The [`worker`] module coordinates core logic with I/O to implement the
//! claim-process-resolve loop behind the CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
