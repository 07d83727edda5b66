//! Pure, deterministic logic with no I/O.
//!
//! Everything in this module is a function of its inputs: outcome
//! classification, task identity and branch naming, the idle-exit predicate,
//! and retry bookkeeping. Side effects live in [`crate::io`].

pub mod decision;
pub mod idle;
pub mod retry;
pub mod task;
