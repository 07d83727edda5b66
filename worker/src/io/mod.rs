//! Side-effecting adapters: filesystem queue, git, child processes, ledger.

pub mod branch;
pub mod config;
pub mod gates;
pub mod git;
pub mod ledger;
pub mod process;
pub mod queue;
pub mod task_log;
pub mod tool;
