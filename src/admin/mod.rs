#![forbid(unsafe_code)]

//! Offline administration: integrity checks, tail repair and summaries.
//!
//! Every entry point takes the process-level file lock, so none of them runs
//! against a database another process has open.

mod check;
mod error;
mod info;
mod options;

/// Integrity checks and tail repair.
///
/// `check` verifies the newest commit, optionally every commit and every
/// index tree. `repair` truncates the file to its last intact commit.
pub use check::{check, repair, CheckReport, IndexCheck, RepairReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Summary of tables, row counts and tree shapes.
pub use info::{info, report, IndexSummary, InfoReport, TableSummary};

/// Configuration options for opening a database in admin mode.
pub use options::AdminOpenOptions;
