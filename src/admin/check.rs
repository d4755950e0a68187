use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::commit::{self, FastCheck, FullCheck};
use crate::db::Database;
use crate::primitives::concurrency::FileLock;
use crate::primitives::io::StdFileIo;
use crate::storage::btree::Btree;
use crate::storage::chunked::Storage;
use crate::storage::tran::Tran;

use crate::admin::{AdminError, AdminOpenOptions, Result};

const MAX_FINDINGS: usize = 32;

/// Result of one Btree self-check.
#[derive(Clone, Debug, Serialize)]
pub struct IndexCheck {
    /// Table name.
    pub table: String,
    /// Index columns, as `(a,b)`.
    pub index: String,
    /// Leaf keys found.
    pub keys: usize,
    /// Nodes visited.
    pub nodes: usize,
}

/// Report of `check`.
#[derive(Clone, Debug, Serialize)]
pub struct CheckReport {
    /// Whether nothing was found wrong.
    pub success: bool,
    /// Newest-commit check.
    pub fast: FastCheck,
    /// Whole-file check, when requested.
    pub full: Option<FullCheck>,
    /// Per-index tree checks, when requested.
    pub indexes: Vec<IndexCheck>,
    /// Problems found, capped.
    pub findings: Vec<String>,
}

/// Report of `repair`.
#[derive(Clone, Debug, Serialize)]
pub struct RepairReport {
    /// Size before repair.
    pub size: u64,
    /// Size after repair.
    pub new_size: u64,
    /// Intact commits kept.
    pub commits: u64,
    /// Whether bytes were removed.
    pub truncated: bool,
}

fn open_storage(path: &Path, opts: &AdminOpenOptions) -> Result<(Arc<Storage>, FileLock)> {
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    let io = StdFileIo::open(path, false)?;
    let lock = FileLock::try_exclusive(Arc::clone(io.file()))?
        .ok_or_else(|| AdminError::InUse(path.to_path_buf()))?;
    let mut options = opts.storage.clone();
    if let Some(recorded) = commit::recorded_chunk_size(&io)? {
        options.chunk_size = recorded;
    }
    let storage = Storage::open(Arc::new(io), options)?;
    Ok((Arc::new(storage), lock))
}

fn push(findings: &mut Vec<String>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(message.into());
    }
}

/// Checks the database at `path`.
///
/// Always verifies the newest commit. `full` verifies every commit; `deep`
/// also walks every index tree of the newest state, which needs an intact
/// newest commit.
pub fn check(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    full: bool,
    deep: bool,
) -> Result<CheckReport> {
    let path = path.as_ref();
    let (storage, lock) = open_storage(path, opts)?;
    let fast = commit::fast_check(&storage)?;
    let mut findings = Vec::new();
    if let Some(problem) = &fast.problem {
        push(&mut findings, format!("newest commit: {problem}"));
    }
    let full = if full {
        let report = commit::full_check(&storage)?;
        if let Some(problem) = &report.problem {
            push(&mut findings, format!("at {}: {problem}", report.ok_size));
        }
        Some(report)
    } else {
        None
    };
    drop(storage);
    drop(lock);

    let mut indexes = Vec::new();
    if deep {
        if fast.ok {
            check_trees(path, opts, &mut indexes, &mut findings)?;
        } else {
            push(&mut findings, "index trees not checked: newest commit damaged");
        }
    }
    debug!(path = %path.display(), findings = findings.len(), "admin.check");
    Ok(CheckReport {
        success: findings.is_empty(),
        fast,
        full,
        indexes,
        findings,
    })
}

fn check_trees(
    path: &Path,
    opts: &AdminOpenOptions,
    out: &mut Vec<IndexCheck>,
    findings: &mut Vec<String>,
) -> Result<()> {
    let db = Database::open(path, opts.db_options())?;
    let state = db.snapshot();
    let tran = Tran::new(Arc::clone(db.storage()));
    for (name, num) in state.schema().tables() {
        let info = state.table_info(num)?;
        for ix in &info.indexes {
            let tree = Btree::open(
                ix.root,
                ix.levels,
                state.redirects().clone(),
                db.options().btree.clone(),
            );
            match tree.check(&tran) {
                Ok(counts) => {
                    if counts.keys as u64 != info.nrows {
                        push(
                            findings,
                            format!(
                                "{name} index {}: {} keys for {} rows",
                                ix.describe(),
                                counts.keys,
                                info.nrows
                            ),
                        );
                    }
                    out.push(IndexCheck {
                        table: name.to_owned(),
                        index: ix.describe(),
                        keys: counts.keys,
                        nodes: counts.nodes,
                    });
                }
                Err(err) => push(findings, format!("{name} index {}: {err}", ix.describe())),
            }
        }
    }
    Ok(())
}

/// Truncates the database at `path` to the end of its last intact commit.
pub fn repair(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<RepairReport> {
    let path = path.as_ref();
    let (storage, _lock) = open_storage(path, opts)?;
    let full = commit::full_check(&storage)?;
    if full.commits == 0 {
        return Err(AdminError::Unrecoverable(path.to_path_buf()));
    }
    let truncated = full.ok_size < full.size;
    if truncated {
        warn!(
            size = full.size,
            ok_size = full.ok_size,
            problem = full.problem.as_deref().unwrap_or(""),
            "admin.repair_truncating"
        );
        storage.truncate(full.ok_size)?;
    }
    info!(path = %path.display(), truncated, "admin.repair");
    Ok(RepairReport {
        size: full.size,
        new_size: full.ok_size,
        commits: full.commits,
        truncated,
    })
}
