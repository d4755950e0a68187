#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use immustore::admin::{self, AdminError, AdminOpenOptions};
use immustore::db::{Database, DbOptions, IndexSpec};
use immustore::storage::RecordBuilder;
use serde_json::Value;
use tempfile::TempDir;

fn setup_db(name: &str) -> (TempDir, PathBuf, u64) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    let size = seed_demo(&path).expect("seed demo data");
    (dir, path, size)
}

/// Two tables, a few commits. Returns the storage size.
fn seed_demo(path: &Path) -> immustore::Result<u64> {
    let db = Database::open(path, DbOptions::default().sync_on_commit(false))?;
    let mut ex = db.exclusive_transaction()?;
    ex.create_table(
        "users",
        &[IndexSpec::new([0], true), IndexSpec::new([1], false)],
    )?;
    ex.create_table("tags", &[IndexSpec::new([0, 1], true)])?;
    ex.complete()?;

    let mut txn = db.update_transaction()?;
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        txn.add_record("users", RecordBuilder::new().add_int(id).add_str(name).build())?;
    }
    txn.add_record("tags", RecordBuilder::new().add_int(1).add_str("admin").build())?;
    assert!(txn.complete()?.is_none());
    Ok(db.storage().size())
}

#[test]
fn info_reports_tables() {
    let (_dir, db_path, size) = setup_db("info");
    let report = admin::info(&db_path, &AdminOpenOptions::default()).expect("info");
    assert_eq!(report.size, size);
    assert_eq!(report.commit_seq, 2);
    let names: Vec<&str> = report.tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["tags", "users"]);
    let users = &report.tables[1];
    assert_eq!(users.rows, 3);
    assert!(users.total_size > 0);
    assert_eq!(users.indexes.len(), 2);
    assert_eq!(users.indexes[0].columns, "(0)");
    assert!(users.indexes[0].unique);
    assert!(!users.indexes[1].unique);
}

#[test]
fn missing_database_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    let err = admin::info(dir.path().join("nope.db"), &AdminOpenOptions::default())
        .expect_err("must fail");
    assert!(matches!(err, AdminError::MissingDatabase(_)));
}

#[test]
fn cli_info_json() {
    let (_dir, db_path, _) = setup_db("cli_info");
    let output = cargo_bin_cmd!("immustore")
        .args(["--format", "json", "info"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["commit_seq"].as_u64(), Some(2));
    assert_eq!(json["tables"][1]["name"].as_str(), Some("users"));
    assert_eq!(json["tables"][1]["rows"].as_u64(), Some(3));
}

#[test]
fn cli_check_deep_succeeds() {
    let (_dir, db_path, _) = setup_db("cli_check");
    let output = cargo_bin_cmd!("immustore")
        .args(["--format", "json", "check", "--full", "--deep"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["full"]["commits"].as_u64(), Some(3));
    assert_eq!(json["indexes"].as_array().map(Vec::len), Some(3));
}

#[test]
fn cli_check_fails_then_repair_fixes() {
    let (_dir, db_path, size) = setup_db("cli_repair");
    let file = OpenOptions::new().write(true).open(&db_path).expect("open");
    file.set_len(size - 8).expect("truncate");
    drop(file);

    cargo_bin_cmd!("immustore")
        .args(["check", "--full"])
        .arg(&db_path)
        .assert()
        .code(2);

    let output = cargo_bin_cmd!("immustore")
        .args(["--format", "json", "repair"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["truncated"].as_bool(), Some(true));
    assert_eq!(json["commits"].as_u64(), Some(2));

    cargo_bin_cmd!("immustore")
        .args(["check", "--full", "--deep"])
        .arg(&db_path)
        .assert()
        .success();
}
