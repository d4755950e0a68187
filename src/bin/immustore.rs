//! Binary entry point for the immustore administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use immustore::admin::{self, AdminOpenOptions, CheckReport, InfoReport, RepairReport};
use immustore::storage::{BtreeOptions, StorageOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "immustore",
    version,
    about = "Administrative CLI for immustore databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        help = "Chunk size (bytes), for files that do not record one"
    )]
    chunk_size: Option<usize>,

    #[arg(long, global = true, help = "Btree node split threshold")]
    max_node_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify commit checksums and, optionally, index trees.
    Check {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, help = "Verify every commit, not only the newest")]
        full: bool,
        #[arg(long, help = "Also walk every index tree")]
        deep: bool,
    },
    /// Truncate the database to its last intact commit.
    Repair {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
    /// Summarize tables and indexes.
    Info {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

/// Returns false when a check found problems.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    let opts = build_open_options(&cli.open);

    match cli.command {
        Command::Check {
            db_path,
            full,
            deep,
        } => {
            let report = admin::check(&db_path, &opts, full, deep)?;
            emit(cli.format, &report, || print_check_text(&report))?;
            return Ok(report.success);
        }
        Command::Repair { db_path } => {
            let report = admin::repair(&db_path, &opts)?;
            emit(cli.format, &report, || print_repair_text(&report))?;
        }
        Command::Info { db_path } => {
            let report = admin::info(&db_path, &opts)?;
            emit(cli.format, &report, || print_info_text(&report))?;
        }
    }
    Ok(true)
}

fn build_open_options(args: &OpenArgs) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::default();
    if let Some(size) = args.chunk_size {
        opts.storage = StorageOptions::default().chunk_size(size);
    }
    if let Some(max) = args.max_node_size {
        opts.btree = BtreeOptions::default().max_node_size(max);
    }
    opts
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_check_text(report: &CheckReport) {
    println!(
        "Check => success={} size={} newest_ok={}",
        report.success, report.fast.size, report.fast.ok
    );
    if let Some(full) = &report.full {
        println!(
            "  full: commits={} ok_size={} ok={}",
            full.commits, full.ok_size, full.ok
        );
    }
    for ix in &report.indexes {
        println!(
            "  {} {}: keys={} nodes={}",
            ix.table, ix.index, ix.keys, ix.nodes
        );
    }
    for finding in &report.findings {
        println!("- {finding}");
    }
}

fn print_repair_text(report: &RepairReport) {
    if report.truncated {
        println!(
            "Repair truncated {} -> {} bytes ({} intact commits)",
            report.size, report.new_size, report.commits
        );
    } else {
        println!("Repair: nothing to do ({} intact commits)", report.commits);
    }
}

fn print_info_text(report: &InfoReport) {
    println!(
        "size={} commit_seq={} redirects={} tables={}",
        report.size,
        report.commit_seq,
        report.redirects,
        report.tables.len()
    );
    for table in &report.tables {
        println!(
            "{} (#{}): rows={} bytes={}",
            table.name, table.num, table.rows, table.total_size
        );
        for ix in &table.indexes {
            println!(
                "  {}{} levels={}",
                ix.columns,
                if ix.unique { " unique" } else { "" },
                ix.levels
            );
        }
    }
}
