//! Schema compatibility gate for the engine API registry.
//!
//! Compares the checksums in the local collections registry against a
//! directory of engine schema files. On mismatch the registry is rewritten
//! in place, a machine-readable list of changes goes to stdout, and the
//! exit code is nonzero so CI can gate on it.

mod check;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "dut-schema-check")]
#[command(about = "Checks engine schema checksums against the supported collections")]
struct Args {
    /// Directory tree of engine schema files
    #[arg(long)]
    schema_dir: PathBuf,

    /// Collections registry file to check and, on mismatch, rewrite
    #[arg(long)]
    registry: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

const BANNER_RULE: &str =
    "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@";

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let report = check::run_check(&args.schema_dir, &args.registry)?;
    debug!("Checked {} registry entries", report.checked);

    if report.passed() {
        eprintln!("\n{BANNER_RULE}\n\nDUT API CHECK PASS!\n\n{BANNER_RULE}");
        return Ok(());
    }

    // Machine-readable list, one JSON object per line (intentional stdout).
    for mismatch in &report.mismatches {
        println!("{}", serde_json::to_string(mismatch)?);
    }
    eprintln!(
        "\n{BANNER_RULE}\n\n\
         DUT API CHECK FAIL!\n\n\
         The schema under test has missing operations, or operations\n\
         with unexpected checksums compared to the registered\n\
         collections. The registry file was rewritten in place;\n\
         review and commit it if the change is intended.\n\n\
         {BANNER_RULE}"
    );
    std::process::exit(1);
}
