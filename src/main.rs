//! Shadow-table demo CLI.
//!
//! Runs the scripted scenarios against an in-memory or on-disk database and
//! prints the merged state afterwards.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use shadow_engine::{run_gc, EngineConfig, ShadowDb};
use shadow_tables::{Demo, DemoScenario};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the demo.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite database file (in-memory when omitted)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenarios to run, in order (all when omitted)
    #[arg(short, long, value_enum)]
    scenario: Vec<DemoScenario>,

    /// Print the final merged state as JSON
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(path) = args.database {
        config.path = Some(path);
    }
    let retention = config.retention;

    let db = ShadowDb::open(config).context("opening shadow database")?;
    let mut demo = Demo::new(db).context("declaring chat schema")?;

    let scenarios = if args.scenario.is_empty() {
        DemoScenario::ALL.to_vec()
    } else {
        args.scenario
    };
    for scenario in scenarios {
        println!("{}: {}", scenario.title(), scenario.description());
        demo.run(scenario)
            .with_context(|| format!("scenario {:?} failed", scenario))?;
    }

    let removed = run_gc(&demo.db, retention)?;
    tracing::debug!(removed, "ledger compacted");

    let snapshot = demo.snapshot()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for line in demo.log() {
            println!("  {line}");
        }
        for table in &snapshot {
            println!("{} ({} rows, {} pending)", table.table, table.rows.len(), table.pending_local);
            for row in &table.rows {
                println!("  {}", serde_json::Value::Object(row.clone()));
            }
        }
    }
    Ok(())
}
