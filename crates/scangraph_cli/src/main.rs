//! Maintenance CLI for a scangraph database.
//!
//! # Responsibility
//! - Open a database file with an optional JSON store config.
//! - Run row counts, orphan sweeps/purges and node lookups.
//! - Keep output line-oriented so it can be scraped by scripts.

use clap::{Args, Parser, Subcommand};
use log::error;
use scangraph_core::{
    default_log_level, init_logging, open_db, Context, LoggingConfig, NodeService,
    SqliteNodeRepository, StoreConfig,
};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "scangraph",
    version,
    about = "Maintenance CLI for the node scan graph store",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(long, global = true, help = "Log level (trace|debug|info|warn|error)")]
    log_level: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Write rotating log files to this absolute directory instead of stderr"
    )]
    log_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "MS", help = "Deadline for the whole command")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, value_name = "FILE", help = "SQLite database file")]
    db: PathBuf,

    #[arg(long, value_name = "FILE", help = "JSON store config")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print node, component and CVE row counts.
    Count,
    /// Mark CVEs no component references anymore as orphaned.
    Sweep,
    /// Sweep, then delete CVEs orphaned for longer than the retention.
    Purge {
        #[arg(
            long,
            value_name = "MS",
            help = "Override orphan_retention_ms from the config"
        )]
        retention_ms: Option<u64>,
    },
    /// Print one node with its scan as JSON.
    Show {
        #[arg(value_name = "NODE_ID")]
        id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        level: cli
            .log_level
            .clone()
            .unwrap_or_else(|| default_log_level().to_string()),
        log_dir: cli.log_dir.clone(),
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("scangraph: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error={err}");
            eprintln!("scangraph: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = match &cli.open.config {
        Some(path) => StoreConfig::load_from_path(path)?,
        None => StoreConfig::default(),
    };
    let db = open_db(&cli.open.db, &config)?;
    let service = NodeService::new(SqliteNodeRepository::new(db, &config));

    let ctx = match cli.timeout_ms {
        Some(timeout_ms) => Context::background().with_timeout(Duration::from_millis(timeout_ms)),
        None => Context::background(),
    };

    match cli.command {
        Command::Count => {
            let counts = service.counts(&ctx)?;
            println!("nodes={}", counts.nodes);
            println!("components={}", counts.components);
            println!("cves={}", counts.cves);
        }
        Command::Sweep => {
            let orphaned = service.sweep_orphans(&ctx)?;
            println!("orphaned={orphaned}");
        }
        Command::Purge { retention_ms } => {
            let retention_ms = retention_ms.unwrap_or(config.orphan_retention_ms);
            let summary = service.run_orphan_maintenance(&ctx, retention_ms)?;
            println!("orphaned={}", summary.orphaned);
            println!("purged={}", summary.purged);
            println!("cutoff_ms={}", summary.cutoff_ms);
        }
        Command::Show { id } => {
            let node = service.require_node(&ctx, &id)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
    }
    Ok(())
}
