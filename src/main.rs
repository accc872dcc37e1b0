//! # Result Archive Store CLI (`ras`)
//!
//! Inspect a result archive: check the server, find runs, print their
//! console logs and browse their stored artifacts.
//!
//! ## Usage
//!
//! ```bash
//! ras --config ./config/ras.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ras check` | Validate the server identity/version and collections |
//! | `ras runs` | Find runs by name, or by requestor and queue time |
//! | `ras requestors` | List distinct requestors |
//! | `ras tests` | List distinct test names |
//! | `ras log <run-id>` | Print a run's console log |
//! | `ras ls <run-id> [path]` | List a directory of a run's artifacts |
//! | `ras cat <run-id> <path>` | Write one artifact to stdout |
//!
//! ## Examples
//!
//! ```bash
//! # Every run named L10
//! ras runs --name L10
//!
//! # Runs alice queued in January
//! ras runs --requestor alice --from 2024-01-01 --to 2024-02-01
//!
//! # Browse and read artifacts
//! ras ls 3f1c... /framework
//! ras cat 3f1c... /framework/cps_record.properties
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use result_archive_store::{artifacts, config, couchdb, logging, query};

/// Result Archive Store CLI.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ras.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ras",
    about = "Result Archive Store: inspect archived test runs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ras.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the server and report the run, log and artifact collections.
    Check,

    /// Find runs.
    ///
    /// With `--name`, runs with exactly that name. Otherwise runs matching
    /// every given filter; with no filters at all, every run.
    Runs {
        /// Run name.
        #[arg(long, conflicts_with_all = ["requestor", "from", "to"])]
        name: Option<String>,

        /// Requestor.
        #[arg(long)]
        requestor: Option<String>,

        /// Queued at or after this time (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,

        /// Queued before this time (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,
    },

    /// List the distinct requestors of stored runs.
    Requestors,

    /// List the distinct test names of stored runs.
    Tests,

    /// Print a run's console log.
    Log {
        /// Run document id.
        run_id: String,
    },

    /// List a directory of a run's artifacts.
    Ls {
        /// Run document id.
        run_id: String,

        /// Directory path.
        #[arg(default_value = "/")]
        path: String,
    },

    /// Write one artifact to stdout.
    Cat {
        /// Run document id.
        run_id: String,

        /// Artifact path, e.g. `/framework/cps_record.properties`.
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            couchdb::run_check(&cfg).await?;
        }
        Commands::Runs {
            name,
            requestor,
            from,
            to,
        } => {
            query::run_runs(
                &cfg,
                name.as_deref(),
                requestor.as_deref(),
                from.as_deref(),
                to.as_deref(),
            )
            .await?;
        }
        Commands::Requestors => {
            query::run_requestors(&cfg).await?;
        }
        Commands::Tests => {
            query::run_tests(&cfg).await?;
        }
        Commands::Log { run_id } => {
            query::run_log(&cfg, &run_id).await?;
        }
        Commands::Ls { run_id, path } => {
            artifacts::run_ls(&cfg, &run_id, &path).await?;
        }
        Commands::Cat { run_id, path } => {
            artifacts::run_cat(&cfg, &run_id, &path).await?;
        }
    }

    Ok(())
}
