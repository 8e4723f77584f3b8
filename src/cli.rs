//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (batch, roles, analyze,
//! pipeline, interactive, ask, history, reset) and the global flags.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::CONFIG_FILE;

/// Orchestrates long-running research jobs on an external agent service.
#[derive(Debug, Parser)]
#[command(name = "research-orchestrator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Options shared by the batch-style commands.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Work item file: JSON array, product catalog or one question per line.
    pub input: PathBuf,

    /// Output directory. Defaults to a new `research_results_*` directory,
    /// or the newest existing one with `--resume`.
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,

    /// Skip items already recorded in the checkpoint.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Per-item timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs every work item through the configured agent.
    Batch {
        #[command(flatten)]
        run: RunArgs,

        /// Name used for the checkpoint and report files.
        #[arg(long, default_value = "research")]
        role: String,
    },

    /// Runs every configured role concurrently over the same work items.
    Roles {
        #[command(flatten)]
        run: RunArgs,

        /// Only run these roles (repeatable).
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Writes a report per product from a finished `roles` run.
    Analyze {
        /// Directory holding `combined_agent_results.json`. Defaults to the
        /// newest `research_results_*` directory.
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Defaults to a new `product_analysis_reports_*` directory.
        #[arg(long, short)]
        output_dir: Option<PathBuf>,

        /// Per-product timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Runs the role search and then the product analysis.
    Pipeline {
        /// Work item file for the search phase.
        #[arg(required_unless_present = "search_dir")]
        input: Option<PathBuf>,

        /// Skip the search phase; requires `--search-dir`.
        #[arg(long, default_value_t = false, requires = "search_dir")]
        skip_search: bool,

        /// Analyse an existing search directory instead of searching.
        #[arg(long)]
        search_dir: Option<PathBuf>,

        /// Base directory for all output. Defaults to `product_analysis_*`.
        #[arg(long)]
        output_base: Option<PathBuf>,

        /// Show what would run without contacting the service.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Per-job timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Only run these roles (repeatable).
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Starts a multi-turn research conversation.
    Interactive {
        /// First question; asked for on the terminal when absent.
        #[arg(long, short)]
        question: Option<String>,

        /// Session key to continue; a fresh session when absent.
        #[arg(long)]
        session: Option<String>,

        /// Where the transcript is written.
        #[arg(long, short, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Asks one question on the session stored under a key.
    Ask {
        key: String,
        question: String,

        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Prints the conversation stored under a key.
    History { key: String },

    /// Replaces the session stored under a key with a fresh one.
    Reset { key: String },
}
