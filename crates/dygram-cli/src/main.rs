//! `dygram` — the CLI shell around `dygram-core`/`dygram-session`.
//!
//! Wires real commands for everything the core owns (`execute`, `exec
//! list|status|rm|clean`) and stubs the rest (`generate`,
//! `check-imports`, `bundle`) with a clear "not implemented in this
//! core" message and exit code 1, since their DSL-to-JSON generation,
//! diagram rendering, and import-resolution logic live in external
//! collaborators this crate does not own.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dygram")]
#[command(about = "Run and inspect dygram graph-driven agent workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate diagram/bundle formats from a machine definition.
    Generate {
        file: PathBuf,
        #[arg(short = 'f', long = "formats")]
        formats: Vec<String>,
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },

    /// Execute a machine definition, creating or resuming a session.
    Execute {
        /// Machine JSON file; reads stdin when omitted.
        file: Option<PathBuf>,

        #[arg(short, long)]
        interactive: bool,

        /// Resume an existing execution id (or `last`).
        #[arg(long)]
        id: Option<String>,

        /// Resume despite a machine-hash mismatch.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        playback: Option<PathBuf>,

        #[arg(long)]
        record: Option<PathBuf>,

        #[arg(short = 'm', long = "model")]
        model: Option<String>,

        /// Advance exactly one superstep and stop.
        #[arg(long)]
        step: bool,

        /// Advance exactly one agent turn (LLM round-trip, possibly
        /// spanning several internal tool rounds) and stop.
        #[arg(long = "step-turn")]
        step_turn: bool,

        /// Advance the single path whose id matches the session's
        /// round-robin cursor. The underlying superstep still advances
        /// every active path (see DESIGN.md); this flag narrows which
        /// path's outcome is reported.
        #[arg(long = "step-path")]
        step_path: bool,
    },

    /// Inspect and manage saved executions.
    Exec {
        #[command(subcommand)]
        action: ExecAction,
    },

    /// Validate a machine definition's import graph.
    CheckImports { file: PathBuf },

    /// Bundle a machine definition and its imports into one artifact.
    Bundle {
        file: PathBuf,
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ExecAction {
    /// List saved executions, oldest first.
    List,
    /// Show one execution's metadata.
    Status { id: String },
    /// Remove one execution.
    Rm { id: String },
    /// Remove completed/failed executions (or everything with `--all`).
    Clean {
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::ExitCode::from(code)
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Generate { file, formats, dest } => commands::generate::run(&file, &formats, dest.as_deref()),
        Commands::Execute {
            file,
            interactive,
            id,
            force,
            playback,
            record,
            model,
            step,
            step_turn,
            step_path,
        } => {
            commands::execute::run(commands::execute::ExecuteArgs {
                file,
                interactive,
                id,
                force,
                playback,
                record,
                model,
                step,
                step_turn,
                step_path,
            })
            .await
        }
        Commands::Exec { action } => match action {
            ExecAction::List => commands::exec::list(),
            ExecAction::Status { id } => commands::exec::status(&id),
            ExecAction::Rm { id } => commands::exec::rm(&id),
            ExecAction::Clean { all } => commands::exec::clean(all),
        },
        Commands::CheckImports { file } => commands::check_imports::run(&file),
        Commands::Bundle { file, dest } => commands::bundle::run(&file, dest.as_deref()),
    }
}
