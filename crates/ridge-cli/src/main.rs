//! ridge — the Ridgeline command line.
//!
//! Assembles the engine crates around a state store and a provider kept
//! under the data directory:
//! - `init` writes the reference media-stack topology
//! - `plan` / `apply` / `destroy` drive the executor
//! - `state` inspects persisted records
//! - `monitor` runs the autoscaling and alarm loops until Ctrl-C
//!
//! # Usage
//!
//! ```text
//! ridge init
//! RIDGE_DB_PASSWORD=... RIDGE_APP_SECRET_KEY=... ridge apply
//! ridge state list
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "ridge",
    about = "Ridgeline — dependency-ordered infrastructure orchestration",
    version,
    propagate_version = true
)]
struct Cli {
    /// Topology file.
    #[arg(long, global = true, default_value = "topology.toml")]
    topology: PathBuf,

    /// Directory holding the state store and provider snapshot.
    #[arg(long, global = true, default_value = ".ridge")]
    data_dir: PathBuf,

    /// Maximum provider operations in flight (overrides [engine].parallelism).
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the reference media-stack topology to --topology.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show what apply would change.
    Plan {
        /// Read live resources first and plan repairs for drift.
        #[arg(long)]
        refresh: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Plan and apply the topology.
    Apply {
        /// Read live resources first and repair drift.
        #[arg(long)]
        refresh: bool,
    },
    /// Destroy every recorded resource in teardown order.
    Destroy,
    /// Inspect persisted state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Run autoscaling and alarm loops until Ctrl-C.
    Monitor {
        /// Publish this CPU utilization for every monitored service once per
        /// period (the simulated provider has no metric source of its own).
        #[arg(long)]
        synthetic_cpu: Option<f64>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// One line per resource, secret, scaling policy and alarm.
    List,
    /// Full record of one resource.
    Show { id: String },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| "info,ridge=debug,ridgeline=debug".parse())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let opts = commands::Options {
        topology: cli.topology,
        data_dir: cli.data_dir,
        parallelism: cli.parallelism,
    };

    match cli.command {
        Commands::Init { force } => commands::init::init(&opts.topology, force),
        Commands::Plan { refresh, format } => commands::apply::plan(&opts, refresh, &format).await,
        Commands::Apply { refresh } => commands::apply::apply(&opts, refresh).await,
        Commands::Destroy => commands::apply::destroy(&opts).await,
        Commands::State { action } => match action {
            StateAction::List => commands::state::list(&opts),
            StateAction::Show { id } => commands::state::show(&opts, &id),
        },
        Commands::Monitor { synthetic_cpu } => commands::monitor::monitor(&opts, synthetic_cpu).await,
    }
}
