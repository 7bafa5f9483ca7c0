mod cmd;
mod output;
mod root;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cmd::{action::ActionSubcommand, config::ConfigSubcommand};

#[derive(Parser)]
#[command(
    name = "cloudops",
    about = "Durable orchestration of cloud lifecycle actions: schedule, dispatch, inspect",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from .cloudops/)
    #[arg(long, global = true, env = "CLOUDOPS_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .cloudops/ with a default config and an empty action store
    Init,

    /// Serve the HTTP API, dispatching on an interval unless told otherwise
    Serve {
        #[arg(long, default_value = "3150")]
        port: u16,
        /// Do not start the interval ticker; cycles run only on POST /api/dispatch
        #[arg(long)]
        external_trigger: bool,
    },

    /// Run one dispatch cycle and exit
    Tick,

    /// Apply the retention policy now
    Sweep,

    /// Create, inspect, cancel and run actions
    Action {
        #[command(subcommand)]
        subcommand: ActionSubcommand,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Tick => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Serve {
            port,
            external_trigger,
        } => cmd::serve::run(&root, port, external_trigger),
        Commands::Tick => cmd::tick::run(&root, cli.json),
        Commands::Sweep => cmd::sweep::run(&root, cli.json),
        Commands::Action { subcommand } => cmd::action::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
