mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sprinklerd",
    about = "Sprinkler controller: drive valve lines, run watering scenarios, mirror state remotely",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the controller config (YAML or JSON)
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "SPRINKLER_CONFIG",
        default_value = "sprinklers.yaml"
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the controller and serve the HTTP API until interrupted
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Use the in-memory line driver instead of the configured hardware
        #[arg(long)]
        mock_hardware: bool,
    },

    /// Inspect and validate the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// List completed runs of one actuator from the local event log
    Events {
        /// Actuator id
        actuator: u64,

        /// Only runs started at or after this instant (RFC 3339 or epoch ms)
        #[arg(long)]
        from: Option<String>,

        /// Only runs started at or before this instant (RFC 3339 or epoch ms)
        #[arg(long)]
        to: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve {
            port,
            mock_hardware,
        } => cmd::serve::run(&cli.config, port, mock_hardware),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Events { actuator, from, to } => {
            cmd::events::run(&cli.config, actuator, from.as_deref(), to.as_deref(), cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
