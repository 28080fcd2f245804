mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, KindArg};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "syncd",
    about = "Keep stored deployment and build artifact status in line with the platform",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "SYNCD_CONFIG",
        default_value = "./syncd.yaml"
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
    /// Run both reconciliation drivers until interrupted
    Serve,

    /// Run a single reconciliation round and print its report
    Tick {
        #[arg(long, value_enum)]
        kind: KindArg,
    },

    /// List stored records with their status and claim timestamp
    Records {
        #[arg(long, value_enum)]
        kind: KindArg,
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
        Commands::Serve => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve => cmd::serve::run(&cli.config),
        Commands::Tick { kind } => cmd::tick::run(&cli.config, kind, cli.json),
        Commands::Records { kind } => cmd::records::run(&cli.config, kind, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
