//! Casedesk realtime - delivery engine command-line entry point.

mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use realtime_config_and_utils::{init_logging, Config, Paths};

/// Casedesk realtime command-line interface.
#[derive(Parser)]
#[command(name = "casedesk-realtime")]
#[command(about = "Realtime delivery and retry engine for Casedesk")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, logs). Defaults to ~/.casedesk
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
    /// Run the engine against in-process collaborators
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level, true);

    match cli.command {
        Commands::Config { save } => {
            if save {
                config.save(&paths)?;
                tracing::info!(path = %paths.config_file().display(), "Configuration saved");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate(args) => {
            let summary = simulate::run(config, args).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
