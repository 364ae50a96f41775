use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ed_gateway::cli::{self, Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = cli::load_config(args.config.as_deref())?;
            match &config_path {
                Some(path) => tracing::info!(path = %path.display(), "config loaded"),
                None => tracing::info!("no config file found, using defaults"),
            }
            ed_gateway::bootstrap::run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config(args.config.as_deref())?;
            if !cli::validate(&config, config_path.as_deref()) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = cli::load_config(args.config.as_deref())?;
            cli::show(&config);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ed_gateway=info,ed_sandbox=info,ed_workflow=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
