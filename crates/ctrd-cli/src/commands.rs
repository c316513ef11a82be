use std::str::FromStr;

use anyhow::Context;
use colored::Colorize;
use tracing::{info, Level};

use ctrd_server::{builtin_registry, Config, Server};

use crate::cli::{Cli, Command, ConfigCommand};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::Config(ConfigCommand::Default)) => cmd_config_default(),
        Some(Command::Plugins) => {
            let config = load_config(&cli)?;
            cmd_plugins(&config)
        }
        None => {
            let config = load_config(&cli)?;
            init_logging(&config.debug.level)?;
            serve(config).await
        }
    }
}

/// The config file overlaid with the command line flags.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.debug.level = level.clone();
    }
    if let Some(address) = &cli.address {
        config.grpc.address = address.clone();
    }
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(state) = &cli.state {
        config.state = state.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = Level::from_str(level).map_err(|_| anyhow::anyhow!("invalid log level {level:?}"))?;
    tracing_subscriber::fmt().with_max_level(level).init();
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let registry = builtin_registry()?;
    let server = Server::new(config, &registry)?;
    info!(
        root = %server.config().root.display(),
        state = %server.config().state.display(),
        "ctrd successfully booted"
    );
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("stop signal received, shutting down");
    drop(server);
    Ok(())
}

fn cmd_config_default() -> anyhow::Result<()> {
    print!("{}", Config::default().to_toml()?);
    Ok(())
}

fn cmd_plugins(config: &Config) -> anyhow::Result<()> {
    let registry = builtin_registry()?;
    let order = registry.resolve(&config.disabled_plugins)?;
    for (i, registration) in order.iter().enumerate() {
        let requires: Vec<String> = registration.requires.iter().map(ToString::to_string).collect();
        if requires.is_empty() {
            println!("{:>3} {}", i + 1, registration.uri().bold());
        } else {
            println!("{:>3} {} {} {}", i + 1, registration.uri().bold(), "requires".dimmed(), requires.join(", ").cyan());
        }
    }
    for uri in &config.disabled_plugins {
        println!("  - {} {}", uri.yellow(), "(disabled)".dimmed());
    }
    Ok(())
}
