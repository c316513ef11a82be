use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ctrd", about = "Container runtime storage daemon", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "/etc/ctrd/config.toml")]
    pub config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true)]
    pub log_level: Option<String>,

    /// Address the services listen on
    #[arg(short, long, global = true)]
    pub address: Option<String>,

    /// Directory for persistent data
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Directory for runtime state
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the order plugins would be loaded in
    Plugins,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the default configuration
    Default,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "ctrd", "-c", "/tmp/c.toml", "-l", "debug", "-a", "/tmp/ctrd.sock", "--root", "/tmp/root",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/c.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.address.as_deref(), Some("/tmp/ctrd.sock"));
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/root")));
        assert!(cli.state.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["ctrd", "config", "default"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config(ConfigCommand::Default))));
        let cli = Cli::try_parse_from(["ctrd", "plugins", "--state", "/tmp/s"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Plugins)));
        assert_eq!(cli.state, Some(PathBuf::from("/tmp/s")));
    }
}
