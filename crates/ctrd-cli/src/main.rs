use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match commands::run_command(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ctrd: {err:#}");
            ExitCode::FAILURE
        }
    }
}
