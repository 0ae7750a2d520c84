mod config;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use spawner::{LaunchOutcome, launch, logging};
use std::process::ExitCode;
use tracing::info;

fn main() -> ExitCode {
    let config = Config::parse();
    logging::init(config.debug.debug);

    match run(&config) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("spawner: {error:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<u8> {
    let request = config.to_request()?;

    match launch(request).context("Failed to launch container")? {
        LaunchOutcome::Exited(status) => Ok(u8::try_from(status.exit_code()).unwrap_or(u8::MAX)),
        LaunchOutcome::Detached { pid } => {
            info!(%pid, "container running");
            Ok(0)
        }
    }
}
