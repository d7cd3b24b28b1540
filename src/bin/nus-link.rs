use std::process::ExitCode;
use clap::Parser;
use nus_link::cli::types::Cli;
use nus_link::error::{AppRunError, ConfigError};
use nus_link::run;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("nus-link is already running");
            ExitCode::FAILURE
        },
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
