use std::env;
use log::LevelFilter;
use crate::cli::application::run_application;
use crate::cli::types::Cli;
use crate::error::AppRunError;

pub mod device;
pub mod cli;
pub mod error;
pub mod config;

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // btleplug is chatty at debug
        .level_for("btleplug", level.min(LevelFilter::Info))
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    run_application(cli)
}
