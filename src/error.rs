use std::io;
use thiserror::Error;
use std::str::Utf8Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid config value for {field}: must be greater than zero")]
    ZeroValue { field: &'static str },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (radio): {source}")]
    RadioError { #[from] source: RadioError },

    #[error("Session failed: {source}")]
    SessionError { #[from] source: SessionError },

    #[error("Invalid payload: {source}")]
    PayloadError { #[from] source: PayloadError },

    #[error("Failed to join session task: {source}")]
    Join { #[from] source: tokio::task::JoinError },

    #[error("Failed to start runtime: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Device failed: {0}")]
    DeviceFailed(String),
}

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("The link is no longer open")]
    LinkClosed,

    #[error("The radio is busy")]
    Busy,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Malformed payload: {source}")]
    MalformedInput { #[from] source: hex::FromHexError },

    #[error("Malformed payload: empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Rejected command input: {source}")]
    MalformedInput { #[from] source: PayloadError },

    #[error("The session has shut down")]
    Closed,

    #[error("The loop period must be greater than zero")]
    ZeroPeriod,
}
