pub mod types;
pub mod host;
pub mod application;
