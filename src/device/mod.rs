pub mod constants;
pub mod types;
pub mod radio;
pub mod permission;
pub mod scanner;
pub mod devices;
pub mod payload;
pub mod connection;
pub mod loop_sender;
pub mod session;
pub mod btle;
