use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "nus-link", version, about = "Scan for BLE peripherals and write to their Nordic UART Service")]
pub struct Cli {
    /// Grant bluetooth capabilities without asking
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List nearby advertising devices
    Scan(ScanArgs),
    /// Connect to a device and write a hex payload to its write channel
    Send(SendArgs),
    /// Show or change the saved configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// How long to scan; defaults to the configured value
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Only list devices whose name or address contains this text
    #[arg(long, default_value = "")]
    pub filter: String,
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Device address, e.g. AA:BB:CC:DD:EE:FF
    pub address: String,

    /// Payload as hex, e.g. 01 or "6c 31"
    pub payload: String,

    /// Repeat the write until interrupted
    #[arg(long = "loop")]
    pub repeat: bool,

    /// Spacing between repeated writes; defaults to the configured value
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub period_ms: Option<u64>,

    /// How long to scan for the device before connecting
    #[arg(long, default_value_t = 3)]
    pub scan_seconds: u64,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub period_ms: Option<u64>,

    #[arg(long)]
    pub scan_seconds: Option<u64>,

    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long)]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    pub fn is_empty(&self) -> bool {
        self.period_ms.is_none()
            && self.scan_seconds.is_none()
            && self.connect_timeout_ms.is_none()
            && self.log_level.is_none()
    }
}
