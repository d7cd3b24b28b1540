use std::sync::Arc;
use futures::channel::mpsc::Receiver;
use futures::StreamExt;
use log::{debug, error, info, warn, LevelFilter};
use tokio::signal::ctrl_c;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::cli::host::ConsoleHost;
use crate::cli::types::{Cli, Command, ConfigArgs, ScanArgs, SendArgs};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::open_radio;
use crate::device::payload::{decode_hex, encode_hex};
use crate::device::session::{spawn_session, SessionHandle};
use crate::device::types::{ConnectionState, DeviceRecord, LoopEvent, LoopStopReason, SessionEvent};
use crate::error::{AppRunError, SessionError};
use crate::init_logging;

type Events = Receiver<SessionEvent>;

fn log_level(verbose: u8, config: &Config) -> LevelFilter {
    match verbose {
        0 => config.log_level_filter(),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn format_device(record: &DeviceRecord) -> String {
    format!(
        "{:<20} {:>5} dBm  {}",
        record.address,
        record.signal_strength,
        record.name.as_deref().unwrap_or("(unnamed)"),
    )
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => info!("State: {}", state),
        SessionEvent::DeviceObserved(record) => debug!("Observed {}", format_device(record)),
        SessionEvent::ScanStarted => info!("Scanning…"),
        SessionEvent::ScanStopped => info!("Scan stopped"),
        SessionEvent::ScanError(message) => error!("Scan error: {}", message),
        SessionEvent::WriteResult { ok, byte_count } => info!("write {} bytes => {}", byte_count, ok),
        SessionEvent::Loop(LoopEvent::Started { byte_count, period }) => {
            info!("Sending {} bytes every {:?}", byte_count, period)
        },
        SessionEvent::Loop(LoopEvent::TickResult(ok)) => debug!("Loop write => {}", ok),
        SessionEvent::Loop(LoopEvent::Stopped(reason)) => info!("Loop stopped: {}", reason),
        SessionEvent::CommandDropped { command, reason } => warn!("{:?} was not run: {:?}", command, reason),
    }
}

async fn next_event(events: &mut Events) -> Result<SessionEvent, AppRunError> {
    let event = events.next().await.ok_or(SessionError::Closed)?;
    log_event(&event);
    Ok(event)
}

fn dropped(event: &SessionEvent) -> Option<AppRunError> {
    match event {
        SessionEvent::CommandDropped { command, reason } => {
            Some(AppRunError::DeviceFailed(format!("{:?} was not run: {:?}", command, reason)))
        },
        _ => None,
    }
}

async fn wait_scan_started(events: &mut Events) -> Result<(), AppRunError> {
    loop {
        let event = next_event(events).await?;
        if let Some(err) = dropped(&event) {
            return Err(err);
        }
        match event {
            SessionEvent::ScanStarted => return Ok(()),
            SessionEvent::ScanError(message) => return Err(AppRunError::DeviceFailed(message)),
            _ => {},
        }
    }
}

/// Lets the scan run for `duration`, or until `until` has been observed.
async fn collect_scan(events: &mut Events, duration: Duration, until: Option<&str>) -> Result<(), AppRunError> {
    let deadline = sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = ctrl_c() => return Ok(()),
            event = next_event(events) => match event? {
                SessionEvent::DeviceObserved(record) => {
                    if until.map_or(false, |address| record.address.eq_ignore_ascii_case(address)) {
                        return Ok(());
                    }
                },
                SessionEvent::ScanError(message) => return Err(AppRunError::DeviceFailed(message)),
                _ => {},
            },
        }
    }
}

/// Waits for service discovery. Returns whether the write channel is present.
async fn wait_ready(events: &mut Events) -> Result<bool, AppRunError> {
    loop {
        let event = next_event(events).await?;
        if let Some(err) = dropped(&event) {
            return Err(err);
        }
        match event {
            SessionEvent::StateChanged(ConnectionState::ServicesDiscovered { has_write_channel, .. }) => {
                return Ok(has_write_channel);
            },
            SessionEvent::StateChanged(ConnectionState::Failed(reason)) => {
                return Err(AppRunError::DeviceFailed(reason));
            },
            SessionEvent::StateChanged(ConnectionState::Disconnected) => {
                return Err(AppRunError::DeviceFailed("disconnected".to_string()));
            },
            _ => {},
        }
    }
}

async fn scan(session: &SessionHandle, events: &mut Events, config: &Config, args: ScanArgs) -> Result<(), AppRunError> {
    session.start_scan().await?;
    wait_scan_started(events).await?;

    let seconds = args.seconds.unwrap_or(config.scan_seconds);
    collect_scan(events, Duration::from_secs(seconds), None).await?;
    session.stop_scan().await?;

    let devices = session.devices(&args.filter).await?;
    for record in &devices {
        println!("{}", format_device(record));
    }
    info!("{} device(s) found", devices.len());
    Ok(())
}

async fn send_loop(session: &SessionHandle, events: &mut Events) -> Result<(), AppRunError> {
    loop {
        tokio::select! {
            _ = ctrl_c() => {
                info!("Interrupted");
                session.stop_loop().await?;
            },
            event = next_event(events) => {
                let event = event?;
                if let Some(err) = dropped(&event) {
                    return Err(err);
                }
                if let SessionEvent::Loop(LoopEvent::Stopped(reason)) = event {
                    println!("loop stopped: {}", reason);
                    return match reason {
                        LoopStopReason::UserRequested => Ok(()),
                        other => Err(AppRunError::DeviceFailed(other.to_string())),
                    };
                }
            },
        }
    }
}

async fn send_once(events: &mut Events) -> Result<(), AppRunError> {
    loop {
        let event = next_event(events).await?;
        if let Some(err) = dropped(&event) {
            return Err(err);
        }
        if let SessionEvent::WriteResult { ok, byte_count } = event {
            println!("write {} bytes => {}", byte_count, ok);
            if !ok {
                return Err(AppRunError::DeviceFailed("the write was rejected".to_string()));
            }
            return Ok(());
        }
    }
}

async fn send(session: &SessionHandle, events: &mut Events, args: SendArgs) -> Result<(), AppRunError> {
    let payload = decode_hex(&args.payload)?;
    info!("Payload: {}", encode_hex(&payload));

    // btleplug only connects to peripherals the adapter has seen
    if args.scan_seconds > 0 {
        session.start_scan().await?;
        wait_scan_started(events).await?;
        collect_scan(events, Duration::from_secs(args.scan_seconds), Some(&args.address)).await?;
    }

    session.connect(&args.address).await?;
    if !wait_ready(events).await? {
        session.disconnect().await?;
        return Err(AppRunError::DeviceFailed(format!("{} has no Nordic UART write channel", args.address)));
    }

    let result = if args.repeat {
        session.start_loop(payload, args.period_ms.map(Duration::from_millis)).await?;
        send_loop(session, events).await
    } else {
        session.write(payload).await?;
        send_once(events).await
    };

    session.disconnect().await?;
    result
}

async fn configure(config_io: &ConfigIO, mut config: Config, args: ConfigArgs) -> Result<(), AppRunError> {
    if !args.is_empty() {
        if let Some(period_ms) = args.period_ms {
            config.loop_period_ms = period_ms;
        }
        if let Some(scan_seconds) = args.scan_seconds {
            config.scan_seconds = scan_seconds;
        }
        if let Some(connect_timeout_ms) = args.connect_timeout_ms {
            config.connect_timeout_ms = connect_timeout_ms;
        }
        if let Some(log_level) = args.log_level {
            config.log_level = log_level;
        }
        config.validate()?;
        config_io.save(config.clone()).await?;
    }

    println!("{}", serde_json::to_string_pretty(&config).map_err(crate::error::ConfigError::from)?);
    Ok(())
}

async fn load_config(config_io: &ConfigIO) -> (Config, Option<String>) {
    match config_io.read().await {
        Ok(config) => (config, None),
        Err(err) if err.is_file_not_found_error() => (Config::default(), None),
        Err(err) => (Config::default(), Some(format!("Failed to load config: {}", err))),
    }
}

async fn run_command(cli: Cli, config_io: ConfigIO) -> Result<(), AppRunError> {
    let (config, load_error) = load_config(&config_io).await;
    init_logging(log_level(cli.verbose, &config));
    if let Some(message) = load_error {
        error!("{}; using defaults", message);
    }

    let args = match cli.command {
        Command::Config(args) => return configure(&config_io, config, args).await,
        other => other,
    };

    let cancel = CancellationToken::new();
    let (radio, radio_events) = open_radio(&config, cancel.clone()).await?;
    let host = Arc::new(ConsoleHost::new(cli.assume_yes));
    let (session, mut events, handle): (SessionHandle, Events, JoinHandle<()>) =
        spawn_session(radio, host, &config, radio_events, cancel.clone());

    let result = match args {
        Command::Scan(args) => scan(&session, &mut events, &config, args).await,
        Command::Send(args) => send(&session, &mut events, args).await,
        Command::Config(_) => Ok(()),
    };

    cancel.cancel();
    // drain so the session can deliver its shutdown notifications
    while let Some(event) = events.next().await {
        log_event(&event);
    }
    handle.await?;
    result
}

pub fn run_application(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync()?;
    // only one process may drive the radio at a time
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run_command(cli, config_io))
}
