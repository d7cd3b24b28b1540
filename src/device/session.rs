use std::sync::Arc;
use futures::channel::mpsc::{channel, unbounded, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::connection::ConnectionStateMachine;
use crate::device::devices::DeviceMap;
use crate::device::loop_sender::{LoopSender, TickOutcome};
use crate::device::payload::decode_hex;
use crate::device::permission::{Authorization, CapabilityHost, PermissionGate};
use crate::device::radio::{Radio, RadioEvent, ScanMode};
use crate::device::scanner::ScanEngine;
use crate::device::types::{
    Capability, CommandKind, ConnectionState, DeviceRecord, DropReason, Grant, LoopEvent, LoopStopReason,
    SessionEvent,
};
use crate::error::SessionError;

#[derive(Debug)]
pub enum SessionCommand {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Write(Vec<u8>),
    StartLoop {
        payload: Vec<u8>,
        period: Option<Duration>,
    },
    StopLoop,
    ClearDevices,
    Devices {
        filter: String,
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
}

impl SessionCommand {
    /// `None` for commands that never touch the radio.
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            SessionCommand::StartScan => Some(CommandKind::StartScan),
            SessionCommand::StopScan => Some(CommandKind::StopScan),
            SessionCommand::Connect(_) => Some(CommandKind::Connect),
            SessionCommand::Disconnect => Some(CommandKind::Disconnect),
            SessionCommand::Write(_) => Some(CommandKind::Write),
            SessionCommand::StartLoop { .. } => Some(CommandKind::StartLoop),
            SessionCommand::StopLoop => Some(CommandKind::StopLoop),
            SessionCommand::ClearDevices | SessionCommand::Devices { .. } => None,
        }
    }

    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self.kind() {
            Some(CommandKind::StartScan) | Some(CommandKind::StopScan) => &[Capability::Scan],
            // connecting implicitly stops a running scan
            Some(CommandKind::Connect) => &[Capability::Scan, Capability::Connect],
            Some(_) => &[Capability::Connect],
            None => &[],
        }
    }
}

struct PendingCommand {
    ticket: u64,
    command: SessionCommand,
}

struct GrantResolution {
    ticket: u64,
    grant: Grant,
}

/// Composes scanning, the connection and the loop sender behind one event loop.
///
/// Commands, radio events, grant resolutions and loop ticks are all handled on the task running
/// `run`, one at a time, each to completion.
pub struct SessionCoordinator<R, H> {
    radio: R,
    gate: PermissionGate<H>,
    scanner: ScanEngine,
    connection: ConnectionStateMachine,
    sender: LoopSender,
    devices: DeviceMap,
    pending: Option<PendingCommand>,
    next_ticket: u64,
    loop_period: Duration,
    events: Sender<SessionEvent>,
    grants_tx: UnboundedSender<GrantResolution>,
    grants_rx: Option<UnboundedReceiver<GrantResolution>>,
}

impl<R: Radio, H: CapabilityHost> SessionCoordinator<R, H> {
    pub fn new(radio: R, host: Arc<H>, loop_period: Duration, events: Sender<SessionEvent>) -> Self {
        let (grants_tx, grants_rx) = unbounded();

        SessionCoordinator {
            radio,
            gate: PermissionGate::new(host),
            scanner: ScanEngine::new(ScanMode::LowLatency),
            connection: ConnectionStateMachine::new(),
            sender: LoopSender::new(),
            devices: DeviceMap::new(),
            pending: None,
            next_ticket: 0,
            loop_period,
            events,
            grants_tx,
            grants_rx: Some(grants_rx),
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if let Err(err) = self.events.send(event).await {
            debug!("Session event dropped, nobody is listening: {}", err);
        }
    }

    pub async fn run(
        mut self,
        mut commands: Receiver<SessionCommand>,
        mut radio_events: Receiver<RadioEvent>,
        cancel: CancellationToken,
    ) {
        let mut grants = match self.grants_rx.take() {
            Some(grants) => grants,
            None => {
                warn!("Session is already running");
                return;
            },
        };

        'mainloop: loop {
            let deadline = self.sender.deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break 'mainloop,
                },
                Some(event) = radio_events.next() => {
                    self.handle_radio_event(event).await;
                },
                Some(resolution) = grants.next() => {
                    self.handle_grant(resolution).await;
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_tick().await;
                },
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("Session shutting down");
        self.stop_loop(LoopStopReason::Shutdown).await;
        if self.scanner.stop(&mut self.radio) {
            self.emit(SessionEvent::ScanStopped).await;
        }
        let transitions = self.connection.disconnect(&mut self.radio);
        self.apply(transitions).await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let authorization = self.gate.authorize(command.required_capabilities());

        // any newer radio command replaces one still waiting for a grant
        if command.kind().is_some() {
            if let Some(previous) = self.pending.take() {
                info!("Dropping {:?}, superseded by {:?}", previous.command.kind(), command.kind());
                self.drop_command(&previous.command, DropReason::Superseded).await;
            }
        }

        match authorization {
            Authorization::Granted => self.execute(command).await,
            Authorization::Pending(request) => {

                self.next_ticket += 1;
                let ticket = self.next_ticket;
                self.pending = Some(PendingCommand { ticket, command });

                let grants_tx = self.grants_tx.clone();
                spawn(async move {
                    let grant = request.await;
                    // the session may be gone by now
                    let _ = grants_tx.unbounded_send(GrantResolution { ticket, grant });
                });
            },
        }
    }

    async fn handle_grant(&mut self, resolution: GrantResolution) {
        let pending = match self.pending.take() {
            Some(pending) if pending.ticket == resolution.ticket => pending,
            other => {
                debug!("Ignoring grant for superseded command (ticket {})", resolution.ticket);
                self.pending = other;
                return;
            },
        };

        match resolution.grant {
            Grant::Granted => self.execute(pending.command).await,
            Grant::Denied => {
                warn!("Permission denied for {:?}", pending.command.kind());
                self.drop_command(&pending.command, DropReason::PermissionDenied).await;
            },
        }
    }

    async fn drop_command(&mut self, command: &SessionCommand, reason: DropReason) {
        if let Some(kind) = command.kind() {
            self.emit(SessionEvent::CommandDropped { command: kind, reason }).await;
        }
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartScan => match self.scanner.start(&mut self.radio) {
                Ok(true) => self.emit(SessionEvent::ScanStarted).await,
                Ok(false) => debug!("Already scanning"),
                Err(err) => self.emit(SessionEvent::ScanError(err.to_string())).await,
            },
            SessionCommand::StopScan => {
                if self.scanner.stop(&mut self.radio) {
                    self.emit(SessionEvent::ScanStopped).await;
                }
            },
            SessionCommand::Connect(address) => {
                if self.scanner.stop(&mut self.radio) {
                    self.emit(SessionEvent::ScanStopped).await;
                }
                let transitions = self.connection.connect(&mut self.radio, &address);
                self.apply(transitions).await;
            },
            SessionCommand::Disconnect => {
                let transitions = self.connection.disconnect(&mut self.radio);
                self.apply(transitions).await;
            },
            SessionCommand::Write(payload) => {
                let ok = self.connection.write(&mut self.radio, &payload);
                info!("write {} bytes => {}", payload.len(), ok);
                self.emit(SessionEvent::WriteResult { ok, byte_count: payload.len() }).await;
            },
            SessionCommand::StartLoop { payload, period } => {
                let period = period.unwrap_or(self.loop_period);
                let byte_count = payload.len();
                if self.sender.start(payload, period, Instant::now()) {
                    self.emit(SessionEvent::Loop(LoopEvent::Started { byte_count, period })).await;
                } else {
                    debug!("Loop send already running");
                }
            },
            SessionCommand::StopLoop => {
                self.stop_loop(LoopStopReason::UserRequested).await;
            },
            SessionCommand::ClearDevices => {
                self.devices.clear();
            },
            SessionCommand::Devices { filter, reply } => {
                let _ = reply.send(self.devices.matching(&filter));
            },
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement(record) => {
                if let Some(record) = self.scanner.on_advertisement(record) {
                    self.devices.observe(record.clone());
                    self.emit(SessionEvent::DeviceObserved(record)).await;
                }
            },
            RadioEvent::ScanFailed(message) => {
                if self.scanner.on_scan_failed(&message) {
                    self.emit(SessionEvent::ScanError(message)).await;
                }
            },
            RadioEvent::LinkChanged { link, status, state } => {
                let transitions = self.connection.on_link_changed(&mut self.radio, link, status, state);
                self.apply(transitions).await;
            },
            RadioEvent::ServicesDiscovered { link, status, services } => {
                let transitions = self.connection.on_services_discovered(&mut self.radio, link, status, &services);
                self.apply(transitions).await;
            },
        }
    }

    /// Forwards state changes in order. A running loop is stopped as soon as the link goes down,
    /// before anything else is processed.
    async fn apply(&mut self, transitions: Vec<ConnectionState>) {
        for state in transitions {
            let stop_reason = match &state {
                ConnectionState::Failed(reason) => Some(LoopStopReason::LinkFailed(reason.clone())),
                state if state.is_down() => Some(LoopStopReason::Disconnected),
                _ => None,
            };

            info!("State: {}", state);
            self.emit(SessionEvent::StateChanged(state)).await;

            if let Some(reason) = stop_reason {
                self.stop_loop(reason).await;
            }
        }
    }

    async fn stop_loop(&mut self, reason: LoopStopReason) {
        if let Some(reason) = self.sender.stop(reason) {
            self.emit(SessionEvent::Loop(LoopEvent::Stopped(reason))).await;
        }
    }

    async fn handle_tick(&mut self) {
        let capability_held = self.gate.holds(Capability::Connect);
        let connection = &mut self.connection;
        let radio = &mut self.radio;

        let outcome = self.sender.tick(Instant::now(), capability_held, |payload| connection.write(radio, payload));

        match outcome {
            TickOutcome::Idle => {},
            TickOutcome::Sent => {
                self.emit(SessionEvent::Loop(LoopEvent::TickResult(true))).await;
            },
            TickOutcome::Stopped { wrote, reason } => {
                if wrote {
                    self.emit(SessionEvent::Loop(LoopEvent::TickResult(false))).await;
                }
                self.emit(SessionEvent::Loop(LoopEvent::Stopped(reason))).await;
            },
        }
    }
}

/// Issues commands into a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
}

impl SessionHandle {
    /// Rejects a loop with a zero period before anything is queued.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        if let SessionCommand::StartLoop { period: Some(period), .. } = &command {
            if period.is_zero() {
                return Err(SessionError::ZeroPeriod);
            }
        }
        self.commands.clone().send(command).await.map_err(|_| SessionError::Closed)
    }

    pub async fn start_scan(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopScan).await
    }

    pub async fn connect(&self, address: &str) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect(address.to_string())).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn write(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.send(SessionCommand::Write(payload)).await
    }

    /// Rejects malformed hex before anything is queued.
    pub async fn write_hex(&self, text: &str) -> Result<(), SessionError> {
        let payload = decode_hex(text)?;
        self.write(payload).await
    }

    pub async fn start_loop(&self, payload: Vec<u8>, period: Option<Duration>) -> Result<(), SessionError> {
        self.send(SessionCommand::StartLoop { payload, period }).await
    }

    pub async fn start_loop_hex(&self, text: &str, period: Option<Duration>) -> Result<(), SessionError> {
        let payload = decode_hex(text)?;
        self.start_loop(payload, period).await
    }

    pub async fn stop_loop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopLoop).await
    }

    pub async fn clear_devices(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ClearDevices).await
    }

    /// Snapshot of the discovered devices whose name or address contains `filter`.
    pub async fn devices(&self, filter: &str) -> Result<Vec<DeviceRecord>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Devices { filter: filter.to_string(), reply: tx }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub fn spawn_session<R: Radio, H: CapabilityHost>(
    radio: R,
    host: Arc<H>,
    config: &Config,
    radio_events: Receiver<RadioEvent>,
    cancel: CancellationToken,
) -> (SessionHandle, Receiver<SessionEvent>, JoinHandle<()>) {
    let (command_sender, command_receiver) = channel::<SessionCommand>(config.event_queue);
    let (event_sender, event_receiver) = channel::<SessionEvent>(config.event_queue);

    let coordinator = SessionCoordinator::new(radio, host, config.loop_period(), event_sender);
    let handle = spawn(coordinator.run(command_receiver, radio_events, cancel));

    (SessionHandle { commands: command_sender }, event_receiver, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};
    use crate::device::permission::fake::ScriptedHost;
    use crate::device::radio::fake::{nus_table, Call, FakeRadio};
    use crate::device::radio::{LinkId, LinkState};
    use crate::device::types::LinkStatus;
    use crate::error::PayloadError;

    const ADDRESS: &str = "AA:BB";

    struct Harness {
        handle: SessionHandle,
        events: Receiver<SessionEvent>,
        radio_tx: Sender<RadioEvent>,
        radio: FakeRadio,
        host: Arc<ScriptedHost>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn new(host: ScriptedHost) -> Self {
            let radio = FakeRadio::default();
            let host = Arc::new(host);
            let (radio_tx, radio_rx) = channel(16);
            let cancel = CancellationToken::new();
            let (handle, events, task) = spawn_session(
                radio.clone(),
                host.clone(),
                &Config::default(),
                radio_rx,
                cancel.clone(),
            );
            Harness { handle, events, radio_tx, radio, host, cancel, task }
        }

        fn granted() -> Self {
            Harness::new(ScriptedHost::granting_all())
        }

        async fn next(&mut self) -> SessionEvent {
            timeout(Duration::from_secs(30), self.events.next())
                .await
                .expect("timed out waiting for a session event")
                .expect("session event channel closed")
        }

        async fn inject(&mut self, event: RadioEvent) {
            self.radio_tx.send(event).await.unwrap();
        }

        fn current_link(&self) -> LinkId {
            LinkId(self.radio.state.lock().unwrap().next_link)
        }

        async fn wait_for_requests(&self, count: usize) {
            while self.host.request_count() < count {
                sleep(Duration::from_millis(1)).await;
            }
        }

        /// Connects to ADDRESS and drives the link to a ready write channel.
        async fn ready(&mut self) -> LinkId {
            self.handle.connect(ADDRESS).await.unwrap();
            assert_eq!(self.next().await, SessionEvent::StateChanged(ConnectionState::Connecting(ADDRESS.to_string())));
            let link = self.current_link();

            self.inject(RadioEvent::LinkChanged { link, status: LinkStatus::Success, state: LinkState::Connected }).await;
            assert_eq!(self.next().await, SessionEvent::StateChanged(ConnectionState::Connected(ADDRESS.to_string())));

            self.inject(RadioEvent::ServicesDiscovered { link, status: LinkStatus::Success, services: nus_table(link) }).await;
            assert_eq!(self.next().await, SessionEvent::StateChanged(ConnectionState::ServicesDiscovered {
                address: ADDRESS.to_string(),
                has_write_channel: true,
            }));
            link
        }

        fn no_pending_events(&mut self) -> bool {
            self.events.try_next().is_err()
        }
    }

    fn advertisement(rssi: i16) -> RadioEvent {
        RadioEvent::Advertisement(DeviceRecord {
            address: ADDRESS.to_string(),
            name: Some("Dev1".to_string()),
            signal_strength: rssi,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_observations_keep_one_record() {
        let mut harness = Harness::granted();
        harness.handle.start_scan().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::ScanStarted);

        harness.inject(advertisement(-50)).await;
        harness.inject(advertisement(-40)).await;
        assert!(matches!(harness.next().await, SessionEvent::DeviceObserved(record) if record.signal_strength == -50));
        assert!(matches!(harness.next().await, SessionEvent::DeviceObserved(record) if record.signal_strength == -40));

        let devices = harness.handle.devices("").await.unwrap();
        assert_eq!(harness.handle.devices("dev").await.unwrap(), devices);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].signal_strength, -40);

        harness.handle.clear_devices().await.unwrap();
        assert!(harness.handle.devices("").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_start_failure_is_reported() {
        let mut harness = Harness::granted();
        harness.radio.state.lock().unwrap().fail_scan_start = true;

        harness.handle.start_scan().await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::ScanError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stops_a_running_scan_first() {
        let mut harness = Harness::granted();
        harness.handle.start_scan().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::ScanStarted);

        harness.handle.connect(ADDRESS).await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::ScanStopped);
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Connecting(ADDRESS.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_link_accepts_a_write() {
        let mut harness = Harness::granted();
        harness.ready().await;

        harness.handle.write(vec![0x01]).await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::WriteResult { ok: true, byte_count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn write_without_link_fails() {
        let mut harness = Harness::granted();
        harness.handle.write_hex("0102").await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::WriteResult { ok: false, byte_count: 2 });
        assert_eq!(harness.radio.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_hex_is_rejected_before_queueing() {
        let mut harness = Harness::granted();
        let result = harness.handle.write_hex("abc").await;
        assert!(matches!(result, Err(SessionError::MalformedInput { source: PayloadError::MalformedInput { .. } })));

        let result = harness.handle.start_loop_hex("zz", None).await;
        assert!(matches!(result, Err(SessionError::MalformedInput { .. })));

        sleep(Duration::from_secs(1)).await;
        assert!(harness.no_pending_events());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_leaves_a_single_link() {
        let mut harness = Harness::granted();
        harness.handle.connect("AA:AA").await.unwrap();
        harness.handle.connect("BB:BB").await.unwrap();

        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Connecting("AA:AA".to_string())));
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Disconnected));
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Connecting("BB:BB".to_string())));
        assert_eq!(harness.radio.open_links(), 1);

        // the first link reporting in late is ignored
        harness.inject(RadioEvent::LinkChanged { link: LinkId(1), status: LinkStatus::Success, state: LinkState::Connected }).await;
        harness.inject(RadioEvent::LinkChanged { link: LinkId(2), status: LinkStatus::Success, state: LinkState::Connected }).await;
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Connected("BB:BB".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ends_on_first_failed_write() {
        let mut harness = Harness::granted();
        harness.ready().await;
        harness.radio.state.lock().unwrap().writes_left = Some(3);

        harness.handle.start_loop(vec![0x01], None).await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Started {
            byte_count: 1,
            period: Duration::from_millis(500),
        }));
        for _ in 0..3 {
            assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));
        }
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(false)));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::WriteFailed)));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.radio.writes(), 4);
        assert!(harness.no_pending_events());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_are_a_period_apart() {
        let mut harness = Harness::granted();
        harness.ready().await;

        let started = Instant::now();
        harness.handle.start_loop(vec![0x02], Some(Duration::from_millis(200))).await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::Loop(LoopEvent::Started { .. })));
        for _ in 0..3 {
            assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));
        }
        // first tick right away, then two periods
        assert_eq!(Instant::now() - started, Duration::from_millis(400));

        harness.handle.stop_loop().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::UserRequested)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_the_loop_before_another_tick() {
        let mut harness = Harness::granted();
        let link = harness.ready().await;

        harness.handle.start_loop(vec![0x01], None).await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::Loop(LoopEvent::Started { .. })));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));

        harness.inject(RadioEvent::LinkChanged { link, status: LinkStatus::Success, state: LinkState::Disconnected }).await;
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Disconnected));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::Disconnected)));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.radio.writes(), 1);
        assert!(harness.no_pending_events());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_disconnect_fails_the_link_and_stops_the_loop() {
        let mut harness = Harness::granted();
        let link = harness.ready().await;
        harness.handle.start_loop(vec![0x01], None).await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::Loop(LoopEvent::Started { .. })));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));

        harness.inject(RadioEvent::LinkChanged { link, status: LinkStatus::from_code(19), state: LinkState::Disconnected }).await;
        let reason = "peer disconnected (19)".to_string();
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Failed(reason.clone())));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::LinkFailed(reason))));
        assert_eq!(harness.radio.open_links(), 0);

        harness.handle.write(vec![0x01]).await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::WriteResult { ok: false, byte_count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_capability_stops_the_loop() {
        let mut harness = Harness::granted();
        harness.ready().await;
        harness.handle.start_loop(vec![0x01], None).await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::Loop(LoopEvent::Started { .. })));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));

        harness.host.revoke(Capability::Connect);
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::CapabilityRevoked)));
        assert_eq!(harness.radio.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_command_is_dropped() {
        let mut harness = Harness::new(ScriptedHost::default());
        harness.handle.start_scan().await.unwrap();
        harness.wait_for_requests(1).await;

        harness.host.resolve(Grant::Denied);
        assert_eq!(harness.next().await, SessionEvent::CommandDropped {
            command: CommandKind::StartScan,
            reason: DropReason::PermissionDenied,
        });
        assert!(harness.radio.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn granted_command_runs_after_the_request() {
        let mut harness = Harness::new(ScriptedHost::default());
        harness.handle.start_scan().await.unwrap();
        harness.wait_for_requests(1).await;

        harness.host.resolve(Grant::Granted);
        assert_eq!(harness.next().await, SessionEvent::ScanStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_gated_command_supersedes_the_pending_one() {
        let mut harness = Harness::new(ScriptedHost::default());
        harness.handle.start_scan().await.unwrap();
        harness.wait_for_requests(1).await;
        harness.handle.connect(ADDRESS).await.unwrap();

        assert_eq!(harness.next().await, SessionEvent::CommandDropped {
            command: CommandKind::StartScan,
            reason: DropReason::Superseded,
        });
        harness.wait_for_requests(2).await;

        // the stale grant is ignored, the fresh one runs the connect
        harness.host.resolve(Grant::Granted);
        harness.host.resolve(Grant::Granted);
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Connecting(ADDRESS.to_string())));
        assert!(harness.no_pending_events());
    }

    #[tokio::test(start_paused = true)]
    async fn granted_command_supersedes_a_pending_one() {
        let host = ScriptedHost::default();
        host.grant(Capability::Connect);
        let mut harness = Harness::new(host);

        // connect also needs Scan, so it waits; disconnect can run right away
        harness.handle.connect(ADDRESS).await.unwrap();
        harness.wait_for_requests(1).await;
        harness.handle.disconnect().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::CommandDropped {
            command: CommandKind::Connect,
            reason: DropReason::Superseded,
        });

        harness.host.resolve(Grant::Granted);
        sleep(Duration::from_secs(1)).await;
        assert!(harness.no_pending_events());
        assert_eq!(harness.radio.open_links(), 0);
        assert!(harness.radio.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_loop_period_is_rejected_before_queueing() {
        let mut harness = Harness::granted();
        harness.ready().await;

        let result = harness.handle.start_loop(vec![0x01], Some(Duration::ZERO)).await;
        assert!(matches!(result, Err(SessionError::ZeroPeriod)));
        let result = harness.handle.start_loop_hex("01", Some(Duration::ZERO)).await;
        assert!(matches!(result, Err(SessionError::ZeroPeriod)));

        sleep(Duration::from_secs(1)).await;
        assert!(harness.no_pending_events());
        assert_eq!(harness.radio.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_can_restart_after_the_radio_gives_up() {
        let mut harness = Harness::granted();
        harness.handle.start_scan().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::ScanStarted);

        harness.inject(RadioEvent::ScanFailed("adapter reset".to_string())).await;
        assert_eq!(harness.next().await, SessionEvent::ScanError("adapter reset".to_string()));

        harness.handle.start_scan().await.unwrap();
        assert_eq!(harness.next().await, SessionEvent::ScanStarted);
        let starts = harness.radio.calls().iter().filter(|call| **call == Call::StartScan).count();
        assert_eq!(starts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_tears_everything_down() {
        let mut harness = Harness::granted();
        harness.ready().await;
        harness.handle.start_loop(vec![0x01], None).await.unwrap();
        assert!(matches!(harness.next().await, SessionEvent::Loop(LoopEvent::Started { .. })));
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::TickResult(true)));

        harness.cancel.cancel();
        assert_eq!(harness.next().await, SessionEvent::Loop(LoopEvent::Stopped(LoopStopReason::Shutdown)));
        assert_eq!(harness.next().await, SessionEvent::StateChanged(ConnectionState::Disconnected));

        let Harness { task, handle, radio, .. } = harness;
        task.await.unwrap();
        assert_eq!(radio.open_links(), 0);
        assert!(matches!(handle.disconnect().await, Err(SessionError::Closed)));
    }
}
