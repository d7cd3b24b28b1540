use log::{debug, info, warn};

use crate::device::constants::{NUS_SERVICE, NUS_WRITE_CHARACTERISTIC};
use crate::device::radio::{ChannelHandle, LinkId, LinkState, Radio, ServiceTable};
use crate::device::types::{ConnectionState, LinkStatus};
use crate::error::RadioError;

pub const REASON_INVALID_ADDRESS: &str = "invalid address";
pub const REASON_DISCOVERY_FAILED: &str = "discovery failed";

/// Drives the single physical link through connect, service discovery and ready.
///
/// Every operation returns the states it passed through, oldest first, so the caller can forward
/// them to the presentation layer in order.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    link: Option<LinkId>,
    address: Option<String>,
    // only set while in ServicesDiscovered with a write channel
    channel: Option<ChannelHandle>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        ConnectionStateMachine {
            state: ConnectionState::Disconnected,
            link: None,
            address: None,
            channel: None,
        }
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        ConnectionStateMachine::default()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn write_channel(&self) -> Option<&ChannelHandle> {
        self.channel.as_ref()
    }

    fn enter(&mut self, state: ConnectionState, transitions: &mut Vec<ConnectionState>) {
        debug!("Connection state: {} -> {}", self.state, state);
        self.state = state.clone();
        transitions.push(state);
    }

    /// Closes the link, if any, and drops every handle derived from it.
    fn release<R: Radio>(&mut self, radio: &mut R) {
        self.channel = None;
        self.address = None;
        if let Some(link) = self.link.take() {
            radio.close_link(link);
        }
    }

    fn fail<R: Radio>(&mut self, radio: &mut R, reason: String, transitions: &mut Vec<ConnectionState>) {
        warn!("Connection failed: {}", reason);
        self.release(radio);
        self.enter(ConnectionState::Failed(reason), transitions);
    }

    fn is_current(&self, link: LinkId) -> bool {
        if self.link == Some(link) {
            return true;
        }
        debug!("Ignoring event for stale link {:?} (current {:?})", link, self.link);
        false
    }

    fn current_address(&self) -> String {
        self.address.clone().unwrap_or_else(|| "unknown".to_string())
    }

    /// Connects to `address`, tearing down any existing link first.
    pub fn connect<R: Radio>(&mut self, radio: &mut R, address: &str) -> Vec<ConnectionState> {
        let mut transitions = self.disconnect(radio);

        info!("Connecting to {}", address);
        self.enter(ConnectionState::Connecting(address.to_string()), &mut transitions);

        match radio.open_link(address) {
            Ok(link) => {
                self.link = Some(link);
                self.address = Some(address.to_string());
            },
            Err(RadioError::InvalidAddress(_)) => {
                self.fail(radio, REASON_INVALID_ADDRESS.to_string(), &mut transitions);
            },
            Err(err) => {
                self.fail(radio, format!("open link failed: {}", err), &mut transitions);
            },
        }

        transitions
    }

    /// Best-effort teardown. Reports `Disconnected` whatever state the link was actually in.
    pub fn disconnect<R: Radio>(&mut self, radio: &mut R) -> Vec<ConnectionState> {
        let mut transitions = Vec::new();
        if self.link.is_none() {
            return transitions;
        }

        info!("Disconnecting from {}", self.current_address());
        self.release(radio);
        self.enter(ConnectionState::Disconnected, &mut transitions);
        transitions
    }

    pub fn on_link_changed<R: Radio>(
        &mut self,
        radio: &mut R,
        link: LinkId,
        status: LinkStatus,
        new_state: LinkState,
    ) -> Vec<ConnectionState> {
        let mut transitions = Vec::new();
        if !self.is_current(link) {
            return transitions;
        }

        // Any error status ends the link, whichever state it claims to be in.
        if !status.is_success() {
            self.fail(radio, status.to_string(), &mut transitions);
            return transitions;
        }

        match new_state {
            LinkState::Connected => {
                if !matches!(self.state, ConnectionState::Connecting(_)) {
                    debug!("Ignoring repeated connected event in state {}", self.state);
                    return transitions;
                }

                let address = self.current_address();
                self.enter(ConnectionState::Connected(address), &mut transitions);

                info!("Connected; Discovering services...");
                if let Err(err) = radio.discover_services(link) {
                    warn!("Could not start service discovery: {}", err);
                    self.fail(radio, REASON_DISCOVERY_FAILED.to_string(), &mut transitions);
                }
            },
            LinkState::Disconnected => {
                info!("Link to {} closed", self.current_address());
                self.release(radio);
                self.enter(ConnectionState::Disconnected, &mut transitions);
            },
        }

        transitions
    }

    pub fn on_services_discovered<R: Radio>(
        &mut self,
        radio: &mut R,
        link: LinkId,
        status: LinkStatus,
        services: &ServiceTable,
    ) -> Vec<ConnectionState> {
        let mut transitions = Vec::new();
        if !self.is_current(link) {
            return transitions;
        }

        if !matches!(self.state, ConnectionState::Connected(_)) {
            debug!("Ignoring discovery result in state {}", self.state);
            return transitions;
        }

        if !status.is_success() {
            self.fail(radio, REASON_DISCOVERY_FAILED.to_string(), &mut transitions);
            return transitions;
        }

        // A peripheral without the write channel is still a usable connection.
        self.channel = services.lookup(NUS_SERVICE, NUS_WRITE_CHARACTERISTIC);
        let has_write_channel = self.channel.is_some();
        info!("Services discovered; write channel present: {}", has_write_channel);

        let address = self.current_address();
        self.enter(ConnectionState::ServicesDiscovered { address, has_write_channel }, &mut transitions);
        transitions
    }

    /// A single unacknowledged write. `false` unless the link is ready and the radio accepted it.
    pub fn write<R: Radio>(&mut self, radio: &mut R, bytes: &[u8]) -> bool {
        let ready = matches!(self.state, ConnectionState::ServicesDiscovered { has_write_channel: true, .. });
        match (&self.channel, ready) {
            (Some(channel), true) => radio.write(channel, bytes),
            _ => {
                debug!("Write of {} bytes refused: no write channel ({})", bytes.len(), self.state);
                false
            },
        }
    }
}
