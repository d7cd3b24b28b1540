use uuid::Uuid;

use crate::device::types::{DeviceRecord, LinkStatus};
use crate::error::RadioError;

/// Identifies one opened link. A new id is handed out for every `open_link`, so events from a
/// link that has since been closed can be told apart from events for the current one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    LowLatency,
}

/// A discovered characteristic that can be written to. Only meaningful while its link is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub link: LinkId,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The services found by a discovery run on one link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceTable {
    pub link: Option<LinkId>,
    pub services: Vec<ServiceEntry>,
}

impl ServiceTable {
    pub fn new(link: LinkId, services: Vec<ServiceEntry>) -> Self {
        ServiceTable { link: Some(link), services }
    }

    pub fn lookup(&self, service: Uuid, characteristic: Uuid) -> Option<ChannelHandle> {
        let link = self.link?;

        self.services
            .iter()
            .filter(|entry| entry.uuid == service)
            .flat_map(|entry| entry.characteristics.iter())
            .find(|uuid| **uuid == characteristic)
            .map(|uuid| ChannelHandle { link, characteristic: *uuid })
    }
}

/// Asynchronous results from the radio, marshaled onto the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Advertisement(DeviceRecord),
    ScanFailed(String),
    LinkChanged {
        link: LinkId,
        status: LinkStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        link: LinkId,
        status: LinkStatus,
        services: ServiceTable,
    },
}

/// The host's BLE radio. Every method only issues a request and returns without waiting for the
/// hardware; outcomes are delivered later as `RadioEvent`s.
pub trait Radio: Send + 'static {
    fn start_scan(&mut self, mode: ScanMode) -> Result<(), RadioError>;

    fn stop_scan(&mut self);

    /// Resolves `address` to a device and starts opening a link to it.
    fn open_link(&mut self, address: &str) -> Result<LinkId, RadioError>;

    /// Tears down the link and releases everything held for it. No events follow for `link`.
    fn close_link(&mut self, link: LinkId);

    fn discover_services(&mut self, link: LinkId) -> Result<(), RadioError>;

    /// Submits an unacknowledged write. Returns whether the radio accepted it, not whether it
    /// was delivered.
    fn write(&mut self, channel: &ChannelHandle, bytes: &[u8]) -> bool;
}
