use std::collections::HashMap;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::LINK_WRITE_QUEUE;
use crate::device::radio::{ChannelHandle, LinkId, LinkState, Radio, RadioEvent, ScanMode, ServiceEntry, ServiceTable};
use crate::device::types::{DeviceRecord, LinkStatus};
use crate::error::RadioError;

enum LinkOp {
    Discover,
    Write(Uuid, Vec<u8>),
}

struct LinkTask {
    cancel: CancellationToken,
    ops: mpsc::Sender<LinkOp>,
}

/// `Radio` on top of btleplug. Requests are handed to spawned tasks so that no call blocks the
/// session loop; each open link is owned by exactly one task.
pub struct BtleRadio {
    adapter: Adapter,
    events: Sender<RadioEvent>,
    cancel: CancellationToken,
    scan: Option<(CancellationToken, JoinHandle<()>)>,
    links: HashMap<LinkId, LinkTask>,
    next_link: u64,
    connect_timeout: Duration,
}

pub async fn default_adapter(manager: &Manager) -> Result<Adapter, RadioError> {
    let adapters = manager.adapters().await?;
    let adapter = adapters.into_iter().next().ok_or(RadioError::NoAdapter)?;
    info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    Ok(adapter)
}

/// Opens the first bluetooth adapter. Events for the returned radio arrive on the receiver.
pub async fn open_radio(config: &Config, cancel: CancellationToken) -> Result<(BtleRadio, Receiver<RadioEvent>), RadioError> {
    let manager = Manager::new().await?;
    let adapter = default_adapter(&manager).await?;
    let (events, receiver) = channel::<RadioEvent>(config.event_queue);

    Ok((BtleRadio::new(adapter, events, cancel, config.connect_timeout()), receiver))
}

fn status_of(err: &btleplug::Error) -> LinkStatus {
    match err {
        btleplug::Error::TimedOut(_) => LinkStatus::Timeout,
        btleplug::Error::NotConnected => LinkStatus::PeerDisconnected,
        _ => LinkStatus::GattError,
    }
}

async fn report(events: &mut Sender<RadioEvent>, event: RadioEvent) -> bool {
    match events.send(event).await {
        Ok(_) => true,
        Err(err) => {
            debug!("Radio event not delivered: {}", err);
            false
        },
    }
}

impl BtleRadio {
    pub fn new(adapter: Adapter, events: Sender<RadioEvent>, cancel: CancellationToken, connect_timeout: Duration) -> Self {
        BtleRadio {
            adapter,
            events,
            cancel,
            scan: None,
            links: HashMap::new(),
            next_link: 0,
            connect_timeout,
        }
    }
}

impl Radio for BtleRadio {
    fn start_scan(&mut self, mode: ScanMode) -> Result<(), RadioError> {
        // btleplug has no scan mode setting
        debug!("Scan mode {:?} requested", mode);

        let previous = self.scan.take().map(|(cancel, handle)| {
            cancel.cancel();
            handle
        });
        let cancel = self.cancel.child_token();
        let handle = spawn(scan_task(self.adapter.clone(), self.events.clone(), cancel.clone(), previous));
        self.scan = Some((cancel, handle));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some((cancel, _)) = &self.scan {
            cancel.cancel();
        }
    }

    fn open_link(&mut self, address: &str) -> Result<LinkId, RadioError> {
        let address: BDAddr = address
            .parse()
            .map_err(|_| RadioError::InvalidAddress(address.to_string()))?;

        self.next_link += 1;
        let link = LinkId(self.next_link);
        let cancel = self.cancel.child_token();
        let (ops, ops_rx) = mpsc::channel(LINK_WRITE_QUEUE);

        spawn(link_task(
            self.adapter.clone(),
            address,
            link,
            self.events.clone(),
            cancel.clone(),
            ops_rx,
            self.connect_timeout,
        ));
        self.links.insert(link, LinkTask { cancel, ops });
        Ok(link)
    }

    fn close_link(&mut self, link: LinkId) {
        if let Some(task) = self.links.remove(&link) {
            task.cancel.cancel();
        }
    }

    fn discover_services(&mut self, link: LinkId) -> Result<(), RadioError> {
        let task = self.links.get(&link).ok_or(RadioError::LinkClosed)?;
        task.ops.try_send(LinkOp::Discover).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RadioError::Busy,
            mpsc::error::TrySendError::Closed(_) => RadioError::LinkClosed,
        })
    }

    fn write(&mut self, channel: &ChannelHandle, bytes: &[u8]) -> bool {
        match self.links.get(&channel.link) {
            Some(task) => task.ops.try_send(LinkOp::Write(channel.characteristic, bytes.to_vec())).is_ok(),
            None => false,
        }
    }
}

impl Drop for BtleRadio {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.scan.take() {
            cancel.cancel();
        }
        for (_, task) in self.links.drain() {
            task.cancel.cancel();
        }
    }
}

async fn observe(adapter: &Adapter, id: &PeripheralId) -> Option<DeviceRecord> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral vanished before it could be read: {:?}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => Some(DeviceRecord {
            address: properties.address.to_string(),
            name: properties.local_name,
            signal_strength: properties.rssi.unwrap_or(0),
        }),
    }
}

async fn scan_task(
    adapter: Adapter,
    mut events: Sender<RadioEvent>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    // let the previous scan finish stopping, or it could stop this one
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            report(&mut events, RadioEvent::ScanFailed(format!("Scan failed: {}", err))).await;
            return;
        },
    };

    // no filter: report every advertising device
    if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
        report(&mut events, RadioEvent::ScanFailed(format!("Scan failed: {}", err))).await;
        return;
    }

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = stream.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if let Some(record) = observe(&adapter, &id).await {
                        if !report(&mut events, RadioEvent::Advertisement(record)).await {
                            break 'mainloop;
                        }
                    }
                },
                Some(_) => {},
                None => {
                    report(&mut events, RadioEvent::ScanFailed("Scan failed: adapter event stream ended".to_string())).await;
                    break 'mainloop;
                },
            },
        }
    }

    if let Err(err) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {:?}", err);
    }
}

async fn find_peripheral(adapter: &Adapter, address: BDAddr) -> Result<Option<Peripheral>, RadioError> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals.into_iter().find(|peripheral| peripheral.address() == address))
}

async fn discover(peripheral: &Peripheral, link: LinkId) -> (LinkStatus, ServiceTable) {
    if let Err(err) = peripheral.discover_services().await {
        warn!("Service discovery failed: {:?}", err);
        return (status_of(&err), ServiceTable::default());
    }

    let services = peripheral
        .services()
        .into_iter()
        .map(|service| ServiceEntry {
            uuid: service.uuid,
            characteristics: service.characteristics.iter().map(|characteristic| characteristic.uuid).collect(),
        })
        .collect();

    (LinkStatus::Success, ServiceTable::new(link, services))
}

async fn write(peripheral: &Peripheral, uuid: Uuid, bytes: Vec<u8>) {
    let characteristic = peripheral.characteristics().into_iter().find(|characteristic| characteristic.uuid == uuid);

    match characteristic {
        None => warn!("Characteristic {} is not available", uuid),
        Some(characteristic) => {
            if let Err(err) = peripheral.write(&characteristic, &bytes, WriteType::WithoutResponse).await {
                warn!("Failed to send to characteristic {}: {:?}", uuid, err);
            }
        },
    }
}

async fn link_task(
    adapter: Adapter,
    address: BDAddr,
    link: LinkId,
    mut events: Sender<RadioEvent>,
    cancel: CancellationToken,
    mut ops: mpsc::Receiver<LinkOp>,
    connect_timeout: Duration,
) {
    let down = |status: LinkStatus| RadioEvent::LinkChanged { link, status, state: LinkState::Disconnected };

    let peripheral = match find_peripheral(&adapter, address).await {
        Ok(Some(peripheral)) => peripheral,
        Ok(None) => {
            warn!("No peripheral with address {} has been seen; scan first", address);
            report(&mut events, down(LinkStatus::GattError)).await;
            return;
        },
        Err(err) => {
            warn!("Finding peripheral failed: {}", err);
            report(&mut events, down(LinkStatus::GattError)).await;
            return;
        },
    };

    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            report(&mut events, down(status_of(&err))).await;
            return;
        },
    };

    info!("Connecting to peripheral {}...", address);
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = peripheral.disconnect().await;
            return;
        },
        result = timeout(connect_timeout, peripheral.connect()) => result,
    };

    match result {
        Ok(Ok(())) => {
            report(&mut events, RadioEvent::LinkChanged { link, status: LinkStatus::Success, state: LinkState::Connected }).await;
        },
        Ok(Err(err)) => {
            warn!("Connecting to peripheral failed: {:?}", err);
            report(&mut events, down(status_of(&err))).await;
            return;
        },
        Err(_) => {
            warn!("Connecting to peripheral took too long");
            let _ = peripheral.disconnect().await;
            report(&mut events, down(LinkStatus::Timeout)).await;
            return;
        },
    }

    let peripheral_id = peripheral.id();

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(op) = ops.recv() => match op {
                LinkOp::Discover => {
                    let (status, services) = discover(&peripheral, link).await;
                    report(&mut events, RadioEvent::ServicesDiscovered { link, status, services }).await;
                },
                LinkOp::Write(uuid, bytes) => write(&peripheral, uuid, bytes).await,
            },
            Some(event) = central_events.next() => {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("Connection lost");
                        report(&mut events, down(LinkStatus::PeerDisconnected)).await;
                        return;
                    }
                }
            },
        }
    }

    // closed from our side; best effort
    info!("Closing link to {}", address);
    if let Err(err) = peripheral.disconnect().await {
        warn!("Failed to disconnect: {:?}", err);
    }
}
