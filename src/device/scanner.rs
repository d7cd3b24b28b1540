use log::{info, warn};

use crate::device::radio::{Radio, ScanMode};
use crate::device::types::DeviceRecord;
use crate::error::RadioError;

/// Owns the scan lifecycle. Assumes the caller already holds the scan capability.
#[derive(Debug, Default)]
pub struct ScanEngine {
    scanning: bool,
    mode: ScanMode,
}

impl ScanEngine {
    pub fn new(mode: ScanMode) -> Self {
        ScanEngine { scanning: false, mode }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Starts a scan session. Returns `Ok(false)` if one is already active; a second start is
    /// ignored rather than queued.
    pub fn start<R: Radio>(&mut self, radio: &mut R) -> Result<bool, RadioError> {
        if self.scanning {
            return Ok(false);
        }

        if let Err(err) = radio.start_scan(self.mode) {
            warn!("Scan failed to start: {}", err);
            return Err(err);
        }

        info!("BLE scan started ({:?})", self.mode);
        self.scanning = true;
        Ok(true)
    }

    /// Returns whether a scan was actually stopped.
    pub fn stop<R: Radio>(&mut self, radio: &mut R) -> bool {
        if !self.scanning {
            return false;
        }

        radio.stop_scan();
        self.scanning = false;
        info!("BLE scan stopped");
        true
    }

    /// The hardware gave up on the scan by itself.
    pub fn on_scan_failed(&mut self, message: &str) -> bool {
        warn!("Scan failed: {}", message);
        let was_scanning = self.scanning;
        self.scanning = false;
        was_scanning
    }

    /// Passes through advertisements that belong to the active scan session. Anything the radio
    /// still delivers after a stop is dropped.
    pub fn on_advertisement(&self, record: DeviceRecord) -> Option<DeviceRecord> {
        if self.scanning { Some(record) } else { None }
    }
}
