use indexmap::IndexMap;

use crate::device::types::DeviceRecord;

/// Discovered devices keyed by address, in order of first observation.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    records: IndexMap<String, DeviceRecord>,
}

impl DeviceMap {
    pub fn new() -> Self {
        DeviceMap::default()
    }

    /// Folds one observation in. A known address keeps its position and takes the new fields.
    pub fn observe(&mut self, record: DeviceRecord) {
        self.records.insert(record.address.clone(), record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records.values().cloned().collect()
    }

    /// Records whose name or address contains `key`, ignoring case. An empty key matches all.
    pub fn matching(&self, key: &str) -> Vec<DeviceRecord> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return self.records();
        }

        self.records
            .values()
            .filter(|record| {
                record.name.as_deref().unwrap_or("").to_lowercase().contains(&key)
                    || record.address.to_lowercase().contains(&key)
            })
            .cloned()
            .collect()
    }
}
