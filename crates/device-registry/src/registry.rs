use crate::{DeviceId, DeviceRecord};
use line_transport::SharedLine;
use std::collections::{BTreeMap, HashMap};

/// Connected devices and their transport handles, keyed by port.
///
/// Records iterate in port order so listings and generator selection are
/// stable across runs.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    links: HashMap<DeviceId, SharedLine>,
}

impl DeviceRegistry {
    pub fn insert(&mut self, record: DeviceRecord, link: SharedLine) {
        self.links.insert(record.id.clone(), link);
        self.devices.insert(record.id.clone(), record);
    }

    /// Drop the record and its link. The link closes once no task holds it.
    pub fn remove(&mut self, id: &DeviceId) -> Option<DeviceRecord> {
        self.links.remove(id);
        self.devices.remove(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    pub fn link(&self, id: &DeviceId) -> Option<SharedLine> {
        self.links.get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Records whose link is still up.
    pub fn connected_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_connected()).count()
    }
}
