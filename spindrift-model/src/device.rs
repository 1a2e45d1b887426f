//! A known device: the local one or an authenticated peer.

use spindrift_types::bep::Compression;
use spindrift_types::records::DeviceRecord;
use spindrift_types::DeviceId;

/// A device participating in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Certificate digest identity.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Pinned certificate common name, if any.
    pub cert_name: String,
    /// Compression preference for traffic with this device.
    pub compression: Compression,
    /// Device may introduce further devices.
    pub introducer: bool,
    /// Accept folder offers from this device without prompting.
    pub auto_accept: bool,
    /// Synchronization with this device is paused.
    pub paused: bool,
    /// Statically configured contact URLs.
    pub addresses: Vec<String>,
    /// Addresses observed at the last successful contact.
    pub last_seen: Vec<String>,
}

impl Device {
    /// A device with default attributes.
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cert_name: String::new(),
            compression: Compression::Metadata,
            introducer: false,
            auto_accept: false,
            paused: false,
            addresses: Vec::new(),
            last_seen: Vec::new(),
        }
    }

    /// Rebuild from a stored record; identity comes from the key.
    pub fn from_record(id: DeviceId, record: DeviceRecord) -> Self {
        Self {
            id,
            name: record.name,
            cert_name: record.cert_name,
            compression: Compression::try_from(record.compression)
                .unwrap_or(Compression::Metadata),
            introducer: record.introducer,
            auto_accept: record.auto_accept,
            paused: record.paused,
            addresses: record.addresses,
            last_seen: record.last_seen,
        }
    }

    /// Serialize the stored attributes.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            cert_name: self.cert_name.clone(),
            compression: self.compression as i32,
            introducer: self.introducer,
            auto_accept: self.auto_accept,
            paused: self.paused,
            addresses: self.addresses.clone(),
            last_seen: self.last_seen.clone(),
        }
    }

    /// Merge the mutable attributes from an updated record.
    pub fn update_from(&mut self, record: &DeviceRecord) {
        if !record.name.is_empty() {
            self.name = record.name.clone();
        }
        if !record.cert_name.is_empty() {
            self.cert_name = record.cert_name.clone();
        }
        self.compression =
            Compression::try_from(record.compression).unwrap_or(self.compression);
        self.introducer = record.introducer;
        self.auto_accept = record.auto_accept;
        self.paused = record.paused;
        if !record.addresses.is_empty() {
            self.addresses = record.addresses.clone();
        }
    }
}
