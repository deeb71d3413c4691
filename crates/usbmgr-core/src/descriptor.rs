//! Table of supported USB instruments.
//!
//! Every instrument the registry can open is described by a [`DeviceDescriptor`]:
//! its USB vendor/product IDs plus the interface and interrupt endpoints used to
//! talk to it. The built-in entries live in [`KNOWN_DEVICES`]; a
//! [`DescriptorTable`] combines them with any extra entries from configuration.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB identity and endpoint layout of one supported instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Human-readable name; unique key in the table.
    pub name: Cow<'static, str>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface claimed when the device is opened.
    #[serde(default)]
    pub interface: u8,
    /// Interrupt IN endpoint address.
    pub input_endpoint: u8,
    /// Interrupt OUT endpoint address.
    pub output_endpoint: u8,
    /// Largest single transfer, in bytes.
    pub max_packet_size: usize,
}

impl DeviceDescriptor {
    const fn builtin(
        name: &'static str,
        vendor_id: u16,
        product_id: u16,
        output_endpoint: u8,
        input_endpoint: u8,
        max_packet_size: usize,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            vendor_id,
            product_id,
            interface: 0,
            input_endpoint,
            output_endpoint,
            max_packet_size,
        }
    }

    /// Whether a physical device with these IDs is this instrument.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04X}:{:04X} if={} in=0x{:02X} out=0x{:02X} pkt={}]",
            self.name,
            self.vendor_id,
            self.product_id,
            self.interface,
            self.input_endpoint,
            self.output_endpoint,
            self.max_packet_size
        )
    }
}

/// Built-in instruments.
pub const KNOWN_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor::builtin("Velleman K8055-0", 0x10cf, 0x5500, 0x01, 0x81, 8),
    DeviceDescriptor::builtin("Velleman K8055-1", 0x10cf, 0x5501, 0x01, 0x81, 8),
    DeviceDescriptor::builtin("Velleman K8055-2", 0x10cf, 0x5502, 0x01, 0x81, 8),
    DeviceDescriptor::builtin("Velleman K8055-3", 0x10cf, 0x5503, 0x01, 0x81, 8),
    DeviceDescriptor::builtin("Velleman K8061-0", 0x10cf, 0x8061, 0x01, 0x81, 64),
    DeviceDescriptor::builtin("Ludl Mac 5000", 0x6969, 0x1235, 0x02, 0x82, 64),
    DeviceDescriptor::builtin("ASI MS-2000", 0x0b54, 0x2000, 0x02, 0x82, 64),
    DeviceDescriptor::builtin("Spectral LMM5", 0x1bdb, 0x0300, 0x02, 0x81, 64),
    DeviceDescriptor::builtin("Nikon AZ100m", 0x04b0, 0x7804, 0x05, 0x84, 64),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Duplicate device name in descriptor table: {0}")]
    DuplicateName(String),

    #[error("Device {0} declares a max packet size of 0")]
    ZeroPacketSize(String),
}

/// Validated, immutable set of device descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    entries: Vec<DeviceDescriptor>,
}

impl DescriptorTable {
    /// Build a table, rejecting duplicate names and zero packet sizes.
    pub fn new(entries: Vec<DeviceDescriptor>) -> Result<Self, DescriptorError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(&entry.name[..]) {
                return Err(DescriptorError::DuplicateName(entry.name.to_string()));
            }
            if entry.max_packet_size == 0 {
                return Err(DescriptorError::ZeroPacketSize(entry.name.to_string()));
            }
        }
        Ok(Self { entries })
    }

    /// The built-in table.
    pub fn builtin() -> Self {
        Self {
            entries: KNOWN_DEVICES.to_vec(),
        }
    }

    /// Built-in entries followed by `extra`.
    pub fn with_extra(extra: &[DeviceDescriptor]) -> Result<Self, DescriptorError> {
        let mut entries = KNOWN_DEVICES.to_vec();
        entries.extend_from_slice(extra);
        Self::new(entries)
    }

    pub fn find(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.entries.iter().find(|d| d.name == name)
    }

    /// First descriptor matching a VID/PID pair.
    pub fn find_by_ids(&self, vendor_id: u16, product_id: u16) -> Option<&DeviceDescriptor> {
        self.entries
            .iter()
            .find(|d| d.matches(vendor_id, product_id))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|d| d.name.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::builtin()
    }
}
