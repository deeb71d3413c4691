//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::descriptor::{DescriptorTable, DeviceDescriptor};
use crate::discovery::DeviceDiscoverer;
use crate::events::NullObserver;
use crate::transport::MockBus;

pub(crate) const TEST0_VID: u16 = 0x1111;
pub(crate) const TEST0_PID: u16 = 0x2222;

pub(crate) fn test0_descriptor(max_packet_size: usize) -> DeviceDescriptor {
    DeviceDescriptor {
        name: "Test-0".into(),
        vendor_id: TEST0_VID,
        product_id: TEST0_PID,
        interface: 1,
        input_endpoint: 0x81,
        output_endpoint: 0x01,
        max_packet_size,
    }
}

/// Table holding only "Test-0" with an 8-byte packet size.
pub(crate) fn test_table() -> DescriptorTable {
    DescriptorTable::new(vec![test0_descriptor(8)]).unwrap()
}

pub(crate) fn test_discoverer(bus: &MockBus) -> Arc<DeviceDiscoverer> {
    discoverer_with_packet(bus, 8)
}

pub(crate) fn discoverer_with_packet(bus: &MockBus, max_packet_size: usize) -> Arc<DeviceDiscoverer> {
    let table = DescriptorTable::new(vec![test0_descriptor(max_packet_size)]).unwrap();
    Arc::new(DeviceDiscoverer::new(
        Arc::new(bus.clone()),
        Arc::new(table),
        Arc::new(NullObserver),
    ))
}
