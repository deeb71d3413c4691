//! Event system for host decoupling.
//!
//! Lets the host (or a CLI) follow session lifecycle and USB traffic without
//! the core knowing how it is displayed.

use std::fmt;

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Out, // Host -> Device
    In,  // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Out => write!(f, "OUT"),
            PacketDirection::In => write!(f, "IN"),
        }
    }
}

/// Events emitted by sessions and the registry.
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A discovery pass finished.
    DevicesDiscovered { names: Vec<String>, cached: bool },
    /// A session claimed its device.
    SessionOpened {
        name: String,
        vid: u16,
        pid: u16,
        interface: u8,
    },
    /// A session released its device.
    SessionClosed { name: String },
    /// A handle was created or dropped.
    ReferenceChanged { name: String, references: usize },
    /// A known device is no longer on the bus.
    DeviceDisappeared { name: String },
    /// A transfer moved data.
    Packet {
        name: String,
        direction: PacketDirection,
        endpoint: u8,
        data: Vec<u8>,
    },
}

/// Observer trait for receiving USB events.
pub trait UsbObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UsbEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UsbObserver for NullObserver {
    fn on_event(&self, _event: &UsbEvent) {}
}

/// Space-separated lowercase hex, the way packet traffic is logged.
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UsbObserver for TracingObserver {
    fn on_event(&self, event: &UsbEvent) {
        match event {
            UsbEvent::DevicesDiscovered { names, cached } => {
                tracing::info!(count = names.len(), cached, devices = ?names, "USB devices found");
            }
            UsbEvent::SessionOpened {
                name,
                vid,
                pid,
                interface,
            } => {
                tracing::info!(
                    device = %name,
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    interface,
                    "USB device opened"
                );
            }
            UsbEvent::SessionClosed { name } => {
                tracing::info!(device = %name, "USB device closed");
            }
            UsbEvent::ReferenceChanged { name, references } => {
                tracing::debug!(device = %name, references, "Reference count changed");
            }
            UsbEvent::DeviceDisappeared { name } => {
                tracing::warn!(device = %name, "USB device disappeared");
            }
            UsbEvent::Packet {
                name,
                direction,
                endpoint,
                data,
            } => {
                tracing::trace!(
                    device = %name,
                    dir = %direction,
                    ep = %format!("0x{:02X}", endpoint),
                    len = data.len(),
                    bytes = %hex_dump(data),
                    "USB packet"
                );
            }
        }
    }
}
