//! usbmgr-core: shared USB instrument connections for a device-plugin host.
//!
//! This crate owns the USB side of instrument adapters: it knows which
//! instruments exist, finds them on the bus, opens one session per physical
//! device and lets several adapters share that session.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Descriptor**: Built-in table of supported instruments
//! - **Transport**: USB backend abstraction (nusb, mock)
//! - **Discovery**: Known devices present on the bus, cached and rescanned
//! - **Retry**: Bounded retry shared by read and write transfers
//! - **Session**: Chunked writes, packet reads, terminated answers
//! - **Registry**: One session per device, reference-counted handles
//! - **Host**: Module surface with result codes for a plugin host
//! - **Events**: Observer pattern for logging and UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbmgr_core::{NusbBackend, SessionRegistry};
//!
//! let registry = SessionRegistry::with_backend(Arc::new(NusbBackend::new()))?;
//! let stage = registry.acquire("ASI MS-2000")?;
//! let answer = stage.query("WHERE X", "\r", 64)?;
//! println!("{answer}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod events;
pub mod host;
pub mod registry;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

// Re-exports for convenience
pub use config::RegistryConfig;
pub use descriptor::{DescriptorError, DescriptorTable, DeviceDescriptor, KNOWN_DEVICES};
pub use discovery::DeviceDiscoverer;
pub use events::{NullObserver, PacketDirection, TracingObserver, UsbEvent, UsbObserver};
pub use host::{AvailableDevice, HostError, UsbModule};
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
pub use retry::RetryPolicy;
pub use session::{ReadEnd, ReadOutcome, SessionError, SessionSettings, TransportSession};
pub use transport::{
    BusDevice, MockBus, MockRead, MockWrite, NusbBackend, TransportError, UsbBackend, UsbHandle,
};
