//! USB backend abstraction.
//!
//! Defines the `UsbBackend` and `UsbHandle` traits the sessions are written
//! against, allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to detach kernel driver from interface {interface}: {message}")]
    DetachFailed { interface: u8, message: String },

    #[error("Failed to set configuration {config}: {message}")]
    ConfigurationFailed { config: u8, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to select alternate setting {alt_setting}: {message}")]
    AltSettingFailed { alt_setting: u8, message: String },

    #[error("Write to endpoint 0x{endpoint:02X} failed: {message}")]
    WriteFailed { endpoint: u8, message: String },

    #[error("Read from endpoint 0x{endpoint:02X} failed: {message}")]
    ReadFailed { endpoint: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to close device: {0}")]
    CloseFailed(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// A physical device seen on the bus during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDevice {
    /// Platform bus identifier.
    pub bus_id: String,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for BusDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus {} addr {} [{:04X}:{:04X}]",
            self.bus_id, self.address, self.vendor_id, self.product_id
        )
    }
}

/// Entry point into the native USB library.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock bus for unit testing
pub trait UsbBackend: Send + Sync {
    /// Every physical device on every bus, bus order then device order.
    fn enumerate(&self) -> Result<Vec<BusDevice>, TransportError>;

    /// Open a native handle to a previously enumerated device.
    fn open(&self, device: &BusDevice) -> Result<Box<dyn UsbHandle>, TransportError>;
}

/// An opened native device handle.
///
/// Transfer calls block for at most `timeout`.
pub trait UsbHandle: Send {
    /// Detach whatever OS driver is bound to `interface`.
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError>;

    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Select an alternate setting on the claimed interface.
    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError>;

    /// One interrupt OUT transfer. Returns the number of bytes actually sent.
    fn interrupt_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// One interrupt IN transfer into `buf`. Returns the number of bytes received;
    /// zero means the device sent a zero-length packet.
    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Release the interface and the handle.
    fn close(self: Box<Self>) -> Result<(), TransportError>;
}
