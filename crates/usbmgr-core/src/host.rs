//! Host-facing module surface.
//!
//! A plugin host discovers what it can load, creates devices by name and
//! deletes them again. [`UsbModule`] provides exactly those three calls on
//! top of a [`SessionRegistry`], and reports failures as a numeric result
//! code plus an operator-readable message.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::RegistryConfig;
use crate::events::UsbObserver;
use crate::registry::{RegistryError, SessionHandle, SessionRegistry};
use crate::session::SessionError;
use crate::transport::{TransportError, UsbBackend};

/// Result codes reported to the host.
pub mod codes {
    pub const DEVICE_OK: i32 = 0;
    pub const DEVICE_ERR: i32 = 1;
    pub const ERR_OPEN_FAILED: i32 = 101;
    pub const ERR_SETUP_FAILED: i32 = 102;
    pub const ERR_TRANSMIT_FAILED: i32 = 104;
    pub const ERR_RECEIVE_FAILED: i32 = 105;
    pub const ERR_BUFFER_OVERRUN: i32 = 106;
    pub const ERR_PORT_ALREADY_OPEN: i32 = 110;
    pub const ERR_PORT_DOES_NOT_EXIST: i32 = 111;
    pub const ERR_PORT_DISAPPEARED: i32 = 112;
    pub const ERR_CLAIM_INTERFACE: i32 = 113;
    pub const ERR_WRITE_FAILED: i32 = 114;
    pub const ERR_PORT_NOT_OPEN: i32 = 115;
    pub const ERR_CLOSING_DEVICE: i32 = 116;
    pub const ERR_INVALID_TERMINATOR: i32 = 117;
}

/// Description advertised for every loadable device.
pub const DEVICE_DESCRIPTION: &str = "USB device";

impl SessionError {
    pub fn code(&self) -> i32 {
        match self {
            SessionError::UnknownDevice(_) => codes::ERR_PORT_DOES_NOT_EXIST,
            SessionError::DeviceNotPresent(_) => codes::ERR_PORT_DISAPPEARED,
            SessionError::OpenFailed { .. } => codes::ERR_OPEN_FAILED,
            SessionError::ClaimFailed { .. } => codes::ERR_CLAIM_INTERFACE,
            SessionError::AlreadyOpen(_) => codes::ERR_PORT_ALREADY_OPEN,
            SessionError::NotOpen(_) => codes::ERR_PORT_NOT_OPEN,
            SessionError::WriteFailed { .. } => codes::ERR_WRITE_FAILED,
            SessionError::ReadFailed(_) | SessionError::ReceiveFailed { .. } => {
                codes::ERR_RECEIVE_FAILED
            }
            SessionError::BufferOverrun => codes::ERR_BUFFER_OVERRUN,
            SessionError::InvalidTerminator => codes::ERR_INVALID_TERMINATOR,
            SessionError::Transport(TransportError::CloseFailed(_)) => codes::ERR_CLOSING_DEVICE,
            SessionError::Transport(TransportError::Disconnected) => codes::ERR_PORT_DISAPPEARED,
            SessionError::Transport(_) => codes::ERR_TRANSMIT_FAILED,
        }
    }
}

impl RegistryError {
    pub fn code(&self) -> i32 {
        match self {
            RegistryError::UnknownDevice { .. } => codes::ERR_PORT_DOES_NOT_EXIST,
            RegistryError::DeviceDisappeared { .. } => codes::ERR_PORT_DISAPPEARED,
            RegistryError::Discovery(_) => codes::ERR_SETUP_FAILED,
            RegistryError::Descriptor(_) => codes::DEVICE_ERR,
            RegistryError::Session(e) => e.code(),
        }
    }
}

/// Failure as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for HostError {}

impl From<RegistryError> for HostError {
    fn from(error: RegistryError) -> Self {
        let message = match &error {
            RegistryError::UnknownDevice { known, .. } => format!(
                "This device does not exist.  Available devices are: \n{}",
                lines(known)
            ),
            RegistryError::DeviceDisappeared { present, .. } => format!(
                "This device was disconnected.  Currently available devices are: \n{}",
                lines(present)
            ),
            other => other.to_string(),
        };
        Self {
            code: error.code(),
            message,
        }
    }
}

impl From<SessionError> for HostError {
    fn from(error: SessionError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

fn lines(names: &[String]) -> String {
    names.iter().map(|n| format!("{n}\n")).collect()
}

/// A device the host may create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableDevice {
    pub name: String,
    pub description: &'static str,
}

/// The loadable module: lives from module load to module unload.
pub struct UsbModule {
    registry: SessionRegistry,
}

impl UsbModule {
    /// Load the module: build the registry and take the initial device snapshot.
    pub fn initialize(
        backend: Arc<dyn UsbBackend>,
        config: &RegistryConfig,
        observer: Arc<dyn UsbObserver>,
    ) -> Result<Self, HostError> {
        let registry = SessionRegistry::from_config(backend, config, observer)?;
        Ok(Self { registry })
    }

    pub fn from_registry(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Devices to advertise to the host.
    pub fn available_devices(&self) -> Vec<AvailableDevice> {
        let devices: Vec<AvailableDevice> = self
            .registry
            .list_available_device_names()
            .into_iter()
            .map(|name| AvailableDevice {
                name,
                description: DEVICE_DESCRIPTION,
            })
            .collect();
        info!(count = devices.len(), "USB devices available to the host");
        devices
    }

    pub fn create_device(&self, name: &str) -> Result<SessionHandle, HostError> {
        self.registry.acquire(name).map_err(HostError::from)
    }

    pub fn delete_device(&self, handle: SessionHandle) {
        self.registry.release(handle);
    }
}
