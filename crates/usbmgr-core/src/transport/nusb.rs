//! nusb-based USB backend.

use std::time::Duration;

use nusb::transfer::{Buffer, In, Interrupt, Out, TransferError as NusbTransferError};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{BusDevice, TransportError, UsbBackend, UsbHandle};

/// Backend over the host's real USB stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }

    fn list() -> Result<Vec<nusb::DeviceInfo>, TransportError> {
        let mut devices: Vec<_> = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .collect();
        devices.sort_by(|a, b| {
            (a.bus_id(), a.device_address()).cmp(&(b.bus_id(), b.device_address()))
        });
        Ok(devices)
    }
}

impl UsbBackend for NusbBackend {
    #[instrument(level = "debug", skip(self))]
    fn enumerate(&self) -> Result<Vec<BusDevice>, TransportError> {
        let devices: Vec<BusDevice> = Self::list()?
            .iter()
            .map(|d| BusDevice {
                bus_id: d.bus_id().to_string(),
                address: d.device_address(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
            })
            .collect();
        debug!(count = devices.len(), "Enumerated USB devices");
        Ok(devices)
    }

    #[instrument(level = "info", skip(self), fields(device = %device))]
    fn open(&self, device: &BusDevice) -> Result<Box<dyn UsbHandle>, TransportError> {
        let device_info = Self::list()?
            .into_iter()
            .find(|d| {
                d.bus_id() == device.bus_id
                    && d.device_address() == device.address
                    && d.vendor_id() == device.vendor_id
                    && d.product_id() == device.product_id
            })
            .ok_or(TransportError::Disconnected)?;

        let native = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            vendor_id = %format!("{:04X}", device.vendor_id),
            product_id = %format!("{:04X}", device.product_id),
            "Device handle acquired"
        );

        Ok(Box::new(NusbHandle {
            device: native,
            interface: None,
        }))
    }
}

struct NusbHandle {
    device: Device,
    interface: Option<Interface>,
}

impl NusbHandle {
    fn claimed(&self) -> Result<&Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: "no interface claimed".into(),
            })
    }
}

fn map_transfer_error(endpoint: u8, error: NusbTransferError, write: bool) -> TransportError {
    match error {
        NusbTransferError::Disconnected => TransportError::Disconnected,
        other if write => TransportError::WriteFailed {
            endpoint,
            message: other.to_string(),
        },
        other => TransportError::ReadFailed {
            endpoint,
            message: other.to_string(),
        },
    }
}

impl UsbHandle for NusbHandle {
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            self.device
                .detach_kernel_driver(interface)
                .map_err(|e| TransportError::DetachFailed {
                    interface,
                    message: e.to_string(),
                })
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            debug!(interface, "Kernel driver detach not supported on this platform");
            Ok(())
        }
    }

    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(config)
            .wait()
            .map_err(|e| TransportError::ConfigurationFailed {
                config,
                message: e.to_string(),
            })
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            })?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError> {
        self.claimed()?
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(|e| TransportError::AltSettingFailed {
                alt_setting,
                message: e.to_string(),
            })
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn interrupt_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .claimed()?
            .endpoint::<Interrupt, Out>(endpoint)
            .map_err(|e| TransportError::WriteFailed {
                endpoint,
                message: e.to_string(),
            })?;

        ep.submit(Buffer::from(data.to_vec()));
        let Some(completion) = ep.wait_next_complete(timeout) else {
            ep.cancel_all();
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        };
        completion
            .status
            .map_err(|e| map_transfer_error(endpoint, e, true))?;
        Ok(completion.actual_len)
    }

    #[instrument(level = "trace", skip(self, buf), fields(max_len = buf.len()))]
    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .claimed()?
            .endpoint::<Interrupt, In>(endpoint)
            .map_err(|e| TransportError::ReadFailed {
                endpoint,
                message: e.to_string(),
            })?;

        let mut request = Buffer::new(buf.len());
        request.set_requested_len(buf.len());
        ep.submit(request);
        let Some(completion) = ep.wait_next_complete(timeout) else {
            ep.cancel_all();
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        };
        completion
            .status
            .map_err(|e| map_transfer_error(endpoint, e, false))?;

        let n = completion.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&completion.buffer[..n]);
        Ok(n)
    }

    fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        // Releasing the interface and device happens on drop.
        drop(self.interface.take());
        debug!("Native handle released");
        Ok(())
    }
}
