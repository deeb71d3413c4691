//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBus, MockRead, MockWrite};
pub use nusb::NusbBackend;
pub use traits::{BusDevice, TransportError, UsbBackend, UsbHandle};
