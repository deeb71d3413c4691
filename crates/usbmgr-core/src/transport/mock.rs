//! Mock USB bus for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::traits::{BusDevice, TransportError, UsbBackend, UsbHandle};

/// Scripted outcome of the next interrupt write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    /// Accept the whole chunk.
    Full,
    /// Accept only this many bytes.
    Short(usize),
    /// Fail the transfer.
    Fail,
}

/// Scripted outcome of the next interrupt read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    ZeroLength,
    Fail,
    Timeout,
}

#[derive(Default)]
struct MockState {
    devices: Vec<BusDevice>,
    next_address: u8,
    fail_enumeration: bool,
    fail_detach: bool,
    fail_claim: bool,
    fail_close: bool,
    enumerate_calls: usize,
    open_calls: usize,
    close_calls: usize,
    write_script: VecDeque<MockWrite>,
    read_script: VecDeque<MockRead>,
    loopback: bool,
    loopback_buf: VecDeque<u8>,
    /// Every write attempt: (endpoint, bytes offered, bytes accepted).
    write_log: Vec<(u8, Vec<u8>, usize)>,
    claimed: Vec<u8>,
    configurations: Vec<u8>,
}

/// In-memory USB bus.
///
/// Cloning shares the same bus, so a test can keep a clone to script and
/// inspect traffic while the registry owns another.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug a device into bus "1".
    pub fn add_device(&self, vendor_id: u16, product_id: u16) -> BusDevice {
        let mut state = self.state();
        state.next_address += 1;
        let device = BusDevice {
            bus_id: "1".into(),
            address: state.next_address,
            vendor_id,
            product_id,
        };
        state.devices.push(device.clone());
        device
    }

    /// Unplug every device with these IDs.
    pub fn remove_device(&self, vendor_id: u16, product_id: u16) {
        self.state()
            .devices
            .retain(|d| d.vendor_id != vendor_id || d.product_id != product_id);
    }

    /// Echo every accepted write back on the read side.
    pub fn set_loopback(&self, enabled: bool) {
        self.state().loopback = enabled;
    }

    pub fn queue_write(&self, outcome: MockWrite) {
        self.state().write_script.push_back(outcome);
    }

    pub fn queue_read(&self, outcome: MockRead) {
        self.state().read_script.push_back(outcome);
    }

    pub fn queue_read_data(&self, data: &[u8]) {
        self.queue_read(MockRead::Data(data.to_vec()));
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state().fail_enumeration = fail;
    }

    pub fn fail_detach(&self, fail: bool) {
        self.state().fail_detach = fail;
    }

    pub fn fail_claim(&self, fail: bool) {
        self.state().fail_claim = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state().fail_close = fail;
    }

    pub fn enumerate_calls(&self) -> usize {
        self.state().enumerate_calls
    }

    pub fn open_calls(&self) -> usize {
        self.state().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        let state = self.state();
        state.open_calls - state.close_calls
    }

    /// Chunks that were accepted in full.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .write_log
            .iter()
            .filter(|(_, data, accepted)| *accepted == data.len())
            .map(|(_, data, _)| data.clone())
            .collect()
    }

    /// Size of every write attempt, including short and failed ones.
    pub fn write_attempts(&self) -> Vec<usize> {
        self.state()
            .write_log
            .iter()
            .map(|(_, data, _)| data.len())
            .collect()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }

    pub fn configurations(&self) -> Vec<u8> {
        self.state().configurations.clone()
    }

    /// Bytes still waiting on the loopback read side.
    pub fn pending_loopback(&self) -> usize {
        self.state().loopback_buf.len()
    }
}

impl UsbBackend for MockBus {
    fn enumerate(&self) -> Result<Vec<BusDevice>, TransportError> {
        let mut state = self.state();
        state.enumerate_calls += 1;
        if state.fail_enumeration {
            return Err(TransportError::EnumerationFailed("mock bus unavailable".into()));
        }
        Ok(state.devices.clone())
    }

    fn open(&self, device: &BusDevice) -> Result<Box<dyn UsbHandle>, TransportError> {
        let mut state = self.state();
        if !state.devices.contains(device) {
            return Err(TransportError::Disconnected);
        }
        state.open_calls += 1;
        Ok(Box::new(MockHandle {
            bus: self.clone(),
            device: device.clone(),
        }))
    }
}

struct MockHandle {
    bus: MockBus,
    device: BusDevice,
}

impl MockHandle {
    fn connected(&self, state: &MockState) -> Result<(), TransportError> {
        if state.devices.contains(&self.device) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl UsbHandle for MockHandle {
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.bus.state().fail_detach {
            return Err(TransportError::DetachFailed {
                interface,
                message: "no driver bound".into(),
            });
        }
        Ok(())
    }

    fn set_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        self.bus.state().configurations.push(config);
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.bus.state();
        if state.fail_claim {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: "resource busy".into(),
            });
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn set_alt_setting(&mut self, _alt_setting: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn interrupt_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.bus.state();
        self.connected(&state)?;
        let outcome = state.write_script.pop_front().unwrap_or(MockWrite::Full);
        let accepted = match outcome {
            MockWrite::Full => data.len(),
            MockWrite::Short(n) => n.min(data.len()),
            MockWrite::Fail => {
                state.write_log.push((endpoint, data.to_vec(), 0));
                return Err(TransportError::WriteFailed {
                    endpoint,
                    message: "mock failure".into(),
                });
            }
        };
        state.write_log.push((endpoint, data.to_vec(), accepted));
        if state.loopback && accepted == data.len() {
            state.loopback_buf.extend(data.iter().copied());
        }
        Ok(accepted)
    }

    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.bus.state();
        self.connected(&state)?;

        if let Some(outcome) = state.read_script.pop_front() {
            return match outcome {
                MockRead::Data(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        state
                            .read_script
                            .push_front(MockRead::Data(data[n..].to_vec()));
                    }
                    Ok(n)
                }
                MockRead::ZeroLength => Ok(0),
                MockRead::Fail => Err(TransportError::ReadFailed {
                    endpoint,
                    message: "mock failure".into(),
                }),
                MockRead::Timeout => Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
        }

        if state.loopback && !state.loopback_buf.is_empty() {
            let n = state.loopback_buf.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(state.loopback_buf.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }

        drop(state);
        // Nothing pending: behave like an idle endpoint.
        thread::sleep(timeout.min(Duration::from_millis(1)));
        Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.bus.state();
        state.close_calls += 1;
        if state.fail_close {
            return Err(TransportError::CloseFailed("mock failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_enumeration() {
        let bus = MockBus::new();
        bus.add_device(0x1111, 0x2222);
        bus.add_device(0x3333, 0x4444);

        let devices = bus.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, 1);
        assert_eq!(devices[1].vendor_id, 0x3333);
        assert_eq!(bus.enumerate_calls(), 1);

        bus.remove_device(0x1111, 0x2222);
        assert_eq!(bus.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn test_mock_write_script() {
        let bus = MockBus::new();
        let device = bus.add_device(0x1111, 0x2222);
        let mut handle = bus.open(&device).unwrap();
        let timeout = Duration::from_millis(20);

        bus.queue_write(MockWrite::Short(2));
        assert_eq!(handle.interrupt_write(0x01, b"Hello", timeout).unwrap(), 2);
        assert_eq!(handle.interrupt_write(0x01, b"World", timeout).unwrap(), 5);

        assert_eq!(bus.writes(), vec![b"World".to_vec()]);
        assert_eq!(bus.write_attempts(), vec![5, 5]);
    }

    #[test]
    fn test_mock_disconnect() {
        let bus = MockBus::new();
        let device = bus.add_device(0x1111, 0x2222);
        let mut handle = bus.open(&device).unwrap();

        bus.remove_device(0x1111, 0x2222);
        let mut buf = [0u8; 8];
        assert!(matches!(
            handle.interrupt_read(0x81, &mut buf, Duration::from_millis(1)),
            Err(TransportError::Disconnected)
        ));
        assert!(bus.open(&device).is_err());
    }

    #[test]
    fn test_mock_read_splits_long_data() {
        let bus = MockBus::new();
        let device = bus.add_device(0x1111, 0x2222);
        let mut handle = bus.open(&device).unwrap();
        bus.queue_read_data(b"0123456789");

        let mut buf = [0u8; 8];
        let timeout = Duration::from_millis(20);
        assert_eq!(handle.interrupt_read(0x81, &mut buf, timeout).unwrap(), 8);
        assert_eq!(&buf, b"01234567");
        assert_eq!(handle.interrupt_read(0x81, &mut buf, timeout).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert!(
            handle
                .interrupt_read(0x81, &mut buf, timeout)
                .unwrap_err()
                .is_timeout()
        );
    }
}
