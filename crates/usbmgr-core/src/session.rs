//! Transport session: one open connection to one physical instrument.
//!
//! A session looks its device up in the descriptor table, claims the
//! interface, and then moves opaque byte sequences over the interrupt
//! endpoints. Writes are split into packet-sized chunks; reads collect
//! packet-sized transfers; answers are framed by a caller-supplied terminator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::RegistryConfig;
use crate::descriptor::DeviceDescriptor;
use crate::discovery::DeviceDiscoverer;
use crate::events::{PacketDirection, UsbEvent, UsbObserver};
use crate::retry::{LastFailure, RetryPolicy, retry_transfer};
use crate::transport::{TransportError, UsbHandle};

/// Alternate setting selected after claiming the interface.
const ALT_SETTING: u8 = 0;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unknown USB device: {0}")]
    UnknownDevice(String),

    #[error("USB device {0} is not connected")]
    DeviceNotPresent(String),

    #[error("Failed to open USB device {name}: {source}")]
    OpenFailed {
        name: String,
        source: TransportError,
    },

    #[error("Can not take over USB device {name} from the OS driver: {source}")]
    ClaimFailed {
        name: String,
        source: TransportError,
    },

    #[error("USB device {0} is already open")]
    AlreadyOpen(String),

    #[error("USB device {0} is not open")]
    NotOpen(String),

    #[error("USB write failed on chunk {chunk} after {attempts} attempt(s): {reason}")]
    WriteFailed {
        chunk: usize,
        attempts: u32,
        reason: String,
    },

    #[error("USB read failed: {0}")]
    ReadFailed(#[source] TransportError),

    #[error("No answer terminated by \"{terminator}\" within {timeout_ms}ms ({received} bytes received)")]
    ReceiveFailed {
        terminator: String,
        timeout_ms: u64,
        received: usize,
    },

    #[error("Answer buffer must hold at least one byte")]
    BufferOverrun,

    #[error("Answer terminator must not be empty")]
    InvalidTerminator,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Timeouts and retry limits applied to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Per-transfer timeout.
    pub answer_timeout: Duration,
    /// Overall timeout of [`TransportSession::get_answer`].
    pub receive_timeout: Duration,
    pub write_retry: RetryPolicy,
    pub read_retry: RetryPolicy,
    pub configuration: u8,
    pub purge_packet_limit: usize,
}

impl From<&RegistryConfig> for SessionSettings {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            answer_timeout: config.answer_timeout(),
            receive_timeout: config.receive_timeout(),
            write_retry: RetryPolicy::new(config.write_attempts),
            read_retry: RetryPolicy::new(config.read_attempts),
            configuration: config.configuration,
            purge_packet_limit: config.purge_packet_limit,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

/// Why a [`TransportSession::read`] stopped collecting packets.
#[derive(Debug)]
pub enum ReadEnd {
    /// The requested number of bytes arrived.
    Filled,
    /// The device sent a zero-length packet.
    EndOfData,
    /// No packet within the answer timeout.
    TimedOut,
    /// A transfer failed after earlier packets had already produced data.
    /// The data is still returned; the error is kept for the caller.
    Interrupted(TransportError),
}

#[derive(Debug)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub end: ReadEnd,
}

struct OpenDevice {
    handle: Box<dyn UsbHandle>,
    descriptor: DeviceDescriptor,
}

/// Connection to one instrument. Closed until [`open`](Self::open) succeeds.
pub struct TransportSession {
    name: String,
    discoverer: Arc<DeviceDiscoverer>,
    observer: Arc<dyn UsbObserver>,
    settings: SessionSettings,
    device: Option<OpenDevice>,
}

impl TransportSession {
    pub fn new(
        name: impl Into<String>,
        discoverer: Arc<DeviceDiscoverer>,
        settings: SessionSettings,
    ) -> Self {
        let observer = discoverer.observer().clone();
        Self {
            name: name.into(),
            discoverer,
            observer,
            settings,
            device: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Descriptor of the opened device.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref().map(|d| &d.descriptor)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn answer_timeout(&self) -> Duration {
        self.settings.answer_timeout
    }

    pub fn set_answer_timeout(&mut self, timeout: Duration) {
        self.settings.answer_timeout = timeout;
    }

    /// Find the device on the bus and take it over.
    #[instrument(level = "info", skip(self), fields(device = %self.name))]
    pub fn open(&mut self) -> Result<(), SessionError> {
        if self.device.is_some() {
            return Err(SessionError::AlreadyOpen(self.name.clone()));
        }

        let descriptor = self
            .discoverer
            .descriptors()
            .find(&self.name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownDevice(self.name.clone()))?;

        let bus_device = self
            .discoverer
            .locate(&descriptor)?
            .ok_or_else(|| {
                warn!(device = %self.name, "USB device disappeared");
                SessionError::DeviceNotPresent(self.name.clone())
            })?;

        let mut handle = self
            .discoverer
            .backend()
            .open(&bus_device)
            .map_err(|source| SessionError::OpenFailed {
                name: self.name.clone(),
                source,
            })?;

        if let Err(e) = self.take_over(handle.as_mut(), &descriptor) {
            if let Err(close_err) = handle.close() {
                warn!(error = %close_err, "Failed to release handle after claim error");
            }
            return Err(e);
        }

        info!(
            bus_device = %bus_device,
            in_ep = %format!("0x{:02X}", descriptor.input_endpoint),
            out_ep = %format!("0x{:02X}", descriptor.output_endpoint),
            max_packet = descriptor.max_packet_size,
            "USB device opened"
        );
        self.observer.on_event(&UsbEvent::SessionOpened {
            name: self.name.clone(),
            vid: descriptor.vendor_id,
            pid: descriptor.product_id,
            interface: descriptor.interface,
        });
        self.device = Some(OpenDevice { handle, descriptor });
        Ok(())
    }

    /// Detach the OS driver, select the configuration and claim the interface.
    fn take_over(
        &self,
        handle: &mut dyn UsbHandle,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), SessionError> {
        let interface = descriptor.interface;

        match handle.detach_kernel_driver(interface) {
            Ok(()) => debug!(interface, "Disconnected OS driver"),
            Err(e) => warn!(interface, error = %e, "Could not disconnect OS driver"),
        }

        // Commonly reports busy on an already configured device.
        if let Err(e) = handle.set_configuration(self.settings.configuration) {
            debug!(error = %e, "Set configuration failed");
        }

        handle
            .claim_interface(interface)
            .and_then(|()| handle.set_alt_setting(ALT_SETTING))
            .map_err(|source| SessionError::ClaimFailed {
                name: self.name.clone(),
                source,
            })?;

        debug!(interface, "Took over the device");
        Ok(())
    }

    /// Release the device. Closing a closed session succeeds.
    ///
    /// The session is closed afterwards even if the backend reports an error.
    pub fn close(&mut self) -> Result<(), SessionError> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };

        info!(device = %self.name, "Closing USB device");
        self.observer.on_event(&UsbEvent::SessionClosed {
            name: self.name.clone(),
        });
        device.handle.close()?;
        Ok(())
    }

    fn open_device(&mut self) -> Result<&mut OpenDevice, SessionError> {
        let name = &self.name;
        self.device
            .as_mut()
            .ok_or_else(|| SessionError::NotOpen(name.clone()))
    }

    /// Send `data`, split into packets of at most the device's max packet size.
    ///
    /// Every chunk must be accepted in full; a chunk is attempted up to the
    /// write retry limit.
    #[instrument(level = "debug", skip(self, data), fields(device = %self.name, len = data.len()))]
    pub fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let timeout = self.settings.answer_timeout;
        let policy = self.settings.write_retry;
        let name = self.name.clone();
        let observer = self.observer.clone();
        let device = self.open_device()?;
        let endpoint = device.descriptor.output_endpoint;
        let packet = device.descriptor.max_packet_size;

        for (index, chunk) in data.chunks(packet).enumerate() {
            retry_transfer(policy, Some(chunk.len()), |attempt| {
                trace!(chunk = index, attempt, len = chunk.len(), "Interrupt write");
                device.handle.interrupt_write(endpoint, chunk, timeout)
            })
            .map_err(|exhausted| SessionError::WriteFailed {
                chunk: index,
                attempts: exhausted.attempts,
                reason: match exhausted.last {
                    LastFailure::Short {
                        transferred,
                        expected,
                    } => format!("short write ({transferred} of {expected} bytes)"),
                    LastFailure::Error(e) => e.to_string(),
                },
            })?;

            observer.on_event(&UsbEvent::Packet {
                name: name.clone(),
                direction: PacketDirection::Out,
                endpoint,
                data: chunk.to_vec(),
            });
        }

        Ok(())
    }

    /// Collect up to `max_bytes` from the input endpoint.
    ///
    /// Packets are requested at the device's max packet size; bytes of the
    /// last packet beyond `max_bytes` are discarded. A transfer error before
    /// any data is `ReadFailed`; after some data it ends the read with
    /// [`ReadEnd::Interrupted`].
    #[instrument(level = "debug", skip(self), fields(device = %self.name))]
    pub fn read(&mut self, max_bytes: usize) -> Result<ReadOutcome, SessionError> {
        let timeout = self.settings.answer_timeout;
        let policy = self.settings.read_retry;
        let name = self.name.clone();
        let observer = self.observer.clone();
        let device = self.open_device()?;
        let endpoint = device.descriptor.input_endpoint;

        let mut data = Vec::with_capacity(max_bytes);
        if max_bytes == 0 {
            return Ok(ReadOutcome {
                data,
                end: ReadEnd::Filled,
            });
        }
        let mut packet = vec![0u8; device.descriptor.max_packet_size];

        let end = loop {
            let result = retry_transfer(policy, None, |_| {
                device.handle.interrupt_read(endpoint, &mut packet, timeout)
            });

            match result {
                Ok(0) => break ReadEnd::EndOfData,
                Ok(n) => {
                    let wanted = max_bytes - data.len();
                    if n > wanted {
                        warn!(received = n, kept = wanted, "Discarding bytes beyond read size");
                    }
                    let kept = n.min(wanted);
                    data.extend_from_slice(&packet[..kept]);
                    observer.on_event(&UsbEvent::Packet {
                        name: name.clone(),
                        direction: PacketDirection::In,
                        endpoint,
                        data: packet[..kept].to_vec(),
                    });
                    if data.len() >= max_bytes {
                        break ReadEnd::Filled;
                    }
                }
                Err(exhausted) => {
                    let error = match exhausted.last {
                        LastFailure::Error(e) => e,
                        LastFailure::Short { .. } => TransportError::ReadFailed {
                            endpoint,
                            message: "transfer did not complete".into(),
                        },
                    };
                    if error.is_timeout() {
                        break ReadEnd::TimedOut;
                    }
                    if data.is_empty() {
                        return Err(SessionError::ReadFailed(error));
                    }
                    warn!(error = %error, collected = data.len(), "Read interrupted after partial data");
                    break ReadEnd::Interrupted(error);
                }
            }
        };

        debug!(bytes_read = data.len(), end = ?end, "Read complete");
        Ok(ReadOutcome { data, end })
    }

    /// Read until `terminator` shows up, returning what precedes it.
    ///
    /// `max_answer_len` counts the terminator bytes as well: bytes beyond it
    /// are never read, so a terminator arriving past that budget is lost.
    /// Transfer errors other than a disconnect are retried until `timeout`.
    /// Fails with `ReceiveFailed` if `timeout` elapses first or the answer
    /// grows to `max_answer_len` bytes without the terminator.
    #[instrument(level = "debug", skip(self), fields(device = %self.name))]
    pub fn read_until_terminator(
        &mut self,
        max_answer_len: usize,
        terminator: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        if max_answer_len < 1 {
            return Err(SessionError::BufferOverrun);
        }
        if terminator.is_empty() {
            return Err(SessionError::InvalidTerminator);
        }
        let term = terminator.as_bytes();

        let start = Instant::now();
        let mut answer: Vec<u8> = Vec::with_capacity(max_answer_len);

        while answer.len() < max_answer_len {
            match self.read(max_answer_len - answer.len()) {
                Ok(outcome) => {
                    if let ReadEnd::Interrupted(e) = &outcome.end {
                        debug!(error = %e, "Continuing after interrupted read");
                    }
                    answer.extend_from_slice(&outcome.data);
                }
                Err(SessionError::ReadFailed(e))
                    if !matches!(e, TransportError::Disconnected) =>
                {
                    debug!(error = %e, collected = answer.len(), "Read failed, polling again");
                }
                Err(e) => return Err(e),
            }

            if let Some(pos) = find_subsequence(&answer, term) {
                answer.truncate(pos);
                let text = String::from_utf8_lossy(&answer).into_owned();
                debug!(answer = %text, "Answer received");
                return Ok(text);
            }
            if start.elapsed() >= timeout {
                break;
            }
        }

        Err(SessionError::ReceiveFailed {
            terminator: terminator.escape_debug().to_string(),
            timeout_ms: timeout.as_millis() as u64,
            received: answer.len(),
        })
    }

    /// Send `command` followed by `terminator`.
    pub fn set_command(&mut self, command: &str, terminator: &str) -> Result<(), SessionError> {
        let mut text = String::with_capacity(command.len() + terminator.len());
        text.push_str(command);
        text.push_str(terminator);
        self.write(text.as_bytes())
    }

    /// Terminated answer within the session's receive timeout.
    pub fn get_answer(&mut self, max_len: usize, terminator: &str) -> Result<String, SessionError> {
        let timeout = self.settings.receive_timeout;
        self.read_until_terminator(max_len, terminator, timeout)
    }

    /// Send a command and wait for its terminated answer.
    pub fn query(
        &mut self,
        command: &str,
        terminator: &str,
        max_len: usize,
    ) -> Result<String, SessionError> {
        self.set_command(command, terminator)?;
        self.get_answer(max_len, terminator)
    }

    /// Discard input the device has already queued. Returns the bytes dropped.
    pub fn purge(&mut self) -> Result<usize, SessionError> {
        let timeout = self.settings.answer_timeout;
        let limit = self.settings.purge_packet_limit;
        let device = self.open_device()?;
        let endpoint = device.descriptor.input_endpoint;
        let mut packet = vec![0u8; device.descriptor.max_packet_size];

        let mut discarded = 0;
        for _ in 0..limit {
            match device.handle.interrupt_read(endpoint, &mut packet, timeout) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(TransportError::Disconnected) => return Err(TransportError::Disconnected.into()),
                Err(_) => break,
            }
        }
        if discarded > 0 {
            debug!(discarded, "Purged pending input");
        }
        Ok(discarded)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(device = %self.name, error = %e, "Error closing USB device");
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TEST0_PID, TEST0_VID, test_discoverer};
    use crate::transport::{MockBus, MockRead, MockWrite};

    fn open_session(bus: &MockBus) -> TransportSession {
        bus.add_device(TEST0_VID, TEST0_PID);
        let mut session =
            TransportSession::new("Test-0", test_discoverer(bus), SessionSettings::default());
        session.open().unwrap();
        session
    }

    #[test]
    fn test_open_claims_interface() {
        let bus = MockBus::new();
        let session = open_session(&bus);
        assert!(session.is_open());
        assert_eq!(bus.claimed_interfaces(), vec![1]);
        assert_eq!(bus.configurations(), vec![1]);
        assert_eq!(session.descriptor().unwrap().max_packet_size, 8);
    }

    #[test]
    fn test_open_twice_fails() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        assert!(matches!(session.open(), Err(SessionError::AlreadyOpen(_))));
    }

    #[test]
    fn test_open_unknown_device() {
        let bus = MockBus::new();
        let mut session =
            TransportSession::new("Nope", test_discoverer(&bus), SessionSettings::default());
        assert!(matches!(session.open(), Err(SessionError::UnknownDevice(_))));
        assert_eq!(bus.enumerate_calls(), 0);
    }

    #[test]
    fn test_open_device_not_present() {
        let bus = MockBus::new();
        let mut session =
            TransportSession::new("Test-0", test_discoverer(&bus), SessionSettings::default());
        assert!(matches!(
            session.open(),
            Err(SessionError::DeviceNotPresent(_))
        ));
        assert!(!session.is_open());
    }

    #[test]
    fn test_detach_failure_is_not_fatal() {
        let bus = MockBus::new();
        bus.fail_detach(true);
        let session = open_session(&bus);
        assert!(session.is_open());
    }

    #[test]
    fn test_claim_failure_releases_handle() {
        let bus = MockBus::new();
        bus.add_device(TEST0_VID, TEST0_PID);
        bus.fail_claim(true);
        let mut session =
            TransportSession::new("Test-0", test_discoverer(&bus), SessionSettings::default());

        assert!(matches!(session.open(), Err(SessionError::ClaimFailed { .. })));
        assert!(!session.is_open());
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(bus.close_calls(), 1);
        assert!(matches!(session.write(b"x"), Err(SessionError::NotOpen(_))));
        assert!(matches!(session.read(1), Err(SessionError::NotOpen(_))));
    }

    #[test]
    fn test_close_error_still_closes() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.fail_close(true);
        assert!(session.close().is_err());
        assert!(!session.is_open());
    }

    #[test]
    fn test_drop_closes_handle() {
        let bus = MockBus::new();
        let session = open_session(&bus);
        drop(session);
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_write_chunks_with_retry() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_write(MockWrite::Full);
        bus.queue_write(MockWrite::Short(3));
        bus.queue_write(MockWrite::Short(5));

        let payload: Vec<u8> = (0..20).collect();
        session.write(&payload).unwrap();

        let chunks = bus.writes();
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![8, 8, 4]
        );
        assert_eq!(chunks.concat(), payload);
        assert_eq!(bus.write_attempts(), vec![8, 8, 8, 8, 4]);
    }

    #[test]
    fn test_write_fails_after_three_short_writes() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_write(MockWrite::Full);
        for _ in 0..3 {
            bus.queue_write(MockWrite::Short(1));
        }

        let err = session.write(&[0u8; 20]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::WriteFailed {
                chunk: 1,
                attempts: 3,
                ..
            }
        ));
        // The third chunk is never attempted.
        assert_eq!(bus.write_attempts().len(), 4);
    }

    #[test]
    fn test_loopback_roundtrip_packet_sizes() {
        let payload: Vec<u8> = (0..20).map(|i| i * 3).collect();
        for packet in [4usize, 20, 64] {
            let bus = MockBus::new();
            bus.set_loopback(true);
            bus.add_device(TEST0_VID, TEST0_PID);
            let discoverer = crate::test_util::discoverer_with_packet(&bus, packet);
            let mut session =
                TransportSession::new("Test-0", discoverer, SessionSettings::default());
            session.open().unwrap();

            session.write(&payload).unwrap();
            let outcome = session.read(payload.len()).unwrap();
            assert_eq!(outcome.data, payload, "packet size {packet}");
            assert!(matches!(outcome.end, ReadEnd::Filled));
            assert_eq!(bus.pending_loopback(), 0);
        }
    }

    #[test]
    fn test_read_stops_at_zero_length_packet() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"abc");
        bus.queue_read(MockRead::ZeroLength);
        bus.queue_read_data(b"never");

        let outcome = session.read(32).unwrap();
        assert_eq!(outcome.data, b"abc");
        assert!(matches!(outcome.end, ReadEnd::EndOfData));
    }

    #[test]
    fn test_read_error_after_data_is_partial() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"12345678");
        bus.queue_read(MockRead::Fail);

        let outcome = session.read(32).unwrap();
        assert_eq!(outcome.data, b"12345678");
        assert!(matches!(outcome.end, ReadEnd::Interrupted(_)));
    }

    #[test]
    fn test_read_error_before_data_fails() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read(MockRead::Fail);
        assert!(matches!(session.read(8), Err(SessionError::ReadFailed(_))));
    }

    #[test]
    fn test_read_idle_endpoint_times_out() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        let outcome = session.read(8).unwrap();
        assert!(outcome.data.is_empty());
        assert!(matches!(outcome.end, ReadEnd::TimedOut));
    }

    #[test]
    fn test_read_until_terminator_across_packets() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"POS 12");
        bus.queue_read_data(b"34\r");
        bus.queue_read(MockRead::Timeout);
        bus.queue_read_data(b"\nrest");

        let answer = session
            .read_until_terminator(64, "\r\n", Duration::from_millis(500))
            .unwrap();
        assert_eq!(answer, "POS 1234");
    }

    #[test]
    fn test_read_until_terminator_survives_transient_error() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"POS 12");
        bus.queue_read(MockRead::Timeout);
        bus.queue_read(MockRead::Fail);
        bus.queue_read_data(b"34\r");

        let answer = session
            .read_until_terminator(64, "\r", Duration::from_millis(500))
            .unwrap();
        assert_eq!(answer, "POS 1234");
    }

    #[test]
    fn test_read_until_terminator_stops_on_disconnect() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"POS");
        bus.remove_device(TEST0_VID, TEST0_PID);

        let err = session
            .read_until_terminator(64, "\r", Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ReadFailed(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_read_until_terminator_budget_includes_terminator() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"12345\r");
        let answer = session
            .read_until_terminator(6, "\r", Duration::from_millis(50))
            .unwrap();
        assert_eq!(answer, "12345");

        bus.queue_read_data(b"12345\r");
        let err = session
            .read_until_terminator(5, "\r", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, SessionError::ReceiveFailed { received: 5, .. }));
    }

    #[test]
    fn test_read_until_terminator_times_out() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"no newline");

        let started = Instant::now();
        let err = session
            .read_until_terminator(10, "\n", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, SessionError::ReceiveFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_read_until_terminator_without_data_times_out() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        let err = session
            .read_until_terminator(10, "\n", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ReceiveFailed { received: 0, .. }
        ));
    }

    #[test]
    fn test_read_until_terminator_argument_errors() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        assert!(matches!(
            session.read_until_terminator(0, "\n", Duration::from_millis(10)),
            Err(SessionError::BufferOverrun)
        ));
        assert!(matches!(
            session.read_until_terminator(10, "", Duration::from_millis(10)),
            Err(SessionError::InvalidTerminator)
        ));
    }

    #[test]
    fn test_query_appends_terminator() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b":A\r");

        let answer = session.query("WHERE X", "\r", 32).unwrap();
        assert_eq!(answer, ":A");
        assert_eq!(bus.writes().concat(), b"WHERE X\r");
    }

    #[test]
    fn test_purge_discards_pending_input() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        bus.queue_read_data(b"stale data");
        assert_eq!(session.purge().unwrap(), 10);
        assert_eq!(session.purge().unwrap(), 0);
    }

    #[test]
    fn test_set_answer_timeout() {
        let bus = MockBus::new();
        let mut session = open_session(&bus);
        session.set_answer_timeout(Duration::from_millis(5));
        assert_eq!(session.answer_timeout(), Duration::from_millis(5));
    }
}
