//! Session registry: one transport session per device name, shared through
//! reference-counted handles.
//!
//! The registry owns every session. Callers get a [`SessionHandle`]; creating
//! or cloning a handle adds a reference and dropping it removes one. The
//! session is closed and forgotten when the last handle goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryConfig;
use crate::descriptor::{DescriptorError, DescriptorTable};
use crate::discovery::DeviceDiscoverer;
use crate::events::{TracingObserver, UsbEvent, UsbObserver};
use crate::session::{ReadOutcome, SessionError, SessionSettings, TransportSession};
use crate::transport::{TransportError, UsbBackend};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("This device does not exist: {name}. Known devices are: {}", .known.join(", "))]
    UnknownDevice { name: String, known: Vec<String> },

    #[error("This device was disconnected: {name}. Currently available devices are: {}", .present.join(", "))]
    DeviceDisappeared { name: String, present: Vec<String> },

    #[error("USB discovery failed: {0}")]
    Discovery(#[source] TransportError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

struct Entry {
    session: Arc<Mutex<TransportSession>>,
    references: usize,
}

struct RegistryInner {
    discoverer: Arc<DeviceDiscoverer>,
    observer: Arc<dyn UsbObserver>,
    settings: SessionSettings,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl RegistryInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reference_changed(&self, name: &str, references: usize) {
        self.observer.on_event(&UsbEvent::ReferenceChanged {
            name: name.to_string(),
            references,
        });
    }

    /// Add a reference for a handle being cloned. False if no longer tracked.
    fn add_reference(&self, name: &str, session: &Arc<Mutex<TransportSession>>) -> bool {
        let mut sessions = self.sessions();
        match sessions.get_mut(name) {
            Some(entry) if Arc::ptr_eq(&entry.session, session) => {
                entry.references += 1;
                let references = entry.references;
                drop(sessions);
                self.reference_changed(name, references);
                true
            }
            _ => false,
        }
    }

    fn release(&self, name: &str, session: &Arc<Mutex<TransportSession>>) {
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get_mut(name) else {
            debug!(device = %name, "Released handle is not tracked");
            return;
        };
        if !Arc::ptr_eq(&entry.session, session) {
            debug!(device = %name, "Released handle belongs to an older session");
            return;
        }

        entry.references = entry.references.saturating_sub(1);
        let references = entry.references;
        if references > 0 {
            drop(sessions);
            self.reference_changed(name, references);
            return;
        }

        // Closed under the map lock so a concurrent acquire cannot reopen the
        // device while this handle still holds its interface.
        if let Some(entry) = sessions.remove(name) {
            let mut session = entry.session.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = session.close() {
                warn!(device = %name, error = %e, "Error closing USB device");
            }
        }
        drop(sessions);
        self.reference_changed(name, 0);
        info!(device = %name, "Session released");
    }
}

/// Owner of all transport sessions.
///
/// Dropping the registry closes every session it still tracks; handles that
/// outlive it refer to closed sessions.
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry and take the initial device snapshot.
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        table: DescriptorTable,
        settings: SessionSettings,
        observer: Arc<dyn UsbObserver>,
    ) -> Result<Self, RegistryError> {
        let discoverer = Arc::new(DeviceDiscoverer::new(
            backend,
            Arc::new(table),
            observer.clone(),
        ));
        let initial = discoverer
            .list_known_present_devices(false)
            .map_err(RegistryError::Discovery)?;
        info!(devices = ?initial, "USB registry initialised");

        Ok(Self {
            inner: Arc::new(RegistryInner {
                discoverer,
                observer,
                settings,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Registry with descriptors and settings from `config`.
    pub fn from_config(
        backend: Arc<dyn UsbBackend>,
        config: &RegistryConfig,
        observer: Arc<dyn UsbObserver>,
    ) -> Result<Self, RegistryError> {
        let table = config.descriptor_table()?;
        Self::new(backend, table, SessionSettings::from(config), observer)
    }

    /// Registry with the built-in table, default settings and tracing output.
    pub fn with_backend(backend: Arc<dyn UsbBackend>) -> Result<Self, RegistryError> {
        Self::from_config(backend, &RegistryConfig::default(), Arc::new(TracingObserver))
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        self.inner.discoverer.descriptors()
    }

    /// Known devices found by the initial (or latest) scan.
    pub fn list_available_device_names(&self) -> Vec<String> {
        self.inner.discoverer.cached_names().unwrap_or_default()
    }

    /// Scan the bus again and refresh the snapshot.
    pub fn rescan(&self) -> Result<Vec<String>, RegistryError> {
        self.inner
            .discoverer
            .list_known_present_devices(false)
            .map_err(RegistryError::Discovery)
    }

    /// Get a handle to the session for `name`, opening the device if needed.
    #[instrument(level = "info", skip(self))]
    pub fn acquire(&self, name: &str) -> Result<SessionHandle, RegistryError> {
        let table = self.descriptors();
        if !table.contains(name) {
            return Err(RegistryError::UnknownDevice {
                name: name.to_string(),
                known: table.names(),
            });
        }

        let mut sessions = self.inner.sessions();
        if let Some(entry) = sessions.get_mut(name) {
            entry.references += 1;
            let references = entry.references;
            let session = entry.session.clone();
            drop(sessions);
            self.inner.reference_changed(name, references);
            return Ok(self.handle(name, session));
        }

        let mut session = TransportSession::new(
            name,
            self.inner.discoverer.clone(),
            self.inner.settings.clone(),
        );
        if let Err(e) = session.open() {
            drop(sessions);
            warn!(device = %name, error = %e, "Failed to open USB device");
            return Err(self.diagnose_failure(name, e));
        }

        let session = Arc::new(Mutex::new(session));
        sessions.insert(
            name.to_string(),
            Entry {
                session: session.clone(),
                references: 1,
            },
        );
        drop(sessions);
        self.inner.reference_changed(name, 1);
        Ok(self.handle(name, session))
    }

    fn handle(&self, name: &str, session: Arc<Mutex<TransportSession>>) -> SessionHandle {
        SessionHandle {
            registry: self.inner.clone(),
            name: name.to_string(),
            session,
        }
    }

    /// Give a handle back. Same as dropping it.
    pub fn release(&self, handle: SessionHandle) {
        drop(handle);
    }

    /// Turn an open failure into an operator-facing error.
    ///
    /// Unknown names list every known device; names missing from a fresh
    /// scan list the devices currently present. Anything else, including a
    /// device that is present but refuses to open, is returned unchanged.
    pub fn diagnose_failure(&self, name: &str, error: SessionError) -> RegistryError {
        let table = self.descriptors();
        if !table.contains(name) {
            return RegistryError::UnknownDevice {
                name: name.to_string(),
                known: table.names(),
            };
        }

        if !matches!(
            error,
            SessionError::UnknownDevice(_)
                | SessionError::DeviceNotPresent(_)
                | SessionError::OpenFailed { .. }
                | SessionError::ClaimFailed { .. }
        ) {
            return RegistryError::Session(error);
        }

        match self.inner.discoverer.list_known_present_devices(false) {
            Ok(present) if !present.iter().any(|n| n == name) => {
                self.inner.observer.on_event(&UsbEvent::DeviceDisappeared {
                    name: name.to_string(),
                });
                RegistryError::DeviceDisappeared {
                    name: name.to_string(),
                    present,
                }
            }
            Ok(_) => RegistryError::Session(error),
            Err(scan_err) => {
                warn!(error = %scan_err, "Rescan during failure diagnosis failed");
                RegistryError::Session(error)
            }
        }
    }

    /// Live references to the session for `name`; zero if none is open.
    pub fn reference_count(&self, name: &str) -> usize {
        self.inner
            .sessions()
            .get(name)
            .map_or(0, |entry| entry.references)
    }

    /// Names with an open session, sorted.
    pub fn open_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and forget every session.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = self.inner.sessions().drain().collect();
        for (name, entry) in drained {
            if entry.references > 0 {
                warn!(device = %name, references = entry.references, "Closing session with live handles");
            }
            let mut session = entry.session.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = session.close() {
                warn!(device = %name, error = %e, "Error closing USB device");
            }
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared access to one session.
///
/// Dropping the handle releases its reference.
pub struct SessionHandle {
    registry: Arc<RegistryInner>,
    name: String,
    session: Arc<Mutex<TransportSession>>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exclusive access to the session for a multi-step exchange.
    pub fn lock(&self) -> MutexGuard<'_, TransportSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.lock().write(data)
    }

    pub fn read(&self, max_bytes: usize) -> Result<ReadOutcome, SessionError> {
        self.lock().read(max_bytes)
    }

    pub fn read_until_terminator(
        &self,
        max_answer_len: usize,
        terminator: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        self.lock()
            .read_until_terminator(max_answer_len, terminator, timeout)
    }

    pub fn set_command(&self, command: &str, terminator: &str) -> Result<(), SessionError> {
        self.lock().set_command(command, terminator)
    }

    pub fn get_answer(&self, max_len: usize, terminator: &str) -> Result<String, SessionError> {
        self.lock().get_answer(max_len, terminator)
    }

    /// Command and answer under one lock, so other handles cannot interleave.
    pub fn query(
        &self,
        command: &str,
        terminator: &str,
        max_len: usize,
    ) -> Result<String, SessionError> {
        self.lock().query(command, terminator, max_len)
    }

    pub fn purge(&self) -> Result<usize, SessionError> {
        self.lock().purge()
    }
}

impl Clone for SessionHandle {
    fn clone(&self) -> Self {
        if !self.registry.add_reference(&self.name, &self.session) {
            debug!(device = %self.name, "Cloning a handle the registry no longer tracks");
        }
        Self {
            registry: self.registry.clone(),
            name: self.name.clone(),
            session: self.session.clone(),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.release(&self.name, &self.session);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("session", &Arc::as_ptr(&self.session))
            .finish()
    }
}
