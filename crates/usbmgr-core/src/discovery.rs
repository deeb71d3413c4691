//! Discovery of known devices on the host's USB buses.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, instrument};

use crate::descriptor::{DescriptorTable, DeviceDescriptor};
use crate::events::{UsbEvent, UsbObserver};
use crate::transport::{BusDevice, TransportError, UsbBackend};

/// Cross-references bus enumeration against the descriptor table.
///
/// Keeps the last scan's result so hosts can list devices without touching
/// the bus again.
pub struct DeviceDiscoverer {
    backend: Arc<dyn UsbBackend>,
    table: Arc<DescriptorTable>,
    observer: Arc<dyn UsbObserver>,
    cached: Mutex<Option<Vec<String>>>,
}

impl DeviceDiscoverer {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        table: Arc<DescriptorTable>,
        observer: Arc<dyn UsbObserver>,
    ) -> Self {
        Self {
            backend,
            table,
            observer,
            cached: Mutex::new(None),
        }
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    /// Names of known devices that are plugged in.
    ///
    /// With `use_cache` and an earlier scan available, returns that scan
    /// without I/O. Otherwise walks the bus and replaces the cache. Each
    /// physical device contributes at most one name, so two identical
    /// instruments show up twice.
    #[instrument(level = "debug", skip(self))]
    pub fn list_known_present_devices(
        &self,
        use_cache: bool,
    ) -> Result<Vec<String>, TransportError> {
        if use_cache
            && let Some(names) = self.cached_names()
        {
            self.observer.on_event(&UsbEvent::DevicesDiscovered {
                names: names.clone(),
                cached: true,
            });
            return Ok(names);
        }

        let names: Vec<String> = self
            .backend
            .enumerate()?
            .iter()
            .filter_map(|dev| self.table.find_by_ids(dev.vendor_id, dev.product_id))
            .map(|d| d.name.to_string())
            .collect();

        debug!(count = names.len(), "Known devices present");
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(names.clone());
        self.observer.on_event(&UsbEvent::DevicesDiscovered {
            names: names.clone(),
            cached: false,
        });
        Ok(names)
    }

    /// Last scan, if any.
    pub fn cached_names(&self) -> Option<Vec<String>> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fresh scan for the first physical device matching `descriptor`.
    pub fn locate(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Option<BusDevice>, TransportError> {
        Ok(self
            .backend
            .enumerate()?
            .into_iter()
            .find(|dev| descriptor.matches(dev.vendor_id, dev.product_id)))
    }

    pub(crate) fn backend(&self) -> &Arc<dyn UsbBackend> {
        &self.backend
    }

    pub(crate) fn observer(&self) -> &Arc<dyn UsbObserver> {
        &self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::MockBus;

    fn discoverer(bus: &MockBus) -> DeviceDiscoverer {
        DeviceDiscoverer::new(
            Arc::new(bus.clone()),
            Arc::new(DescriptorTable::builtin()),
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn test_fresh_scan_filters_unknown_devices() {
        let bus = MockBus::new();
        bus.add_device(0x0b54, 0x2000);
        bus.add_device(0xdead, 0xbeef);
        bus.add_device(0x10cf, 0x5501);

        let names = discoverer(&bus).list_known_present_devices(false).unwrap();
        assert_eq!(names, vec!["ASI MS-2000", "Velleman K8055-1"]);
    }

    #[test]
    fn test_duplicates_preserved() {
        let bus = MockBus::new();
        bus.add_device(0x0b54, 0x2000);
        bus.add_device(0x0b54, 0x2000);

        let names = discoverer(&bus).list_known_present_devices(false).unwrap();
        assert_eq!(names, vec!["ASI MS-2000", "ASI MS-2000"]);
    }

    #[test]
    fn test_cache_avoids_io() {
        let bus = MockBus::new();
        bus.add_device(0x1bdb, 0x0300);
        let discoverer = discoverer(&bus);

        // No snapshot yet: the cached call still scans once.
        assert_eq!(
            discoverer.list_known_present_devices(true).unwrap(),
            vec!["Spectral LMM5"]
        );
        assert_eq!(bus.enumerate_calls(), 1);

        bus.remove_device(0x1bdb, 0x0300);
        assert_eq!(
            discoverer.list_known_present_devices(true).unwrap(),
            vec!["Spectral LMM5"]
        );
        assert_eq!(bus.enumerate_calls(), 1);

        assert!(discoverer.list_known_present_devices(false).unwrap().is_empty());
        assert_eq!(bus.enumerate_calls(), 2);
        assert_eq!(discoverer.cached_names(), Some(Vec::new()));
    }

    #[test]
    fn test_empty_bus_is_not_an_error() {
        let bus = MockBus::new();
        assert!(discoverer(&bus).list_known_present_devices(false).unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_failure_propagates() {
        let bus = MockBus::new();
        bus.fail_enumeration(true);
        assert!(matches!(
            discoverer(&bus).list_known_present_devices(false),
            Err(TransportError::EnumerationFailed(_))
        ));
    }

    #[test]
    fn test_locate() {
        let bus = MockBus::new();
        let table = DescriptorTable::builtin();
        let lmm5 = table.find("Spectral LMM5").unwrap().clone();
        let discoverer = discoverer(&bus);

        assert!(discoverer.locate(&lmm5).unwrap().is_none());
        let plugged = bus.add_device(0x1bdb, 0x0300);
        assert_eq!(discoverer.locate(&lmm5).unwrap(), Some(plugged));
    }
}
