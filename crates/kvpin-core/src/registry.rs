//! Registry of host memory ranges that are mapped into device address space.
//!
//! Lookups take the shared side of the lock and never block each other;
//! registration and unregistration take the exclusive side. Registration keeps
//! the exclusive lock across the driver call so that the driver mapping and
//! the map insert are atomic with respect to other registrations.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::driver::{AcceleratorDriver, HostMemory};
use crate::error::{KvpinError, Result};
use crate::probe;
use crate::range_index::{
    LinearRangeIndex, RangeIndex, RegisteredMemoryRecord, RegistrationPath, RegistryEntry,
};

pub struct PinnedRegistry {
    driver: Arc<dyn AcceleratorDriver>,
    host_memory: Arc<dyn HostMemory>,
    visible_devices_env: String,
    records: RwLock<Box<dyn RangeIndex>>,
}

impl PinnedRegistry {
    pub fn new(
        driver: Arc<dyn AcceleratorDriver>,
        host_memory: Arc<dyn HostMemory>,
        visible_devices_env: impl Into<String>,
    ) -> Self {
        Self::with_index(
            driver,
            host_memory,
            visible_devices_env,
            Box::new(LinearRangeIndex::new()),
        )
    }

    pub fn with_index(
        driver: Arc<dyn AcceleratorDriver>,
        host_memory: Arc<dyn HostMemory>,
        visible_devices_env: impl Into<String>,
        index: Box<dyn RangeIndex>,
    ) -> Self {
        Self {
            driver,
            host_memory,
            visible_devices_env: visible_devices_env.into(),
            records: RwLock::new(index),
        }
    }

    /// Register caller-owned host memory through the runtime.
    ///
    /// Registering the same base address again returns the existing record
    /// without touching the driver.
    pub fn register(&self, host_ptr: u64, size: usize) -> Result<RegisteredMemoryRecord> {
        if host_ptr == 0 || size == 0 {
            return Err(KvpinError::precondition(
                "host pointer cannot be null and size must be greater than 0",
            ));
        }
        let mut records = self.records.write();

        if let Some(existing) = records.get(host_ptr) {
            return Ok(existing.record);
        }
        if let Some(other) = records.overlapping(host_ptr, size) {
            return Err(KvpinError::precondition(format!(
                "range {:#x}+{} overlaps registered range {:#x}+{}",
                host_ptr, size, other.record.host_address, other.record.size
            )));
        }

        let device_address = self
            .driver
            .host_register(host_ptr, size)
            .map_err(|status| KvpinError::Driver { op: "host register", status })?;

        let record = RegisteredMemoryRecord {
            host_address: host_ptr,
            device_address,
            size,
        };
        records.insert(RegistryEntry { record, path: RegistrationPath::Direct });
        debug!(
            "registered host {:#x} ({} bytes) -> device {:#x}",
            host_ptr, size, device_address
        );
        Ok(record)
    }

    /// Map, register and lock a new host buffer through the low-level path.
    ///
    /// Used when the driver cannot register caller-owned memory. Any failure
    /// releases everything acquired before it.
    pub fn register_fresh_buffer(&self, size: usize) -> Result<RegisteredMemoryRecord> {
        if size == 0 {
            return Err(KvpinError::precondition("buffer size must be greater than 0"));
        }
        let device = probe::resolve_local_device_index(self.driver.as_ref(), &self.visible_devices_env)?;

        // The mapping is pre-faulted; populate it before blocking lookups.
        let host_ptr = self
            .host_memory
            .map(size)
            .map_err(|source| KvpinError::HostMemory { op: "mmap", source })?;

        if let Err(e) = self.host_memory.advise_huge_pages(host_ptr, size) {
            debug!("huge page advice for {:#x} ignored: {}", host_ptr, e);
        }

        let mut records = self.records.write();

        let device_address = match self.driver.hal_host_register(host_ptr, size, device) {
            Ok(addr) => addr,
            Err(status) => {
                self.unmap_logged(host_ptr, size);
                return Err(KvpinError::Driver { op: "hal host register", status });
            }
        };

        if let Err(source) = self.host_memory.lock(host_ptr, size) {
            // Usually RLIMIT_MEMLOCK or missing privileges. The buffer must be
            // pinned, so undo the registration and the mapping.
            if let Err(status) = self.driver.hal_host_unregister(host_ptr, device) {
                warn!(
                    "failed to unregister {:#x} after mlock failure: status {}",
                    host_ptr, status
                );
            }
            self.unmap_logged(host_ptr, size);
            return Err(KvpinError::HostMemory { op: "mlock", source });
        }

        let record = RegisteredMemoryRecord {
            host_address: host_ptr,
            device_address,
            size,
        };
        records.insert(RegistryEntry {
            record,
            path: RegistrationPath::Legacy { device },
        });
        debug!(
            device,
            "registered fresh host buffer {:#x} ({} bytes) -> device {:#x}",
            host_ptr, size, device_address
        );
        Ok(record)
    }

    /// Remove the registration based at `host_ptr`, if there is one.
    ///
    /// Driver failures are logged: context teardown may already have dropped
    /// the mapping.
    pub fn unregister(&self, host_ptr: u64) -> Result<()> {
        if host_ptr == 0 {
            return Err(KvpinError::precondition("host pointer cannot be null"));
        }
        let removed = self.records.write().remove(host_ptr);
        match removed {
            Some(entry) => {
                self.driver_unregister_logged(&entry);
                debug!("unregistered host {:#x}", host_ptr);
            }
            None => debug!("unregister of unknown host pointer {:#x} ignored", host_ptr),
        }
        Ok(())
    }

    /// Device address for any host address inside a registered range.
    pub fn resolve_device_pointer(&self, host_ptr: u64) -> Option<u64> {
        if host_ptr == 0 {
            return None;
        }
        self.records
            .read()
            .covering(host_ptr)
            .and_then(|e| e.record.translate(host_ptr))
    }

    /// Size of the registration covering `host_ptr`, or 0.
    pub fn record_size_of(&self, host_ptr: u64) -> usize {
        if host_ptr == 0 {
            return 0;
        }
        self.records
            .read()
            .covering(host_ptr)
            .map_or(0, |e| e.record.size)
    }

    /// Record covering `host_ptr`.
    pub fn record_of(&self, host_ptr: u64) -> Option<RegisteredMemoryRecord> {
        self.records.read().covering(host_ptr).map(|e| e.record)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Unregister every record and clear the registry.
    pub fn unregister_all(&self) {
        let mut records = self.records.write();
        let drained = records.drain();
        for entry in &drained {
            self.driver_unregister_logged(entry);
        }
        if !drained.is_empty() {
            debug!("unregistered {} host range(s)", drained.len());
        }
    }

    /// Release a buffer created by [`PinnedRegistry::register_fresh_buffer`].
    ///
    /// Called from buffer teardown, so nothing here raises.
    pub(crate) fn release_fresh_buffer(&self, host_ptr: u64, size: usize) {
        let removed = self.records.write().remove(host_ptr);
        if let Some(entry) = removed {
            self.driver_unregister_logged(&entry);
        }
        self.unmap_logged(host_ptr, size);
        debug!("released fresh host buffer {:#x} ({} bytes)", host_ptr, size);
    }

    fn driver_unregister_logged(&self, entry: &RegistryEntry) {
        let host_ptr = entry.record.host_address;
        let res = match entry.path {
            RegistrationPath::Direct => self.driver.host_unregister(host_ptr),
            RegistrationPath::Legacy { device } => self.driver.hal_host_unregister(host_ptr, device),
        };
        if let Err(status) = res {
            warn!("unable to unregister host {:#x}: status {}", host_ptr, status);
        }
    }

    fn unmap_logged(&self, host_ptr: u64, size: usize) {
        if let Err(e) = self.host_memory.unmap(host_ptr, size) {
            warn!("unable to unmap {:#x} ({} bytes): {}", host_ptr, size, e);
        }
    }
}

impl Drop for PinnedRegistry {
    fn drop(&mut self) {
        self.unregister_all();
    }
}
