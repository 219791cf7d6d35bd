//! Chooses how a host buffer is made visible to the device.
//!
//! Drivers from major version 25 on can register memory the framework already
//! allocated. Older drivers only accept anonymous mappings, so the buffer gets
//! a freshly mapped and registered storage spliced in instead.

use std::sync::Arc;

use tracing::debug;

use crate::error::{KvpinError, Result};
use crate::probe::CapabilityProbe;
use crate::registry::PinnedRegistry;
use crate::tensor::{FreshStorage, Placement, SpliceStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStrategy {
    /// Register the buffer's own storage.
    Direct,
    /// Register a new mapping and splice it into the buffer.
    FreshBuffer,
}

pub struct RegistrationSelector {
    registry: Arc<PinnedRegistry>,
    probe: Arc<CapabilityProbe>,
    min_major: i64,
}

impl RegistrationSelector {
    pub fn new(registry: Arc<PinnedRegistry>, probe: Arc<CapabilityProbe>, min_major: i64) -> Self {
        Self { registry, probe, min_major }
    }

    /// Strategy for the installed driver. The version is queried every time.
    pub fn strategy(&self) -> Result<RegistrationStrategy> {
        let version = self.probe.driver_version()?;
        Ok(select_strategy(&version, self.min_major))
    }

    /// Make `buffer` device-visible and return its device address.
    ///
    /// With [`RegistrationStrategy::FreshBuffer`] the buffer's storage is
    /// replaced; its previous contents are not carried over.
    pub fn acquire_device_pointer<B>(&self, buffer: &mut B) -> Result<u64>
    where
        B: SpliceStorage + ?Sized,
    {
        if *buffer.placement() != (Placement::Host { pinned: true }) {
            return Err(KvpinError::precondition(
                "buffer must be host-resident and pinned to be registered",
            ));
        }
        let size = buffer.nbytes()?;

        match self.strategy()? {
            RegistrationStrategy::Direct => {
                let record = self.registry.register(buffer.data_ptr(), size)?;
                Ok(record.device_address)
            }
            RegistrationStrategy::FreshBuffer => {
                let record = self.registry.register_fresh_buffer(size)?;
                debug!(
                    "splicing fresh buffer {:#x} into host buffer {:#x}",
                    record.host_address,
                    buffer.data_ptr()
                );
                let storage = Arc::new(FreshStorage::new(Arc::clone(&self.registry), record));
                buffer.splice_storage(storage);
                Ok(record.device_address)
            }
        }
    }
}

/// Pick a strategy from a raw driver version string.
pub fn select_strategy(version: &str, min_major: i64) -> RegistrationStrategy {
    match parse_driver_major(version) {
        Some(major) if major >= min_major => RegistrationStrategy::Direct,
        _ => RegistrationStrategy::FreshBuffer,
    }
}

/// Leading integer of a version string such as `"25.0.rc1"` or `"30.2-beta"`.
pub fn parse_driver_major(version: &str) -> Option<i64> {
    let s = version.trim_start();
    let digits_start = usize::from(s.starts_with(['+', '-']));
    let end = s[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(s.len(), |i| i + digits_start);
    if end == digits_start {
        return None;
    }
    s[..end].parse().ok()
}
