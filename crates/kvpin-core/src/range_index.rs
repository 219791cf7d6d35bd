//! Lookup structure behind the pinned-memory registry.

use std::collections::BTreeMap;

/// A host range that has been made visible to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredMemoryRecord {
    pub host_address: u64,
    pub device_address: u64,
    pub size: usize,
}

impl RegisteredMemoryRecord {
    /// True if `addr` lies in `[host_address, host_address + size)`.
    pub fn covers(&self, addr: u64) -> bool {
        addr >= self.host_address && addr - self.host_address < self.size as u64
    }

    /// True if `[base, base + size)` intersects this record's host range.
    pub fn overlaps(&self, base: u64, size: usize) -> bool {
        let end = base.saturating_add(size as u64);
        let own_end = self.host_address.saturating_add(self.size as u64);
        base < own_end && self.host_address < end
    }

    /// Device address corresponding to a covered host address.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        self.covers(addr)
            .then(|| self.device_address + (addr - self.host_address))
    }
}

/// Which driver path registered a record, so teardown can use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPath {
    /// Caller-owned memory registered through the runtime.
    Direct,
    /// Freshly mapped memory registered through the low-level path.
    Legacy { device: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub record: RegisteredMemoryRecord,
    pub path: RegistrationPath,
}

/// Range lookup over registered host memory, keyed by base address.
///
/// Implementations are not synchronised; the registry wraps them in its lock.
pub trait RangeIndex: Send + Sync {
    fn insert(&mut self, entry: RegistryEntry);

    /// Entry whose base address is exactly `base`.
    fn get(&self, base: u64) -> Option<&RegistryEntry>;

    fn remove(&mut self, base: u64) -> Option<RegistryEntry>;

    /// Entry whose host range contains `addr`, if any.
    fn covering(&self, addr: u64) -> Option<&RegistryEntry>;

    /// Some entry whose host range intersects `[base, base + size)`.
    fn overlapping(&self, base: u64, size: usize) -> Option<&RegistryEntry>;

    /// Remove and return every entry.
    fn drain(&mut self) -> Vec<RegistryEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default [`RangeIndex`]: exact lookups by key, range lookups by linear scan.
///
/// `covering` and `overlapping` are O(n) in the number of live registrations.
/// That is fine for the tens of large buffers an inference process pins; swap
/// in an interval structure before relying on it for thousands.
#[derive(Debug, Default)]
pub struct LinearRangeIndex {
    entries: BTreeMap<u64, RegistryEntry>,
}

impl LinearRangeIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RangeIndex for LinearRangeIndex {
    fn insert(&mut self, entry: RegistryEntry) {
        self.entries.insert(entry.record.host_address, entry);
    }

    fn get(&self, base: u64) -> Option<&RegistryEntry> {
        self.entries.get(&base)
    }

    fn remove(&mut self, base: u64) -> Option<RegistryEntry> {
        self.entries.remove(&base)
    }

    fn covering(&self, addr: u64) -> Option<&RegistryEntry> {
        self.entries.values().find(|e| e.record.covers(addr))
    }

    fn overlapping(&self, base: u64, size: usize) -> Option<&RegistryEntry> {
        self.entries.values().find(|e| e.record.overlaps(base, size))
    }

    fn drain(&mut self) -> Vec<RegistryEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
