//! In-process stand-ins for the driver, the host OS and the kernel library.
//!
//! They hand out synthetic addresses and never touch memory, so they run on
//! machines without an accelerator. Failure injection and call counters let
//! tests observe exactly which driver calls were made.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::driver::{AcceleratorDriver, DriverStatus, HostMemory, PciAddress};
use crate::error::{KvpinError, Result};
use crate::kernel::{KernelLaunch, KernelLauncher, Stream};

const FAKE_DEVICE_BASE: u64 = 0xd000_0000_0000;
const FAKE_HOST_BASE: u64 = 0x7e00_0000_0000;
const PAGE: u64 = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverCalls {
    pub host_register: usize,
    pub host_unregister: usize,
    pub hal_host_register: usize,
    pub hal_host_unregister: usize,
    pub driver_version: usize,
}

struct DriverState {
    version: Option<String>,
    current_device: Option<u32>,
    vector_cores: Option<u32>,
    scratch_bytes: Option<u64>,
    host_register_status: Option<DriverStatus>,
    hal_register_status: Option<DriverStatus>,
    unregister_status: Option<DriverStatus>,
    next_device_address: u64,
    calls: DriverCalls,
    hal_devices: Vec<u32>,
}

/// Scriptable [`AcceleratorDriver`].
pub struct FakeDriver {
    state: Mutex<DriverState>,
}

impl FakeDriver {
    /// Driver on device 0 reporting `version`.
    pub fn new(version: &str) -> Self {
        Self {
            state: Mutex::new(DriverState {
                version: Some(version.to_string()),
                current_device: Some(0),
                vector_cores: None,
                scratch_bytes: None,
                host_register_status: None,
                hal_register_status: None,
                unregister_status: None,
                next_device_address: FAKE_DEVICE_BASE,
                calls: DriverCalls::default(),
                hal_devices: Vec::new(),
            }),
        }
    }

    pub fn set_version(&self, version: &str) {
        self.state.lock().version = Some(version.to_string());
    }

    /// Make the version query fail as if the management library were missing.
    pub fn remove_version(&self) {
        self.state.lock().version = None;
    }

    /// `None` makes the current-device query fail.
    pub fn set_current_device(&self, device: Option<u32>) {
        self.state.lock().current_device = device;
    }

    pub fn set_vector_cores(&self, cores: u32) {
        self.state.lock().vector_cores = Some(cores);
    }

    pub fn set_scratch_bytes(&self, bytes: u64) {
        self.state.lock().scratch_bytes = Some(bytes);
    }

    pub fn fail_host_register(&self, status: DriverStatus) {
        self.state.lock().host_register_status = Some(status);
    }

    pub fn fail_hal_host_register(&self, status: DriverStatus) {
        self.state.lock().hal_register_status = Some(status);
    }

    /// Make both unregister paths report `status`.
    pub fn fail_unregister(&self, status: DriverStatus) {
        self.state.lock().unregister_status = Some(status);
    }

    pub fn calls(&self) -> DriverCalls {
        self.state.lock().calls
    }

    /// Device indices passed to the low-level registration, in call order.
    pub fn hal_devices(&self) -> Vec<u32> {
        self.state.lock().hal_devices.clone()
    }

    fn allocate_device_range(state: &mut DriverState, size: usize) -> u64 {
        let addr = state.next_device_address;
        state.next_device_address += (size as u64).div_ceil(PAGE).max(1) * PAGE;
        addr
    }
}

impl AcceleratorDriver for FakeDriver {
    fn host_register(&self, _host_ptr: u64, size: usize) -> std::result::Result<u64, DriverStatus> {
        let mut state = self.state.lock();
        state.calls.host_register += 1;
        if let Some(status) = state.host_register_status {
            return Err(status);
        }
        Ok(Self::allocate_device_range(&mut state, size))
    }

    fn host_unregister(&self, _host_ptr: u64) -> std::result::Result<(), DriverStatus> {
        let mut state = self.state.lock();
        state.calls.host_unregister += 1;
        state.unregister_status.map_or(Ok(()), Err)
    }

    fn hal_host_register(
        &self,
        _host_ptr: u64,
        size: usize,
        device: u32,
    ) -> std::result::Result<u64, DriverStatus> {
        let mut state = self.state.lock();
        state.calls.hal_host_register += 1;
        state.hal_devices.push(device);
        if let Some(status) = state.hal_register_status {
            return Err(status);
        }
        Ok(Self::allocate_device_range(&mut state, size))
    }

    fn hal_host_unregister(&self, _host_ptr: u64, _device: u32) -> std::result::Result<(), DriverStatus> {
        let mut state = self.state.lock();
        state.calls.hal_host_unregister += 1;
        state.unregister_status.map_or(Ok(()), Err)
    }

    fn driver_version(&self, _device: u32) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.driver_version += 1;
        state
            .version
            .clone()
            .ok_or_else(|| KvpinError::DriverUnavailable("fake management library".to_string()))
    }

    fn current_device(&self) -> std::result::Result<u32, DriverStatus> {
        self.state.lock().current_device.ok_or(107_002)
    }

    fn vector_core_count(&self, _device: u32) -> Option<u32> {
        self.state.lock().vector_cores
    }

    fn scratch_bytes(&self, _device: u32) -> Option<u64> {
        self.state.lock().scratch_bytes
    }

    fn pci_address(&self, device: u32) -> Result<PciAddress> {
        Ok(PciAddress { domain: 0, bus: 0xc1 + device, device: 0, function: 0 })
    }
}

#[derive(Default)]
struct HostState {
    next_address: u64,
    mappings: BTreeMap<u64, usize>,
    locked: Vec<u64>,
    fail_map: bool,
    fail_lock: bool,
}

/// [`HostMemory`] that hands out page-aligned synthetic addresses.
pub struct FakeHostMemory {
    state: Mutex<HostState>,
}

impl Default for FakeHostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHostMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState { next_address: FAKE_HOST_BASE, ..HostState::default() }),
        }
    }

    pub fn fail_map(&self) {
        self.state.lock().fail_map = true;
    }

    pub fn fail_lock(&self) {
        self.state.lock().fail_lock = true;
    }

    /// Live mappings as `(address, size)`.
    pub fn mappings(&self) -> Vec<(u64, usize)> {
        self.state.lock().mappings.iter().map(|(a, s)| (*a, *s)).collect()
    }

    pub fn is_locked(&self, addr: u64) -> bool {
        self.state.lock().locked.contains(&addr)
    }
}

impl HostMemory for FakeHostMemory {
    fn map(&self, size: usize) -> std::io::Result<u64> {
        let mut state = self.state.lock();
        if state.fail_map {
            return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory));
        }
        let addr = state.next_address;
        state.next_address += (size as u64).div_ceil(PAGE).max(1) * PAGE;
        state.mappings.insert(addr, size);
        Ok(addr)
    }

    fn advise_huge_pages(&self, _addr: u64, _size: usize) -> std::io::Result<()> {
        Ok(())
    }

    fn lock(&self, addr: u64, _size: usize) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_lock {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        }
        state.locked.push(addr);
        Ok(())
    }

    fn unmap(&self, addr: u64, _size: usize) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.locked.retain(|a| *a != addr);
        match state.mappings.remove(&addr) {
            Some(_) => Ok(()),
            None => Err(std::io::Error::from(std::io::ErrorKind::InvalidInput)),
        }
    }
}

/// [`KernelLauncher`] that records every launch instead of running it.
#[derive(Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<(Stream, KernelLaunch)>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<(Stream, KernelLaunch)> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn last(&self) -> Option<KernelLaunch> {
        self.launches.lock().last().map(|(_, l)| *l)
    }
}

impl KernelLauncher for RecordingLauncher {
    fn current_stream(&self, device: u32) -> Result<Stream> {
        Ok(Stream { handle: 0x5000 + u64::from(device), device })
    }

    fn launch(&self, stream: Stream, launch: &KernelLaunch) -> Result<()> {
        self.launches.lock().push((stream, *launch));
        Ok(())
    }
}
