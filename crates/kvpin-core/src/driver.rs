//! Seams to the accelerator driver and to the host OS memory primitives.
//!
//! Everything the registry, the probe and the selector need from the outside
//! world goes through [`AcceleratorDriver`] and [`HostMemory`], so that a real
//! vendor binding and the fakes in [`crate::fake`] are interchangeable.

use std::fmt;

use crate::error::Result;

/// Raw status code returned by a driver entry point (0 = success).
pub type DriverStatus = i32;

/// Driver entry points used by this crate.
pub trait AcceleratorDriver: Send + Sync {
    /// Make `size` bytes of existing host memory at `host_ptr` visible to the
    /// device and return the device-side address.
    fn host_register(&self, host_ptr: u64, size: usize) -> std::result::Result<u64, DriverStatus>;

    /// Reverse of [`AcceleratorDriver::host_register`].
    fn host_unregister(&self, host_ptr: u64) -> std::result::Result<(), DriverStatus>;

    /// Low-level registration bound to a physical device index. `host_ptr`
    /// must come from an anonymous mapping.
    fn hal_host_register(
        &self,
        host_ptr: u64,
        size: usize,
        device: u32,
    ) -> std::result::Result<u64, DriverStatus>;

    /// Reverse of [`AcceleratorDriver::hal_host_register`].
    fn hal_host_unregister(&self, host_ptr: u64, device: u32) -> std::result::Result<(), DriverStatus>;

    /// Raw driver version string as reported by the management library.
    fn driver_version(&self, device: u32) -> Result<String>;

    /// Device ordinal of the current execution context.
    fn current_device(&self) -> std::result::Result<u32, DriverStatus>;

    /// Number of vector cores, when the driver can report it.
    fn vector_core_count(&self, _device: u32) -> Option<u32> {
        None
    }

    /// Per-core scratch memory size, when the driver can report it.
    fn scratch_bytes(&self, _device: u32) -> Option<u64> {
        None
    }

    /// PCIe location of a physical device.
    fn pci_address(&self, device: u32) -> Result<PciAddress>;
}

/// Anonymous page mappings and page locking on the host.
pub trait HostMemory: Send + Sync {
    /// Map `size` bytes of private, anonymous, pre-faulted memory.
    fn map(&self, size: usize) -> std::io::Result<u64>;

    /// Ask the kernel to back the range with transparent huge pages.
    fn advise_huge_pages(&self, addr: u64, size: usize) -> std::io::Result<()>;

    /// Lock the range in physical memory.
    fn lock(&self, addr: u64, size: usize) -> std::io::Result<()>;

    fn unmap(&self, addr: u64, size: usize) -> std::io::Result<()>;
}

/// PCIe bus/device/function address of an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}
