//! Dynamic loading of the Ascend runtime, HAL, management and DCMI libraries.
//!
//! Library names come from `[driver]` in kvpin.toml. The runtime and HAL
//! libraries are required; DCMI is optional and only needed for PCIe queries.
//! The management library is opened for each version query and closed again.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::Arc;

use kvpin_core::config::DriverConfig;
use kvpin_core::driver::{AcceleratorDriver, DriverStatus, PciAddress};
use kvpin_core::{KvpinError, Result};
use libloading::{Library, Symbol};
use tracing::{debug, info, warn};

use crate::error::DriverLoadError;
use crate::status::status_name;

pub type AclError = c_int;

pub const ACL_SUCCESS: AclError = 0;
/// `aclrtHostRegisterType::ACL_HOST_REGISTER_MAPPED`
const ACL_HOST_REGISTER_MAPPED: c_int = 0;
/// `aclDeviceInfo::ACL_DEVICE_INFO_VECTOR_CORE_NUM`
const ACL_DEVICE_INFO_VECTOR_CORE_NUM: c_int = 1;
/// `HOST_MEM_MAP_DEV_PCIE_TH` from ascend_hal_define.h
const HOST_MEM_MAP_DEV_PCIE_TH: c_uint = 2;
const VERSION_BUFFER_LEN: c_uint = 256;

type FnAclrtHostRegister =
    unsafe extern "C" fn(ptr: *mut c_void, size: u64, kind: c_int, dev_ptr: *mut *mut c_void) -> AclError;
type FnAclrtHostUnregister = unsafe extern "C" fn(ptr: *mut c_void) -> AclError;
type FnAclrtGetDevice = unsafe extern "C" fn(device: *mut i32) -> AclError;
type FnAclrtGetSocName = unsafe extern "C" fn() -> *const c_char;
type FnAclGetDeviceCapability =
    unsafe extern "C" fn(device: u32, info: c_int, value: *mut i64) -> AclError;

type FnHalHostRegister = unsafe extern "C" fn(
    src: *mut c_void,
    size: u64,
    flag: c_uint,
    devid: c_uint,
    dst: *mut *mut c_void,
) -> c_int;
type FnHalHostUnregisterEx = unsafe extern "C" fn(src: *mut c_void, devid: c_uint, flag: c_uint) -> c_int;

type FnDsmiGetVersion =
    unsafe extern "C" fn(device: c_int, version: *mut c_char, len: c_uint, ret_len: *mut c_uint) -> c_int;

type FnDcmiInit = unsafe extern "C" fn() -> c_int;
type FnDcmiGetDevicePcieInfoV2 =
    unsafe extern "C" fn(card: c_int, device: c_int, info: *mut DcmiPcieInfoAll) -> c_int;

/// `struct dcmi_pcie_info_all` from dcmi_interface_api.h
#[repr(C)]
#[derive(Default)]
struct DcmiPcieInfoAll {
    vendor_id: c_uint,
    subvendor_id: c_uint,
    device_id: c_uint,
    subdevice_id: c_uint,
    domain: c_int,
    bdf_bus_id: c_uint,
    bdf_device_id: c_uint,
    bdf_func_id: c_uint,
    reserve: [u8; 32],
}

struct Dcmi {
    _lib: Library,
    get_device_pcie_info_v2: FnDcmiGetDevicePcieInfoV2,
}

/// Runtime and HAL entry points of an installed Ascend driver.
pub struct AscendDriver {
    _runtime: Library,
    _hal: Library,
    dcmi: Option<Dcmi>,
    management_libs: Vec<String>,

    aclrt_host_register: FnAclrtHostRegister,
    aclrt_host_unregister: FnAclrtHostUnregister,
    aclrt_get_device: FnAclrtGetDevice,
    aclrt_get_soc_name: Option<FnAclrtGetSocName>,
    acl_get_device_capability: Option<FnAclGetDeviceCapability>,

    hal_host_register: FnHalHostRegister,
    hal_host_unregister_ex: FnHalHostUnregisterEx,
}

// SAFETY: the libraries stay loaded for the lifetime of the struct and the
// runtime entry points may be called from any thread.
unsafe impl Send for AscendDriver {}
unsafe impl Sync for AscendDriver {}

impl AscendDriver {
    /// Load the runtime and HAL libraries and resolve their entry points.
    pub fn load(config: &DriverConfig) -> std::result::Result<Arc<Self>, DriverLoadError> {
        let runtime = load_library("runtime", &config.runtime_libs)?;
        let hal = load_library("HAL", &config.hal_libs)?;
        let dcmi = match Self::load_dcmi(&config.dcmi_libs) {
            Ok(dcmi) => Some(dcmi),
            Err(e) => {
                warn!("PCIe queries unavailable: {}", e);
                None
            }
        };

        unsafe {
            let driver = Self {
                aclrt_host_register: load_fn(&runtime, "aclrtHostRegister")?,
                aclrt_host_unregister: load_fn(&runtime, "aclrtHostUnregister")?,
                aclrt_get_device: load_fn(&runtime, "aclrtGetDevice")?,
                aclrt_get_soc_name: load_fn_opt(&runtime, "aclrtGetSocName"),
                acl_get_device_capability: load_fn_opt(&runtime, "aclGetDeviceCapability"),
                hal_host_register: load_fn(&hal, "halHostRegister")?,
                hal_host_unregister_ex: load_fn(&hal, "halHostUnregisterEx")?,
                dcmi,
                management_libs: config.management_libs.clone(),
                _runtime: runtime,
                _hal: hal,
            };
            info!("Ascend driver loaded");
            Ok(Arc::new(driver))
        }
    }

    fn load_dcmi(names: &[String]) -> std::result::Result<Dcmi, DriverLoadError> {
        let lib = load_library("DCMI", names)?;
        unsafe {
            let init: FnDcmiInit = load_fn(&lib, "dcmi_init")?;
            let status = init();
            if status != 0 {
                return Err(DriverLoadError::InitFailed { call: "dcmi_init", status });
            }
            Ok(Dcmi {
                get_device_pcie_info_v2: load_fn(&lib, "dcmi_get_device_pcie_info_v2")?,
                _lib: lib,
            })
        }
    }

    /// SoC name reported by the runtime, e.g. `Ascend910B3`.
    pub fn soc_name(&self) -> Option<String> {
        let func = self.aclrt_get_soc_name?;
        let ptr = unsafe { func() };
        if ptr.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(ptr) };
        Some(name.to_string_lossy().into_owned())
    }

    fn query_version(lib: &Library, device: u32) -> Result<String> {
        let func: FnDsmiGetVersion = unsafe { load_fn(lib, "dsmi_get_version") }?;
        let mut buf = vec![0u8; VERSION_BUFFER_LEN as usize];
        let mut ret_len: c_uint = 0;
        let status = unsafe {
            func(
                device as c_int,
                buf.as_mut_ptr() as *mut c_char,
                VERSION_BUFFER_LEN,
                &mut ret_len,
            )
        };
        if status != 0 {
            return Err(KvpinError::Driver { op: "dsmi_get_version", status });
        }
        if ret_len == 0 || ret_len > VERSION_BUFFER_LEN {
            return Err(KvpinError::DriverUnavailable(format!(
                "dsmi_get_version reported invalid length {}",
                ret_len
            )));
        }
        buf.truncate(ret_len as usize);
        if let Some(nul) = buf.iter().position(|b| *b == 0) {
            buf.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl AcceleratorDriver for AscendDriver {
    fn host_register(&self, host_ptr: u64, size: usize) -> std::result::Result<u64, DriverStatus> {
        let mut dev_ptr: *mut c_void = std::ptr::null_mut();
        let res = unsafe {
            (self.aclrt_host_register)(
                host_ptr as *mut c_void,
                size as u64,
                ACL_HOST_REGISTER_MAPPED,
                &mut dev_ptr,
            )
        };
        if res == ACL_SUCCESS {
            Ok(dev_ptr as u64)
        } else {
            debug!("aclrtHostRegister failed: {} ({})", status_name(res), res);
            Err(res)
        }
    }

    fn host_unregister(&self, host_ptr: u64) -> std::result::Result<(), DriverStatus> {
        let res = unsafe { (self.aclrt_host_unregister)(host_ptr as *mut c_void) };
        if res == ACL_SUCCESS { Ok(()) } else { Err(res) }
    }

    fn hal_host_register(
        &self,
        host_ptr: u64,
        size: usize,
        device: u32,
    ) -> std::result::Result<u64, DriverStatus> {
        let mut dev_ptr: *mut c_void = std::ptr::null_mut();
        let res = unsafe {
            (self.hal_host_register)(
                host_ptr as *mut c_void,
                size as u64,
                HOST_MEM_MAP_DEV_PCIE_TH,
                device,
                &mut dev_ptr,
            )
        };
        if res == 0 { Ok(dev_ptr as u64) } else { Err(res) }
    }

    fn hal_host_unregister(&self, host_ptr: u64, device: u32) -> std::result::Result<(), DriverStatus> {
        let res = unsafe {
            (self.hal_host_unregister_ex)(host_ptr as *mut c_void, device, HOST_MEM_MAP_DEV_PCIE_TH)
        };
        if res == 0 { Ok(()) } else { Err(res) }
    }

    fn driver_version(&self, device: u32) -> Result<String> {
        let lib = load_library("management", &self.management_libs)?;
        let version = Self::query_version(&lib, device);
        drop(lib);
        version
    }

    fn current_device(&self) -> std::result::Result<u32, DriverStatus> {
        let mut device: i32 = 0;
        let res = unsafe { (self.aclrt_get_device)(&mut device) };
        if res != ACL_SUCCESS {
            return Err(res);
        }
        u32::try_from(device).map_err(|_| res)
    }

    fn vector_core_count(&self, device: u32) -> Option<u32> {
        let func = self.acl_get_device_capability?;
        let mut value: i64 = 0;
        let res = unsafe { func(device, ACL_DEVICE_INFO_VECTOR_CORE_NUM, &mut value) };
        if res != ACL_SUCCESS {
            debug!("aclGetDeviceCapability failed: {} ({})", status_name(res), res);
            return None;
        }
        u32::try_from(value).ok().filter(|n| *n > 0)
    }

    fn pci_address(&self, device: u32) -> Result<PciAddress> {
        let dcmi = self
            .dcmi
            .as_ref()
            .ok_or_else(|| KvpinError::DriverUnavailable("DCMI library not loaded".to_string()))?;
        let mut info = DcmiPcieInfoAll::default();
        // Die 0; multi-die cards are addressed through their first die.
        let status = unsafe { (dcmi.get_device_pcie_info_v2)(device as c_int, 0, &mut info) };
        if status != 0 {
            return Err(KvpinError::Driver { op: "dcmi_get_device_pcie_info_v2", status });
        }
        Ok(PciAddress {
            domain: info.domain as u32,
            bus: info.bdf_bus_id,
            device: info.bdf_device_id,
            function: info.bdf_func_id,
        })
    }
}

/// Open the first library in `names` that loads.
pub(crate) fn load_library(
    what: &'static str,
    names: &[String],
) -> std::result::Result<Library, DriverLoadError> {
    let mut last_error = String::from("no library names configured");
    for name in names {
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                info!("loaded {} library from: {}", what, name);
                return Ok(lib);
            }
            Err(e) => {
                last_error = format!("{}: {}", name, e);
                debug!("failed to load {}: {}", name, e);
            }
        }
    }
    Err(DriverLoadError::LibraryNotFound {
        what,
        tried: names.to_vec(),
        last_error,
    })
}

/// # Safety
/// `F` must match the C signature of `name`.
pub(crate) unsafe fn load_fn<F: Copy>(
    lib: &Library,
    name: &'static str,
) -> std::result::Result<F, DriverLoadError> {
    let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }.map_err(|e| DriverLoadError::MissingSymbol {
        symbol: name,
        reason: e.to_string(),
    })?;
    Ok(*sym)
}

/// # Safety
/// `F` must match the C signature of `name`.
pub(crate) unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
    unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
}
