//! Host-side entry points of the compiled copy kernels.
//!
//! The kernel library exports one C function per kernel taking the stream and
//! a pointer to the matching parameter struct from `kvpin_core::kernel`.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::Arc;

use kvpin_core::config::DriverConfig;
use kvpin_core::kernel::{
    FlashParams, KernelLaunch, KernelLauncher, MultiLayerParams, SingleLayerParams, Stream,
};
use kvpin_core::{KvpinError, Result};
use libloading::Library;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::ascend::{load_fn, load_library};
use crate::error::DriverLoadError;
use crate::status::status_name;

type FnMultiLayer = unsafe extern "C" fn(stream: *mut c_void, params: *const MultiLayerParams) -> c_int;
type FnSingleLayer = unsafe extern "C" fn(stream: *mut c_void, params: *const SingleLayerParams) -> c_int;
type FnFlash = unsafe extern "C" fn(stream: *mut c_void, params: *const FlashParams) -> c_int;

pub struct KernelLibrary {
    _lib: Library,
    multi_layer: FnMultiLayer,
    multi_layer_bounded: FnMultiLayer,
    single_layer: FnSingleLayer,
    flash: FnFlash,
    /// Stream bound per device; unbound devices use the default stream.
    streams: RwLock<HashMap<u32, u64>>,
}

// SAFETY: kernel entry points only enqueue work and may be called from any
// thread; the library stays loaded for the lifetime of the struct.
unsafe impl Send for KernelLibrary {}
unsafe impl Sync for KernelLibrary {}

impl KernelLibrary {
    pub fn load(config: &DriverConfig) -> std::result::Result<Arc<Self>, DriverLoadError> {
        let lib = load_library("kernel", &config.kernel_libs)?;
        unsafe {
            let kernels = Self {
                multi_layer: load_fn(&lib, "kvpin_multi_layer_kv_transfer")?,
                multi_layer_bounded: load_fn(&lib, "kvpin_multi_layer_kv_transfer_bounded")?,
                single_layer: load_fn(&lib, "kvpin_single_layer_kv_transfer")?,
                flash: load_fn(&lib, "kvpin_load_and_reshape_flash")?,
                streams: RwLock::new(HashMap::new()),
                _lib: lib,
            };
            info!("copy kernels loaded");
            Ok(Arc::new(kernels))
        }
    }

    /// Route launches for `device` to the runtime stream `handle`.
    pub fn bind_stream(&self, device: u32, handle: u64) {
        self.streams.write().insert(device, handle);
    }
}

impl KernelLauncher for KernelLibrary {
    fn current_stream(&self, device: u32) -> Result<Stream> {
        let handle = self.streams.read().get(&device).copied().unwrap_or(0);
        Ok(Stream { handle, device })
    }

    fn launch(&self, stream: Stream, launch: &KernelLaunch) -> Result<()> {
        let handle = stream.handle as *mut c_void;
        let status = unsafe {
            match launch {
                KernelLaunch::MultiLayer(p) => (self.multi_layer)(handle, p),
                KernelLaunch::MultiLayerBounded(p) => (self.multi_layer_bounded)(handle, p),
                KernelLaunch::SingleLayer(p) => (self.single_layer)(handle, p),
                KernelLaunch::Flash(p) => (self.flash)(handle, p),
            }
        };
        if status != 0 {
            debug!("kernel launch failed: {} ({})", status_name(status), status);
            return Err(KvpinError::Driver { op: "kernel launch", status });
        }
        Ok(())
    }
}
