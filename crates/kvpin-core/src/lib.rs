//! Pinned host memory registration and KV cache transfer dispatch for
//! accelerator-backed inference engines.

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fake;
pub mod host_memory;
pub mod kernel;
pub mod layout;
pub mod offload;
pub mod probe;
pub mod range_index;
pub mod registry;
pub mod selector;
pub mod tensor;

pub use config::KvpinConfig;
pub use dispatch::{SingleLayerLayout, TransferDispatcher};
pub use driver::{AcceleratorDriver, DriverStatus, HostMemory, PciAddress};
pub use error::{ErrorKind, KvpinError, Result};
pub use host_memory::LibcHostMemory;
pub use kernel::{Direction, KernelLaunch, KernelLauncher, Stream};
pub use offload::KvOffload;
pub use probe::CapabilityProbe;
pub use range_index::RegisteredMemoryRecord;
pub use registry::PinnedRegistry;
pub use selector::{RegistrationSelector, RegistrationStrategy};
pub use tensor::{DType, Placement, SpliceStorage, Tensor, TensorBuffer};
