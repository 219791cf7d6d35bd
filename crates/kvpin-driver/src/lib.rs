//! Vendor bindings for Ascend accelerators, resolved at runtime with
//! `libloading` so the workspace builds and tests on hosts without the CANN
//! toolkit.

pub mod ascend;
pub mod error;
pub mod kernels;
pub mod status;

pub use ascend::AscendDriver;
pub use error::DriverLoadError;
pub use kernels::KernelLibrary;
pub use status::status_name;
