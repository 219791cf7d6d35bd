//! Integration test: registration strategy selection
//!
//! Drives KvOffload::register_host_memory with different driver versions and
//! checks which registration path is taken.
//!
//! Run with: cargo test -p kvpin-core --test selector_test

use std::sync::Arc;

use kvpin_core::error::ErrorKind;
use kvpin_core::fake::{FakeDriver, FakeHostMemory, RecordingLauncher};
use kvpin_core::{DType, KvOffload, KvpinConfig, Placement, Tensor, TensorBuffer};

const HOST: u64 = 0x7f10_0000_0000;

struct Harness {
    driver: Arc<FakeDriver>,
    host: Arc<FakeHostMemory>,
    offload: KvOffload,
}

fn make_harness(version: &str, env: &str) -> Harness {
    let mut config = KvpinConfig::default();
    config.device.visible_devices_env = env.to_string();
    let driver = Arc::new(FakeDriver::new(version));
    let host = Arc::new(FakeHostMemory::new());
    let offload = KvOffload::new(
        &config,
        driver.clone(),
        host.clone(),
        Arc::new(RecordingLauncher::new()),
    );
    Harness { driver, host, offload }
}

fn pinned_buffer() -> Tensor {
    Tensor::from_raw(HOST, Placement::Host { pinned: true }, DType::F16, &[2, 4, 256])
}

#[test]
fn test_new_driver_registers_in_place() {
    for version in ["25.0", "30.2-beta", "25"] {
        let h = make_harness(version, "KVPIN_TEST_SEL_DIRECT");
        let mut buffer = pinned_buffer();

        let device = h.offload.register_host_memory(&mut buffer).expect("register");

        assert_eq!(buffer.data_ptr(), HOST, "version {version}");
        assert!(buffer.fresh_storage().is_none());
        assert_eq!(h.offload.resolve_device_pointer(HOST), Some(device));
        assert_eq!(h.driver.calls().host_register, 1);
        assert_eq!(h.driver.calls().hal_host_register, 0);
    }
}

#[test]
fn test_old_or_unknown_driver_splices_fresh_buffer() {
    for version in ["24.0.1", "", "unknown", "rc-25"] {
        let h = make_harness(version, "KVPIN_TEST_SEL_LEGACY");
        let mut buffer = pinned_buffer();
        let nbytes = buffer.nbytes().expect("size");

        let device = h.offload.register_host_memory(&mut buffer).expect("register");

        assert_ne!(buffer.data_ptr(), HOST, "version {version:?}");
        assert_eq!(buffer.shape(), &[2, 4, 256]);
        assert_eq!(buffer.strides(), &[1024, 256, 1]);
        assert_eq!(buffer.dtype(), DType::F16);
        assert_eq!(h.offload.resolve_device_pointer(buffer.data_ptr()), Some(device));
        assert_eq!(h.offload.registry().record_size_of(buffer.data_ptr()), nbytes);
        assert_eq!(h.driver.calls().host_register, 0);
        assert_eq!(h.driver.calls().hal_host_register, 1);
    }
}

#[test]
fn test_spliced_storage_release_unregisters_and_unmaps() {
    let h = make_harness("24.1", "KVPIN_TEST_SEL_RELEASE");
    let mut buffer = pinned_buffer();
    h.offload.register_host_memory(&mut buffer).expect("register");
    let fresh = buffer.data_ptr();
    assert_eq!(h.host.mappings().len(), 1);

    drop(buffer);

    assert_eq!(h.driver.calls().hal_host_unregister, 1);
    assert!(h.host.mappings().is_empty());
    assert_eq!(h.offload.resolve_device_pointer(fresh), None);
}

#[test]
fn test_release_after_explicit_unregister_only_unmaps() {
    let h = make_harness("24.1", "KVPIN_TEST_SEL_UNREG");
    let mut buffer = pinned_buffer();
    h.offload.register_host_memory(&mut buffer).expect("register");

    h.offload.unregister_host_memory(&buffer).expect("unregister");
    h.offload.unregister_host_memory(&buffer).expect("unregister is idempotent");
    assert_eq!(h.driver.calls().hal_host_unregister, 1);

    drop(buffer);
    assert_eq!(h.driver.calls().hal_host_unregister, 1);
    assert!(h.host.mappings().is_empty());
}

#[test]
fn test_version_is_queried_every_call() {
    let h = make_harness("24.0", "KVPIN_TEST_SEL_REQUERY");
    let mut legacy = pinned_buffer();
    h.offload.register_host_memory(&mut legacy).expect("legacy");

    h.driver.set_version("25.1");
    let mut direct = Tensor::from_raw(HOST + 0x100000, Placement::Host { pinned: true }, DType::F32, &[64]);
    h.offload.register_host_memory(&mut direct).expect("direct");

    assert_eq!(h.driver.calls().driver_version, 2);
    assert_eq!(h.driver.calls().hal_host_register, 1);
    assert_eq!(h.driver.calls().host_register, 1);
}

#[test]
fn test_unpinned_or_device_buffers_rejected() {
    let h = make_harness("25.0", "KVPIN_TEST_SEL_UNPINNED");

    let mut pageable = Tensor::from_raw(HOST, Placement::Host { pinned: false }, DType::F16, &[16]);
    let err = h.offload.register_host_memory(&mut pageable).expect_err("not pinned");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    let mut device = Tensor::from_raw(0xd000, Placement::Accelerator { index: 0 }, DType::F16, &[16]);
    let err = h.offload.register_host_memory(&mut device).expect_err("device buffer");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    assert_eq!(h.driver.calls().driver_version, 0);
}

#[test]
fn test_missing_management_library_fails_loudly() {
    let h = make_harness("25.0", "KVPIN_TEST_SEL_NOLIB");
    h.driver.remove_version();

    let mut buffer = pinned_buffer();
    let err = h.offload.register_host_memory(&mut buffer).expect_err("no version");
    assert_eq!(err.kind(), ErrorKind::DriverFailure);
    assert!(h.offload.registry().is_empty());
}
