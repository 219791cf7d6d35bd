//! Integration test: host buffer lifecycle through KvOffload
//!
//! Register, transfer, unregister and re-register a pinned buffer, the way an
//! inference engine drives the crate over a session.
//!
//! Run with: cargo test -p kvpin-core --test lifecycle_test

use std::sync::Arc;

use kvpin_core::fake::{FakeDriver, FakeHostMemory, RecordingLauncher};
use kvpin_core::{
    DType, Direction, KernelLaunch, KvOffload, KvpinConfig, Placement, Tensor, TensorBuffer,
};

const HOST: u64 = 0x7f30_0000_0000;

fn make_offload(config: &KvpinConfig) -> (Arc<FakeDriver>, Arc<RecordingLauncher>, KvOffload) {
    let driver = Arc::new(FakeDriver::new("25.0.rc1"));
    let launcher = Arc::new(RecordingLauncher::new());
    let offload = KvOffload::new(
        config,
        driver.clone(),
        Arc::new(FakeHostMemory::new()),
        launcher.clone(),
    );
    (driver, launcher, offload)
}

#[test]
fn test_register_unregister_reregister() {
    let (_driver, _launcher, offload) = make_offload(&KvpinConfig::default());
    let mut buffer = Tensor::from_raw(HOST, Placement::Host { pinned: true }, DType::U8, &[4096]);

    offload.register_host_memory(&mut buffer).expect("register");
    assert_eq!(offload.registry().record_size_of(buffer.data_ptr()), 4096);

    offload.unregister_host_memory(&buffer).expect("unregister");
    assert_eq!(offload.resolve_device_pointer(HOST + 100), None);

    let device = offload.register_host_memory(&mut buffer).expect("re-register");
    assert_eq!(offload.registry().record_size_of(buffer.data_ptr()), 4096);
    assert_eq!(offload.resolve_device_pointer(HOST + 100), Some(device + 100));
}

#[test]
fn test_registered_offload_buffer_feeds_transfer() {
    let (_driver, launcher, offload) = make_offload(&KvpinConfig::default());
    let mut cache = Tensor::from_raw(HOST, Placement::Host { pinned: true }, DType::F16, &[2, 3, 8, 16]);
    let device = offload.register_host_memory(&mut cache).expect("register");

    let key = Tensor::from_raw(0xb000_0000, Placement::Accelerator { index: 0 }, DType::F16, &[4, 4, 2, 8]);
    let value = Tensor::from_raw(0xb010_0000, Placement::Accelerator { index: 0 }, DType::F16, &[4, 4, 2, 8]);
    let slots = Tensor::from_raw(0xb020_0000, Placement::Accelerator { index: 0 }, DType::I32, &[8]);

    offload
        .store_and_reshape(&cache, &key, &value, &slots, 1)
        .expect("store");

    match launcher.last() {
        Some(KernelLaunch::Flash(p)) => {
            assert_eq!(p.offload, device);
            assert_eq!(p.key_cache, 0xb000_0000);
            assert_eq!(p.tokens, 8);
        }
        other => panic!("unexpected launch {other:?}"),
    }

    offload.unregister_host_memory(&cache).expect("unregister");
    let err = offload
        .load_and_reshape(&cache, &key, &value, &slots, 1)
        .expect_err("unregistered host buffer");
    assert!(err.to_string().contains("host registered pointer"));
    assert_eq!(launcher.launch_count(), 1);
}

#[test]
fn test_config_bounds_single_layer_width() {
    let config = KvpinConfig::from_toml("[dispatch]\nsingle_layer_max_width = 2\n").expect("config");
    let (_driver, launcher, offload) = make_offload(&config);

    let lmc = Tensor::from_raw(0xc000_0000, Placement::Accelerator { index: 0 }, DType::F16, &[8, 2, 16]);
    let key = Tensor::from_raw(0xc010_0000, Placement::Accelerator { index: 0 }, DType::F16, &[4, 4, 2, 8]);
    let value = Tensor::from_raw(0xc020_0000, Placement::Accelerator { index: 0 }, DType::F16, &[4, 4, 2, 8]);
    let slots = Tensor::from_raw(0xc030_0000, Placement::Accelerator { index: 0 }, DType::I64, &[8]);

    offload
        .transfer_single_layer(&lmc, &key, &value, &slots, Direction::OffloadToPaged, true, false)
        .expect("transfer");
    match launcher.last() {
        Some(KernelLaunch::SingleLayer(p)) => assert_eq!(p.width, 2),
        other => panic!("unexpected launch {other:?}"),
    }
}

#[test]
fn test_probe_reports_configured_fallbacks() {
    let config = KvpinConfig::from_toml("[device]\nscratch_bytes = 65536\nvector_cores = 20\n")
        .expect("config");
    let (driver, _launcher, offload) = make_offload(&config);

    assert_eq!(offload.probe().on_chip_scratch_budget().expect("budget"), 65536);
    assert_eq!(offload.probe().vector_core_count().expect("cores"), 20);

    driver.set_vector_cores(40);
    driver.set_scratch_bytes(196_608);
    assert_eq!(offload.probe().on_chip_scratch_budget().expect("budget"), 196_608);
    assert_eq!(offload.probe().vector_core_count().expect("cores"), 40);
    assert_eq!(offload.probe().driver_version().expect("version"), "25.0.rc1");
    assert_eq!(offload.probe().pci_bus_id(1).expect("bus id"), "0000:c2:00.0");
}
