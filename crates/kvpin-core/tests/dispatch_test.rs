//! Integration test: TransferDispatcher
//!
//! Every transfer is checked through the launch recorded by
//! RecordingLauncher: launch width, chunking, strides and resolved pointers.
//!
//! Run with: cargo test -p kvpin-core --test dispatch_test

use std::sync::Arc;

use kvpin_core::error::ErrorKind;
use kvpin_core::fake::{FakeDriver, FakeHostMemory, RecordingLauncher};
use kvpin_core::kernel::{KernelDType, SingleLayerParams};
use kvpin_core::{
    DType, Direction, KernelLaunch, KvOffload, KvpinConfig, KvpinError, Placement, Tensor,
};

const HOST: u64 = 0x7f20_0000_0000;
const DEV: u64 = 0xa000_0000;

struct Harness {
    driver: Arc<FakeDriver>,
    launcher: Arc<RecordingLauncher>,
    offload: KvOffload,
}

fn make_harness() -> Harness {
    let mut config = KvpinConfig::default();
    config.device.visible_devices_env = "KVPIN_TEST_DISPATCH_VISIBLE".to_string();
    let driver = Arc::new(FakeDriver::new("25.0"));
    let launcher = Arc::new(RecordingLauncher::new());
    let offload = KvOffload::new(
        &config,
        driver.clone(),
        Arc::new(FakeHostMemory::new()),
        launcher.clone(),
    );
    Harness { driver, launcher, offload }
}

fn device_tensor(addr: u64, dtype: DType, shape: &[usize]) -> Tensor {
    Tensor::from_raw(addr, Placement::Accelerator { index: 1 }, dtype, shape)
}

fn slots(tokens: usize) -> Tensor {
    device_tensor(DEV + 0x0f00_0000, DType::I64, &[tokens])
}

/// Paged planes of 3 blocks x 4 slots x 2 heads x 8 dims.
fn paged_planes(dtype: DType) -> (Tensor, Tensor) {
    (
        device_tensor(DEV, dtype, &[3, 4, 2, 8]),
        device_tensor(DEV + 0x10_0000, dtype, &[3, 4, 2, 8]),
    )
}

fn single_layer_launch(h: &Harness) -> SingleLayerParams {
    match h.launcher.last() {
        Some(KernelLaunch::SingleLayer(p)) => p,
        other => panic!("expected a single-layer launch, got {other:?}"),
    }
}

fn run_single_layer(token_major: bool, two_plane_major: bool) -> SingleLayerParams {
    let h = make_harness();
    let shape: &[usize] = if token_major { &[4, 2, 16] } else { &[2, 4, 16] };
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, shape);
    let (key, value) = paged_planes(DType::F16);

    h.offload
        .transfer_single_layer(
            &offload,
            &key,
            &value,
            &slots(4),
            Direction::OffloadToPaged,
            token_major,
            two_plane_major,
        )
        .expect("single-layer transfer");
    assert_eq!(h.launcher.launch_count(), 1);
    single_layer_launch(&h)
}

#[test]
fn test_single_layer_strides_token_major_two_plane_major() {
    let p = run_single_layer(true, true);
    assert_eq!((p.offload_token_stride, p.offload_value_offset), (32, 16));
    assert_eq!((p.paged_block_stride, p.paged_value_offset), (64, 192));
    assert!(p.token_major);
}

#[test]
fn test_single_layer_strides_token_major_interleaved() {
    let p = run_single_layer(true, false);
    assert_eq!((p.offload_token_stride, p.offload_value_offset), (32, 16));
    assert_eq!((p.paged_block_stride, p.paged_value_offset), (128, 64));
}

#[test]
fn test_single_layer_strides_plane_major_two_plane_major() {
    let p = run_single_layer(false, true);
    assert_eq!((p.offload_token_stride, p.offload_value_offset), (16, 64));
    assert_eq!((p.paged_block_stride, p.paged_value_offset), (64, 192));
    assert!(!p.token_major);
}

#[test]
fn test_single_layer_strides_plane_major_interleaved() {
    let p = run_single_layer(false, false);
    assert_eq!((p.offload_token_stride, p.offload_value_offset), (16, 64));
    assert_eq!((p.paged_block_stride, p.paged_value_offset), (128, 64));
}

#[test]
fn test_single_layer_launch_parameters() {
    let p = run_single_layer(true, true);
    assert_eq!(p.dtype, KernelDType::Fp16);
    assert_eq!(p.slot_dtype, KernelDType::Int64);
    assert_eq!(p.width, 4);
    assert_eq!(p.tokens_per_chunk, 4);
    assert_eq!((p.heads, p.head_dim, p.block_size, p.tokens), (2, 8, 4, 4));
    assert_eq!(p.paged_key, DEV);
    assert_eq!(p.paged_value, DEV + 0x10_0000);
    assert_eq!(p.paged_bytes, 2 * 3 * 4 * 2 * 8 * 2);
    assert_eq!(p.offload_bytes, 4 * 2 * 16 * 2);
    assert!(!p.page_to_offload);
}

#[test]
fn test_single_layer_chunk_follows_budget() {
    let h = make_harness();
    // 64 bytes per token, room for 2.
    h.driver.set_scratch_bytes(150);
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    h.offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::PagedToOffload, true, true)
        .expect("transfer");
    let p = single_layer_launch(&h);
    assert_eq!(p.tokens_per_chunk, 2);
    assert!(p.page_to_offload);
}

#[test]
fn test_single_layer_token_too_large_for_scratch() {
    let h = make_harness();
    h.driver.set_scratch_bytes(63);
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect_err("does not fit");
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    match err {
        KvpinError::CapacityExceeded { required, available, .. } => {
            assert_eq!((required, available), (64, 63));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_single_layer_width_capped() {
    let h = make_harness();
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    h.offload
        .transfer_single_layer(&offload, &key, &value, &slots(2), Direction::OffloadToPaged, true, true)
        .expect("two tokens");
    assert_eq!(single_layer_launch(&h).width, 2);

    h.driver.set_vector_cores(1);
    h.offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect("one core");
    assert_eq!(single_layer_launch(&h).width, 1);
}

#[test]
fn test_single_layer_rejects_single_plane() {
    let h = make_harness();
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 1, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, false)
        .expect_err("single plane");
    assert!(matches!(err, KvpinError::UnsupportedLayout(_)));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_single_plane_reported_without_device() {
    let h = make_harness();
    h.driver.set_current_device(None);
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 1, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, false)
        .expect_err("single plane");
    assert!(matches!(err, KvpinError::UnsupportedLayout(_)), "got {err}");
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_single_layer_rejects_oversized_offload() {
    let h = make_harness();
    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[usize::MAX / 4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect_err("offload size overflows");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_single_layer_rejects_bad_dtypes() {
    let h = make_harness();
    let offload = device_tensor(DEV + 0x20_0000, DType::U8, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::U8);
    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect_err("u8 cache");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    let offload = device_tensor(DEV + 0x20_0000, DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);
    let float_slots = device_tensor(DEV + 0x0f00_0000, DType::F32, &[4]);
    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &float_slots, Direction::OffloadToPaged, true, true)
        .expect_err("f32 slots");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_host_buffer_resolved_through_registry() {
    let h = make_harness();
    let offload = Tensor::from_raw(HOST, Placement::Host { pinned: true }, DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect_err("not registered");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert!(err.to_string().contains("host registered pointer"));

    let record = h.offload.registry().register(HOST, 4096).expect("register");
    h.offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect("registered");
    assert_eq!(single_layer_launch(&h).offload, record.device_address);
}

#[test]
fn test_other_placement_rejected() {
    let h = make_harness();
    let offload = Tensor::from_raw(HOST, Placement::Other("xpu".to_string()), DType::F16, &[4, 2, 16]);
    let (key, value) = paged_planes(DType::F16);

    let err = h
        .offload
        .transfer_single_layer(&offload, &key, &value, &slots(4), Direction::OffloadToPaged, true, true)
        .expect_err("foreign device");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert_eq!(h.launcher.launch_count(), 0);
}

fn multi_layer_inputs(planes: usize, layers: usize) -> (Tensor, Tensor, Tensor) {
    (
        device_tensor(DEV, DType::BF16, &[planes, layers, 4, 16]),
        device_tensor(DEV + 0x10_0000, DType::I64, &[layers]),
        Tensor::from_raw(DEV + 0x20_0000, Placement::Accelerator { index: 2 }, DType::I32, &[4]),
    )
}

#[test]
fn test_multi_layer_uses_every_core() {
    let h = make_harness();
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 6);

    h.offload
        .transfer_multi_layer(&offload, &ptrs, &slot_mapping, 2, 128, Direction::PagedToOffload, false)
        .expect("multi-layer transfer");

    let launches = h.launcher.launches();
    assert_eq!(launches.len(), 1);
    let (stream, launch) = launches[0];
    assert_eq!(stream.device, 2);
    match launch {
        KernelLaunch::MultiLayer(p) => {
            assert_eq!(p.width, 48);
            assert_eq!((p.planes, p.layers, p.tokens, p.hidden), (2, 6, 4, 16));
            assert_eq!(p.page_buffer_size, 128);
            assert_eq!(p.paged_layer_ptrs, DEV + 0x10_0000);
            assert_eq!(p.dtype, KernelDType::Bf16);
            assert_eq!(p.slot_dtype, KernelDType::Int32);
            assert!(p.page_to_offload);
        }
        other => panic!("unexpected launch {other:?}"),
    }
}

#[test]
fn test_multi_layer_reduced_kv() {
    let h = make_harness();
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(1, 6);
    h.offload
        .transfer_multi_layer(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, true)
        .expect("reduced kv");
    match h.launcher.last() {
        Some(KernelLaunch::MultiLayer(p)) => assert_eq!(p.planes, 1),
        other => panic!("unexpected launch {other:?}"),
    }

    // Two planes present but reduced requested.
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 6);
    let err = h
        .offload
        .transfer_multi_layer(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, true)
        .expect_err("plane mismatch");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}

#[test]
fn test_multi_layer_rejects_narrow_pointer_table() {
    let h = make_harness();
    let (offload, _, slot_mapping) = multi_layer_inputs(2, 6);
    let ptrs = device_tensor(DEV + 0x10_0000, DType::I32, &[6]);

    let err = h
        .offload
        .transfer_multi_layer(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, false)
        .expect_err("32-bit pointers");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert!(err.to_string().contains("64-bit"));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_bounded_multi_layer_width() {
    let h = make_harness();
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 6);
    h.offload
        .transfer_multi_layer_bounded(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, false)
        .expect("bounded");
    match h.launcher.last() {
        Some(KernelLaunch::MultiLayerBounded(p)) => assert_eq!(p.width, 4),
        other => panic!("unexpected launch {other:?}"),
    }

    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 2);
    h.offload
        .transfer_multi_layer_bounded(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, false)
        .expect("bounded");
    match h.launcher.last() {
        Some(KernelLaunch::MultiLayerBounded(p)) => assert_eq!(p.width, 2),
        other => panic!("unexpected launch {other:?}"),
    }
}

#[test]
fn test_bounded_multi_layer_budget() {
    let h = make_harness();
    // 2 * 4 tokens * 16 hidden * 2 bytes = 256.
    h.driver.set_scratch_bytes(255);
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 6);

    let err = h
        .offload
        .transfer_multi_layer_bounded(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, false)
        .expect_err("over budget");
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert_eq!(h.launcher.launch_count(), 0);

    h.driver.set_scratch_bytes(256);
    h.offload
        .transfer_multi_layer_bounded(&offload, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged, false)
        .expect("exactly fits");
    assert_eq!(h.launcher.launch_count(), 1);
}

fn flash_inputs() -> (Tensor, Tensor, Tensor) {
    let (key, value) = paged_planes(DType::F32);
    (device_tensor(DEV + 0x40_0000, DType::F32, &[2, 3, 4, 16]), key, value)
}

#[test]
fn test_load_and_store_directions() {
    let h = make_harness();
    let (offload, key, value) = flash_inputs();

    h.offload
        .load_and_reshape(&offload, &key, &value, &slots(4), 2)
        .expect("load");
    let load = match h.launcher.last() {
        Some(KernelLaunch::Flash(p)) => p,
        other => panic!("unexpected launch {other:?}"),
    };
    assert!(load.page_to_offload);
    assert_eq!(load.width, 48);
    assert_eq!((load.layers, load.layer, load.blocks, load.block_size), (3, 2, 3, 4));
    assert_eq!((load.hidden, load.tokens), (16, 4));

    h.offload
        .store_and_reshape(&offload, &key, &value, &slots(4), 0)
        .expect("store");
    match h.launcher.last() {
        Some(KernelLaunch::Flash(p)) => {
            assert!(!p.page_to_offload);
            assert_eq!(p.layer, 0);
        }
        other => panic!("unexpected launch {other:?}"),
    }
}

#[test]
fn test_flash_layer_out_of_range() {
    let h = make_harness();
    let (offload, key, value) = flash_inputs();
    let err = h
        .offload
        .load_and_reshape(&offload, &key, &value, &slots(4), 3)
        .expect_err("layer 3 of 3");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_flash_rejects_mismatched_buffers() {
    let h = make_harness();
    // f16 offload of 2 tokens x 16 hidden against f32 caches of 2 heads x 4 dims.
    let offload = device_tensor(DEV + 0x40_0000, DType::F16, &[2, 3, 2, 16]);
    let key = device_tensor(DEV, DType::F32, &[3, 4, 2, 4]);
    let value = device_tensor(DEV + 0x10_0000, DType::F32, &[3, 4, 2, 4]);
    let err = h
        .offload
        .store_and_reshape(&offload, &key, &value, &slots(100), 0)
        .expect_err("nothing matches");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    let (offload, key, value) = flash_inputs();

    let narrow = device_tensor(DEV, DType::F32, &[3, 4, 2, 4]);
    let err = h
        .offload
        .load_and_reshape(&offload, &narrow, &narrow, &slots(4), 0)
        .expect_err("hidden 16 vs 2 x 4");
    assert!(err.to_string().contains("hidden size"), "got {err}");

    let half = device_tensor(DEV + 0x40_0000, DType::F16, &[2, 3, 4, 16]);
    let err = h
        .offload
        .load_and_reshape(&half, &key, &value, &slots(4), 0)
        .expect_err("f16 offload, f32 cache");
    assert!(err.to_string().contains("dtype"), "got {err}");

    let err = h
        .offload
        .store_and_reshape(&offload, &key, &value, &slots(5), 0)
        .expect_err("5 slots, 4 tokens");
    assert!(err.to_string().contains("5 slots"), "got {err}");

    assert_eq!(h.launcher.launch_count(), 0);
}

#[test]
fn test_flash_ignores_scratch_budget() {
    let h = make_harness();
    h.driver.set_scratch_bytes(1);
    let (offload, key, value) = flash_inputs();
    h.offload
        .store_and_reshape(&offload, &key, &value, &slots(4), 1)
        .expect("no budget check");
    assert_eq!(h.launcher.launch_count(), 1);
}

#[test]
fn test_unilateral_not_implemented() {
    let h = make_harness();
    let (offload, ptrs, slot_mapping) = multi_layer_inputs(2, 6);
    let err = h
        .offload
        .transfer_multi_layer_unilateral(&offload, &ptrs, &ptrs, &slot_mapping, 0, 128, Direction::OffloadToPaged)
        .expect_err("not implemented");
    assert_eq!(err.kind(), ErrorKind::NotImplemented);
    assert_eq!(h.launcher.launch_count(), 0);
}
