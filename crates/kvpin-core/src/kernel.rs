//! Launch interface of the copy kernels.
//!
//! Parameter structs are `#[repr(C)]` and handed to the kernel library by
//! pointer, so field order and types are part of the kernel ABI.

use crate::error::Result;
use crate::tensor::DType;

/// Execution stream a launch is enqueued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    /// Opaque runtime stream handle; 0 is the device's default stream.
    pub handle: u64,
    pub device: u32,
}

/// Element type codes understood by the kernels.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDType {
    Fp32 = 0,
    Fp16 = 1,
    Bf16 = 2,
    Int64 = 3,
    Int32 = 4,
}

impl DType {
    /// Kernel type code, or `None` for types the kernels cannot copy.
    pub fn kernel_code(self) -> Option<KernelDType> {
        match self {
            DType::F32 => Some(KernelDType::Fp32),
            DType::F16 => Some(KernelDType::Fp16),
            DType::BF16 => Some(KernelDType::Bf16),
            DType::I64 => Some(KernelDType::Int64),
            DType::I32 => Some(KernelDType::Int32),
            DType::U8 => None,
        }
    }
}

/// Which way the data moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Offload buffer into the paged cache.
    OffloadToPaged,
    /// Paged cache into the offload buffer.
    PagedToOffload,
}

impl Direction {
    /// The kernels' boolean direction flag.
    pub fn page_to_offload(self) -> bool {
        matches!(self, Direction::PagedToOffload)
    }
}

/// Parameters of both multi-layer kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiLayerParams {
    pub dtype: KernelDType,
    pub slot_dtype: KernelDType,
    pub width: u32,
    /// Device table holding one paged-cache pointer per layer.
    pub paged_layer_ptrs: u64,
    pub offload: u64,
    pub slot_mapping: u64,
    pub hidden: i64,
    pub planes: i32,
    pub layers: i32,
    pub page_buffer_size: i64,
    pub tokens: i32,
    pub page_to_offload: bool,
}

/// Parameters of the single-layer kernel. Strides and offsets are in elements,
/// sizes in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleLayerParams {
    pub dtype: KernelDType,
    pub slot_dtype: KernelDType,
    pub width: u32,
    pub offload: u64,
    pub paged_key: u64,
    pub paged_value: u64,
    pub slot_mapping: u64,
    pub paged_block_stride: i64,
    pub paged_value_offset: i64,
    pub paged_bytes: i64,
    pub offload_token_stride: i64,
    pub offload_value_offset: i64,
    pub offload_bytes: i64,
    pub tokens_per_chunk: i32,
    pub heads: i32,
    pub head_dim: i32,
    pub tokens: i32,
    pub block_size: i32,
    pub page_to_offload: bool,
    pub token_major: bool,
}

/// Parameters of the per-layer flash load/store kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashParams {
    pub dtype: KernelDType,
    pub slot_dtype: KernelDType,
    pub width: u32,
    pub offload: u64,
    pub key_cache: u64,
    pub value_cache: u64,
    pub slot_mapping: u64,
    pub hidden: i64,
    pub blocks: i64,
    pub block_size: i32,
    pub tokens: i32,
    pub layers: i32,
    pub layer: i32,
    pub page_to_offload: bool,
}

/// One enqueued kernel, as seen by a launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelLaunch {
    MultiLayer(MultiLayerParams),
    MultiLayerBounded(MultiLayerParams),
    SingleLayer(SingleLayerParams),
    Flash(FlashParams),
}

/// Enqueues copy kernels. Every launch is asynchronous and returns once the
/// kernel is queued.
pub trait KernelLauncher: Send + Sync {
    /// Stream the caller is currently working on for `device`.
    fn current_stream(&self, device: u32) -> Result<Stream>;

    fn launch(&self, stream: Stream, launch: &KernelLaunch) -> Result<()>;
}
