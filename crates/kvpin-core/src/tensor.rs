//! Minimal view of the framework's tensors: where the data lives, its element
//! type and its geometry. Allocation stays with the framework.

use std::sync::Arc;

use crate::error::{KvpinError, Result};
use crate::layout::checked_product;
use crate::range_index::RegisteredMemoryRecord;
use crate::registry::PinnedRegistry;

/// Element types understood by the copy kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn element_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Host { pinned: bool },
    Accelerator { index: u32 },
    /// Any other device class, named by the framework.
    Other(String),
}

/// Read access to a framework tensor.
pub trait TensorBuffer {
    /// Address of the first element.
    fn data_ptr(&self) -> u64;
    fn placement(&self) -> &Placement;
    fn dtype(&self) -> DType;
    fn shape(&self) -> &[usize];
    /// Per-dimension strides, in elements.
    fn strides(&self) -> &[usize];

    fn numel(&self) -> Result<usize> {
        let factors: Vec<u64> = self.shape().iter().map(|&d| d as u64).collect();
        to_usize(checked_product("element count", &factors)?)
    }

    fn nbytes(&self) -> Result<usize> {
        let numel = self.numel()? as u64;
        to_usize(checked_product("byte size", &[numel, self.dtype().element_size() as u64])?)
    }

    /// Size of dimension `dim`; negative values count from the end.
    fn size(&self, dim: isize) -> Result<usize> {
        let shape = self.shape();
        let idx = normalize_dim(dim, shape.len())?;
        Ok(shape[idx])
    }

    fn stride(&self, dim: isize) -> Result<usize> {
        let strides = self.strides();
        let idx = normalize_dim(dim, strides.len())?;
        Ok(strides[idx])
    }
}

/// A tensor whose backing storage can be swapped for a registered buffer.
pub trait SpliceStorage: TensorBuffer {
    /// Replace the storage, keeping shape, strides and dtype; the first
    /// element moves to the start of `storage`. The tensor holds `storage`
    /// until its own storage is released.
    fn splice_storage(&mut self, storage: Arc<FreshStorage>);
}

/// Host storage created by [`PinnedRegistry::register_fresh_buffer`].
///
/// Dropping the last handle unregisters the buffer through the low-level path
/// and unmaps it.
pub struct FreshStorage {
    registry: Arc<PinnedRegistry>,
    record: RegisteredMemoryRecord,
}

impl FreshStorage {
    pub fn new(registry: Arc<PinnedRegistry>, record: RegisteredMemoryRecord) -> Self {
        Self { registry, record }
    }

    pub fn host_address(&self) -> u64 {
        self.record.host_address
    }

    pub fn device_address(&self) -> u64 {
        self.record.device_address
    }

    pub fn size(&self) -> usize {
        self.record.size
    }
}

impl std::fmt::Debug for FreshStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshStorage").field("record", &self.record).finish()
    }
}

impl Drop for FreshStorage {
    fn drop(&mut self) {
        self.registry
            .release_fresh_buffer(self.record.host_address, self.record.size);
    }
}

/// Strided tensor view over memory owned elsewhere.
#[derive(Debug, Clone)]
pub struct Tensor {
    base: u64,
    /// Offset of the first element from `base`, in elements.
    storage_offset: usize,
    placement: Placement,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage: Option<Arc<FreshStorage>>,
}

impl Tensor {
    /// Contiguous (row-major) view of `shape` at `ptr`.
    pub fn from_raw(ptr: u64, placement: Placement, dtype: DType, shape: &[usize]) -> Self {
        Self {
            base: ptr,
            storage_offset: 0,
            placement,
            dtype,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            storage: None,
        }
    }

    pub fn with_strides(mut self, strides: &[usize]) -> Self {
        self.strides = strides.to_vec();
        self
    }

    pub fn with_storage_offset(mut self, offset: usize) -> Self {
        self.storage_offset = offset;
        self
    }

    /// Storage spliced in by the registration selector, if any.
    pub fn fresh_storage(&self) -> Option<&Arc<FreshStorage>> {
        self.storage.as_ref()
    }
}

impl TensorBuffer for Tensor {
    fn data_ptr(&self) -> u64 {
        self.base + (self.storage_offset * self.dtype.element_size()) as u64
    }

    fn placement(&self) -> &Placement {
        &self.placement
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn strides(&self) -> &[usize] {
        &self.strides
    }
}

impl SpliceStorage for Tensor {
    fn splice_storage(&mut self, storage: Arc<FreshStorage>) {
        self.base = storage.host_address();
        self.storage_offset = 0;
        self.placement = Placement::Host { pinned: true };
        self.storage = Some(storage);
    }
}

/// Row-major strides for `shape`, in elements.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(shape[i + 1]);
    }
    strides
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| KvpinError::precondition(format!("{} bytes is not addressable", v)))
}

fn normalize_dim(dim: isize, rank: usize) -> Result<usize> {
    let idx = if dim < 0 { rank as isize + dim } else { dim };
    if idx < 0 || idx as usize >= rank {
        return Err(KvpinError::precondition(format!(
            "dimension {} out of range for a rank-{} tensor",
            dim, rank
        )));
    }
    Ok(idx as usize)
}
