//! Turns transfer requests into one validated kernel launch each.
//!
//! Every operation resolves device pointers for its buffers, derives the
//! layout parameters, checks them against the core count and the on-chip
//! scratch budget, and enqueues exactly one kernel. Nothing is launched when
//! any check fails.

use std::sync::Arc;

use tracing::debug;

use crate::config::DispatchConfig;
use crate::error::{KvpinError, Result};
use crate::kernel::{
    Direction, FlashParams, KernelDType, KernelLaunch, KernelLauncher, MultiLayerParams,
    SingleLayerParams, Stream,
};
use crate::layout::{self, SingleLayerGeometry};
use crate::probe::CapabilityProbe;
use crate::registry::PinnedRegistry;
use crate::tensor::{DType, Placement, TensorBuffer};

/// Geometry flags of a single-layer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleLayerLayout {
    /// Offload buffer is `[tokens, 2, hidden]` rather than `[2, tokens, hidden]`.
    pub token_major: bool,
    /// Paged planes come from a `[2, blocks, ...]` cache rather than
    /// `[blocks, 2, ...]`.
    pub two_plane_major: bool,
}

pub struct TransferDispatcher {
    registry: Arc<PinnedRegistry>,
    probe: Arc<CapabilityProbe>,
    launcher: Arc<dyn KernelLauncher>,
    config: DispatchConfig,
}

impl TransferDispatcher {
    pub fn new(
        registry: Arc<PinnedRegistry>,
        probe: Arc<CapabilityProbe>,
        launcher: Arc<dyn KernelLauncher>,
        config: DispatchConfig,
    ) -> Self {
        Self { registry, probe, launcher, config }
    }

    /// Device address the kernels should use for `buffer`.
    pub fn kernel_pointer(&self, buffer: &dyn TensorBuffer) -> Result<u64> {
        match buffer.placement() {
            Placement::Accelerator { .. } => Ok(buffer.data_ptr()),
            Placement::Host { .. } => self
                .registry
                .resolve_device_pointer(buffer.data_ptr())
                .ok_or_else(|| {
                    KvpinError::precondition(
                        "unable to retrieve device pointer; is this a host registered pointer?",
                    )
                }),
            Placement::Other(name) => Err(KvpinError::precondition(format!(
                "invalid device {name}; buffers must be accelerator-resident or pinned host memory"
            ))),
        }
    }

    /// Copy every layer between the offload buffer `[kv, layers, tokens,
    /// hidden]` and the paged caches listed in `layer_ptrs`, one core per
    /// token across the whole device.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer(
        &self,
        offload: &dyn TensorBuffer,
        layer_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        target_device: u32,
        page_size: usize,
        direction: Direction,
        reduced_kv: bool,
    ) -> Result<()> {
        let cores = self.probe.vector_core_count()?;
        let params = self.multi_layer_params(
            offload, layer_ptrs, slot_mapping, page_size, direction, reduced_kv, cores,
        )?;
        self.enqueue(target_device, KernelLaunch::MultiLayer(params))
    }

    /// Like [`TransferDispatcher::transfer_multi_layer`], with one core per
    /// layer up to the configured bound. The whole token range of a layer
    /// must fit in scratch memory.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer_bounded(
        &self,
        offload: &dyn TensorBuffer,
        layer_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        target_device: u32,
        page_size: usize,
        direction: Direction,
        reduced_kv: bool,
    ) -> Result<()> {
        let cores = self.probe.vector_core_count()?;
        let width = layout::launch_width(
            self.config.bounded_multi_layer_max_width,
            offload.size(1)? as u64,
            cores,
        );
        let params = self.multi_layer_params(
            offload, layer_ptrs, slot_mapping, page_size, direction, reduced_kv, width,
        )?;

        let budget = self.probe.on_chip_scratch_budget()?;
        let required = layout::checked_product(
            "per-token-chunk size",
            &[
                2,
                params.tokens as u64,
                params.hidden as u64,
                offload.dtype().element_size() as u64,
            ],
        )?;
        if required > budget {
            return Err(KvpinError::CapacityExceeded {
                what: "per-token-chunk buffer",
                required,
                available: budget,
            });
        }
        self.enqueue(target_device, KernelLaunch::MultiLayerBounded(params))
    }

    /// Copy one layer between the offload buffer and the key/value planes of
    /// a paged cache, chunking tokens to fit the scratch budget.
    pub fn transfer_single_layer(
        &self,
        offload: &dyn TensorBuffer,
        paged_key: &dyn TensorBuffer,
        paged_value: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        direction: Direction,
        layout: SingleLayerLayout,
    ) -> Result<()> {
        expect_rank(offload, 3, "offload buffer")?;
        expect_rank(paged_key, 4, "paged key cache")?;
        check_planes_match(paged_key, paged_value)?;

        let (planes, offload_tokens) = if layout.token_major {
            (offload.size(1)?, offload.size(0)?)
        } else {
            (offload.size(0)?, offload.size(1)?)
        };
        let hidden = offload.size(-1)?;
        let tokens = slot_mapping.size(0)?;
        let blocks = paged_key.size(-4)?;
        let block_size = paged_key.size(-3)?;
        let heads = paged_key.size(-2)?;
        let head_dim = paged_key.size(-1)?;

        layout::check_kv_planes(planes)?;
        check_offload_matches_cache(offload, paged_key, hidden, heads, head_dim)?;
        check_slot_count(tokens, offload_tokens)?;

        let dtype = cache_dtype(paged_key)?;
        let slot_dtype = slot_dtype(slot_mapping)?;
        let offload_strides = layout::offload_strides(offload_tokens, hidden, layout.token_major)?;
        let paged_strides = layout::paged_strides(blocks, block_size, heads, head_dim, layout.two_plane_major)?;

        let geometry = SingleLayerGeometry {
            tokens,
            planes,
            heads,
            head_dim,
            element_size: paged_key.dtype().element_size(),
        };
        let budget = self.probe.on_chip_scratch_budget()?;
        let cores = self.probe.vector_core_count()?;
        let plan = layout::plan_single_layer(&geometry, budget, cores, self.config.single_layer_max_width)?;

        let params = SingleLayerParams {
            dtype,
            slot_dtype,
            width: plan.width,
            offload: self.kernel_pointer(offload)?,
            paged_key: self.kernel_pointer(paged_key)?,
            paged_value: self.kernel_pointer(paged_value)?,
            slot_mapping: self.kernel_pointer(slot_mapping)?,
            paged_block_stride: to_i64(paged_strides.block_stride)?,
            paged_value_offset: to_i64(paged_strides.value_offset)?,
            paged_bytes: to_i64(layout::checked_product("paged cache size", &[2, paged_key.nbytes()? as u64])?)?,
            offload_token_stride: to_i64(offload_strides.token_stride)?,
            offload_value_offset: to_i64(offload_strides.value_offset)?,
            offload_bytes: to_i64(offload.nbytes()? as u64)?,
            tokens_per_chunk: to_i32(plan.tokens_per_chunk as usize)?,
            heads: to_i32(heads)?,
            head_dim: to_i32(head_dim)?,
            tokens: to_i32(tokens)?,
            block_size: to_i32(block_size)?,
            page_to_offload: direction.page_to_offload(),
            token_major: layout.token_major,
        };
        let device = self.device_of(paged_key)?;
        self.enqueue(device, KernelLaunch::SingleLayer(params))
    }

    /// Read one layer of the paged cache into the offload buffer.
    pub fn load_and_reshape(
        &self,
        offload: &dyn TensorBuffer,
        key_cache: &dyn TensorBuffer,
        value_cache: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        layer: usize,
    ) -> Result<()> {
        self.flash(offload, key_cache, value_cache, slot_mapping, layer, Direction::PagedToOffload)
    }

    /// Write one layer of the offload buffer back into the paged cache.
    pub fn store_and_reshape(
        &self,
        offload: &dyn TensorBuffer,
        key_cache: &dyn TensorBuffer,
        value_cache: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        layer: usize,
    ) -> Result<()> {
        self.flash(offload, key_cache, value_cache, slot_mapping, layer, Direction::OffloadToPaged)
    }

    /// Multi-layer transfer against separate key and value pointer tables.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer_unilateral(
        &self,
        _offload: &dyn TensorBuffer,
        _key_ptrs: &dyn TensorBuffer,
        _value_ptrs: &dyn TensorBuffer,
        _slot_mapping: &dyn TensorBuffer,
        _target_device: u32,
        _page_size: usize,
        _direction: Direction,
    ) -> Result<()> {
        Err(KvpinError::NotImplemented("unilateral multi-layer transfer"))
    }

    #[allow(clippy::too_many_arguments)]
    fn multi_layer_params(
        &self,
        offload: &dyn TensorBuffer,
        layer_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        page_size: usize,
        direction: Direction,
        reduced_kv: bool,
        width: u32,
    ) -> Result<MultiLayerParams> {
        expect_rank(offload, 4, "offload buffer")?;
        let planes = if reduced_kv { 1 } else { 2 };
        if offload.size(0)? != planes {
            return Err(KvpinError::precondition(format!(
                "offload buffer must have {} key/value planes, got {}",
                planes,
                offload.size(0)?
            )));
        }
        let layers = offload.size(1)?;
        if layer_ptrs.dtype() != DType::I64 {
            return Err(KvpinError::precondition(format!(
                "layer pointer table must hold 64-bit entries, got {:?}",
                layer_ptrs.dtype()
            )));
        }
        let pointers = layer_ptrs.numel()?;
        if pointers != layers {
            return Err(KvpinError::precondition(format!(
                "{} layer pointers for {} layers",
                pointers, layers
            )));
        }
        let tokens = slot_mapping.size(0)?;
        check_slot_count(tokens, offload.size(2)?)?;

        Ok(MultiLayerParams {
            dtype: cache_dtype(offload)?,
            slot_dtype: slot_dtype(slot_mapping)?,
            width,
            paged_layer_ptrs: self.kernel_pointer(layer_ptrs)?,
            offload: self.kernel_pointer(offload)?,
            slot_mapping: self.kernel_pointer(slot_mapping)?,
            hidden: to_i64(offload.size(-1)? as u64)?,
            planes: to_i32(planes)?,
            layers: to_i32(layers)?,
            page_buffer_size: to_i64(page_size as u64)?,
            tokens: to_i32(tokens)?,
            page_to_offload: direction.page_to_offload(),
        })
    }

    fn flash(
        &self,
        offload: &dyn TensorBuffer,
        key_cache: &dyn TensorBuffer,
        value_cache: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        layer: usize,
        direction: Direction,
    ) -> Result<()> {
        expect_rank(offload, 4, "offload buffer")?;
        expect_rank(key_cache, 4, "key cache")?;
        check_planes_match(key_cache, value_cache)?;

        let layers = offload.size(1)?;
        if layer >= layers {
            return Err(KvpinError::precondition(format!(
                "layer index {} out of range for {} layers",
                layer, layers
            )));
        }
        let hidden = offload.size(-1)?;
        check_offload_matches_cache(offload, key_cache, hidden, key_cache.size(2)?, key_cache.size(3)?)?;
        let tokens = slot_mapping.size(0)?;
        check_slot_count(tokens, offload.size(2)?)?;

        let cores = self.probe.vector_core_count()?;
        let params = FlashParams {
            dtype: cache_dtype(offload)?,
            slot_dtype: slot_dtype(slot_mapping)?,
            width: cores,
            offload: self.kernel_pointer(offload)?,
            key_cache: self.kernel_pointer(key_cache)?,
            value_cache: self.kernel_pointer(value_cache)?,
            slot_mapping: self.kernel_pointer(slot_mapping)?,
            hidden: to_i64(hidden as u64)?,
            blocks: to_i64(key_cache.size(0)? as u64)?,
            block_size: to_i32(key_cache.size(1)?)?,
            tokens: to_i32(tokens)?,
            layers: to_i32(layers)?,
            layer: to_i32(layer)?,
            page_to_offload: direction.page_to_offload(),
        };
        let device = self.device_of(key_cache)?;
        self.enqueue(device, KernelLaunch::Flash(params))
    }

    /// Device whose stream runs the kernel: the buffer's own accelerator, or
    /// the current device for host buffers.
    fn device_of(&self, buffer: &dyn TensorBuffer) -> Result<u32> {
        match buffer.placement() {
            Placement::Accelerator { index } => Ok(*index),
            _ => self.probe.current_device(),
        }
    }

    fn enqueue(&self, device: u32, launch: KernelLaunch) -> Result<()> {
        let stream: Stream = self.launcher.current_stream(device)?;
        debug!(device, stream = stream.handle, ?launch, "enqueueing copy kernel");
        self.launcher.launch(stream, &launch)
    }
}

fn cache_dtype(buffer: &dyn TensorBuffer) -> Result<KernelDType> {
    buffer.dtype().kernel_code().ok_or_else(|| {
        KvpinError::precondition(format!("cache dtype {:?} is not supported", buffer.dtype()))
    })
}

fn slot_dtype(slot_mapping: &dyn TensorBuffer) -> Result<KernelDType> {
    match slot_mapping.dtype() {
        DType::I32 => Ok(KernelDType::Int32),
        DType::I64 => Ok(KernelDType::Int64),
        other => Err(KvpinError::precondition(format!(
            "slot mapping must be i32 or i64, got {:?}",
            other
        ))),
    }
}

fn expect_rank(buffer: &dyn TensorBuffer, rank: usize, what: &str) -> Result<()> {
    if buffer.shape().len() != rank {
        return Err(KvpinError::precondition(format!(
            "{} must have rank {}, got shape {:?}",
            what,
            rank,
            buffer.shape()
        )));
    }
    Ok(())
}

fn check_planes_match(key: &dyn TensorBuffer, value: &dyn TensorBuffer) -> Result<()> {
    if key.shape() != value.shape() || key.dtype() != value.dtype() {
        return Err(KvpinError::precondition(format!(
            "key cache {:?}/{:?} and value cache {:?}/{:?} differ",
            key.shape(),
            key.dtype(),
            value.shape(),
            value.dtype()
        )));
    }
    Ok(())
}

/// The offload rows must hold `heads x head_dim` elements of the cache's type.
fn check_offload_matches_cache(
    offload: &dyn TensorBuffer,
    cache: &dyn TensorBuffer,
    hidden: usize,
    heads: usize,
    head_dim: usize,
) -> Result<()> {
    let expected = layout::checked_product("cache hidden size", &[heads as u64, head_dim as u64])?;
    if hidden as u64 != expected {
        return Err(KvpinError::precondition(format!(
            "offload hidden size {} does not match {} heads x {} head dim",
            hidden, heads, head_dim
        )));
    }
    if offload.dtype() != cache.dtype() {
        return Err(KvpinError::precondition(format!(
            "offload dtype {:?} does not match cache dtype {:?}",
            offload.dtype(),
            cache.dtype()
        )));
    }
    Ok(())
}

fn check_slot_count(slots: usize, offload_tokens: usize) -> Result<()> {
    if slots > offload_tokens {
        return Err(KvpinError::precondition(format!(
            "{} slots but the offload buffer holds {} tokens",
            slots, offload_tokens
        )));
    }
    Ok(())
}

fn to_i32(v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| KvpinError::precondition(format!("{} does not fit the kernel's 32-bit field", v)))
}

fn to_i64(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| KvpinError::precondition(format!("{} does not fit the kernel's 64-bit field", v)))
}
