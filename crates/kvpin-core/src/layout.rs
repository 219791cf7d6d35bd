//! Stride and chunk arithmetic for single-layer transfers.
//!
//! Everything here is computed from declared geometry and layout flags only;
//! the strides a tensor happens to carry are never consulted.

use crate::error::{KvpinError, Result};

/// Strides of the offload buffer, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadStrides {
    /// Distance between consecutive tokens of the same plane.
    pub token_stride: u64,
    /// Distance from a key element to the matching value element.
    pub value_offset: u64,
}

/// Strides of the combined paged cache, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedStrides {
    /// Distance between consecutive blocks of the same plane.
    pub block_stride: u64,
    /// Distance from a key block to the matching value block.
    pub value_offset: u64,
}

/// Offload buffer is `[tokens, 2, hidden]` when `token_major`, else
/// `[2, tokens, hidden]`.
pub fn offload_strides(tokens: usize, hidden: usize, token_major: bool) -> Result<OffloadStrides> {
    let (tokens, hidden) = (tokens as u64, hidden as u64);
    Ok(if token_major {
        OffloadStrides {
            token_stride: checked_product("offload token stride", &[2, hidden])?,
            value_offset: hidden,
        }
    } else {
        OffloadStrides {
            token_stride: hidden,
            value_offset: checked_product("offload value offset", &[tokens, hidden])?,
        }
    })
}

/// Combined cache is `[2, blocks, block_size, heads, head_dim]` when
/// `two_plane_major`, else `[blocks, 2, block_size, heads, head_dim]`.
pub fn paged_strides(
    blocks: usize,
    block_size: usize,
    heads: usize,
    head_dim: usize,
    two_plane_major: bool,
) -> Result<PagedStrides> {
    let block = checked_product("paged block", &[block_size as u64, heads as u64, head_dim as u64])?;
    Ok(if two_plane_major {
        PagedStrides {
            block_stride: block,
            value_offset: checked_product("paged value offset", &[blocks as u64, block])?,
        }
    } else {
        PagedStrides {
            block_stride: checked_product("paged block stride", &[2, block])?,
            value_offset: block,
        }
    })
}

/// Product of `factors`, or a precondition error naming `what` on overflow.
pub fn checked_product(what: &str, factors: &[u64]) -> Result<u64> {
    factors
        .iter()
        .try_fold(1u64, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| KvpinError::precondition(format!("{} overflows 64 bits", what)))
}

/// Inputs to [`plan_single_layer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleLayerGeometry {
    pub tokens: usize,
    /// Size of the key/value plane dimension of the offload buffer.
    pub planes: usize,
    pub heads: usize,
    pub head_dim: usize,
    pub element_size: usize,
}

/// How a single-layer transfer is split across cores and inner loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Bytes one token occupies in scratch memory.
    pub per_token_bytes: u64,
    /// Tokens copied per inner loop of one core.
    pub tokens_per_chunk: u32,
    /// Number of cores the launch uses.
    pub width: u32,
}

/// Work out the chunking of a single-layer transfer.
///
/// `max_width` is the configured upper bound on cores, `cores` the number the
/// device has, `budget` the per-core scratch size in bytes.
pub fn plan_single_layer(
    geometry: &SingleLayerGeometry,
    budget: u64,
    cores: u32,
    max_width: u32,
) -> Result<ChunkPlan> {
    check_kv_planes(geometry.planes)?;
    if geometry.tokens == 0 {
        return Err(KvpinError::precondition("slot mapping is empty"));
    }

    let per_token_bytes = checked_product(
        "per-token size",
        &[
            geometry.planes as u64,
            geometry.heads as u64,
            geometry.head_dim as u64,
            geometry.element_size as u64,
        ],
    )?;
    if per_token_bytes > budget {
        return Err(KvpinError::CapacityExceeded {
            what: "per-token cache buffer",
            required: per_token_bytes,
            available: budget,
        });
    }

    let tokens = geometry.tokens as u64;
    let tokens_per_chunk = (budget / per_token_bytes.max(1)).min(tokens);
    Ok(ChunkPlan {
        per_token_bytes,
        tokens_per_chunk: clamp_u32(tokens_per_chunk),
        width: launch_width(max_width, tokens, cores),
    })
}

/// Single-layer kernels copy separate key and value planes; MLA caches have
/// only one.
pub fn check_kv_planes(planes: usize) -> Result<()> {
    if planes == 1 {
        return Err(KvpinError::UnsupportedLayout(
            "single-plane (MLA) caches are not supported".to_string(),
        ));
    }
    if planes != 2 {
        return Err(KvpinError::precondition(format!(
            "offload buffer must have 2 key/value planes, got {}",
            planes
        )));
    }
    Ok(())
}

/// Bounded launch width: `min(bound, units)`, capped by the core count and
/// never below 1.
pub fn launch_width(bound: u32, units: u64, cores: u32) -> u32 {
    let width = u64::from(bound).min(units).min(u64::from(cores));
    clamp_u32(width).max(1)
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}
