use std::collections::HashMap;

use crate::config::MemoryConfig;
use crate::device::VirtualDevice;
use crate::error::{Result, VgpuError};
use crate::id_pool::{IdPool, MemoryResource, TransferTag};
use crate::memory::pool::{align_up, GpuMemoryPool};
use crate::memory::transfer::{
    TransferPipeline, TransferPriority, TransferRequest, TransferStats, TransferStatus,
};
use crate::stats::EngineStats;

/// Device address of the first pool.
pub const POOL_ADDRESS_BASE: u64 = 0x1_0000_0000;
/// Address window reserved per pool; pools never grow past it.
pub const POOL_ADDRESS_STRIDE: u64 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub resource: MemoryResource,
    pub pool_index: usize,
    pub offset: u64,
    /// Requested size.
    pub size: u64,
    /// Bytes charged to the pool.
    pub aligned_size: u64,
    pub gpu_address: u64,
}

pub struct MemoryPoolManager {
    pools: Vec<GpuMemoryPool>,
    allocations: HashMap<MemoryResource, Allocation>,
    alignment: u64,
    allow_expansion: bool,
    allow_sibling_fallback: bool,
    transfers: TransferPipeline,
}

impl MemoryPoolManager {
    pub fn new(config: &MemoryConfig, transfer_ids: IdPool<TransferTag>) -> Result<Self> {
        if !config.alignment.is_power_of_two() {
            return Err(VgpuError::bad_argument(format!(
                "alignment {} is not a power of two",
                config.alignment
            )));
        }
        let pools = config
            .pools
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let base = POOL_ADDRESS_BASE + i as u64 * POOL_ADDRESS_STRIDE;
                GpuMemoryPool::new(i as u32, base, spec, config.expansion_ceiling)
            })
            .collect();
        Ok(Self {
            pools,
            allocations: HashMap::new(),
            alignment: config.alignment,
            allow_expansion: config.allow_expansion,
            allow_sibling_fallback: config.allow_sibling_fallback,
            transfers: TransferPipeline::new(config, transfer_ids)?,
        })
    }

    fn score(&self, pool: &GpuMemoryPool, size: u64, resource: MemoryResource) -> f64 {
        let usage = if pool.size() == 0 {
            f64::INFINITY
        } else {
            size as f64 / pool.size() as f64
        };
        let fit = if usage <= 0.25 {
            40.0
        } else if usage <= 0.5 {
            20.0
        } else {
            5.0
        };
        // Even handles lean towards coherent memory.
        let wants_coherent = resource.raw() % 2 == 0;
        let coherency = if pool.is_coherent == wants_coherent {
            15.0
        } else {
            0.0
        };
        fit + coherency + (1.0 - pool.fragmentation_level()) * 20.0 + pool.free_ratio() * 25.0
    }

    fn best_pool(
        &self,
        size: u64,
        resource: MemoryResource,
        filter: impl Fn(usize, &GpuMemoryPool) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, pool) in self.pools.iter().enumerate() {
            if !filter(i, pool) {
                continue;
            }
            let score = self.score(pool, size, resource);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Highest-scoring pool that can take `size` bytes without growing.
    pub fn select_optimal_pool(&self, size: u64, resource: MemoryResource) -> Option<usize> {
        let aligned = align_up(size, self.alignment)?;
        self.best_pool(size, resource, |_, p| p.fits(aligned))
    }

    /// Allocate from `pool_index`, growing it or falling back to a sibling
    /// when it is full.
    pub fn allocate(
        &mut self,
        pool_index: usize,
        size: u64,
        resource: MemoryResource,
        stats: &EngineStats,
    ) -> Result<Allocation> {
        if size == 0 {
            return Err(VgpuError::bad_argument("zero-sized allocation"));
        }
        if pool_index >= self.pools.len() {
            return Err(VgpuError::bad_argument(format!("no memory pool {pool_index}")));
        }
        if self.allocations.contains_key(&resource) {
            return Err(VgpuError::bad_argument(format!(
                "{resource} already owns an allocation"
            )));
        }
        let Some(aligned) = align_up(size, self.alignment) else {
            stats.inc_memory_failures();
            return Err(VgpuError::no_resources(format!(
                "{size} bytes cannot be aligned to {}",
                self.alignment
            )));
        };

        let mut target = None;
        if self.pools[pool_index].fits(aligned) {
            target = Some(pool_index);
        } else if self.allow_expansion && self.pools[pool_index].expand(aligned) {
            let pool = &self.pools[pool_index];
            stats.inc_memory_expansions();
            tracing::info!(pool = %pool.name, size = pool.size(), "expanded memory pool");
            if pool.fits(aligned) {
                target = Some(pool_index);
            }
        }
        if target.is_none() && self.allow_sibling_fallback {
            target = self.best_pool(size, resource, |i, p| i != pool_index && p.fits(aligned));
            if let Some(sibling) = target {
                stats.inc_memory_sibling_fallbacks();
                tracing::debug!(
                    from = %self.pools[pool_index].name,
                    to = %self.pools[sibling].name,
                    size,
                    "memory pool exhausted; using sibling"
                );
            }
        }
        let Some(index) = target else {
            stats.inc_memory_failures();
            tracing::warn!(
                pool = %self.pools[pool_index].name,
                size,
                "memory allocation failed after expansion and sibling search"
            );
            return Err(VgpuError::no_resources(format!(
                "no memory pool can hold {size} bytes"
            )));
        };

        let pool = &mut self.pools[index];
        let offset = pool
            .bump(aligned)
            .ok_or_else(|| VgpuError::no_resources(format!("pool '{}' is full", pool.name)))?;
        let allocation = Allocation {
            resource,
            pool_index: index,
            offset,
            size,
            aligned_size: aligned,
            gpu_address: pool.base_address + offset,
        };
        self.allocations.insert(resource, allocation);
        stats.inc_memory_allocations();
        tracing::trace!(%resource, pool = %pool.name, offset, size, "allocated device memory");
        Ok(allocation)
    }

    /// Pick a pool by score and allocate from it. If no pool has room as is,
    /// the best-scoring pool is asked to grow.
    pub fn allocate_memory(
        &mut self,
        size: u64,
        resource: MemoryResource,
        stats: &EngineStats,
    ) -> Result<Allocation> {
        if size == 0 {
            return Err(VgpuError::bad_argument("zero-sized allocation"));
        }
        let index = self
            .select_optimal_pool(size, resource)
            .or_else(|| self.best_pool(size, resource, |_, _| true))
            .ok_or_else(|| VgpuError::no_resources("no memory pools configured"))?;
        self.allocate(index, size, resource, stats)
    }

    /// Return `resource`'s bytes to its pool. No compaction happens; the pool
    /// reclaims its space once every allocation in it is freed.
    pub fn free_memory(&mut self, resource: MemoryResource, stats: &EngineStats) -> Result<Allocation> {
        let allocation = self
            .allocations
            .remove(&resource)
            .ok_or(VgpuError::NotFound {
                kind: resource.kind(),
                id: resource.raw(),
            })?;
        self.pools[allocation.pool_index].release(allocation.aligned_size);
        self.transfers.forget(resource, allocation.gpu_address);
        stats.inc_memory_frees();
        Ok(allocation)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_memory(
        &mut self,
        resource: MemoryResource,
        data: &[u8],
        offset: u64,
        priority: TransferPriority,
        inflight: usize,
        device: &mut dyn VirtualDevice,
        stats: &EngineStats,
    ) -> Result<TransferStatus> {
        let allocation = *self.allocations.get(&resource).ok_or(VgpuError::NotFound {
            kind: resource.kind(),
            id: resource.raw(),
        })?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= allocation.size)
            .ok_or_else(|| {
                VgpuError::bad_argument(format!(
                    "write of {} bytes at offset {offset} overruns {resource} ({} bytes)",
                    data.len(),
                    allocation.size
                ))
            })?;
        let pool = &self.pools[allocation.pool_index];
        tracing::trace!(%resource, offset, end, pool = %pool.name, "memory update");
        let request = TransferRequest {
            resource,
            gpu_address: allocation.gpu_address,
            offset,
            pool_coherent: pool.is_coherent,
            pool_dma: pool.supports_dma,
            priority,
            data,
        };
        self.transfers.submit(request, inflight, device, stats)
    }

    pub fn flush_transfers(
        &mut self,
        device: &mut dyn VirtualDevice,
        stats: &EngineStats,
    ) -> Result<usize> {
        self.transfers.flush(device, stats)
    }

    pub fn allocation(&self, resource: MemoryResource) -> Option<&Allocation> {
        self.allocations.get(&resource)
    }

    pub fn pools(&self) -> &[GpuMemoryPool] {
        &self.pools
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfers.stats()
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.pending_batched() + self.transfers.pending_deferred()
    }
}
