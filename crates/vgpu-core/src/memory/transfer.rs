//! Host-to-device transfer scheduling.
//!
//! Small writes are queued per priority and later flushed as one submission of
//! RESOURCE_INLINE_WRITE commands. Larger writes map the host region and copy
//! it with RESOURCE_COPY_REGION; a large low-priority write arriving while the
//! device is busy is deferred to the next flush instead.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use vgpu_protocol::{barrier_flags, CommandWriter, HostCopy, InlineWriteTarget};

use crate::config::MemoryConfig;
use crate::device::{DeviceSubmission, VirtualDevice};
use crate::error::{Result, VgpuError};
use crate::id_pool::{IdPool, MemoryResource, TransferId, TransferTag};
use crate::stats::EngineStats;

const LATENCY_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl TransferPriority {
    fn queue_index(self) -> usize {
        match self {
            TransferPriority::High => 0,
            TransferPriority::Normal => 1,
            TransferPriority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed {
        transfer_id: TransferId,
        device_address: u64,
    },
    /// Queued for the next batch flush.
    Batched { transfer_id: TransferId },
    /// Held back to avoid stalling a busy device; runs on the next flush.
    Deferred { transfer_id: TransferId },
}

impl TransferStatus {
    pub fn transfer_id(&self) -> TransferId {
        match *self {
            TransferStatus::Completed { transfer_id, .. }
            | TransferStatus::Batched { transfer_id }
            | TransferStatus::Deferred { transfer_id } => transfer_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpuMemoryTransfer {
    pub transfer_id: TransferId,
    pub resource: MemoryResource,
    /// Destination: device address of the resource's allocation.
    pub gpu_address: u64,
    pub offset: u64,
    pub size: u64,
    pub priority: TransferPriority,
    pub is_coherent: bool,
    pub is_batched: bool,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TransferStats {
    pub count: u64,
    pub bytes: u64,
    pub batched: u64,
    pub deferred: u64,
    pub batch_flushes: u64,
    /// Exponential moving average, microseconds.
    pub avg_latency_us: f64,
    /// Bytes per second.
    pub peak_throughput: f64,
    pub coherency_flushes: u64,
    pub stalls_avoided: u64,
}

/// One write into a resource's allocation.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub resource: MemoryResource,
    pub gpu_address: u64,
    pub offset: u64,
    pub pool_coherent: bool,
    pub pool_dma: bool,
    pub priority: TransferPriority,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct CoherencyEntry {
    resource: MemoryResource,
    gpu_address: u64,
    coherent: bool,
}

fn coherency_key(resource: MemoryResource, gpu_address: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&resource.key().to_le_bytes());
    buf[8..].copy_from_slice(&gpu_address.to_le_bytes());
    xxhash_rust::xxh3::xxh3_64(&buf)
}

pub struct TransferPipeline {
    ids: IdPool<TransferTag>,
    coherency: LruCache<u64, CoherencyEntry>,
    /// High, Normal, Low.
    batches: [VecDeque<GpuMemoryTransfer>; 3],
    deferred: VecDeque<GpuMemoryTransfer>,
    batching_enabled: bool,
    batch_threshold: u64,
    batch_queue_depth: usize,
    stall_threshold_bytes: u64,
    stall_inflight_submissions: usize,
    transfer_context_id: u32,
    stats: TransferStats,
}

impl TransferPipeline {
    pub fn new(config: &MemoryConfig, ids: IdPool<TransferTag>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.coherency_cache_capacity)
            .ok_or_else(|| VgpuError::bad_argument("coherency_cache_capacity must be > 0"))?;
        Ok(Self {
            ids,
            coherency: LruCache::new(capacity),
            batches: Default::default(),
            deferred: VecDeque::new(),
            batching_enabled: config.batching_enabled,
            batch_threshold: config.batch_threshold,
            batch_queue_depth: config.batch_queue_depth.max(1),
            stall_threshold_bytes: config.stall_threshold_bytes,
            stall_inflight_submissions: config.stall_inflight_submissions,
            transfer_context_id: config.transfer_context_id,
            stats: TransferStats::default(),
        })
    }

    /// Run, queue, or defer one transfer. `inflight` is the number of buffers
    /// the device has accepted but not yet completed.
    pub fn submit(
        &mut self,
        req: TransferRequest<'_>,
        inflight: usize,
        device: &mut dyn VirtualDevice,
        stats: &EngineStats,
    ) -> Result<TransferStatus> {
        if req.data.is_empty() {
            return Err(VgpuError::bad_argument("empty transfer"));
        }
        let transfer_id = self.ids.allocate()?;
        let size = req.data.len() as u64;
        let mut transfer = GpuMemoryTransfer {
            transfer_id,
            resource: req.resource,
            gpu_address: req.gpu_address,
            offset: req.offset,
            size,
            priority: req.priority,
            is_coherent: req.pool_coherent,
            is_batched: false,
            started_at: Instant::now(),
            completed_at: None,
            data: Vec::new(),
        };

        let inline_ok = u32::try_from(req.offset).is_ok();
        if self.batching_enabled && size < self.batch_threshold && inline_ok {
            transfer.is_batched = true;
            transfer.data = req.data.to_vec();
            let index = req.priority.queue_index();
            self.batches[index].push_back(transfer);
            if self.batches[index].len() >= self.batch_queue_depth {
                if let Err(err) = self.flush_batches(device, stats) {
                    // A write reported as failed must not go out on a later flush.
                    self.batches[index].pop_back();
                    self.retire_id(transfer_id);
                    return Err(err);
                }
            }
            self.stats.batched += 1;
            stats.inc_transfers_batched();
            return Ok(TransferStatus::Batched { transfer_id });
        }

        if !req.pool_dma {
            self.retire_id(transfer_id);
            return Err(VgpuError::Unsupported(format!(
                "{} lives in a pool without DMA; only inline writes under {} bytes are possible",
                req.resource, self.batch_threshold
            )));
        }

        if req.priority == TransferPriority::Low
            && size >= self.stall_threshold_bytes
            && inflight >= self.stall_inflight_submissions
        {
            tracing::debug!(
                transfer_id = transfer_id.raw(),
                size,
                inflight,
                "deferring large low-priority transfer"
            );
            transfer.data = req.data.to_vec();
            self.deferred.push_back(transfer);
            self.stats.deferred += 1;
            self.stats.stalls_avoided += 1;
            stats.inc_transfers_deferred();
            return Ok(TransferStatus::Deferred { transfer_id });
        }

        match self.execute_copy(&mut transfer, req.data, device, stats) {
            Ok(device_address) => {
                stats.inc_transfers_immediate();
                Ok(TransferStatus::Completed {
                    transfer_id,
                    device_address,
                })
            }
            Err(err) => {
                self.retire_id(transfer_id);
                Err(err)
            }
        }
    }

    fn execute_copy(
        &mut self,
        transfer: &mut GpuMemoryTransfer,
        data: &[u8],
        device: &mut dyn VirtualDevice,
        stats: &EngineStats,
    ) -> Result<u64> {
        let device_address = device.map_host_region(data)?;
        let coherent = self.check_coherency(
            transfer.resource,
            transfer.gpu_address,
            transfer.is_coherent,
            stats,
        );

        let mut writer = CommandWriter::new();
        if !coherent {
            writer.memory_barrier(barrier_flags::HOST_WRITES);
            self.stats.coherency_flushes += 1;
            stats.inc_coherency_flushes();
        }
        writer.copy_from_host(HostCopy {
            handle: transfer.resource.wire_handle(),
            dst_offset: transfer.offset,
            src_address: device_address,
            size: transfer.size,
        });
        device.submit(DeviceSubmission {
            context_id: self.transfer_context_id,
            stream: writer.finish().to_bytes(),
        })?;

        self.complete(transfer);
        Ok(device_address)
    }

    /// Coherency of `(resource, gpu_address)`. The cache is keyed by a hash of
    /// the pair; an entry is only trusted if its stored pair matches exactly.
    pub fn check_coherency(
        &mut self,
        resource: MemoryResource,
        gpu_address: u64,
        pool_coherent: bool,
        stats: &EngineStats,
    ) -> bool {
        let key = coherency_key(resource, gpu_address);
        match self.coherency.get(&key).copied() {
            Some(entry) if entry.resource == resource && entry.gpu_address == gpu_address => {
                stats.inc_coherency_hits();
                return entry.coherent;
            }
            Some(_) => {
                tracing::debug!(%resource, gpu_address, "coherency cache key collision");
            }
            None => {}
        }
        stats.inc_coherency_misses();
        self.coherency.put(
            key,
            CoherencyEntry {
                resource,
                gpu_address,
                coherent: pool_coherent,
            },
        );
        pool_coherent
    }

    /// Drop cached coherency and pending writes for an allocation that went
    /// away.
    pub fn forget(&mut self, resource: MemoryResource, gpu_address: u64) {
        self.coherency.pop(&coherency_key(resource, gpu_address));
        let mut dropped = Vec::new();
        for queue in self.batches.iter_mut().chain(std::iter::once(&mut self.deferred)) {
            queue.retain(|t| {
                let keep = t.resource != resource;
                if !keep {
                    dropped.push(t.transfer_id);
                }
                keep
            });
        }
        for id in dropped {
            tracing::debug!(transfer_id = id.raw(), %resource, "dropping write to freed resource");
            self.retire_id(id);
        }
    }

    /// Submit every batched transfer as one stream (High, Normal, then Low)
    /// and run deferred copies. Returns the number of transfers completed.
    pub fn flush(&mut self, device: &mut dyn VirtualDevice, stats: &EngineStats) -> Result<usize> {
        let mut done = self.flush_batches(device, stats)?;
        while let Some(mut transfer) = self.deferred.pop_front() {
            let data = std::mem::take(&mut transfer.data);
            if let Err(err) = self.execute_copy(&mut transfer, &data, device, stats) {
                transfer.data = data;
                self.deferred.push_front(transfer);
                return Err(err);
            }
            stats.inc_transfers_immediate();
            done += 1;
        }
        Ok(done)
    }

    /// Nothing leaves the queues unless the device accepts the stream.
    fn flush_batches(
        &mut self,
        device: &mut dyn VirtualDevice,
        stats: &EngineStats,
    ) -> Result<usize> {
        if self.pending_batched() == 0 {
            return Ok(0);
        }
        let mut writer = CommandWriter::new();
        for transfer in self.batches.iter().flatten() {
            let target = InlineWriteTarget::buffer_range(
                transfer.resource.wire_handle(),
                transfer.offset as u32,
                transfer.size as u32,
            );
            writer.resource_inline_write(target, &transfer.data)?;
        }
        device.submit(DeviceSubmission {
            context_id: self.transfer_context_id,
            stream: writer.finish().to_bytes(),
        })?;

        let mut done = 0;
        let batches = std::mem::take(&mut self.batches);
        for mut transfer in batches.into_iter().flatten() {
            self.complete(&mut transfer);
            done += 1;
        }
        self.stats.batch_flushes += 1;
        stats.inc_batch_flushes();
        Ok(done)
    }

    fn complete(&mut self, transfer: &mut GpuMemoryTransfer) {
        let now = Instant::now();
        transfer.completed_at = Some(now);
        let elapsed = now.duration_since(transfer.started_at);

        let latency_us = elapsed.as_secs_f64() * 1e6;
        self.stats.avg_latency_us = if self.stats.count == 0 {
            latency_us
        } else {
            LATENCY_EMA_ALPHA * latency_us + (1.0 - LATENCY_EMA_ALPHA) * self.stats.avg_latency_us
        };
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let throughput = transfer.size as f64 / secs;
            self.stats.peak_throughput = self.stats.peak_throughput.max(throughput);
        }
        self.stats.count += 1;
        self.stats.bytes += transfer.size;
        self.retire_id(transfer.transfer_id);
    }

    fn retire_id(&mut self, id: TransferId) {
        if let Err(err) = self.ids.release(id) {
            tracing::warn!(transfer_id = id.raw(), %err, "transfer id not recycled");
        }
    }

    pub fn pending_batched(&self) -> usize {
        self.batches.iter().map(VecDeque::len).sum()
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }
}
