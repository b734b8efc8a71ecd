//! The engine: one instance of every manager plus the device they feed.
//!
//! Each manager sits behind its own re-entrant lock so that the frame-pacing
//! pass can call back into public entry points while it already holds them.
//! `RefCell` borrows are kept to a single statement or a short block and are
//! never held across a call into another public method.
//!
//! Lock order: pacer, pools, graph, memory, resources, device.

use std::cell::RefCell;
use std::time::Instant;

use parking_lot::ReentrantMutex;
use vgpu_protocol::{barrier_flags, CommandWriter};

use crate::command_buffer::CommandBufferState;
use crate::command_pool::{CommandBufferPool, CommandPoolManager};
use crate::config::EngineConfig;
use crate::dependency::{AccessFlags, BarrierMode, DependencyEdge, DependencyGraph};
use crate::device::{DeviceSubmission, VirtualDevice};
use crate::error::{Result, VgpuError};
use crate::id_pool::{
    BufferId, BufferTag, CommandBufferId, IdPool, MemoryResource, TextureId, TextureTag,
};
use crate::memory::{
    Allocation, GpuMemoryPool, MemoryPoolManager, TransferPriority, TransferStats,
    TransferStatus,
};
use crate::pacing::FramePacer;
use crate::stats::{EngineStats, EngineStatsSnapshot};

type Locked<T> = ReentrantMutex<RefCell<T>>;

fn locked<T>(value: T) -> Locked<T> {
    ReentrantMutex::new(RefCell::new(value))
}

struct ResourceIds {
    buffers: IdPool<BufferTag>,
    textures: IdPool<TextureTag>,
}

/// Outcome of one scheduling pass over a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteStatus {
    pub submitted: usize,
    /// Queued entries whose buffer was evicted or destroyed meanwhile.
    pub skipped: usize,
    pub device_barriers: usize,
    pub software_barriers: usize,
    pub transfers_flushed: usize,
    /// Entries requeued because a buffer they depend on is still queued in
    /// another context.
    pub held_back: usize,
}

impl ExecuteStatus {
    fn merge(&mut self, other: ExecuteStatus) {
        self.submitted += other.submitted;
        self.skipped += other.skipped;
        self.device_barriers += other.device_barriers;
        self.software_barriers += other.software_barriers;
        self.transfers_flushed += other.transfers_flushed;
        self.held_back += other.held_back;
    }
}

/// Work done by one frame-pacing tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub contexts: Vec<u32>,
    pub status: ExecuteStatus,
}

pub struct VgpuEngine<D> {
    config: EngineConfig,
    pacer: Locked<FramePacer>,
    pools: Locked<CommandPoolManager>,
    graph: Locked<DependencyGraph>,
    memory: Locked<MemoryPoolManager>,
    resources: Locked<ResourceIds>,
    device: Locked<D>,
    stats: EngineStats,
}

impl<D: VirtualDevice> VgpuEngine<D> {
    pub fn new(config: EngineConfig, device: D) -> Result<Self> {
        config.validate()?;
        let ids = &config.ids;
        let policy = ids.overflow_policy;

        let pools = CommandPoolManager::new(
            &config.command_pools,
            IdPool::with_policy(ids.command_buffer_recycle_capacity, policy),
        );
        let graph = DependencyGraph::new(
            config.dependencies.policy,
            config.dependencies.max_dependents,
        );
        let memory = MemoryPoolManager::new(
            &config.memory,
            IdPool::with_policy(ids.transfer_recycle_capacity, policy),
        )?;
        let resources = ResourceIds {
            buffers: IdPool::with_policy(ids.buffer_recycle_capacity, policy),
            textures: IdPool::with_policy(ids.texture_recycle_capacity, policy),
        };

        tracing::info!(
            command_pools = config.command_pools.pools.len(),
            memory_pools = config.memory.pools.len(),
            hazard_policy = ?config.dependencies.policy,
            "virtual gpu engine initialized"
        );
        Ok(Self {
            pacer: locked(FramePacer::new(&config.frame_pacing)),
            pools: locked(pools),
            graph: locked(graph),
            memory: locked(memory),
            resources: locked(resources),
            device: locked(device),
            stats: EngineStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- command buffers -------------------------------------------------

    /// Create a buffer on the default context.
    pub fn create_command_buffer(&self, queue_id: u32) -> Result<CommandBufferId> {
        self.create_command_buffer_in(self.config.default_context_id, queue_id, None)
    }

    pub fn create_command_buffer_in(
        &self,
        context_id: u32,
        queue_id: u32,
        debug_label: Option<&str>,
    ) -> Result<CommandBufferId> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();

        let created = pools.borrow_mut().create(
            queue_id,
            context_id,
            debug_label.map(str::to_owned),
            &self.stats,
        )?;
        let mut graph = graph.borrow_mut();
        if let Some(evicted) = created.evicted {
            graph.remove_buffer(evicted);
        }
        let report = graph.register_buffer(created.id, queue_id, created.priority);
        self.stats.add_hazards(report.added, report.dropped);
        Ok(created.id)
    }

    pub fn begin_recording(&self, id: CommandBufferId) -> Result<()> {
        let pools = self.pools.lock();
        let result = pools.borrow_mut().begin_recording(id);
        result
    }

    /// Append encoded wire bytes to a recording buffer. Returns the number of
    /// commands appended.
    pub fn record_command(&self, id: CommandBufferId, bytes: &[u8]) -> Result<usize> {
        let pools = self.pools.lock();
        let result = pools.borrow_mut().record_command(id, bytes);
        result
    }

    pub fn set_reusable(&self, id: CommandBufferId, reusable: bool) -> Result<()> {
        let pools = self.pools.lock();
        let result = pools.borrow_mut().set_reusable(id, reusable);
        result
    }

    /// Declare that `id` reads and/or writes `resource`. Only consulted by the
    /// resource-access hazard policy.
    pub fn declare_access(
        &self,
        id: CommandBufferId,
        resource: impl Into<MemoryResource>,
        flags: AccessFlags,
    ) -> Result<()> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        pools.borrow().record(id)?;
        let result = graph.borrow_mut().declare_access(id, resource.into(), flags);
        result
    }

    /// Freeze the buffer, resolve its hazards and queue it for submission.
    pub fn commit(&self, id: CommandBufferId) -> Result<()> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        let device = self.device.lock();

        pools.borrow().commit_target(id)?;
        let device_barrier = device.borrow().supports_memory_barrier();

        let (barrier, has_dependencies) = {
            let mut graph = graph.borrow_mut();
            let report = graph.analyze_commit(id);
            self.stats.add_hazards(report.added, report.dropped);
            let installed = graph.configure_synchronization_primitives(id);
            self.stats.add_sync_primitives(installed);
            (
                graph.setup_memory_barriers(id, device_barrier),
                graph.has_dependencies(id),
            )
        };

        pools.borrow_mut().commit(id, barrier, has_dependencies)?;
        tracing::debug!(buffer_id = id.raw(), ?barrier, has_dependencies, "committed");
        Ok(())
    }

    /// Drop a buffer that has not been committed.
    pub fn discard(&self, id: CommandBufferId) -> Result<()> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        pools.borrow_mut().discard(id, &self.stats)?;
        graph.borrow_mut().remove_buffer(id);
        Ok(())
    }

    pub fn destroy_command_buffer(&self, id: CommandBufferId) -> Result<()> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        pools.borrow_mut().destroy(id, &self.stats)?;
        graph.borrow_mut().remove_buffer(id);
        Ok(())
    }

    /// Re-open a reusable buffer for recording.
    pub fn reset_for_reuse(&self, id: CommandBufferId) -> Result<()> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        let (queue_id, priority) = pools.borrow_mut().reset_for_reuse(id)?;
        let report = graph.borrow_mut().reset_buffer(id, queue_id, priority);
        self.stats.add_hazards(report.added, report.dropped);
        Ok(())
    }

    pub fn command_buffer_state(&self, id: CommandBufferId) -> Result<CommandBufferState> {
        let pools = self.pools.lock();
        let state = pools.borrow().record(id).map(|r| r.state);
        state
    }

    pub fn is_executed(&self, id: CommandBufferId) -> Result<bool> {
        let pools = self.pools.lock();
        let executed = pools.borrow().is_executed(id);
        executed
    }

    // --- scheduling --------------------------------------------------------

    /// Flush pending transfers, then submit every queued buffer of
    /// `context_id`: High before Normal before Low, FIFO within a level,
    /// except that a buffer always follows the sources of its dependency
    /// edges. Buffers waiting on a source queued in another context stay
    /// queued.
    ///
    /// If the device rejects a buffer, it and every buffer after it go back to
    /// the head of their queues and the error is returned.
    pub fn execute(&self, context_id: u32) -> Result<ExecuteStatus> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        let mut status = ExecuteStatus {
            transfers_flushed: self.flush_transfers()?,
            ..ExecuteStatus::default()
        };

        let drained = pools.borrow_mut().drain_context(context_id);
        let (entries, held) = {
            let graph = graph.borrow();
            let queued = pools.borrow();
            let split = queued.scheduler().order_by_dependencies(drained, |id| {
                graph.incoming(id).map(|e| e.source).collect::<Vec<_>>()
            });
            split
        };
        if !held.is_empty() {
            tracing::debug!(
                context_id,
                held = held.len(),
                "buffers wait on work queued in other contexts"
            );
            status.held_back = held.len();
            pools.borrow_mut().requeue_front(&held);
        }
        for (i, entry) in entries.iter().enumerate() {
            let pending = pools.borrow().pending_submission(entry);
            let Some(pending) = pending else {
                tracing::warn!(buffer_id = entry.id.raw(), "queued buffer no longer live");
                status.skipped += 1;
                continue;
            };

            let stream = match pending.barrier {
                BarrierMode::None => pending.stream,
                BarrierMode::Device => {
                    let mut writer = CommandWriter::new();
                    writer.memory_barrier(barrier_flags::DEVICE_WRITES);
                    let mut bytes = writer.finish().to_bytes();
                    bytes.extend_from_slice(&pending.stream);
                    status.device_barriers += 1;
                    self.stats.inc_device_barriers();
                    bytes
                }
                BarrierMode::Software => {
                    if let Err(err) = self.with_device(|d| d.wait_idle()) {
                        pools.borrow_mut().requeue_front(&entries[i..]);
                        return Err(err.into());
                    }
                    status.software_barriers += 1;
                    self.stats.inc_software_barriers();
                    pending.stream
                }
            };

            let submitted = self.with_device(|d| {
                d.submit(DeviceSubmission {
                    context_id,
                    stream,
                })
            });
            if let Err(err) = submitted {
                self.stats.inc_submission_failures();
                tracing::warn!(buffer_id = entry.id.raw(), context_id, %err, "submission rejected");
                pools.borrow_mut().requeue_front(&entries[i..]);
                return Err(err.into());
            }
            pools.borrow_mut().mark_submitted(pending.id)?;
            self.stats.inc_submissions();
            status.submitted += 1;
        }

        if status.submitted > 0 {
            tracing::debug!(context_id, submitted = status.submitted, "scheduling pass");
        }
        Ok(status)
    }

    /// Block until the device is idle, then retire every submitted buffer.
    /// Returns how many buffers completed.
    pub fn synchronize(&self) -> Result<usize> {
        let pools = self.pools.lock();
        let graph = self.graph.lock();
        self.with_device(|d| d.wait_idle())?;

        let done = pools.borrow_mut().complete_submitted(&self.stats);
        let mut graph = graph.borrow_mut();
        for completion in &done {
            graph.remove_buffer(completion.id);
        }
        Ok(done.len())
    }

    /// Contexts that have committed buffers waiting for a scheduling pass.
    pub fn pending_contexts(&self) -> Vec<u32> {
        let pools = self.pools.lock();
        let contexts = pools.borrow().pending_contexts();
        contexts
    }

    /// Frame-pacing entry point. If a tick is due at `now`, run a scheduling
    /// pass for every pending context and flush transfers.
    pub fn frame_tick(&self, now: Instant) -> Result<Option<FrameReport>> {
        let pacer = self.pacer.lock();
        if !pacer.borrow_mut().try_tick(now) {
            return Ok(None);
        }
        self.stats.inc_frame_ticks();

        // Held for the whole pass; the calls below take them again.
        let _pools = self.pools.lock();
        let _graph = self.graph.lock();
        let _memory = self.memory.lock();

        let mut report = FrameReport::default();
        // Buffers held back on another context become ready once that context
        // has been drained, so repeat until a round submits nothing.
        loop {
            let contexts = self.pending_contexts();
            if contexts.is_empty() {
                break;
            }
            let (submitted, held_back) = (report.status.submitted, report.status.held_back);
            for context_id in contexts {
                report.status.merge(self.execute(context_id)?);
                if !report.contexts.contains(&context_id) {
                    report.contexts.push(context_id);
                }
            }
            if report.status.held_back == held_back || report.status.submitted == submitted {
                break;
            }
        }
        report.status.transfers_flushed += self.flush_transfers()?;
        Ok(Some(report))
    }

    // --- resources and memory ----------------------------------------------

    pub fn create_buffer_resource(&self) -> Result<BufferId> {
        let resources = self.resources.lock();
        let id = resources.borrow_mut().buffers.allocate();
        id
    }

    pub fn create_texture_resource(&self) -> Result<TextureId> {
        let resources = self.resources.lock();
        let id = resources.borrow_mut().textures.allocate();
        id
    }

    /// Free the resource's memory, if any, and recycle its handle.
    pub fn release_resource(&self, resource: impl Into<MemoryResource>) -> Result<()> {
        let resource = resource.into();
        let memory = self.memory.lock();
        let resources = self.resources.lock();

        match memory.borrow_mut().free_memory(resource, &self.stats) {
            Ok(_) | Err(VgpuError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        let mut ids = resources.borrow_mut();
        match resource {
            MemoryResource::Buffer(id) => ids.buffers.release(id),
            MemoryResource::Texture(id) => ids.textures.release(id),
        }
    }

    /// Back `resource` with device memory. Returns its device address.
    pub fn allocate_memory(&self, size: u64, resource: impl Into<MemoryResource>) -> Result<u64> {
        let memory = self.memory.lock();
        let allocation = memory
            .borrow_mut()
            .allocate_memory(size, resource.into(), &self.stats)?;
        Ok(allocation.gpu_address)
    }

    pub fn free_memory(&self, resource: impl Into<MemoryResource>) -> Result<()> {
        let memory = self.memory.lock();
        let freed = memory.borrow_mut().free_memory(resource.into(), &self.stats);
        freed.map(|_| ())
    }

    pub fn allocation(&self, resource: impl Into<MemoryResource>) -> Option<Allocation> {
        let memory = self.memory.lock();
        let allocation = memory.borrow().allocation(resource.into()).copied();
        allocation
    }

    /// Copy `data` into `resource` at `offset`.
    pub fn update_memory(
        &self,
        resource: impl Into<MemoryResource>,
        data: &[u8],
        offset: u64,
    ) -> Result<TransferStatus> {
        self.update_memory_with_priority(resource, data, offset, TransferPriority::Normal)
    }

    pub fn update_memory_with_priority(
        &self,
        resource: impl Into<MemoryResource>,
        data: &[u8],
        offset: u64,
        priority: TransferPriority,
    ) -> Result<TransferStatus> {
        let pools = self.pools.lock();
        let memory = self.memory.lock();
        let device = self.device.lock();

        let inflight = pools.borrow().submitted_ids().len();
        let status = memory.borrow_mut().update_memory(
            resource.into(),
            data,
            offset,
            priority,
            inflight,
            &mut *device.borrow_mut(),
            &self.stats,
        );
        status
    }

    /// Submit batched and deferred transfers. Returns how many completed.
    pub fn flush_transfers(&self) -> Result<usize> {
        let memory = self.memory.lock();
        let device = self.device.lock();
        let flushed = memory
            .borrow_mut()
            .flush_transfers(&mut *device.borrow_mut(), &self.stats);
        flushed
    }

    // --- introspection -----------------------------------------------------

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_json(&self) -> String {
        self.stats.to_json()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        let memory = self.memory.lock();
        let stats = memory.borrow().transfer_stats();
        stats
    }

    pub fn command_pools(&self) -> Vec<CommandBufferPool> {
        let pools = self.pools.lock();
        let snapshot = pools.borrow().pools().to_vec();
        snapshot
    }

    pub fn memory_pools(&self) -> Vec<GpuMemoryPool> {
        let memory = self.memory.lock();
        let snapshot = memory.borrow().pools().to_vec();
        snapshot
    }

    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        let graph = self.graph.lock();
        let edges = graph.borrow().edges().to_vec();
        edges
    }

    /// Run `f` with exclusive access to the device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let device = self.device.lock();
        let mut device = device.borrow_mut();
        f(&mut device)
    }
}
