//! Command buffer sub-pools, the buffer registry and the submission queues.
//!
//! A new buffer lands in the sub-pool with the best load-balancing score. A
//! saturated pool is grown (when allowed) by `max(capacity / 2, 8)` up to the
//! hard cap; after that, any sibling with spare slots is used. The registry is
//! a fixed-size [`BoundedTable`]; when it is full the oldest entry that is
//! neither committed nor in flight is evicted and treated as destroyed. If
//! every entry is committed, creation fails with `NoResources`.

use serde::{Deserialize, Serialize};

use crate::bounded_table::{BoundedTable, Fifo, OldestFirst};
use crate::command_buffer::{CommandBufferRecord, CommandBufferState, Priority};
use crate::config::CommandPoolConfig;
use crate::dependency::BarrierMode;
use crate::error::{Result, VgpuError};
use crate::id_pool::{CommandBufferId, CommandBufferTag, IdPool};
use crate::scheduler::{Scheduled, SubmissionScheduler};
use crate::stats::EngineStats;

const MIN_POOL_GROWTH: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolClass {
    Critical,
    Standard,
    /// No priority affinity; absorbs overflow from the others.
    Compute,
    Background,
}

impl PoolClass {
    pub fn preferred_for(priority: Priority) -> Self {
        match priority {
            Priority::Critical | Priority::High => PoolClass::Critical,
            Priority::Normal => PoolClass::Standard,
            Priority::Background => PoolClass::Background,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPoolSpec {
    pub name: String,
    pub class: PoolClass,
    pub capacity: u32,
}

impl CommandPoolSpec {
    pub fn new(name: impl Into<String>, class: PoolClass, capacity: u32) -> Self {
        Self {
            name: name.into(),
            class,
            capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandBufferPool {
    pub pool_id: u32,
    pub name: String,
    pub class: PoolClass,
    pub capacity: u32,
    pub active_count: u32,
    /// Highest `active_count` seen; never decreases.
    pub peak_usage: u32,
    pub allocation_count: u64,
}

impl CommandBufferPool {
    fn from_spec(pool_id: u32, spec: &CommandPoolSpec) -> Self {
        Self {
            pool_id,
            name: spec.name.clone(),
            class: spec.class,
            capacity: spec.capacity,
            active_count: 0,
            peak_usage: 0,
            allocation_count: 0,
        }
    }

    pub fn has_room(&self) -> bool {
        self.active_count < self.capacity
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.active_count)
    }

    pub fn free_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(self.free_slots()) / f64::from(self.capacity)
    }

    /// Share of capacity that was in use at peak but is idle now.
    pub fn fragmentation(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(self.peak_usage.saturating_sub(self.active_count)) / f64::from(self.capacity)
    }

    fn score(&self, priority: Priority, hard_cap: u32, expansion: bool) -> f64 {
        let affinity = if self.class == PoolClass::preferred_for(priority) {
            40.0
        } else {
            0.0
        };
        let headroom = if expansion && hard_cap > 0 {
            f64::from(hard_cap.saturating_sub(self.capacity)) / f64::from(hard_cap) * 10.0
        } else {
            0.0
        };
        affinity + headroom + self.free_ratio() * 30.0 - self.fragmentation() * 10.0
    }

    fn grow(&mut self, hard_cap: u32) -> bool {
        if self.capacity >= hard_cap {
            return false;
        }
        let step = (self.capacity / 2).max(MIN_POOL_GROWTH);
        self.capacity = self.capacity.saturating_add(step).min(hard_cap);
        true
    }

    fn acquire(&mut self) {
        self.active_count += 1;
        self.allocation_count += 1;
        self.peak_usage = self.peak_usage.max(self.active_count);
    }

    fn release(&mut self) {
        self.active_count = self.active_count.saturating_sub(1);
    }
}

/// Result of a successful creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedBuffer {
    pub id: CommandBufferId,
    pub priority: Priority,
    pub pool_index: usize,
    /// Live buffer pushed out of the registry to make room.
    pub evicted: Option<CommandBufferId>,
}

/// A buffer ready to hand to the device.
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub id: CommandBufferId,
    pub context_id: u32,
    pub stream: Vec<u8>,
    pub barrier: BarrierMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: CommandBufferId,
    /// Released rather than parked as reusable.
    pub released: bool,
}

pub struct CommandPoolManager {
    pools: Vec<CommandBufferPool>,
    registry: BoundedTable<CommandBufferId, CommandBufferRecord, OldestFirst>,
    /// Recently completed-and-released buffers, for `is_executed` polling.
    retired: BoundedTable<CommandBufferId, (), Fifo>,
    ids: IdPool<CommandBufferTag>,
    scheduler: SubmissionScheduler,
    allow_expansion: bool,
    allow_sibling_fallback: bool,
    hard_cap: u32,
    recycle_ids_on_complete: bool,
    tick: u64,
}

impl CommandPoolManager {
    pub fn new(config: &CommandPoolConfig, ids: IdPool<CommandBufferTag>) -> Self {
        let pools = config
            .pools
            .iter()
            .enumerate()
            .map(|(i, spec)| CommandBufferPool::from_spec(i as u32, spec))
            .collect();
        Self {
            pools,
            registry: BoundedTable::new(config.registry_capacity, OldestFirst),
            retired: BoundedTable::new(config.registry_capacity, Fifo),
            ids,
            scheduler: SubmissionScheduler::new(),
            allow_expansion: config.allow_expansion,
            allow_sibling_fallback: config.allow_sibling_fallback,
            hard_cap: config.hard_cap,
            recycle_ids_on_complete: config.recycle_ids_on_complete,
            tick: 0,
        }
    }

    pub fn create(
        &mut self,
        queue_id: u32,
        context_id: u32,
        debug_label: Option<String>,
        stats: &EngineStats,
    ) -> Result<CreatedBuffer> {
        let priority = Priority::from_queue_id(queue_id);
        if !self.registry.has_room() {
            stats.inc_pool_exhausted();
            return Err(VgpuError::no_resources(format!(
                "command buffer registry full: all {} entries are committed or in flight",
                self.registry.capacity()
            )));
        }
        let pool_index = self.select_pool(priority, stats)?;
        let id = self.ids.allocate()?;
        self.retired.remove(&id);
        self.pools[pool_index].acquire();
        self.tick += 1;

        let record = CommandBufferRecord::new(
            id,
            queue_id,
            context_id,
            pool_index,
            self.tick,
            debug_label,
        );
        let evicted = self.registry.insert(id, record).map(|(old_id, old)| {
            tracing::warn!(
                buffer_id = old_id.raw(),
                state = ?old.state,
                "command buffer registry full; evicting oldest idle entry"
            );
            stats.inc_buffers_evicted();
            self.release_record(old, true);
            old_id
        });

        stats.inc_buffers_created();
        tracing::debug!(
            buffer_id = id.raw(),
            queue_id,
            ?priority,
            pool = %self.pools[pool_index].name,
            "created command buffer"
        );
        Ok(CreatedBuffer {
            id,
            priority,
            pool_index,
            evicted,
        })
    }

    fn select_pool(&mut self, priority: Priority, stats: &EngineStats) -> Result<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, pool) in self.pools.iter().enumerate() {
            let score = pool.score(priority, self.hard_cap, self.allow_expansion);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        let Some((chosen, _)) = best else {
            stats.inc_pool_exhausted();
            return Err(VgpuError::no_resources("no command buffer pools configured"));
        };
        if self.pools[chosen].has_room() {
            return Ok(chosen);
        }

        if self.allow_expansion && self.pools[chosen].grow(self.hard_cap) {
            stats.inc_pool_expansions();
            tracing::info!(
                pool = %self.pools[chosen].name,
                capacity = self.pools[chosen].capacity,
                "expanded command buffer pool"
            );
            return Ok(chosen);
        }

        if self.allow_sibling_fallback {
            let sibling = self
                .pools
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != chosen && p.has_room())
                .max_by_key(|(i, p)| (p.free_slots(), std::cmp::Reverse(*i)))
                .map(|(i, _)| i);
            if let Some(sibling) = sibling {
                stats.inc_pool_sibling_fallbacks();
                tracing::debug!(
                    from = %self.pools[chosen].name,
                    to = %self.pools[sibling].name,
                    "command buffer pool saturated; using sibling"
                );
                return Ok(sibling);
            }
        }

        stats.inc_pool_exhausted();
        Err(VgpuError::no_resources(format!(
            "command buffer pool '{}' exhausted at {} buffers",
            self.pools[chosen].name, self.pools[chosen].capacity
        )))
    }

    pub fn begin_recording(&mut self, id: CommandBufferId) -> Result<()> {
        let tick = self.next_tick();
        self.record_mut(id)?
            .transition(CommandBufferState::Recording, tick)
    }

    /// Append already-encoded wire bytes. A buffer still in `Created` starts
    /// recording implicitly.
    pub fn record_command(&mut self, id: CommandBufferId, bytes: &[u8]) -> Result<usize> {
        let count = vgpu_protocol::count_commands(bytes)?;
        let tick = self.next_tick();
        let record = self.record_mut(id)?;
        if record.state == CommandBufferState::Created {
            record.transition(CommandBufferState::Recording, tick)?;
        }
        if record.state != CommandBufferState::Recording {
            return Err(VgpuError::bad_argument(format!(
                "{id} is {:?}, not recording",
                record.state
            )));
        }
        record.stream.extend_from_slice(bytes);
        record.command_count = record.command_count.saturating_add(count as u32);
        Ok(count)
    }

    /// Check that `id` can be committed, returning its queue and priority.
    pub fn commit_target(&self, id: CommandBufferId) -> Result<(u32, Priority)> {
        let record = self.record(id)?;
        match record.state {
            CommandBufferState::Created | CommandBufferState::Recording => {
                Ok((record.queue_id, record.priority))
            }
            state => Err(VgpuError::bad_argument(format!(
                "{id} is {state:?}; only recording buffers can be committed"
            ))),
        }
    }

    pub fn commit(
        &mut self,
        id: CommandBufferId,
        barrier: BarrierMode,
        has_dependencies: bool,
    ) -> Result<()> {
        let tick = self.next_tick();
        let record = self.record_mut(id)?;
        if record.state == CommandBufferState::Created {
            record.transition(CommandBufferState::Recording, tick)?;
        }
        record.transition(CommandBufferState::Committed, tick)?;
        record.barrier = barrier;
        record.has_dependencies = has_dependencies;
        let (context_id, level) = (record.context_id, record.priority.queue_level());
        self.scheduler.enqueue(id, context_id, level);
        Ok(())
    }

    /// Pull every queued buffer of `context_id` in scheduling order.
    pub fn drain_context(&mut self, context_id: u32) -> Vec<Scheduled> {
        self.scheduler.drain_context(context_id)
    }

    pub fn requeue_front(&mut self, entries: &[Scheduled]) {
        self.scheduler.requeue_front(entries);
    }

    /// Snapshot of what to send for a drained entry. `None` if the buffer was
    /// evicted or destroyed after it was queued.
    pub fn pending_submission(&self, entry: &Scheduled) -> Option<PendingSubmission> {
        let record = self.registry.get(&entry.id)?;
        (record.state == CommandBufferState::Committed && !record.is_submitted).then(|| {
            PendingSubmission {
                id: entry.id,
                context_id: entry.context_id,
                stream: record.stream.clone(),
                barrier: record.barrier,
            }
        })
    }

    pub fn mark_submitted(&mut self, id: CommandBufferId) -> Result<()> {
        self.record_mut(id)?.is_submitted = true;
        Ok(())
    }

    pub fn submitted_ids(&self) -> Vec<CommandBufferId> {
        self.registry
            .iter()
            .filter(|(_, r)| r.is_submitted)
            .map(|(id, _)| id)
            .collect()
    }

    /// Mark every submitted buffer executed. Reusable buffers are parked; the
    /// rest are released, recycling their ids when configured to.
    pub fn complete_submitted(&mut self, stats: &EngineStats) -> Vec<Completion> {
        let mut done = Vec::new();
        let mut ids = self.submitted_ids();
        ids.sort();
        for id in ids {
            let tick = self.next_tick();
            let Some(record) = self.registry.get_mut(&id) else {
                continue;
            };
            if let Err(err) = record.transition(CommandBufferState::Executed, tick) {
                tracing::warn!(buffer_id = id.raw(), %err, "completion out of order");
                continue;
            }
            stats.inc_buffers_completed();
            if record.is_reusable {
                if let Err(err) = record.transition(CommandBufferState::Reusable, tick) {
                    tracing::warn!(buffer_id = id.raw(), %err, "could not park reusable buffer");
                }
                done.push(Completion {
                    id,
                    released: false,
                });
            } else if let Some(record) = self.registry.remove(&id) {
                let recycle = self.recycle_ids_on_complete;
                self.release_record(record, recycle);
                self.retired.insert(id, ());
                stats.inc_buffers_destroyed();
                done.push(Completion { id, released: true });
            }
        }
        done
    }

    pub fn is_executed(&self, id: CommandBufferId) -> Result<bool> {
        match self.registry.get(&id) {
            Some(record) => Ok(record.is_executed()),
            None if self.retired.contains(&id) => Ok(true),
            None => Err(not_found(id)),
        }
    }

    pub fn set_reusable(&mut self, id: CommandBufferId, reusable: bool) -> Result<()> {
        self.record_mut(id)?.is_reusable = reusable;
        Ok(())
    }

    /// Drop a buffer that was never committed.
    pub fn discard(&mut self, id: CommandBufferId, stats: &EngineStats) -> Result<()> {
        let state = self.record(id)?.state;
        if !matches!(
            state,
            CommandBufferState::Created | CommandBufferState::Recording
        ) {
            return Err(VgpuError::bad_argument(format!(
                "{id} is {state:?}; only unsubmitted buffers can be discarded"
            )));
        }
        self.destroy(id, stats)?;
        stats.inc_buffers_discarded();
        Ok(())
    }

    pub fn destroy(&mut self, id: CommandBufferId, stats: &EngineStats) -> Result<()> {
        let tick = self.next_tick();
        let record = self.record_mut(id)?;
        if record.state == CommandBufferState::Committed {
            return Err(VgpuError::NotReady("committed buffers cannot be cancelled"));
        }
        record.transition(CommandBufferState::Destroyed, tick)?;
        if let Some(record) = self.registry.remove(&id) {
            self.release_record(record, true);
        }
        stats.inc_buffers_destroyed();
        tracing::debug!(buffer_id = id.raw(), "destroyed command buffer");
        Ok(())
    }

    /// Start a new recording cycle on a buffer parked after execution.
    pub fn reset_for_reuse(&mut self, id: CommandBufferId) -> Result<(u32, Priority)> {
        let tick = self.next_tick();
        let record = self.record_mut(id)?;
        if record.state != CommandBufferState::Reusable {
            return Err(VgpuError::bad_argument(format!(
                "{id} is {:?}, not reusable",
                record.state
            )));
        }
        record.transition(CommandBufferState::Recording, tick)?;
        Ok((record.queue_id, record.priority))
    }

    fn release_record(&mut self, record: CommandBufferRecord, recycle_id: bool) {
        if let Some(pool) = self.pools.get_mut(record.pool_index) {
            pool.release();
        }
        self.scheduler.remove(record.id);
        if recycle_id {
            if let Err(err) = self.ids.release(record.id) {
                tracing::warn!(buffer_id = record.id.raw(), %err, "id not recycled");
            }
        }
    }

    pub fn record(&self, id: CommandBufferId) -> Result<&CommandBufferRecord> {
        self.registry.get(&id).ok_or_else(|| not_found(id))
    }

    fn record_mut(&mut self, id: CommandBufferId) -> Result<&mut CommandBufferRecord> {
        self.registry.get_mut(&id).ok_or_else(|| not_found(id))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn pools(&self) -> &[CommandBufferPool] {
        &self.pools
    }

    pub fn scheduler(&self) -> &SubmissionScheduler {
        &self.scheduler
    }

    pub fn pending_contexts(&self) -> Vec<u32> {
        self.scheduler.pending_contexts()
    }

    pub fn live_buffers(&self) -> usize {
        self.registry.len()
    }

    pub fn ids(&self) -> &IdPool<CommandBufferTag> {
        &self.ids
    }
}

fn not_found(id: CommandBufferId) -> VgpuError {
    VgpuError::NotFound {
        kind: "command-buffer",
        id: id.raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueLevel;
    use vgpu_protocol::CommandWriter;

    fn config(pools: Vec<CommandPoolSpec>, expansion: bool) -> CommandPoolConfig {
        CommandPoolConfig {
            pools,
            allow_expansion: expansion,
            ..CommandPoolConfig::default()
        }
    }

    fn manager(config: &CommandPoolConfig) -> CommandPoolManager {
        CommandPoolManager::new(config, IdPool::new(64))
    }

    fn nop_stream() -> Vec<u8> {
        let mut w = CommandWriter::new();
        w.nop();
        w.finish().to_bytes()
    }

    #[test]
    fn normal_priority_prefers_standard_pool() {
        let cfg = CommandPoolConfig::default();
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let created = m.create(5, 0, None, &stats).unwrap();
        assert_eq!(m.pools()[created.pool_index].class, PoolClass::Standard);
        let created = m.create(0, 0, None, &stats).unwrap();
        assert_eq!(m.pools()[created.pool_index].class, PoolClass::Critical);
    }

    #[test]
    fn saturated_pool_grows_by_half_or_eight() {
        let cfg = config(vec![CommandPoolSpec::new("only", PoolClass::Standard, 4)], true);
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        for _ in 0..5 {
            m.create(5, 0, None, &stats).unwrap();
        }
        assert_eq!(m.pools()[0].capacity, 12);
        assert_eq!(stats.snapshot().pool_expansions, 1);
    }

    #[test]
    fn growth_stops_at_hard_cap() {
        let mut cfg = config(vec![CommandPoolSpec::new("only", PoolClass::Standard, 6)], true);
        cfg.hard_cap = 10;
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        for _ in 0..10 {
            m.create(5, 0, None, &stats).unwrap();
        }
        assert_eq!(m.pools()[0].capacity, 10);
        assert!(matches!(
            m.create(5, 0, None, &stats),
            Err(VgpuError::NoResources(_))
        ));
    }

    #[test]
    fn destroy_returns_slot_and_id() {
        let cfg = CommandPoolConfig::default();
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let a = m.create(5, 0, None, &stats).unwrap();
        m.destroy(a.id, &stats).unwrap();
        assert_eq!(m.pools()[a.pool_index].active_count, 0);
        assert_eq!(m.pools()[a.pool_index].peak_usage, 1);
        let b = m.create(5, 0, None, &stats).unwrap();
        assert_eq!(b.id, a.id);
    }

    #[test]
    fn committed_buffers_cannot_be_destroyed_or_discarded() {
        let cfg = CommandPoolConfig::default();
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let a = m.create(5, 0, None, &stats).unwrap();
        m.record_command(a.id, &nop_stream()).unwrap();
        m.commit(a.id, BarrierMode::None, false).unwrap();
        assert!(matches!(m.destroy(a.id, &stats), Err(VgpuError::NotReady(_))));
        assert!(matches!(m.discard(a.id, &stats), Err(VgpuError::BadArgument(_))));
        assert_eq!(m.scheduler().level_len(QueueLevel::Normal), 1);
    }

    #[test]
    fn record_rejects_malformed_bytes() {
        let cfg = CommandPoolConfig::default();
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let a = m.create(5, 0, None, &stats).unwrap();
        assert!(matches!(
            m.record_command(a.id, &[1, 2, 3]),
            Err(VgpuError::Protocol(_))
        ));
        assert_eq!(m.record_command(a.id, &nop_stream()).unwrap(), 1);
        assert_eq!(m.record(a.id).unwrap().command_count, 1);
    }

    #[test]
    fn registry_overflow_evicts_oldest_and_frees_its_slot() {
        let mut cfg = CommandPoolConfig::default();
        cfg.registry_capacity = 2;
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let a = m.create(5, 0, None, &stats).unwrap();
        let b = m.create(5, 0, None, &stats).unwrap();
        m.record_command(a.id, &nop_stream()).unwrap();
        m.commit(a.id, BarrierMode::None, false).unwrap();

        // `a` was committed last, so `b` is now the oldest entry.
        let c = m.create(5, 0, None, &stats).unwrap();
        assert_eq!(c.evicted, Some(b.id));
        assert!(matches!(m.record(b.id), Err(VgpuError::NotFound { .. })));
        assert_eq!(m.live_buffers(), 2);
        assert_eq!(m.pools()[c.pool_index].active_count, 2);
        assert_eq!(stats.snapshot().buffers_evicted, 1);
    }

    #[test]
    fn committed_buffers_are_never_evicted() {
        let mut cfg = CommandPoolConfig::default();
        cfg.registry_capacity = 2;
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let a = m.create(5, 0, None, &stats).unwrap().id;
        let b = m.create(5, 0, None, &stats).unwrap().id;
        m.commit(a, BarrierMode::None, false).unwrap();
        m.commit(b, BarrierMode::None, false).unwrap();
        let entry = m.drain_context(0).remove(0);
        m.mark_submitted(entry.id).unwrap();

        assert!(matches!(
            m.create(5, 0, None, &stats),
            Err(VgpuError::NoResources(_))
        ));
        assert_eq!(m.live_buffers(), 2);
        assert_eq!(m.ids().stats().allocated, 2);
        assert_eq!(stats.snapshot().buffers_evicted, 0);
        assert_eq!(m.record(b).unwrap().state, CommandBufferState::Committed);

        m.complete_submitted(&stats);
        let c = m.create(5, 0, None, &stats).unwrap();
        assert_eq!(c.evicted, None);
        assert_ne!(c.id, b);
    }

    #[test]
    fn completion_parks_reusable_and_releases_the_rest() {
        let cfg = CommandPoolConfig::default();
        let mut m = manager(&cfg);
        let stats = EngineStats::new();
        let keep = m.create(5, 0, None, &stats).unwrap().id;
        let transient = m.create(5, 0, None, &stats).unwrap().id;
        m.set_reusable(keep, true).unwrap();
        for id in [keep, transient] {
            m.commit(id, BarrierMode::None, false).unwrap();
        }
        for entry in m.drain_context(0) {
            assert!(m.pending_submission(&entry).is_some());
            m.mark_submitted(entry.id).unwrap();
        }

        let done = m.complete_submitted(&stats);
        assert_eq!(done.len(), 2);
        assert!(m.is_executed(keep).unwrap());
        assert!(m.is_executed(transient).unwrap());
        assert_eq!(m.record(keep).unwrap().state, CommandBufferState::Reusable);
        assert!(m.record(transient).is_err());

        m.reset_for_reuse(keep).unwrap();
        assert!(!m.is_executed(keep).unwrap());
    }
}
