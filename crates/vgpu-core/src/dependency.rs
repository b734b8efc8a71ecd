//! Hazard tracking between in-flight command buffers.
//!
//! Two policies are available. [`HazardPolicy::PriorityHeuristic`] flags a
//! conflict at creation time whenever two buffers share a queue or sit in
//! adjacent priority bands; it over-reports and does not look at resources.
//! [`HazardPolicy::ResourceAccess`] computes hazards at commit time from the
//! read/write sets each buffer declares.
//!
//! Edges always point from the earlier buffer to the later one. A buffer may
//! have at most [`MAX_DEPENDENTS`] outgoing edges; further edges are dropped
//! with a warning rather than failing the caller.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::command_buffer::Priority;
use crate::error::{Result, VgpuError};
use crate::id_pool::{CommandBufferId, MemoryResource};

pub const MAX_DEPENDENTS: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardPolicy {
    #[default]
    PriorityHeuristic,
    ResourceAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterRead,
    WriteAfterWrite,
}

impl HazardKind {
    pub fn primitive(self) -> SyncPrimitive {
        match self {
            HazardKind::ReadAfterWrite => SyncPrimitive::ExecutionBarrier,
            HazardKind::WriteAfterRead => SyncPrimitive::MemoryFence,
            HazardKind::WriteAfterWrite => SyncPrimitive::WriteBarrier,
        }
    }

    /// WAR only needs execution ordering; the other two need writes made
    /// visible before the dependent runs.
    pub fn needs_memory_barrier(self) -> bool {
        !matches!(self, HazardKind::WriteAfterRead)
    }

    /// Hazard between an earlier access `prev` and a later access `next`.
    pub fn between(prev: AccessFlags, next: AccessFlags) -> Option<Self> {
        let prev_w = prev.contains(AccessFlags::WRITE);
        let next_w = next.contains(AccessFlags::WRITE);
        if prev_w && next_w {
            Some(HazardKind::WriteAfterWrite)
        } else if prev_w && next.contains(AccessFlags::READ) {
            Some(HazardKind::ReadAfterWrite)
        } else if next_w && prev.contains(AccessFlags::READ) {
            Some(HazardKind::WriteAfterRead)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPrimitive {
    ExecutionBarrier,
    MemoryFence,
    WriteBarrier,
}

/// What two buffers are ordered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HazardSubject {
    /// Heuristic mode: the earlier buffer's implied resource set.
    Implicit(CommandBufferId),
    Resource(MemoryResource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub source: CommandBufferId,
    pub target: CommandBufferId,
    pub kind: HazardKind,
    pub subject: HazardSubject,
    pub requires_sync: bool,
    pub resolved: bool,
    pub primitive: Option<SyncPrimitive>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDependencyInfo {
    pub subject: HazardSubject,
    pub access_flags: AccessFlags,
    pub dependent_ids: Vec<CommandBufferId>,
    pub has_write_dependency: bool,
    pub requires_memory_barrier: bool,
}

/// How the submission path must order a buffer behind its producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierMode {
    #[default]
    None,
    /// Prepend a MEMORY_BARRIER command to the buffer's stream.
    Device,
    /// Device has no barrier command; drain the device before submitting.
    Software,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HazardReport {
    pub added: usize,
    pub dropped: usize,
}

impl HazardReport {
    fn merge(&mut self, other: HazardReport) {
        self.added += other.added;
        self.dropped += other.dropped;
    }
}

#[derive(Debug, thiserror::Error)]
enum EdgeRejected {
    #[error("{source_id} has reached its dependent limit")]
    DependentLimit { source_id: CommandBufferId },
    #[error("edge {source_id} -> {target} already present")]
    Duplicate {
        source_id: CommandBufferId,
        target: CommandBufferId,
    },
}

#[derive(Debug)]
struct BufferNode {
    id: CommandBufferId,
    queue_id: u32,
    priority: Priority,
    accesses: HashMap<MemoryResource, AccessFlags>,
    /// Commit order; `None` until committed.
    committed_seq: Option<u64>,
}

#[derive(Debug)]
pub struct DependencyGraph {
    policy: HazardPolicy,
    max_dependents: usize,
    /// Registration order.
    nodes: Vec<BufferNode>,
    edges: Vec<DependencyEdge>,
    infos: HashMap<HazardSubject, ResourceDependencyInfo>,
    commit_seq: u64,
}

impl DependencyGraph {
    pub fn new(policy: HazardPolicy, max_dependents: usize) -> Self {
        Self {
            policy,
            max_dependents: max_dependents.min(MAX_DEPENDENTS),
            nodes: Vec::new(),
            edges: Vec::new(),
            infos: HashMap::new(),
            commit_seq: 0,
        }
    }

    pub fn policy(&self) -> HazardPolicy {
        self.policy
    }

    /// Track a newly created buffer. Under the heuristic policy this scans
    /// every registered buffer for conflicts.
    pub fn register_buffer(
        &mut self,
        id: CommandBufferId,
        queue_id: u32,
        priority: Priority,
    ) -> HazardReport {
        let mut report = HazardReport::default();
        if self.node(id).is_some() {
            return report;
        }
        if self.policy == HazardPolicy::PriorityHeuristic {
            let conflicts: Vec<(CommandBufferId, HazardKind)> = self
                .nodes
                .iter()
                .filter(|n| {
                    n.queue_id == queue_id || n.priority.rank().abs_diff(priority.rank()) <= 1
                })
                .map(|n| {
                    let kind = if n.queue_id == queue_id && n.priority == priority {
                        HazardKind::WriteAfterWrite
                    } else if n.priority >= priority {
                        HazardKind::ReadAfterWrite
                    } else {
                        HazardKind::WriteAfterRead
                    };
                    (n.id, kind)
                })
                .collect();
            for (source, kind) in conflicts {
                report.merge(self.add_edge(source, id, kind, HazardSubject::Implicit(source)));
            }
        }
        self.nodes.push(BufferNode {
            id,
            queue_id,
            priority,
            accesses: HashMap::new(),
            committed_seq: None,
        });
        report
    }

    pub fn declare_access(
        &mut self,
        id: CommandBufferId,
        resource: MemoryResource,
        flags: AccessFlags,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(VgpuError::bad_argument("empty access flags"));
        }
        let node = self.node_mut(id).ok_or(VgpuError::NotFound {
            kind: "command-buffer",
            id: id.raw(),
        })?;
        if node.committed_seq.is_some() {
            return Err(VgpuError::bad_argument(format!(
                "{id} is committed; its access set is frozen"
            )));
        }
        *node.accesses.entry(resource).or_default() |= flags;
        Ok(())
    }

    /// Freeze `id`'s access set. Under the resource-access policy this adds an
    /// edge from every earlier-committed buffer whose accesses conflict.
    pub fn analyze_commit(&mut self, id: CommandBufferId) -> HazardReport {
        let mut report = HazardReport::default();
        self.commit_seq += 1;
        let seq = self.commit_seq;
        let Some(node) = self.node_mut(id) else {
            // Degrade to "no dependency"; the buffer still submits.
            tracing::warn!(buffer_id = id.raw(), "commit of untracked buffer; no hazards computed");
            return report;
        };
        node.committed_seq = Some(seq);

        if self.policy != HazardPolicy::ResourceAccess {
            return report;
        }

        let Some(node) = self.node(id) else {
            return report;
        };
        let mut found = Vec::new();
        for prev in &self.nodes {
            if prev.id == id || !matches!(prev.committed_seq, Some(s) if s < seq) {
                continue;
            }
            for (&resource, &next_flags) in &node.accesses {
                let Some(&prev_flags) = prev.accesses.get(&resource) else {
                    continue;
                };
                if let Some(kind) = HazardKind::between(prev_flags, next_flags) {
                    found.push((prev.id, kind, resource));
                }
            }
        }
        // Deterministic regardless of HashMap iteration order.
        found.sort_by_key(|&(source, _, resource)| (source, resource));
        for (source, kind, resource) in found {
            report.merge(self.add_edge(source, id, kind, HazardSubject::Resource(resource)));
        }
        report
    }

    fn add_edge(
        &mut self,
        source: CommandBufferId,
        target: CommandBufferId,
        kind: HazardKind,
        subject: HazardSubject,
    ) -> HazardReport {
        match self.try_add_edge(source, target, kind, subject) {
            Ok(()) => HazardReport {
                added: 1,
                dropped: 0,
            },
            Err(err) => {
                tracing::warn!(
                    source = source.raw(),
                    target = target.raw(),
                    ?kind,
                    %err,
                    "dropping dependency edge"
                );
                HazardReport {
                    added: 0,
                    dropped: 1,
                }
            }
        }
    }

    fn try_add_edge(
        &mut self,
        source: CommandBufferId,
        target: CommandBufferId,
        kind: HazardKind,
        subject: HazardSubject,
    ) -> std::result::Result<(), EdgeRejected> {
        if self
            .edges
            .iter()
            .any(|e| e.source == source && e.target == target && e.subject == subject)
        {
            return Err(EdgeRejected::Duplicate {
                source_id: source,
                target,
            });
        }
        let outgoing = self.edges.iter().filter(|e| e.source == source).count();
        if outgoing >= self.max_dependents {
            return Err(EdgeRejected::DependentLimit { source_id: source });
        }

        let source_flags = match subject {
            HazardSubject::Implicit(_) => AccessFlags::WRITE,
            HazardSubject::Resource(resource) => self
                .node(source)
                .and_then(|n| n.accesses.get(&resource).copied())
                .unwrap_or_default(),
        };
        let info = self
            .infos
            .entry(subject)
            .or_insert_with(|| ResourceDependencyInfo {
                subject,
                access_flags: AccessFlags::empty(),
                dependent_ids: Vec::new(),
                has_write_dependency: false,
                requires_memory_barrier: false,
            });
        info.access_flags |= source_flags;
        if !info.dependent_ids.contains(&target) {
            info.dependent_ids.push(target);
        }
        // Every hazard kind involves at least one write.
        info.has_write_dependency = true;
        info.requires_memory_barrier |= kind.needs_memory_barrier();

        tracing::debug!(source = source.raw(), target = target.raw(), ?kind, "dependency edge");
        self.edges.push(DependencyEdge {
            source,
            target,
            kind,
            subject,
            requires_sync: true,
            resolved: false,
            primitive: None,
        });
        Ok(())
    }

    /// Install the primitive matching each unresolved edge into or out of
    /// `id` and mark it resolved. Returns the number of primitives installed.
    pub fn configure_synchronization_primitives(&mut self, id: CommandBufferId) -> usize {
        let mut installed = 0;
        for edge in self
            .edges
            .iter_mut()
            .filter(|e| (e.source == id || e.target == id) && e.requires_sync && !e.resolved)
        {
            edge.primitive = Some(edge.kind.primitive());
            edge.resolved = true;
            installed += 1;
        }
        installed
    }

    /// Barrier needed in front of `id` given whether the device can execute a
    /// MEMORY_BARRIER command itself.
    pub fn setup_memory_barriers(&self, id: CommandBufferId, device_barrier: bool) -> BarrierMode {
        let needed = self.edges.iter().filter(|e| e.target == id).any(|e| {
            self.infos
                .get(&e.subject)
                .is_some_and(|info| info.requires_memory_barrier)
        });
        if !needed {
            BarrierMode::None
        } else if device_barrier {
            BarrierMode::Device
        } else {
            tracing::debug!(
                buffer_id = id.raw(),
                "device lacks memory barriers; using software barrier"
            );
            BarrierMode::Software
        }
    }

    /// Forget `id` and every edge touching it.
    pub fn remove_buffer(&mut self, id: CommandBufferId) {
        self.nodes.retain(|n| n.id != id);
        self.edges.retain(|e| e.source != id && e.target != id);
        self.infos.remove(&HazardSubject::Implicit(id));
        self.infos.retain(|_, info| {
            info.dependent_ids.retain(|&d| d != id);
            !info.dependent_ids.is_empty()
        });
    }

    /// Start a fresh recording cycle for a reused buffer.
    pub fn reset_buffer(
        &mut self,
        id: CommandBufferId,
        queue_id: u32,
        priority: Priority,
    ) -> HazardReport {
        self.remove_buffer(id);
        self.register_buffer(id, queue_id, priority)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn incoming(&self, id: CommandBufferId) -> impl Iterator<Item = &DependencyEdge> + '_ {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn has_dependencies(&self, id: CommandBufferId) -> bool {
        self.incoming(id).next().is_some()
    }

    pub fn dependency_info(&self, subject: HazardSubject) -> Option<&ResourceDependencyInfo> {
        self.infos.get(&subject)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: CommandBufferId) -> Option<&BufferNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: CommandBufferId) -> Option<&mut BufferNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_pool::{BufferId, ResourceId};

    fn cb(raw: u32) -> CommandBufferId {
        ResourceId::from_raw(raw).unwrap()
    }

    fn buf(raw: u32) -> MemoryResource {
        MemoryResource::Buffer(BufferId::from_raw(raw).unwrap())
    }

    #[test]
    fn same_queue_same_priority_is_write_after_write() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::from_queue_id(5));
        let report = g.register_buffer(cb(2), 5, Priority::from_queue_id(5));
        assert_eq!(report.added, 1);
        let edge = &g.edges()[0];
        assert_eq!((edge.source, edge.target), (cb(1), cb(2)));
        assert_eq!(edge.kind, HazardKind::WriteAfterWrite);
        assert!(edge.requires_sync && !edge.resolved);
    }

    #[test]
    fn heuristic_kinds_follow_priority_order() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 0, Priority::Critical);
        g.register_buffer(cb(2), 2, Priority::High);
        // Critical -> High: earlier, higher priority producer.
        assert_eq!(g.edges()[0].kind, HazardKind::ReadAfterWrite);

        g.register_buffer(cb(3), 9, Priority::Background);
        // Background is two bands below High and shares no queue: no edge.
        assert!(g.incoming(cb(3)).next().is_none());

        g.register_buffer(cb(4), 4, Priority::Normal);
        let kinds: Vec<_> = g.incoming(cb(4)).map(|e| (e.source, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (cb(2), HazardKind::ReadAfterWrite),
                (cb(3), HazardKind::WriteAfterRead)
            ]
        );
    }

    #[test]
    fn dependents_are_capped() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, 2);
        let mut dropped = 0;
        for raw in 1..=4 {
            dropped += g.register_buffer(cb(raw), 5, Priority::Normal).dropped;
        }
        assert!(g.edges().iter().filter(|e| e.source == cb(1)).count() <= 2);
        assert!(dropped > 0);
    }

    #[test]
    fn primitives_match_kinds() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::Normal);
        g.register_buffer(cb(2), 5, Priority::Normal);
        assert_eq!(g.configure_synchronization_primitives(cb(2)), 1);
        assert_eq!(g.edges()[0].primitive, Some(SyncPrimitive::WriteBarrier));
        assert!(g.edges()[0].resolved);
        assert_eq!(g.configure_synchronization_primitives(cb(2)), 0);
    }

    #[test]
    fn primitives_are_installed_per_committed_buffer() {
        let mut g = DependencyGraph::new(HazardPolicy::ResourceAccess, MAX_DEPENDENTS);
        for raw in 1..=4 {
            g.register_buffer(cb(raw), 5, Priority::Normal);
        }
        g.declare_access(cb(1), buf(1), AccessFlags::WRITE).unwrap();
        g.declare_access(cb(2), buf(1), AccessFlags::READ).unwrap();
        g.declare_access(cb(3), buf(2), AccessFlags::WRITE).unwrap();
        g.declare_access(cb(4), buf(2), AccessFlags::WRITE).unwrap();
        for raw in 1..=4 {
            g.analyze_commit(cb(raw));
        }
        assert_eq!(g.edges().len(), 2);

        assert_eq!(g.configure_synchronization_primitives(cb(2)), 1);
        let resolved: Vec<_> = g
            .edges()
            .iter()
            .map(|e| (e.target, e.resolved))
            .collect();
        assert_eq!(resolved, vec![(cb(2), true), (cb(4), false)]);

        assert_eq!(g.configure_synchronization_primitives(cb(3)), 1);
        assert!(g.edges().iter().all(|e| e.resolved));
    }

    #[test]
    fn memory_barrier_falls_back_to_software() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::Normal);
        g.register_buffer(cb(2), 5, Priority::Normal);
        assert_eq!(g.setup_memory_barriers(cb(1), true), BarrierMode::None);
        assert_eq!(g.setup_memory_barriers(cb(2), true), BarrierMode::Device);
        assert_eq!(g.setup_memory_barriers(cb(2), false), BarrierMode::Software);
    }

    #[test]
    fn resource_access_policy_uses_real_intersection() {
        let mut g = DependencyGraph::new(HazardPolicy::ResourceAccess, MAX_DEPENDENTS);
        for raw in 1..=3 {
            assert_eq!(g.register_buffer(cb(raw), 5, Priority::Normal).added, 0);
        }
        g.declare_access(cb(1), buf(10), AccessFlags::WRITE).unwrap();
        g.declare_access(cb(2), buf(10), AccessFlags::READ).unwrap();
        g.declare_access(cb(3), buf(11), AccessFlags::READ).unwrap();

        g.analyze_commit(cb(1));
        assert_eq!(g.analyze_commit(cb(2)).added, 1);
        assert_eq!(g.analyze_commit(cb(3)).added, 0);

        let edge = &g.edges()[0];
        assert_eq!(edge.kind, HazardKind::ReadAfterWrite);
        assert_eq!(edge.subject, HazardSubject::Resource(buf(10)));
        let info = g.dependency_info(edge.subject).unwrap();
        assert_eq!(info.dependent_ids, vec![cb(2)]);
        assert!(info.requires_memory_barrier);
    }

    #[test]
    fn write_after_read_needs_no_memory_barrier() {
        let mut g = DependencyGraph::new(HazardPolicy::ResourceAccess, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::Normal);
        g.register_buffer(cb(2), 5, Priority::Normal);
        g.declare_access(cb(1), buf(1), AccessFlags::READ).unwrap();
        g.declare_access(cb(2), buf(1), AccessFlags::WRITE).unwrap();
        g.analyze_commit(cb(1));
        g.analyze_commit(cb(2));
        assert_eq!(g.edges()[0].kind, HazardKind::WriteAfterRead);
        assert_eq!(g.setup_memory_barriers(cb(2), true), BarrierMode::None);
    }

    #[test]
    fn access_set_is_frozen_after_commit() {
        let mut g = DependencyGraph::new(HazardPolicy::ResourceAccess, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::Normal);
        g.analyze_commit(cb(1));
        assert!(g.declare_access(cb(1), buf(1), AccessFlags::READ).is_err());
        assert!(matches!(
            g.declare_access(cb(9), buf(1), AccessFlags::READ),
            Err(VgpuError::NotFound { .. })
        ));
    }

    #[test]
    fn removing_a_buffer_clears_its_edges() {
        let mut g = DependencyGraph::new(HazardPolicy::PriorityHeuristic, MAX_DEPENDENTS);
        g.register_buffer(cb(1), 5, Priority::Normal);
        g.register_buffer(cb(2), 5, Priority::Normal);
        g.remove_buffer(cb(1));
        assert!(g.edges().is_empty());
        assert!(g.dependency_info(HazardSubject::Implicit(cb(1))).is_none());
        assert_eq!(g.len(), 1);
    }
}
