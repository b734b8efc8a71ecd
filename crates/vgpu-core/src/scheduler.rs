//! Priority submission queues.
//!
//! The queues are passive: nothing drains them until a scheduling pass runs.
//! Draining visits High, then Normal, then Low; each level is FIFO. A drained
//! batch is then reordered so that no buffer is submitted ahead of a buffer it
//! depends on.

use std::collections::VecDeque;

use crate::id_pool::CommandBufferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueLevel {
    High,
    Normal,
    Low,
}

impl QueueLevel {
    pub const ALL: [QueueLevel; 3] = [QueueLevel::High, QueueLevel::Normal, QueueLevel::Low];

    fn index(self) -> usize {
        match self {
            QueueLevel::High => 0,
            QueueLevel::Normal => 1,
            QueueLevel::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub id: CommandBufferId,
    pub context_id: u32,
    pub level: QueueLevel,
}

#[derive(Debug, Default)]
pub struct SubmissionScheduler {
    queues: [VecDeque<Scheduled>; 3],
}

impl SubmissionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, id: CommandBufferId, context_id: u32, level: QueueLevel) {
        self.queues[level.index()].push_back(Scheduled {
            id,
            context_id,
            level,
        });
    }

    /// Remove every entry for `context_id` in submission order, leaving other
    /// contexts' entries queued in their original order.
    pub fn drain_context(&mut self, context_id: u32) -> Vec<Scheduled> {
        let mut out = Vec::new();
        for queue in &mut self.queues {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.context_id == context_id {
                    out.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        out
    }

    /// Order a drained batch so every entry follows its sources, keeping
    /// priority order otherwise. Entries with a source still queued here (in
    /// another context), and anything that transitively waits on them, are
    /// returned in the second list to be requeued.
    pub fn order_by_dependencies<F, I>(
        &self,
        entries: Vec<Scheduled>,
        sources: F,
    ) -> (Vec<Scheduled>, Vec<Scheduled>)
    where
        F: Fn(CommandBufferId) -> I,
        I: IntoIterator<Item = CommandBufferId>,
    {
        let mut pending = entries;
        let mut ordered = Vec::with_capacity(pending.len());
        let mut held: Vec<Scheduled> = Vec::new();

        while !pending.is_empty() {
            let mut pick = None;
            for (i, entry) in pending.iter().enumerate() {
                let mut blocked = false;
                let mut waiting = false;
                for source in sources(entry.id) {
                    if source == entry.id {
                        continue;
                    }
                    if self.contains(source) || held.iter().any(|h| h.id == source) {
                        blocked = true;
                        break;
                    }
                    if pending.iter().any(|p| p.id == source) {
                        waiting = true;
                    }
                }
                if blocked || !waiting {
                    pick = Some((i, blocked));
                    break;
                }
            }
            match pick {
                Some((i, true)) => held.push(pending.remove(i)),
                Some((i, false)) => ordered.push(pending.remove(i)),
                None => {
                    tracing::warn!(
                        remaining = pending.len(),
                        "dependency cycle in drained batch; keeping priority order"
                    );
                    ordered.append(&mut pending);
                }
            }
        }
        (ordered, held)
    }

    pub fn contains(&self, id: CommandBufferId) -> bool {
        self.queues.iter().flatten().any(|e| e.id == id)
    }

    /// Put entries back at the head of their levels, preserving their order.
    pub fn requeue_front(&mut self, entries: &[Scheduled]) {
        for entry in entries.iter().rev() {
            self.queues[entry.level.index()].push_front(*entry);
        }
    }

    pub fn remove(&mut self, id: CommandBufferId) -> bool {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|e| e.id == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Contexts with queued work, in first-seen order across levels.
    pub fn pending_contexts(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for entry in self.queues.iter().flatten() {
            if !out.contains(&entry.context_id) {
                out.push(entry.context_id);
            }
        }
        out
    }

    pub fn level_len(&self, level: QueueLevel) -> usize {
        self.queues[level.index()].len()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
