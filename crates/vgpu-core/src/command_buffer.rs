//! Command buffer records and their lifecycle.
//!
//! ```text
//! Created -> Recording -> Committed -> Executed -> Reusable -> Recording ...
//!    \           \                        \           \
//!     `-----------`-----> Destroyed <------`-----------'
//! ```
//!
//! Committed buffers cannot be cancelled; only `Created`/`Recording` buffers may
//! be discarded.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bounded_table::AgeKey;
use crate::dependency::BarrierMode;
use crate::error::{Result, VgpuError};
use crate::id_pool::CommandBufferId;
use crate::scheduler::QueueLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Priority band for a queue id: low ids are latency sensitive.
    pub fn from_queue_id(queue_id: u32) -> Self {
        match queue_id {
            0..=1 => Self::Critical,
            2..=3 => Self::High,
            4..=7 => Self::Normal,
            _ => Self::Background,
        }
    }

    pub fn queue_level(self) -> QueueLevel {
        match self {
            Self::Critical | Self::High => QueueLevel::High,
            Self::Normal => QueueLevel::Normal,
            Self::Background => QueueLevel::Low,
        }
    }

    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Created,
    Recording,
    Committed,
    Executed,
    Reusable,
    Destroyed,
}

impl CommandBufferState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use CommandBufferState::*;
        matches!(
            (self, next),
            (Created, Recording)
                | (Recording, Committed)
                | (Committed, Executed)
                | (Executed, Reusable)
                | (Reusable, Recording)
                | (Created | Recording | Executed | Reusable, Destroyed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CommandBufferRecord {
    pub id: CommandBufferId,
    pub queue_id: u32,
    pub context_id: u32,
    pub priority: Priority,
    /// Index of the owning sub-pool.
    pub pool_index: usize,
    pub state: CommandBufferState,
    pub command_count: u32,
    pub created_at: Instant,
    pub recording_started_at: Option<Instant>,
    pub committed_at: Option<Instant>,
    pub executed_at: Option<Instant>,
    pub is_reusable: bool,
    pub has_dependencies: bool,
    /// Accepted by the device but not yet observed complete.
    pub is_submitted: bool,
    pub barrier: BarrierMode,
    pub debug_label: Option<String>,
    pub(crate) stream: Vec<u8>,
    created_tick: u64,
    committed_tick: Option<u64>,
}

impl CommandBufferRecord {
    pub(crate) fn new(
        id: CommandBufferId,
        queue_id: u32,
        context_id: u32,
        pool_index: usize,
        tick: u64,
        debug_label: Option<String>,
    ) -> Self {
        Self {
            id,
            queue_id,
            context_id,
            priority: Priority::from_queue_id(queue_id),
            pool_index,
            state: CommandBufferState::Created,
            command_count: 0,
            created_at: Instant::now(),
            recording_started_at: None,
            committed_at: None,
            executed_at: None,
            is_reusable: false,
            has_dependencies: false,
            is_submitted: false,
            barrier: BarrierMode::None,
            debug_label,
            stream: Vec::new(),
            created_tick: tick,
            committed_tick: None,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.executed_at.is_some()
    }

    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    pub(crate) fn transition(&mut self, next: CommandBufferState, tick: u64) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VgpuError::bad_argument(format!(
                "command buffer {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        let now = Instant::now();
        match next {
            CommandBufferState::Recording => {
                if self.state == CommandBufferState::Reusable {
                    self.stream.clear();
                    self.command_count = 0;
                    self.committed_at = None;
                    self.committed_tick = None;
                    self.executed_at = None;
                    self.barrier = BarrierMode::None;
                }
                self.recording_started_at = Some(now);
            }
            CommandBufferState::Committed => {
                self.committed_at = Some(now);
                self.committed_tick = Some(tick);
            }
            CommandBufferState::Executed => {
                self.executed_at = Some(now);
                self.is_submitted = false;
            }
            CommandBufferState::Created
            | CommandBufferState::Reusable
            | CommandBufferState::Destroyed => {}
        }
        self.state = next;
        Ok(())
    }
}

impl AgeKey for CommandBufferRecord {
    /// Recording-end time once committed, creation time before that.
    fn age_key(&self) -> u64 {
        self.committed_tick.unwrap_or(self.created_tick)
    }

    /// Committed work must reach the device and complete before its id can
    /// be reclaimed.
    fn pinned(&self) -> bool {
        self.state == CommandBufferState::Committed || self.is_submitted
    }
}
