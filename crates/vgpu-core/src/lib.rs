//! Command submission and resource lifecycle for a virtual GPU.
//!
//! [`VgpuEngine`] ties together:
//!
//! - [`IdPool`]: recycled, typed resource ids.
//! - [`CommandPoolManager`]: command buffer pools, the buffer registry and
//!   the per-context [`SubmissionScheduler`].
//! - [`DependencyGraph`]: hazard detection between command buffers.
//! - [`MemoryPoolManager`]: bump-allocated device memory pools and host
//!   transfers.
//!
//! Command streams use the wire format from [`vgpu_protocol`].

#![forbid(unsafe_code)]

mod error;

pub mod bounded_table;
pub mod command_buffer;
pub mod command_pool;
pub mod config;
pub mod dependency;
pub mod device;
pub mod engine;
pub mod id_pool;
pub mod memory;
pub mod pacing;
pub mod scheduler;
pub mod stats;

pub use command_buffer::{CommandBufferRecord, CommandBufferState, Priority};
pub use command_pool::{
    CommandBufferPool, CommandPoolManager, CommandPoolSpec, Completion, CreatedBuffer,
    PendingSubmission, PoolClass,
};
pub use config::{
    CommandPoolConfig, ConfigError, DependencyConfig, EngineConfig, FramePacingConfig,
    IdPoolConfig, MemoryConfig,
};
pub use dependency::{
    AccessFlags, BarrierMode, DependencyEdge, DependencyGraph, HazardKind, HazardPolicy,
    HazardReport, HazardSubject, ResourceDependencyInfo, SyncPrimitive, MAX_DEPENDENTS,
};
pub use device::{
    DeviceError, DeviceSubmission, MappedRegion, NullDevice, RecordingDevice, VirtualDevice,
};
pub use engine::{ExecuteStatus, FrameReport, VgpuEngine};
pub use error::{Result, VgpuError};
pub use id_pool::{
    BufferId, BufferTag, CommandBufferId, CommandBufferTag, IdPool, IdPoolStats, IdTag,
    MemoryResource, OverflowPolicy, ResourceId, TextureId, TextureTag, TransferId, TransferTag,
    TEXTURE_HANDLE_BIT,
};
pub use memory::{
    AccessPattern, Allocation, GpuMemoryPool, MemoryPoolManager, MemoryPoolSpec,
    TransferPriority, TransferStats, TransferStatus,
};
pub use pacing::FramePacer;
pub use scheduler::{QueueLevel, Scheduled, SubmissionScheduler};
pub use stats::{EngineStats, EngineStatsSnapshot};
