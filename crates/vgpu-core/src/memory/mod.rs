//! Device memory: pools, per-resource allocations and host transfers.

mod manager;
mod pool;
mod transfer;

pub use manager::{Allocation, MemoryPoolManager, POOL_ADDRESS_BASE, POOL_ADDRESS_STRIDE};
pub use pool::{AccessPattern, GpuMemoryPool, MemoryPoolSpec};
pub use transfer::{
    GpuMemoryTransfer, TransferPipeline, TransferPriority, TransferRequest, TransferStats,
    TransferStatus,
};
