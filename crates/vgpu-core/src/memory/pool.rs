use std::fmt;

use serde::{Deserialize, Serialize};

/// Round `value` up to a power-of-two `alignment`. `None` if the result does
/// not fit in a `u64`.
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    /// Small, hot, host-and-device shared data.
    Frequent,
    Mixed,
    /// Sampled textures and other read-mostly data.
    ReadMostly,
    /// Written once per frame by the host.
    Streaming,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPoolSpec {
    pub name: String,
    pub size: u64,
    /// Growth limit; `None` means the global expansion ceiling.
    #[serde(default)]
    pub max_size: Option<u64>,
    pub is_coherent: bool,
    pub supports_dma: bool,
    pub access_pattern: AccessPattern,
}

impl MemoryPoolSpec {
    pub fn new(name: impl Into<String>, size: u64, access_pattern: AccessPattern) -> Self {
        Self {
            name: name.into(),
            size,
            max_size: None,
            is_coherent: false,
            supports_dma: true,
            access_pattern,
        }
    }

    pub fn coherent(mut self, is_coherent: bool) -> Self {
        self.is_coherent = is_coherent;
        self
    }

    pub fn dma(mut self, supports_dma: bool) -> Self {
        self.supports_dma = supports_dma;
        self
    }

    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// One device memory region with a bump allocator.
///
/// Frees only adjust counters. Space behind the cursor is reclaimed when the
/// last live allocation goes away; until then it counts as fragmentation.
#[derive(Clone, PartialEq)]
pub struct GpuMemoryPool {
    pub pool_id: u32,
    pub name: String,
    pub base_address: u64,
    size: u64,
    max_size: u64,
    cursor: u64,
    allocated: u64,
    available: u64,
    freed_behind_cursor: u64,
    live_allocations: u32,
    total_allocations: u64,
    pub is_coherent: bool,
    pub supports_dma: bool,
    pub access_pattern: AccessPattern,
}

impl GpuMemoryPool {
    pub fn new(pool_id: u32, base_address: u64, spec: &MemoryPoolSpec, ceiling: u64) -> Self {
        let max_size = spec.max_size.unwrap_or(ceiling).min(ceiling).max(spec.size);
        Self {
            pool_id,
            name: spec.name.clone(),
            base_address,
            size: spec.size,
            max_size,
            cursor: 0,
            allocated: 0,
            available: spec.size,
            freed_behind_cursor: 0,
            live_allocations: 0,
            total_allocations: 0,
            is_coherent: spec.is_coherent,
            supports_dma: spec.supports_dma,
            access_pattern: spec.access_pattern,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn live_allocations(&self) -> u32 {
        self.live_allocations
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    /// Bytes that can still be bump-allocated.
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.cursor)
    }

    pub fn free_ratio(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.available as f64 / self.size as f64
    }

    /// Freed bytes stranded behind the cursor, as a share of the pool.
    pub fn fragmentation_level(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.freed_behind_cursor as f64 / self.size as f64
    }

    pub fn fits(&self, aligned_size: u64) -> bool {
        aligned_size <= self.remaining()
    }

    /// Carve `aligned_size` bytes off the cursor. Returns the pool offset.
    pub(crate) fn bump(&mut self, aligned_size: u64) -> Option<u64> {
        if !self.fits(aligned_size) {
            return None;
        }
        let offset = self.cursor;
        self.cursor += aligned_size;
        self.allocated += aligned_size;
        self.available = self.size - self.allocated;
        self.live_allocations += 1;
        self.total_allocations += 1;
        Some(offset)
    }

    pub(crate) fn release(&mut self, aligned_size: u64) {
        self.allocated = self.allocated.saturating_sub(aligned_size);
        self.available = self.size - self.allocated;
        self.live_allocations = self.live_allocations.saturating_sub(1);
        self.freed_behind_cursor += aligned_size;
        if self.live_allocations == 0 {
            self.cursor = 0;
            self.freed_behind_cursor = 0;
        }
    }

    /// Grow by `max(1.5 * requested, size / 4)`, clamped to `max_size`.
    /// Returns `false` if the pool is already at its limit.
    pub(crate) fn expand(&mut self, requested: u64) -> bool {
        if self.size >= self.max_size {
            return false;
        }
        let grow = requested
            .saturating_add(requested / 2)
            .max(self.size / 4);
        self.size = self.size.saturating_add(grow).min(self.max_size);
        self.available = self.size - self.allocated;
        true
    }
}

impl fmt::Debug for GpuMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMemoryPool")
            .field("name", &self.name)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .field("allocated", &self.allocated)
            .field("live_allocations", &self.live_allocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn pool(size: u64, max: u64) -> GpuMemoryPool {
        let spec = MemoryPoolSpec::new("test", size, AccessPattern::Mixed).max_size(max);
        GpuMemoryPool::new(0, 0x1_0000_0000, &spec, 1024 * MIB)
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(257, 1), Some(257));
        assert_eq!(align_up(u64::MAX - 255, 256), Some(u64::MAX - 255));
        assert_eq!(align_up(u64::MAX - 254, 256), None);
    }

    #[test]
    fn allocated_plus_available_is_size() {
        let mut p = pool(MIB, MIB);
        let a = p.bump(4096).unwrap();
        let b = p.bump(512).unwrap();
        assert_eq!((a, b), (0, 4096));
        assert_eq!(p.allocated() + p.available(), p.size());
        p.release(4096);
        assert_eq!(p.allocated() + p.available(), p.size());
        assert!(p.fragmentation_level() > 0.0);
    }

    #[test]
    fn last_free_resets_cursor() {
        let mut p = pool(MIB, MIB);
        p.bump(4096).unwrap();
        p.bump(4096).unwrap();
        p.release(4096);
        assert_eq!(p.cursor(), 8192);
        p.release(4096);
        assert_eq!(p.cursor(), 0);
        assert_eq!(p.fragmentation_level(), 0.0);
    }

    #[test]
    fn expansion_uses_larger_of_request_and_quarter() {
        let mut p = pool(8 * MIB, 64 * MIB);
        assert!(p.expand(MIB));
        assert_eq!(p.size(), 10 * MIB);
        assert!(p.expand(4 * MIB));
        assert_eq!(p.size(), 16 * MIB);
        assert_eq!(p.allocated() + p.available(), p.size());
    }

    #[test]
    fn expansion_stops_at_limit() {
        let mut p = pool(8 * MIB, 8 * MIB);
        assert!(!p.expand(10 * MIB));
        assert_eq!(p.size(), 8 * MIB);

        let mut p = pool(8 * MIB, 9 * MIB);
        assert!(p.expand(10 * MIB));
        assert_eq!(p.size(), 9 * MIB);
        assert!(!p.fits(10 * MIB));
    }
}
