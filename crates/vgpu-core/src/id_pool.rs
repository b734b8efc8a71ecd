//! Handle allocation with LIFO recycling.
//!
//! Every resource namespace (buffers, textures, command buffers, transfers)
//! uses the same [`IdPool`], parameterized by a tag type so handles from
//! different namespaces cannot be mixed up at compile time.
//!
//! Allocation pops the most recently released handle if one is available,
//! otherwise it takes the next value of a monotonic counter. `0` is never
//! issued. Released handles go onto a bounded recycle stack; when the stack is
//! full the oldest quarter is dropped (FIFO) before the new handle is pushed.
//! Dropped handles are never reissued, which bounds memory at the cost of
//! namespace growth.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VgpuError};

/// Set in the wire handle of every texture. Buffer and texture ids stay below
/// it so the two kinds never share a handle on the wire.
pub const TEXTURE_HANDLE_BIT: u32 = 1 << 31;

/// Namespace marker for an [`IdPool`].
pub trait IdTag {
    const NAME: &'static str;
    /// Exclusive upper bound of issued ids.
    const LIMIT: u32;
}

macro_rules! id_tags {
    ($($ty:ident => $name:literal, below $limit:expr;)*) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $ty {}

            impl IdTag for $ty {
                const NAME: &'static str = $name;
                const LIMIT: u32 = $limit;
            }
        )*
    };
}

id_tags! {
    BufferTag => "buffer", below TEXTURE_HANDLE_BIT;
    TextureTag => "texture", below TEXTURE_HANDLE_BIT;
    CommandBufferTag => "command-buffer", below u32::MAX;
    TransferTag => "memory-transfer", below u32::MAX;
}

/// Opaque non-zero handle in namespace `T`.
pub struct ResourceId<T> {
    raw: u32,
    _tag: PhantomData<fn() -> T>,
}

impl<T> ResourceId<T> {
    /// Wrap a raw value received from a caller. Returns `None` for `0`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self {
            raw,
            _tag: PhantomData,
        })
    }

    pub fn raw(self) -> u32 {
        self.raw
    }
}

impl<T> Clone for ResourceId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceId<T> {}

impl<T> PartialEq for ResourceId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for ResourceId<T> {}

impl<T> PartialOrd for ResourceId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ResourceId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> std::hash::Hash for ResourceId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: IdTag> fmt::Debug for ResourceId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", T::NAME, self.raw)
    }
}

impl<T: IdTag> fmt::Display for ResourceId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

pub type CommandBufferId = ResourceId<CommandBufferTag>;
pub type TransferId = ResourceId<TransferTag>;
pub type BufferId = ResourceId<BufferTag>;
pub type TextureId = ResourceId<TextureTag>;

/// A device-memory-backed resource: the closed set of handle kinds that can own
/// an allocation or appear in a buffer's access set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryResource {
    Buffer(BufferId),
    Texture(TextureId),
}

impl MemoryResource {
    pub fn raw(self) -> u32 {
        match self {
            Self::Buffer(id) => id.raw(),
            Self::Texture(id) => id.raw(),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::Buffer(_) => BufferTag::NAME,
            Self::Texture(_) => TextureTag::NAME,
        }
    }

    /// Handle carried by wire commands. Textures have [`TEXTURE_HANDLE_BIT`]
    /// set.
    pub fn wire_handle(self) -> u32 {
        match self {
            Self::Buffer(id) => id.raw(),
            Self::Texture(id) => id.raw() | TEXTURE_HANDLE_BIT,
        }
    }

    /// Namespace-qualified key, unique across kinds.
    pub fn key(self) -> u64 {
        let ns = match self {
            Self::Buffer(_) => 0u64,
            Self::Texture(_) => 1u64,
        };
        (ns << 32) | u64::from(self.raw())
    }
}

impl From<BufferId> for MemoryResource {
    fn from(id: BufferId) -> Self {
        Self::Buffer(id)
    }
}

impl From<TextureId> for MemoryResource {
    fn from(id: TextureId) -> Self {
        Self::Texture(id)
    }
}

impl fmt::Display for MemoryResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.raw())
    }
}

/// What to do when a release finds the recycle stack full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest quarter of the stack, then push.
    EvictOldestQuarter,
    /// Keep the stack as is and drop the released handle.
    DropReleased,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdPoolStats {
    pub allocated: u64,
    pub recycled: u64,
    pub released: u64,
    pub evicted: u64,
}

pub struct IdPool<T> {
    next: u32,
    /// Oldest at the front, most recently released at the back.
    recycle: VecDeque<u32>,
    capacity: usize,
    policy: OverflowPolicy,
    stats: IdPoolStats,
    _tag: PhantomData<fn() -> T>,
}

impl<T: IdTag> IdPool<T> {
    pub fn new(recycle_capacity: usize) -> Self {
        Self::with_policy(recycle_capacity, OverflowPolicy::EvictOldestQuarter)
    }

    pub fn with_policy(recycle_capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            next: 1,
            recycle: VecDeque::with_capacity(recycle_capacity),
            capacity: recycle_capacity,
            policy,
            stats: IdPoolStats::default(),
            _tag: PhantomData,
        }
    }

    pub fn allocate(&mut self) -> Result<ResourceId<T>> {
        let raw = match self.recycle.pop_back() {
            Some(raw) => {
                self.stats.recycled += 1;
                raw
            }
            None => {
                if self.next >= T::LIMIT {
                    return Err(VgpuError::no_resources(format!(
                        "{} id space exhausted",
                        T::NAME
                    )));
                }
                let raw = self.next;
                self.next += 1;
                raw
            }
        };
        self.stats.allocated += 1;
        Ok(ResourceId {
            raw,
            _tag: PhantomData,
        })
    }

    pub fn release(&mut self, id: ResourceId<T>) -> Result<()> {
        let raw = id.raw;
        if raw == 0 || raw >= self.next {
            return Err(VgpuError::bad_argument(format!(
                "{} id {raw} was never issued",
                T::NAME
            )));
        }
        // Linear scan; the stack is small and bounded.
        if self.recycle.contains(&raw) {
            return Err(VgpuError::bad_argument(format!(
                "{} id {raw} released twice",
                T::NAME
            )));
        }
        if self.capacity == 0 {
            return Ok(());
        }

        if self.recycle.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::EvictOldestQuarter => {
                    let evict = (self.capacity / 4).max(1);
                    self.recycle.drain(..evict);
                    self.stats.evicted += evict as u64;
                    tracing::trace!(namespace = T::NAME, evict, "recycle stack overflow");
                }
                OverflowPolicy::DropReleased => {
                    self.stats.evicted += 1;
                    self.stats.released += 1;
                    return Ok(());
                }
            }
        }
        self.recycle.push_back(raw);
        self.stats.released += 1;
        Ok(())
    }

    pub fn recycle_len(&self) -> usize {
        self.recycle.len()
    }

    pub fn recycle_capacity(&self) -> usize {
        self.capacity
    }

    /// Recycled handles, oldest first.
    pub fn recycled(&self) -> impl Iterator<Item = u32> + '_ {
        self.recycle.iter().copied()
    }

    /// Next value the monotonic counter would hand out.
    pub fn high_water_mark(&self) -> u32 {
        self.next
    }

    pub fn stats(&self) -> IdPoolStats {
        self.stats
    }
}

impl<T: IdTag> fmt::Debug for IdPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdPool")
            .field("namespace", &T::NAME)
            .field("next", &self.next)
            .field("recycled", &self.recycle.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_ids(pool: &mut IdPool<BufferTag>, n: usize) -> Vec<u32> {
        (0..n).map(|_| pool.allocate().unwrap().raw()).collect()
    }

    #[test]
    fn lifo_reuse_of_released_id() {
        let mut pool = IdPool::<BufferTag>::new(32);
        assert_eq!(raw_ids(&mut pool, 3), vec![1, 2, 3]);
        pool.release(ResourceId::from_raw(2).unwrap()).unwrap();
        assert_eq!(pool.allocate().unwrap().raw(), 2);
        assert_eq!(pool.allocate().unwrap().raw(), 4);
    }

    #[test]
    fn most_recent_release_is_reused_first() {
        let mut pool = IdPool::<BufferTag>::new(32);
        raw_ids(&mut pool, 4);
        for raw in [1, 3, 2] {
            pool.release(ResourceId::from_raw(raw).unwrap()).unwrap();
        }
        assert_eq!(raw_ids(&mut pool, 3), vec![2, 3, 1]);
    }

    #[test]
    fn zero_is_never_a_valid_id() {
        assert!(ResourceId::<BufferTag>::from_raw(0).is_none());
        let mut pool = IdPool::<BufferTag>::new(4);
        assert!(raw_ids(&mut pool, 16).iter().all(|&id| id != 0));
    }

    #[test]
    fn release_rejects_unissued_and_duplicate_ids() {
        let mut pool = IdPool::<BufferTag>::new(8);
        let a = pool.allocate().unwrap();
        let unissued = ResourceId::from_raw(5).unwrap();
        assert!(matches!(pool.release(unissued), Err(VgpuError::BadArgument(_))));

        pool.release(a).unwrap();
        assert!(matches!(pool.release(a), Err(VgpuError::BadArgument(_))));
        assert_eq!(pool.recycle_len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_quarter() {
        let mut pool = IdPool::<BufferTag>::new(8);
        let ids = raw_ids(&mut pool, 9);
        for &raw in &ids {
            pool.release(ResourceId::from_raw(raw).unwrap()).unwrap();
        }
        // Releasing the 9th evicted ids 1 and 2.
        assert_eq!(pool.recycle_len(), 7);
        assert_eq!(pool.recycled().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(pool.stats().evicted, 2);
    }

    #[test]
    fn drop_released_policy_keeps_existing_stack() {
        let mut pool = IdPool::<BufferTag>::with_policy(2, OverflowPolicy::DropReleased);
        let ids = raw_ids(&mut pool, 3);
        for &raw in &ids {
            pool.release(ResourceId::from_raw(raw).unwrap()).unwrap();
        }
        assert_eq!(pool.recycled().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn memory_resource_keys_do_not_collide_across_kinds() {
        let b = MemoryResource::from(BufferId::from_raw(3).unwrap());
        let t = MemoryResource::from(TextureId::from_raw(3).unwrap());
        assert_eq!(b.raw(), t.raw());
        assert_ne!(b.key(), t.key());
        assert_eq!(t.to_string(), "texture#3");
    }

    #[test]
    fn wire_handles_are_distinct_across_kinds() {
        let b = MemoryResource::from(BufferId::from_raw(1).unwrap());
        let t = MemoryResource::from(TextureId::from_raw(1).unwrap());
        assert_eq!(b.wire_handle(), 1);
        assert_eq!(t.wire_handle(), 0x8000_0001);
        assert_eq!(BufferTag::LIMIT, TEXTURE_HANDLE_BIT);
    }

    #[test]
    fn debug_includes_namespace() {
        let id = ResourceId::<CommandBufferTag>::from_raw(7).unwrap();
        assert_eq!(format!("{id:?}"), "command-buffer#7");
    }
}
