//! Fixed-capacity keyed table with a pluggable eviction policy.
//!
//! Entries live in a slot arena with a free list; a hash index maps keys to
//! slots. When the table is full, inserting a new key asks the
//! [`EvictionPolicy`] for a victim and returns the evicted entry to the caller.
//! A policy may decline every candidate, in which case the insert is refused.

use std::collections::HashMap;
use std::hash::Hash;

/// View of an occupied slot handed to an [`EvictionPolicy`].
pub struct EntryRef<'a, V> {
    pub slot: usize,
    /// Monotonic insertion sequence number.
    pub inserted: u64,
    pub value: &'a V,
}

pub trait EvictionPolicy<V> {
    fn victim<'a, I>(&self, entries: I) -> Option<usize>
    where
        V: 'a,
        I: Iterator<Item = EntryRef<'a, V>>;
}

/// Values that expose an age for [`OldestFirst`]. Smaller is older.
pub trait AgeKey {
    fn age_key(&self) -> u64;

    /// Pinned values are never chosen as victims.
    fn pinned(&self) -> bool {
        false
    }
}

/// Evict the unpinned entry with the smallest [`AgeKey`]; ties go to the
/// earliest insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFirst;

impl<V: AgeKey> EvictionPolicy<V> for OldestFirst {
    fn victim<'a, I>(&self, entries: I) -> Option<usize>
    where
        V: 'a,
        I: Iterator<Item = EntryRef<'a, V>>,
    {
        entries
            .filter(|e| !e.value.pinned())
            .min_by_key(|e| (e.value.age_key(), e.inserted))
            .map(|e| e.slot)
    }
}

/// Evict in insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl<V> EvictionPolicy<V> for Fifo {
    fn victim<'a, I>(&self, entries: I) -> Option<usize>
    where
        V: 'a,
        I: Iterator<Item = EntryRef<'a, V>>,
    {
        entries.min_by_key(|e| e.inserted).map(|e| e.slot)
    }
}

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    inserted: u64,
}

#[derive(Debug)]
pub struct BoundedTable<K, V, P> {
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    policy: P,
    seq: u64,
}

impl<K, V, P> BoundedTable<K, V, P>
where
    K: Copy + Eq + Hash,
    P: EvictionPolicy<V>,
{
    pub fn new(capacity: usize, policy: P) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            // Pop from the back so slot 0 is used first.
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
            policy,
            seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Whether a new key would fit, possibly by evicting another entry.
    pub fn has_room(&self) -> bool {
        !self.is_full() || self.victim().is_some()
    }

    pub fn can_insert(&self, key: &K) -> bool {
        self.index.contains_key(key) || self.has_room()
    }

    fn victim(&self) -> Option<usize> {
        self.policy
            .victim(self.slots.iter().enumerate().filter_map(|(slot, s)| {
                s.as_ref().map(|s| EntryRef {
                    slot,
                    inserted: s.inserted,
                    value: &s.value,
                })
            }))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|s| &s.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_mut().map(|s| &mut s.value)
    }

    /// Insert or replace `key`. If a new key does not fit, the policy's victim
    /// is removed and returned. A zero-capacity table stores nothing and hands
    /// the entry straight back.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(s) = self.slots[slot].as_mut() {
                s.value = value;
            }
            return None;
        }

        let mut evicted = None;
        if self.free.is_empty() {
            let Some(victim) = self.victim() else {
                return Some((key, value));
            };
            evicted = self.take_slot(victim);
        }

        let Some(slot) = self.free.pop() else {
            return Some((key, value));
        };
        self.seq += 1;
        self.slots[slot] = Some(Slot {
            key,
            value,
            inserted: self.seq,
        });
        self.index.insert(key, slot);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.take_slot(slot).map(|(_, v)| v)
    }

    fn take_slot(&mut self, slot: usize) -> Option<(K, V)> {
        let s = self.slots[slot].take()?;
        self.index.remove(&s.key);
        self.free.push(slot);
        Some((s.key, s.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|s| (s.key, &s.value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut().map(|s| (s.key, &mut s.value)))
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }
}
