//! Open-addressed hash table keyed by [`Value`].
//!
//! Backs globals, module values, class members, instance fields, dict
//! storage, switch jump tables and the string intern pool. Linear probing
//! over a power-of-two capacity; a slot is empty when its key is `Empty`
//! and its value `Nil`, and a tombstone when the key is `Empty` and the
//! value `Bool(true)`. Tombstones count toward load so probe chains stay
//! bounded.
//!
//! Each live entry carries the key's hash. Value equality needs no heap
//! access (objects compare by identity, strings are interned), so every
//! operation except hashing the query key is heap-independent; the
//! `*_with_hash` layer lets callers that already hold a mutable heap
//! borrow precompute the hash first.

use crate::heap::Heap;
use crate::object::HeapData;
use crate::value::{hash_value, Value};

/// Grow when `(count + 1) * 7 > capacity * 6`.
const LOAD_NUM: usize = 6;
const LOAD_DEN: usize = 7;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
    hash: u64,
}

impl Entry {
    const EMPTY: Self = Self { key: Value::Empty, value: Value::Nil, hash: 0 };
    const TOMBSTONE: Self = Self { key: Value::Empty, value: Value::Bool(true), hash: 0 };

    fn is_empty(&self) -> bool {
        matches!(self.key, Value::Empty) && matches!(self.value, Value::Nil)
    }

    fn is_tombstone(&self) -> bool {
        matches!(self.key, Value::Empty) && matches!(self.value, Value::Bool(true))
    }
}

/// The table. Starts with no backing storage; the first insert allocates.
#[derive(Debug, Default)]
pub struct ValueTable {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives growth.
    count: usize,
    /// Live entries only.
    live: usize,
}

impl ValueTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Looks up a key, hashing it against `heap`.
    #[must_use]
    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        self.get_with_hash(key, hash_value(key, heap))
    }

    /// Looks up a key whose hash the caller already computed.
    #[must_use]
    pub fn get_with_hash(&self, key: Value, hash: u64) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        let slot = self.probe(key, hash)?;
        let entry = &self.entries[slot];
        if entry.is_empty() || entry.is_tombstone() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        self.set_with_hash(key, hash_value(key, heap), value)
    }

    /// Insert variant for callers that precomputed the hash.
    pub fn set_with_hash(&mut self, key: Value, hash: u64, value: Value) -> bool {
        if (self.count + 1) * LOAD_DEN > self.entries.len() * LOAD_NUM {
            self.grow();
        }
        let slot = self.probe(key, hash).expect("probe always finds a slot after growth");
        let entry = &mut self.entries[slot];
        let is_new = entry.is_empty() || entry.is_tombstone();
        if entry.is_empty() {
            // Reusing a tombstone does not raise the load count.
            self.count += 1;
        }
        if is_new {
            self.live += 1;
        }
        *entry = Entry { key, value, hash };
        is_new
    }

    /// Deletes a key, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        self.delete_with_hash(key, hash_value(key, heap))
    }

    pub fn delete_with_hash(&mut self, key: Value, hash: u64) -> bool {
        if self.live == 0 {
            return false;
        }
        let Some(slot) = self.probe(key, hash) else { return false };
        let entry = &mut self.entries[slot];
        if entry.is_empty() || entry.is_tombstone() {
            return false;
        }
        *entry = Entry::TOMBSTONE;
        self.live -= 1;
        true
    }

    /// Finds an interned string by content: the probe that makes the
    /// intern pool work. Compares bytes, not identity.
    #[must_use]
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u64) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return None;
            }
            if !entry.is_tombstone() && entry.hash == hash {
                if let Value::Obj(id) = entry.key {
                    if let HeapData::Str(s) = heap.get(id) {
                        if s.bytes() == bytes {
                            return Some(entry.key);
                        }
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes entries whose key or value is an unmarked heap object.
    ///
    /// Runs between the GC mark and sweep phases on the intern pool and
    /// module registry, so those tables keep nothing alive and never
    /// hold a handle past the sweep.
    pub fn remove_white(&mut self, heap: &Heap) {
        for entry in &mut self.entries {
            if entry.is_empty() || entry.is_tombstone() {
                continue;
            }
            let dead = |value: Value| matches!(value, Value::Obj(id) if !heap.is_marked(id));
            if dead(entry.key) || dead(entry.value) {
                *entry = Entry::TOMBSTONE;
                self.live -= 1;
            }
        }
    }

    /// Iterates live `(key, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_empty() && !e.is_tombstone())
            .map(|e| (e.key, e.value))
    }

    /// Copies every live entry of `other` into `self`.
    pub fn extend_from(&mut self, other: &Self) {
        for entry in &other.entries {
            if !entry.is_empty() && !entry.is_tombstone() {
                self.set_with_hash(entry.key, entry.hash, entry.value);
            }
        }
    }

    /// Finds the slot holding `key`, or the slot where it would go
    /// (preferring the first tombstone on the probe path). `None` only
    /// when the table has no storage.
    fn probe(&self, key: Value, hash: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return Some(tombstone.unwrap_or(index));
            }
            if entry.is_tombstone() {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_cap = (self.entries.len() * 2).max(8);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_cap]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if !entry.is_empty() && !entry.is_tombstone() {
                self.set_with_hash(entry.key, entry.hash, entry.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: f64) -> (Value, u64) {
        let heap = Heap::new();
        let v = Value::Number(n);
        (v, hash_value(v, &heap))
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut table = ValueTable::new();
        let (k, h) = key(1.0);
        assert!(table.set_with_hash(k, h, Value::Bool(true)));
        assert!(!table.set_with_hash(k, h, Value::Bool(false)));
        assert_eq!(table.get_with_hash(k, h), Some(Value::Bool(false)));
        assert_eq!(table.len(), 1);
        assert!(table.delete_with_hash(k, h));
        assert_eq!(table.get_with_hash(k, h), None);
        assert!(table.is_empty());
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut table = ValueTable::new();
        for i in 0..4 {
            let (k, h) = key(f64::from(i));
            table.set_with_hash(k, h, Value::Nil);
        }
        let (k1, h1) = key(1.0);
        table.delete_with_hash(k1, h1);
        let before = table.capacity();
        table.set_with_hash(k1, h1, Value::Bool(true));
        assert_eq!(table.capacity(), before);
        assert_eq!(table.get_with_hash(k1, h1), Some(Value::Bool(true)));
    }

    #[test]
    fn survives_growth() {
        let mut table = ValueTable::new();
        for i in 0..100 {
            let (k, h) = key(f64::from(i));
            table.set_with_hash(k, h, Value::Number(f64::from(i * 2)));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let (k, h) = key(f64::from(i));
            assert_eq!(table.get_with_hash(k, h), Some(Value::Number(f64::from(i * 2))));
        }
    }

    #[test]
    fn capacity_stays_power_of_two() {
        let mut table = ValueTable::new();
        for i in 0..50 {
            let (k, h) = key(f64::from(i));
            table.set_with_hash(k, h, Value::Nil);
        }
        assert!(table.capacity().is_power_of_two());
    }
}
