// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings.
// Used for globals, class method tables, instance fields, and the string
// intern pool. Linear probing with tombstoned deletion; keys compare by
// handle identity because the intern pool guarantees one canonical string
// per byte sequence.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

/// One probe slot. A vacant slot with a nil value is truly empty; a vacant
/// slot with `true` is a tombstone and keeps probe sequences intact.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) key: Option<ObjRef>,
    pub(crate) hash: u32,
    pub(crate) value: Value,
}

const VACANT: Entry = Entry { key: None, hash: 0, value: Value::Nil };

#[derive(Debug, Clone, Default)]
pub struct Table {
    count: usize,
    pub(crate) entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Number of live entries plus tombstones, as used for the load check.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Look up a key. The hash must be the key's own cached string hash.
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[find_slot(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow();
        }
        let slot = find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // A reclaimed tombstone was already counted toward the load factor.
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    /// Remove a key, leaving a tombstone in its slot. Returns true when the
    /// key was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    /// Copy every live entry from `source` into this table.
    pub fn add_all(&mut self, source: &Table) {
        for entry in &source.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Iterate over live (key, value) pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Double the capacity and rehash, discarding tombstones.
    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() { MIN_CAPACITY } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![VACANT; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let slot = find_slot(&self.entries, key, entry.hash);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }
}

/// Probe for `key`, returning the index of its entry if present, otherwise
/// the first tombstone passed on the way, otherwise the first empty slot.
pub(crate) fn find_slot(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
    let capacity = entries.len();
    let mut index = hash as usize % capacity;
    let mut tombstone = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            Some(existing) if existing == key => return index,
            Some(_) => {}
            None => {
                if matches!(entry.value, Value::Nil) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
        }
        index = (index + 1) % capacity;
    }
}
