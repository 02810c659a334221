use std::cell::Cell;

use serde::Serialize;

use crate::{stack::CallStack, thread::ThreadIdentity};

/// Default number of slots in the process-wide store.
pub const DEFAULT_CAPACITY: usize = 300_000;

/// Address value marking a free slot.
const FREE: usize = 0;

/// Everything a slot holds apart from its address.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub size: usize,
    pub thread: ThreadIdentity,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub stack: CallStack,
}

impl Entry {
    const EMPTY: Entry = Entry {
        size: 0,
        thread: ThreadIdentity::UNKNOWN,
        timestamp_ns: 0,
        stack: CallStack::EMPTY,
    };
}

/// A live record as handed to reporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub thread_id: u32,
    pub thread_name: String,
    pub timestamp_ns: u64,
    pub stack: Vec<usize>,
}

impl AllocationRecord {
    fn new(address: usize, entry: &Entry) -> Self {
        AllocationRecord {
            address,
            size: entry.size,
            thread_id: entry.thread.id(),
            thread_name: entry.thread.name().to_string(),
            timestamp_ns: entry.timestamp_ns,
            stack: entry.stack.frames().to_vec(),
        }
    }
}

/// No free slot was left for an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFull;

/// Fixed table of live allocation records.
///
/// The table never grows: growing would call the allocator being traced.
/// Slots live in `Cell`s because the store is only reachable through the
/// tracer's reentrant lock, which hands out shared references.
pub struct TraceStore<const CAPACITY: usize> {
    addresses: [Cell<usize>; CAPACITY],
    entries: [Cell<Entry>; CAPACITY],
    /// One past the highest slot that may hold a live record.
    high_water: Cell<usize>,
    live: Cell<usize>,
}

impl<const CAPACITY: usize> Default for TraceStore<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> TraceStore<CAPACITY> {
    pub const fn new() -> Self {
        TraceStore {
            addresses: [const { Cell::new(FREE) }; CAPACITY],
            entries: [const { Cell::new(Entry::EMPTY) }; CAPACITY],
            high_water: Cell::new(0),
            live: Cell::new(0),
        }
    }

    /// Record `address` in the first free slot.
    ///
    /// Every slot at or beyond the high-water mark is free, so the scan
    /// never has to look past it.
    pub fn insert(&self, address: usize, entry: Entry) -> Result<usize, StoreFull> {
        debug_assert_ne!(address, FREE);
        let limit = (self.high_water.get() + 1).min(CAPACITY);
        let slot = self.addresses[..limit]
            .iter()
            .position(|a| a.get() == FREE)
            .ok_or(StoreFull)?;

        self.addresses[slot].set(address);
        self.entries[slot].set(entry);
        if slot >= self.high_water.get() {
            self.high_water.set(slot + 1);
        }
        self.live.set(self.live.get() + 1);
        Ok(slot)
    }

    /// Drop the live record for `address`, returning what it held.
    pub fn invalidate(&self, address: usize) -> Option<Entry> {
        if address == FREE {
            return None;
        }
        let high_water = self.high_water.get();
        let slot = self.addresses[..high_water]
            .iter()
            .position(|a| a.get() == address)?;

        self.addresses[slot].set(FREE);
        let entry = self.entries[slot].replace(Entry::EMPTY);
        if slot + 1 == high_water {
            self.high_water.set(high_water - 1);
        }
        self.live.set(self.live.get() - 1);
        Some(entry)
    }

    /// Active records in slot order.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let high_water = self.high_water.get();
        let mut records = Vec::with_capacity(self.live.get());
        for slot in 0..high_water {
            let address = self.addresses[slot].get();
            if address != FREE {
                records.push(AllocationRecord::new(address, &self.entries[slot].get()));
            }
        }
        records
    }

    pub fn clear(&self) {
        for slot in 0..self.high_water.get() {
            self.addresses[slot].set(FREE);
            self.entries[slot].set(Entry::EMPTY);
        }
        self.high_water.set(0);
        self.live.set(0);
    }

    pub fn len(&self) -> usize {
        self.live.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water(&self) -> usize {
        self.high_water.get()
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(size: usize) -> Entry {
        Entry {
            size,
            thread: ThreadIdentity::with_name(42, "worker"),
            timestamp_ns: 1_000,
            stack: CallStack::from_frames(&[0x10, 0x20]),
        }
    }

    #[test]
    fn insert_and_snapshot() {
        let store = Box::new(TraceStore::<4>::new());
        assert_eq!(store.insert(0x1000, entry(64)), Ok(0));
        assert_eq!(store.insert(0x2000, entry(128)), Ok(1));

        assert_eq!(
            store.snapshot(),
            vec![
                AllocationRecord {
                    address: 0x1000,
                    size: 64,
                    thread_id: 42,
                    thread_name: "worker".to_string(),
                    timestamp_ns: 1_000,
                    stack: vec![0x10, 0x20],
                },
                AllocationRecord {
                    address: 0x2000,
                    size: 128,
                    thread_id: 42,
                    thread_name: "worker".to_string(),
                    timestamp_ns: 1_000,
                    stack: vec![0x10, 0x20],
                },
            ]
        );
    }

    #[test]
    fn invalidate_frees_the_slot_for_reuse() {
        let store = Box::new(TraceStore::<4>::new());
        store.insert(0x1000, entry(64)).unwrap();
        store.insert(0x2000, entry(128)).unwrap();

        assert_eq!(store.invalidate(0x1000).map(|e| e.size), Some(64));
        assert_eq!(store.invalidate(0x1000).map(|e| e.size), None);
        assert_eq!(store.len(), 1);

        assert_eq!(store.insert(0x3000, entry(32)), Ok(0));
        let addresses: Vec<_> = store.snapshot().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x3000, 0x2000]);
    }

    #[test]
    fn unknown_addresses_are_ignored() {
        let store = Box::new(TraceStore::<4>::new());
        store.insert(0x1000, entry(64)).unwrap();
        assert!(store.invalidate(0x9999).is_none());
        assert!(store.invalidate(FREE).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn full_store_rejects_inserts_without_touching_slots() {
        let store = Box::new(TraceStore::<3>::new());
        for (i, address) in [0x1000, 0x2000, 0x3000].into_iter().enumerate() {
            assert_eq!(store.insert(address, entry(i + 1)), Ok(i));
        }
        assert_eq!(store.insert(0x4000, entry(99)), Err(StoreFull));
        assert_eq!(store.len(), 3);
        let sizes: Vec<_> = store.snapshot().iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[test]
    fn high_water_tracks_the_tail() {
        let store = Box::new(TraceStore::<4>::new());
        store.insert(0x1000, entry(1)).unwrap();
        store.insert(0x2000, entry(2)).unwrap();
        assert_eq!(store.high_water(), 2);
        store.invalidate(0x2000);
        assert_eq!(store.high_water(), 1);
        store.invalidate(0x1000);
        assert_eq!(store.high_water(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let store = Box::new(TraceStore::<4>::new());
        store.insert(0x1000, entry(1)).unwrap();
        store.insert(0x2000, entry(2)).unwrap();
        store.clear();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.high_water(), 0);
        assert_eq!(store.insert(0x2000, entry(3)), Ok(0));
    }
}
