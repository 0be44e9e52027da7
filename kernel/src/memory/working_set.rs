//! Working-set list
//!
//! The user pages of a process that are currently valid in its page
//! tables. Locked entries always form a contiguous prefix of the list;
//! removals and lock changes keep that by swapping slots. An index maps a
//! page address to its slot.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use x86_64::VirtAddr;

#[derive(Debug, Default)]
pub struct WorkingSetList {
    entries: Vec<u64>,
    locked: usize,
    index: BTreeMap<u64, usize>,
}

impl WorkingSetList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn locked_count(&self) -> usize {
        self.locked
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.index.contains_key(&va.as_u64())
    }

    pub fn is_locked(&self, va: VirtAddr) -> bool {
        self.index.get(&va.as_u64()).is_some_and(|slot| *slot < self.locked)
    }

    /// Add an unlocked entry; false if already present
    pub fn insert(&mut self, va: VirtAddr) -> bool {
        let va = va.as_u64();
        if self.index.contains_key(&va) {
            return false;
        }
        self.index.insert(va, self.entries.len());
        self.entries.push(va);
        true
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index.insert(self.entries[a], a);
        self.index.insert(self.entries[b], b);
    }

    /// Move an entry into the locked prefix
    pub fn lock_entry(&mut self, va: VirtAddr) -> bool {
        let Some(&slot) = self.index.get(&va.as_u64()) else {
            return false;
        };
        if slot >= self.locked {
            self.swap_slots(slot, self.locked);
            self.locked += 1;
        }
        true
    }

    /// Move an entry out of the locked prefix
    pub fn unlock_entry(&mut self, va: VirtAddr) -> bool {
        let Some(&slot) = self.index.get(&va.as_u64()) else {
            return false;
        };
        if slot < self.locked {
            self.swap_slots(slot, self.locked - 1);
            self.locked -= 1;
        }
        true
    }

    pub fn remove(&mut self, va: VirtAddr) -> bool {
        if !self.unlock_entry(va) {
            return false;
        }
        let Some(slot) = self.index.remove(&va.as_u64()) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        self.entries.pop();
        if slot < self.entries.len() {
            self.index.insert(self.entries[slot], slot);
        }
        true
    }

    /// Entries with `start <= va < end`
    pub fn entries_in_range(&self, start: VirtAddr, end: VirtAddr) -> Vec<VirtAddr> {
        self.index
            .range(start.as_u64()..end.as_u64())
            .map(|(va, _)| VirtAddr::new(*va))
            .collect()
    }

    pub fn unlocked_entries(&self) -> Vec<VirtAddr> {
        self.entries[self.locked..].iter().map(|va| VirtAddr::new(*va)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.entries.iter().map(|va| VirtAddr::new(*va))
    }

    /// Index and prefix agree with the list
    pub fn is_consistent(&self) -> bool {
        self.index.len() == self.entries.len()
            && self.locked <= self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(slot, va)| self.index.get(va) == Some(&slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn page(n: u64) -> VirtAddr {
        VirtAddr::new(0x10000 + n * 0x1000)
    }

    #[test]
    fn test_locked_entries_stay_a_prefix() {
        let mut ws = WorkingSetList::new();
        for n in 0..5 {
            ws.insert(page(n));
        }
        ws.lock_entry(page(3));
        ws.lock_entry(page(4));
        assert_eq!(ws.locked_count(), 2);
        assert!(ws.is_locked(page(3)) && ws.is_locked(page(4)));

        ws.remove(page(3));
        assert_eq!(ws.locked_count(), 1);
        assert!(ws.is_locked(page(4)));
        assert!(!ws.contains(page(3)));
        assert!(ws.is_consistent());
    }

    #[test]
    fn test_range_query() {
        let mut ws = WorkingSetList::new();
        for n in [0, 2, 4, 6] {
            ws.insert(page(n));
        }
        assert_eq!(ws.entries_in_range(page(2), page(6)), alloc::vec![page(2), page(4)]);
    }

    proptest! {
        #[test]
        fn test_random_operations_keep_prefix(ops in proptest::collection::vec((0u8..4, 0u64..16), 1..200)) {
            let mut ws = WorkingSetList::new();
            for (op, n) in ops {
                match op {
                    0 => { ws.insert(page(n)); }
                    1 => { ws.lock_entry(page(n)); }
                    2 => { ws.unlock_entry(page(n)); }
                    _ => { ws.remove(page(n)); }
                }
                prop_assert!(ws.is_consistent());
                let locked: usize = ws.iter().take(ws.locked_count()).filter(|va| ws.is_locked(*va)).count();
                prop_assert_eq!(locked, ws.locked_count());
            }
        }
    }
}
