//! System PTE pool
//!
//! A run of leaf PTEs in system space, built once when the manager starts
//! and handed out in contiguous ranges. Kernel stacks and the hyperspace
//! window live here. A bitmap tracks which slots are reserved.

use super::error::MmError;
use super::layout::{PAGE_SHIFT, PAGE_SIZE};
use super::pte::{Pfn, PteAddress, PteLocation};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::VirtAddr;

pub struct SystemPtePool {
    base: VirtAddr,
    count: u32,
    entries_per_table: usize,
    /// Leaf tables backing the pool, in address order
    tables: Vec<Pfn>,
    bitmap: Mutex<Vec<u64>>,
}

impl SystemPtePool {
    pub fn new(base: VirtAddr, count: u32, entries_per_table: usize, tables: Vec<Pfn>) -> Self {
        let words = (count as usize + 63) / 64;
        Self {
            base,
            count,
            entries_per_table,
            tables,
            bitmap: Mutex::new(vec![0; words]),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.count
    }

    pub fn tables(&self) -> &[Pfn] {
        &self.tables
    }

    /// Reserve `count` contiguous slots, returning the first index
    pub fn reserve(&self, count: u32) -> Result<u32, MmError> {
        if count == 0 || count > self.count {
            return Err(MmError::NoSystemPtes);
        }
        let mut bitmap = self.bitmap.lock();
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for index in 0..self.count {
            let (word, bit) = (index as usize / 64, index % 64);
            if bitmap[word] & (1u64 << bit) == 0 {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    for slot in run_start..run_start + count {
                        bitmap[slot as usize / 64] |= 1u64 << (slot % 64);
                    }
                    log::trace!("reserved system PTEs {}..{}", run_start, run_start + count);
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        log::warn!("system PTE pool exhausted reserving {} slots", count);
        Err(MmError::NoSystemPtes)
    }

    pub fn release(&self, first: u32, count: u32) {
        let mut bitmap = self.bitmap.lock();
        for slot in first..first.saturating_add(count).min(self.count) {
            bitmap[slot as usize / 64] &= !(1u64 << (slot % 64));
        }
        log::trace!("released system PTEs {}..{}", first, first + count);
    }

    pub fn in_use(&self) -> u32 {
        self.bitmap.lock().iter().map(|w| w.count_ones()).sum()
    }

    /// Slot address of the PTE for pool index `index`
    pub fn location(&self, index: u32) -> PteLocation {
        let index = index as usize;
        PteLocation {
            table: self.tables[index / self.entries_per_table],
            index: index % self.entries_per_table,
        }
    }

    pub fn address(&self, index: u32) -> PteAddress {
        PteAddress::Table(self.location(index))
    }

    /// Virtual address mapped by pool index `index`
    pub fn va(&self, index: u32) -> VirtAddr {
        self.base + (u64::from(index) << PAGE_SHIFT)
    }

    /// Pool index mapping `va`, if it falls inside the pool
    pub fn index_of(&self, va: VirtAddr) -> Option<u32> {
        let offset = va.as_u64().checked_sub(self.base.as_u64())?;
        let index = offset / PAGE_SIZE;
        if index < u64::from(self.count) {
            Some(index as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: u32) -> SystemPtePool {
        let tables = (1..=((count + 511) / 512)).map(Pfn).collect();
        SystemPtePool::new(VirtAddr::new(0xFFFF_C900_0000_0000), count, 512, tables)
    }

    #[test]
    fn test_reserve_is_contiguous_first_fit() {
        let pool = pool(128);
        let a = pool.reserve(7).unwrap();
        let b = pool.reserve(7).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 7);
        pool.release(a, 7);
        assert_eq!(pool.reserve(3).unwrap(), 0);
        assert_eq!(pool.in_use(), 10);
    }

    #[test]
    fn test_exhaustion() {
        let pool = pool(8);
        assert!(pool.reserve(8).is_ok());
        assert_eq!(pool.reserve(1), Err(MmError::NoSystemPtes));
    }

    #[test]
    fn test_index_and_location_agree() {
        let pool = pool(1024);
        let va = pool.va(600);
        assert_eq!(pool.index_of(va), Some(600));
        let loc = pool.location(600);
        assert_eq!(loc.table, Pfn(2));
        assert_eq!(loc.index, 88);
        assert_eq!(pool.index_of(VirtAddr::new(0x1000)), None);
    }
}
