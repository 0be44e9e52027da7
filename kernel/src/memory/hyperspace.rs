//! Hyperspace: transient system mappings of arbitrary frames
//!
//! A handful of system PTE slots reserved at start-up. Used to reach page
//! tables of a process that is not current, such as when re-threading a
//! swapped-in hierarchy or copying pages during fork.

use super::error::MmError;
use super::frame_metadata::PfnGuard;
use super::pte::{Pfn, Pte};
use super::system_ptes::SystemPtePool;
use super::tlb;
use super::{MemoryManager, TABLE_PROTECTION};
use spin::Mutex;
use x86_64::VirtAddr;

pub struct HyperspaceWindow {
    first: u32,
    slots: u32,
    busy: Mutex<u64>,
}

/// A live hyperspace mapping; hand it back with
/// [`MemoryManager::unmap_hyperspace`]
#[derive(Debug)]
#[must_use]
pub struct HyperMapping {
    slot: u32,
    pub va: VirtAddr,
    pub frame: Pfn,
}

impl HyperspaceWindow {
    pub fn new(pool: &SystemPtePool, slots: u32) -> Result<Self, MmError> {
        let slots = slots.clamp(1, 64);
        let first = pool.reserve(slots)?;
        Ok(Self {
            first,
            slots,
            busy: Mutex::new(0),
        })
    }

    fn claim(&self) -> Option<u32> {
        let mut busy = self.busy.lock();
        let slot = (0..self.slots).find(|s| *busy & (1 << s) == 0)?;
        *busy |= 1 << slot;
        Some(slot)
    }

    fn free(&self, slot: u32) {
        *self.busy.lock() &= !(1 << slot);
    }

    pub fn in_use(&self) -> u32 {
        self.busy.lock().count_ones()
    }
}

impl MemoryManager {
    pub(crate) fn map_hyperspace(&self, guard: &mut PfnGuard<'_>, frame: Pfn) -> Result<HyperMapping, MmError> {
        let window = self.hyperspace();
        let slot = window.claim().ok_or(MmError::NoSystemPtes)?;
        let index = window.first + slot;
        guard.set_pte(self.system_ptes().address(index), Pte::valid(frame, TABLE_PROTECTION));
        Ok(HyperMapping {
            slot,
            va: self.system_ptes().va(index),
            frame,
        })
    }

    pub(crate) fn unmap_hyperspace(&self, guard: &mut PfnGuard<'_>, mapping: HyperMapping) {
        let window = self.hyperspace();
        let index = window.first + mapping.slot;
        guard.set_pte(self.system_ptes().address(index), Pte::Zero);
        tlb::flush_page(mapping.va);
        window.free(mapping.slot);
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::test_support::small_manager;

    #[test]
    fn test_mapping_is_released() {
        let (mm, _) = small_manager();
        let mut guard = mm.pfn().lock();
        let frame = mm.shared_user_data_frame();
        let mapping = mm.map_hyperspace(&mut guard, frame).unwrap();
        assert_eq!(mm.hyperspace().in_use(), 1);
        let index = mm.system_ptes().index_of(mapping.va).unwrap();
        assert_eq!(guard.read_pte(mm.system_ptes().address(index)).frame(), Some(frame));
        mm.unmap_hyperspace(&mut guard, mapping);
        assert_eq!(mm.hyperspace().in_use(), 0);
        assert!(guard.read_pte(mm.system_ptes().address(index)).is_zero());
    }
}
