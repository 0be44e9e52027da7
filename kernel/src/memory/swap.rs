//! Whole-process swap
//!
//! Outswapping takes a process's own page-table metadata out of memory:
//! every user page table, the working-set list, the VAD bitmap, the
//! hyperspace chain and finally the top-level directory become transition
//! pages. Data pages must already have left the working set. Swap-in
//! rebuilds the skeleton top-down; user tables come back lazily when a
//! walk reaches them.
//!
//! The expansion list records which processes may be trimmed or
//! outswapped. It has its own lock, never held together with a working-set
//! or PFN lock.

use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::layout::{VAD_BITMAP_SLOT, WORKING_SET_LIST_SLOT};
use super::page_table::Walk;
use super::process_memory::{AddressSpace, Lifecycle, Skeleton, SkeletonPage, SpaceState};
use super::pte::{AsId, Pfn, Pte, PteAddress, PteLocation};
use super::stats::MmStats;
use super::tlb::FlushList;
use super::vad::VadKind;
use super::MemoryManager;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Where a process stands on the expansion list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimState {
    /// Eligible for trimming and outswap
    Listed,
    /// Claimed by a trimmer or by swap-out
    BeingTrimmed,
    Outswapped,
}

#[derive(Debug, Default)]
pub struct ExpansionList {
    entries: BTreeMap<AsId, TrimState>,
}

impl ExpansionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: AsId, state: TrimState) {
        self.entries.insert(id, state);
    }

    pub fn remove(&mut self, id: AsId) -> Option<TrimState> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: AsId) -> Option<TrimState> {
        self.entries.get(&id).copied()
    }

    /// Move `id` from `from` to `to`; false if it was not in `from`
    pub fn claim(&mut self, id: AsId, from: TrimState, to: TrimState) -> bool {
        match self.entries.get_mut(&id) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MemoryManager {
    pub fn trim_state(&self, space: &AddressSpace) -> Option<TrimState> {
        self.expansion().lock().get(space.id())
    }

    /// Claim `space` for trimming; false if it is not listed
    pub fn begin_trim(&self, space: &AddressSpace) -> bool {
        self.expansion()
            .lock()
            .claim(space.id(), TrimState::Listed, TrimState::BeingTrimmed)
    }

    pub fn end_trim(&self, space: &AddressSpace) {
        self.expansion()
            .lock()
            .claim(space.id(), TrimState::BeingTrimmed, TrimState::Listed);
    }

    /// Take every unlocked page out of the working set.
    ///
    /// Private pages become transition pages, fork-shared pages go back to
    /// their clone block and the shared user-data mapping is dropped.
    /// Returns the number of entries removed.
    pub fn trim_working_set(&self, space: &AddressSpace) -> Result<usize, MmError> {
        let mut state = space.lock_working_set();
        let top = state.top()?;
        let mut guard = self.pfn().lock();
        let mut flush = FlushList::new();
        let mut trimmed = 0;
        for va in state.ws.unlocked_entries() {
            if let Some(loc) = self.locate_pte(&mut guard, top, va, Walk::Existing)? {
                if self.trim_page(&mut guard, loc) {
                    flush.add(va);
                }
            }
            state.ws.remove(va);
            trimmed += 1;
        }
        flush.flush(self.stats());
        log::debug!("{}: trimmed {} pages, {} locked remain", space.id(), trimmed, state.ws.len());
        Ok(trimmed)
    }

    fn trim_page(&self, guard: &mut PfnGuard<'_>, loc: PteLocation) -> bool {
        let address = PteAddress::Table(loc);
        let Pte::Valid { frame, protection, .. } = guard.table_entry(loc) else {
            return false;
        };
        if frame == self.shared_user_data_frame() {
            guard.set_pte(address, Pte::Zero);
        } else {
            match guard.entry(frame).pte_address {
                PteAddress::Clone(block) => {
                    guard.set_pte(address, Pte::Prototype { block });
                }
                owner if owner == address => {
                    guard.set_pte(address, Pte::Transition { frame, protection });
                }
                other => {
                    log::warn!("trim: {} owned by {:?}, left mapped", frame, other);
                    return false;
                }
            }
        }
        guard.decrement_share(frame);
        true
    }

    /// Outswap the page-table metadata of `space`.
    ///
    /// A no-op returning `false` unless the process is listed, its working
    /// set is empty and it holds no locked, physical or large pages.
    pub fn swap_out_process(&self, space: &AddressSpace) -> bool {
        if space.lifecycle() != Lifecycle::Full || space.is_deleting() {
            return false;
        }
        if !self
            .expansion()
            .lock()
            .claim(space.id(), TrimState::Listed, TrimState::BeingTrimmed)
        {
            log::trace!("{}: not listed, swap-out skipped", space.id());
            return false;
        }

        let mut state = space.lock_working_set();
        if !self.can_outswap(space, &state) {
            drop(state);
            self.end_trim(space);
            log::debug!("{}: swap-out refused", space.id());
            return false;
        }
        let Some(skeleton) = state.skeleton.take() else {
            drop(state);
            self.end_trim(space);
            return false;
        };

        let mut guard = self.pfn().lock();
        let captured = guard.directory_pte(space.id());
        let levels = self.depth().levels();
        let user_indices = 0..self.depth().first_system_top_index();
        self.outswap_tables(&mut guard, skeleton.top, levels, user_indices);
        for page in skeleton.pages(space.id(), self.depth()).iter().rev() {
            transition_page(&mut guard, page.address);
        }
        drop(guard);

        state.outswapped_top = Some(captured);
        space.set_outswapped(true);
        drop(state);
        self.expansion()
            .lock()
            .claim(space.id(), TrimState::BeingTrimmed, TrimState::Outswapped);
        MmStats::bump(&self.stats().outswapped_processes);
        log::debug!("{}: outswapped, top {:#x}", space.id(), captured.raw());
        true
    }

    fn can_outswap(&self, space: &AddressSpace, state: &SpaceState) -> bool {
        state.ws.is_empty()
            && !space.is_outswapped()
            && space.locked_page_count() == 0
            && !state
                .vads
                .iter()
                .any(|vad| matches!(vad.kind, VadKind::Physical | VadKind::LargePage))
    }

    /// Transition the user tables below `table`, children first
    fn outswap_tables(&self, guard: &mut PfnGuard<'_>, table: Pfn, level: usize, indices: core::ops::Range<usize>) {
        let entries = self.depth().entries_per_table();
        for index in indices {
            let slot = PteLocation { table, index };
            let Pte::Valid { frame, global: false, .. } = guard.table_entry(slot) else {
                continue;
            };
            if level > 2 {
                self.outswap_tables(guard, frame, level - 1, 0..entries);
            }
            if guard.entry(frame).share_count != 1 {
                log::warn!("swap-out: level {} table {} still maps pages", level - 1, frame);
                continue;
            }
            transition_page(guard, PteAddress::Table(slot));
        }
    }

    /// Bring back an outswapped process's skeleton and relist it
    pub fn swap_in_process(&self, space: &AddressSpace) -> Result<(), MmError> {
        let mut state = space.lock_working_set();
        if !space.is_outswapped() {
            return Ok(());
        }
        let skeleton = {
            let mut guard = self.pfn().lock();
            self.swap_in_skeleton(&mut guard, space.id())?
        };
        log::debug!("{}: swapped in, top {}", space.id(), skeleton.top);
        state.skeleton = Some(skeleton);
        state.outswapped_top = None;
        space.set_outswapped(false);
        drop(state);
        self.expansion().lock().insert(space.id(), TrimState::Listed);
        MmStats::sub(&self.stats().outswapped_processes, 1);
        Ok(())
    }

    /// Swap in `space` if needed before touching its tables
    pub(crate) fn ensure_resident(&self, space: &AddressSpace) -> Result<(), MmError> {
        if space.is_outswapped() {
            self.swap_in_process(space)?;
        }
        Ok(())
    }

    fn swap_in_skeleton(&self, guard: &mut PfnGuard<'_>, id: AsId) -> Result<Skeleton, MmError> {
        let levels = self.depth().levels();
        let mut pages = Vec::with_capacity(levels + 2);

        let address = PteAddress::Directory(id);
        let usage = PageUsage::PageTable { level: levels as u8 };
        let (top, valid) = self.materialize(guard, address, usage)?;
        guard.set_pte(address, valid);
        pages.push(SkeletonPage {
            frame: top,
            address,
            usage,
        });

        let mut parent = PteLocation {
            table: top,
            index: self.depth().hyperspace_index(),
        };
        for level in (1..levels).rev() {
            let usage = PageUsage::PageTable { level: level as u8 };
            let frame = self.rethread(guard, parent, usage)?;
            pages.push(SkeletonPage {
                frame,
                address: PteAddress::Table(parent),
                usage,
            });
            parent = PteLocation { table: frame, index: 0 };
        }

        let leaf = parent.table;
        for index in [VAD_BITMAP_SLOT, WORKING_SET_LIST_SLOT] {
            let slot = PteLocation { table: leaf, index };
            let frame = self.rethread(guard, slot, PageUsage::Skeleton)?;
            pages.push(SkeletonPage {
                frame,
                address: PteAddress::Table(slot),
                usage: PageUsage::Skeleton,
            });
        }
        Skeleton::from_pages(&pages).ok_or(MmError::InvalidLifecycle)
    }

    /// Materialize the page behind `slot` and store it through a transient
    /// mapping of its parent
    fn rethread(&self, guard: &mut PfnGuard<'_>, slot: PteLocation, usage: PageUsage) -> Result<Pfn, MmError> {
        let window = self.map_hyperspace(guard, slot.table)?;
        let address = PteAddress::Table(slot);
        let result = self.materialize(guard, address, usage);
        if let Ok((_, valid)) = result {
            guard.set_pte(address, valid);
        }
        self.unmap_hyperspace(guard, window);
        result.map(|(frame, _)| frame)
    }
}

/// Turn a valid entry into a transition entry and drop its mapping
fn transition_page(guard: &mut PfnGuard<'_>, address: PteAddress) {
    let old = guard.read_pte(address);
    if let Some(frame) = old.frame().filter(|_| old.is_valid()) {
        guard.set_pte(address, old.to_transition());
        guard.decrement_share(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_metadata::PageState;
    use crate::memory::test_support::small_manager;

    #[test]
    fn test_claim_requires_expected_state() {
        let mut list = ExpansionList::new();
        let id = AsId(3);
        list.insert(id, TrimState::Listed);
        assert!(list.claim(id, TrimState::Listed, TrimState::BeingTrimmed));
        assert!(!list.claim(id, TrimState::Listed, TrimState::BeingTrimmed));
        assert_eq!(list.get(id), Some(TrimState::BeingTrimmed));
        assert!(!list.claim(AsId(4), TrimState::Listed, TrimState::Outswapped));
    }

    #[test]
    fn test_swap_round_trip_restores_top_pte() {
        let (mm, _) = small_manager();
        let space = mm.create_address_space(20).unwrap();
        mm.finish_address_space(&space, None, None).unwrap();
        let before = mm.pfn().lock().directory_pte(space.id());
        let top = space.top_frame().unwrap();

        assert!(mm.swap_out_process(&space));
        assert!(space.is_outswapped());
        assert_eq!(mm.trim_state(&space), Some(TrimState::Outswapped));
        {
            let guard = mm.pfn().lock();
            assert!(guard.directory_pte(space.id()).is_transition());
            assert_eq!(guard.entry(top).share_count, 0);
            assert!(matches!(guard.entry(top).state, PageState::Modified | PageState::Standby));
            assert!(guard.audit().is_ok());
        }

        mm.swap_in_process(&space).unwrap();
        assert!(!space.is_outswapped());
        assert_eq!(mm.trim_state(&space), Some(TrimState::Listed));
        let guard = mm.pfn().lock();
        assert_eq!(guard.directory_pte(space.id()), before);
        assert_eq!(guard.entry(top).share_count, 2);
        assert!(guard.audit().is_ok());
    }

    #[test]
    fn test_swap_out_is_noop_while_trimming() {
        let (mm, _) = small_manager();
        let space = mm.create_address_space(20).unwrap();
        mm.finish_address_space(&space, None, None).unwrap();
        assert!(mm.begin_trim(&space));
        assert!(!mm.swap_out_process(&space));
        assert!(!space.is_outswapped());
        mm.end_trim(&space);
        assert!(mm.swap_out_process(&space));
    }
}
