//! Range deletion
//!
//! Clears every PTE in a user range, releasing what each one held, and
//! frees page-table pages that end up empty on the way. A table is empty
//! when its share count is back to 1 (its own mapping) and no entry is in
//! use; freeing it may empty its parent in turn. The top-level directory
//! is never freed here.

use super::error::MmError;
use super::frame_metadata::PfnGuard;
use super::layout::PAGE_SIZE;
use super::page_table::Walk;
use super::process_memory::AddressSpace;
use super::pte::{Pfn, Pte, PteAddress, PteLocation};
use super::tlb::FlushList;
use super::working_set::WorkingSetList;
use super::MemoryManager;
use alloc::vec::Vec;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteRangeOutcome {
    /// PTEs that held a frame, a paging-file slot or a clone reference
    pub pages_deleted: u64,
    pub tables_reclaimed: u64,
}

impl MemoryManager {
    /// Delete `[start, end)` of `space`.
    ///
    /// With `ws`, the range's working-set entries are removed first. Table
    /// credits are returned to `space` in one batch.
    pub(crate) fn delete_range(
        &self,
        guard: &mut PfnGuard<'_>,
        space: &AddressSpace,
        top: Pfn,
        start: VirtAddr,
        end: VirtAddr,
        ws: Option<&mut WorkingSetList>,
        flush: &mut FlushList,
    ) -> DeleteRangeOutcome {
        if let Some(ws) = ws {
            for va in ws.entries_in_range(start, end) {
                ws.remove(va);
            }
        }

        let leaf_span = self.depth().entry_span(2);
        let mut outcome = DeleteRangeOutcome::default();
        let mut current: Option<(Pfn, VirtAddr)> = None;
        let mut va = start;
        while va < end {
            let loc = match self.locate_pte(guard, top, va, Walk::Existing) {
                Ok(Some(loc)) => loc,
                Ok(None) => {
                    va = next_boundary(va, leaf_span);
                    continue;
                }
                Err(e) => {
                    log::warn!("{}: skipping {:#x} during delete: {}", space.id(), va.as_u64(), e);
                    va = next_boundary(va, leaf_span);
                    continue;
                }
            };
            if let Some((table, previous)) = current {
                if table != loc.table {
                    outcome.tables_reclaimed += self.reclaim_empty_tables(guard, top, previous, flush);
                }
            }
            current = Some((loc.table, va));
            if self.delete_pte(guard, PteAddress::Table(loc), va, flush) {
                outcome.pages_deleted += 1;
            }
            va += PAGE_SIZE;
        }
        if let Some((_, previous)) = current {
            outcome.tables_reclaimed += self.reclaim_empty_tables(guard, top, previous, flush);
        }
        flush.flush(self.stats());

        if outcome.tables_reclaimed > 0 {
            self.commitment().return_resident_available(outcome.tables_reclaimed);
            space.return_commit(self, outcome.tables_reclaimed);
        }
        log::debug!(
            "{}: deleted {:#x}..{:#x}: {} pages, {} tables",
            space.id(),
            start.as_u64(),
            end.as_u64(),
            outcome.pages_deleted,
            outcome.tables_reclaimed
        );
        outcome
    }

    /// Clear one PTE; true when it held something that was released
    pub(crate) fn delete_pte(&self, guard: &mut PfnGuard<'_>, address: PteAddress, va: VirtAddr, flush: &mut FlushList) -> bool {
        let old = guard.set_pte(address, Pte::Zero);
        match old {
            Pte::Zero | Pte::DemandZero { .. } => false,
            Pte::Valid { frame, .. } => {
                flush.add(va);
                self.release_mapping(guard, frame, address);
                true
            }
            Pte::Transition { frame, .. } => {
                guard.delete_unmapped(frame);
                true
            }
            Pte::PagingFile { slot, .. } => {
                self.paging_file().release_backing_store(slot);
                true
            }
            Pte::Prototype { block } => {
                guard.decrement_clone_reference(block);
                true
            }
        }
    }

    /// Drop a valid mapping of `frame` that used to live at `address`
    pub(crate) fn release_mapping(&self, guard: &mut PfnGuard<'_>, frame: Pfn, address: PteAddress) {
        match guard.entry(frame).pte_address {
            owner if owner == address => {
                guard.mark_deleted(frame);
                guard.decrement_share(frame);
            }
            PteAddress::Clone(block) => {
                guard.decrement_share(frame);
                guard.decrement_clone_reference(block);
            }
            _ => guard.decrement_share(frame),
        }
    }

    /// Free the leaf table covering `va` if it is empty, then its parents
    fn reclaim_empty_tables(&self, guard: &mut PfnGuard<'_>, top: Pfn, va: VirtAddr, flush: &mut FlushList) -> u64 {
        let path = self.table_path(guard, top, va);
        let mut reclaimed = 0;
        // Leaf first; the last element of `path` hangs off the top.
        for (table, slot) in path.into_iter().rev() {
            let entry = guard.entry(table);
            if entry.share_count != 1 || entry.used_entries != 0 {
                break;
            }
            guard.set_pte(PteAddress::Table(slot), Pte::Zero);
            guard.mark_deleted(table);
            guard.decrement_share(table);
            flush.add(va);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Resident tables below the top on the way to `va`, each with the
    /// slot that maps it, top-down
    fn table_path(&self, guard: &PfnGuard<'_>, top: Pfn, va: VirtAddr) -> Vec<(Pfn, PteLocation)> {
        let depth = self.depth();
        let mut path = Vec::with_capacity(depth.levels());
        let mut table = top;
        for level in (2..=depth.levels()).rev() {
            let slot = PteLocation {
                table,
                index: depth.index(va, level),
            };
            match guard.table_entry(slot) {
                Pte::Valid { frame, .. } => {
                    path.push((frame, slot));
                    table = frame;
                }
                _ => break,
            }
        }
        path
    }

    /// Delete a range for a caller that holds the working-set lock
    pub(crate) fn delete_user_range(
        &self,
        space: &AddressSpace,
        state: &mut super::process_memory::SpaceState,
        start: VirtAddr,
        end: VirtAddr,
        with_working_set: bool,
    ) -> Result<DeleteRangeOutcome, MmError> {
        let top = state.top()?;
        let mut guard = self.pfn().lock();
        let mut flush = FlushList::new();
        let ws = if with_working_set { Some(&mut state.ws) } else { None };
        Ok(self.delete_range(&mut guard, space, top, start, end, ws, &mut flush))
    }
}

fn next_boundary(va: VirtAddr, span: u64) -> VirtAddr {
    VirtAddr::new((va.as_u64() / span + 1).saturating_mul(span))
}
