//! Explicit virtual memory calls
//!
//! Reserve, commit and free private ranges; nonpaged physical and
//! large-page ranges; driver page locks; user stacks.
//!
//! Commitment rules: a VAD created with `commit` is charged for every page
//! up front and its PTEs stay zero until touched. A reserved VAD is charged
//! page by page as [`MemoryManager::commit_pages`] writes demand-zero
//! entries. Either way the charge is recorded on the VAD and returned when
//! it is removed.

use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::layout::{page_align_down, PAGE_SIZE};
use super::page_table::Walk;
use super::process_memory::{AddressSpace, Lifecycle, LockedPage};
use super::pte::{Pfn, Protection, Pte, PteAddress};
use super::stack::guard_page_count;
use super::vad::{Vad, VadKind};
use super::MemoryManager;
use crate::task::thread::{PreviousMode, StackBounds, TebFields, Thread};
use alloc::vec::Vec;
use x86_64::VirtAddr;

/// End of `pages` pages from `start`, if it stays in range
fn range_end(start: VirtAddr, pages: u64) -> Result<u64, MmError> {
    pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| start.as_u64().checked_add(bytes))
        .ok_or(MmError::InvalidAddress)
}

impl MemoryManager {
    fn check_usable(&self, space: &AddressSpace) -> Result<(), MmError> {
        if space.lifecycle() != Lifecycle::Full || space.is_deleting() {
            return Err(MmError::InvalidLifecycle);
        }
        self.ensure_resident(space)
    }

    /// Reserve `pages` of private memory, at `base` or wherever they fit.
    ///
    /// With `commit` every page is charged now.
    pub fn allocate_virtual_memory(
        &self,
        space: &AddressSpace,
        base: Option<VirtAddr>,
        pages: u64,
        protection: Protection,
        commit: bool,
    ) -> Result<VirtAddr, MmError> {
        if pages == 0 {
            return Err(MmError::InvalidAddress);
        }
        self.check_usable(space)?;

        let _as_lock = space.lock_address_space();
        let mut state = space.lock_working_set();
        let limit = self.depth().user_boundary();
        let start = match base {
            Some(base) => {
                let start = page_align_down(base);
                if range_end(start, pages)? > limit.as_u64() {
                    return Err(MmError::InvalidAddress);
                }
                start
            }
            None => state.vads.find_free_region(pages, limit).ok_or(MmError::NoVad)?,
        };

        let charge = if commit { pages } else { 0 };
        space.charge_commit(self, charge)?;
        let mut vad = Vad::new(start, pages, protection, VadKind::Private);
        if commit {
            vad = vad.committed(charge);
        }
        if let Err(e) = self.insert_vad(space, &mut state, vad) {
            space.return_commit(self, charge);
            return Err(e);
        }
        log::debug!(
            "{}: {} {} pages at {:#x}",
            space.id(),
            if commit { "committed" } else { "reserved" },
            pages,
            start.as_u64()
        );
        Ok(start)
    }

    /// Commit pages inside a private VAD; returns the pages newly charged.
    ///
    /// Already committed pages keep their charge; a demand-zero page takes
    /// the new protection. Nothing stays charged on failure.
    pub fn commit_pages(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        pages: u64,
        protection: Protection,
    ) -> Result<u64, MmError> {
        if pages == 0 {
            return Err(MmError::InvalidAddress);
        }
        self.check_usable(space)?;
        let start = page_align_down(va);
        let end = range_end(start, pages)?;

        let mut state = space.lock_working_set();
        let top = state.top()?;
        let vad = state.vads.find(start).ok_or(MmError::NoVad)?;
        if end > vad.end.as_u64() || vad.kind != VadKind::Private {
            return Err(MmError::InvalidAddress);
        }
        let mem_commit = vad.mem_commit;

        let mut guard = self.pfn().lock();
        let mut fresh = 0;
        if !mem_commit {
            for n in 0..pages {
                let (_, pte) = self.read_user_pte(&mut guard, top, start + n * PAGE_SIZE)?;
                fresh += u64::from(pte.is_zero());
            }
        }
        space.charge_commit(self, fresh)?;

        let mut written: Vec<PteAddress> = Vec::new();
        for n in 0..pages {
            let page = start + n * PAGE_SIZE;
            let loc = match self.locate_pte(&mut guard, top, page, Walk::Create(space)) {
                Ok(Some(loc)) => loc,
                Ok(None) => unreachable_walk(),
                Err(e) => {
                    for address in written {
                        guard.set_pte(address, Pte::Zero);
                    }
                    drop(guard);
                    space.return_commit(self, fresh);
                    log::warn!("{}: commit at {:#x} failed: {}", space.id(), page.as_u64(), e);
                    return Err(e);
                }
            };
            let address = PteAddress::Table(loc);
            match guard.read_pte(address) {
                Pte::Zero => {
                    guard.set_pte(address, Pte::DemandZero { protection });
                    if !mem_commit {
                        written.push(address);
                    }
                }
                Pte::DemandZero { .. } => {
                    guard.set_pte(address, Pte::DemandZero { protection });
                }
                _ => {}
            }
        }
        drop(guard);

        if let Some(vad) = state.vads.find_mut(start) {
            vad.commit_charge += fresh;
        }
        log::trace!("{}: committed {:#x} +{} ({} new)", space.id(), start.as_u64(), pages, fresh);
        Ok(fresh)
    }

    /// Remove the VAD starting at `base`; returns the commitment released
    pub fn free_virtual_memory(&self, space: &AddressSpace, base: VirtAddr) -> Result<u64, MmError> {
        self.check_usable(space)?;
        let _as_lock = space.lock_address_space();
        let mut state = space.lock_working_set();
        let vad = state
            .vads
            .find(base)
            .filter(|vad| vad.start == base)
            .cloned()
            .ok_or(MmError::NoVad)?;
        if !vad.deletable {
            return Err(MmError::InvalidAddress);
        }
        state.vads.remove(vad.start);
        self.remove_vad_pages(space, &mut state, &vad);
        log::debug!("{}: freed {:#x} ({} pages)", space.id(), base.as_u64(), vad.pages());
        Ok(vad.commit_charge)
    }

    /// Map `pages` resident physical pages that never leave the process
    pub fn allocate_physical_pages(&self, space: &AddressSpace, pages: u64, protection: Protection) -> Result<VirtAddr, MmError> {
        self.allocate_nonpaged(space, pages, protection, VadKind::Physical)
    }

    /// Like [`MemoryManager::allocate_physical_pages`], marking the space as
    /// a large-page user
    pub fn allocate_large_pages(&self, space: &AddressSpace, pages: u64, protection: Protection) -> Result<VirtAddr, MmError> {
        let va = self.allocate_nonpaged(space, pages, protection, VadKind::LargePage)?;
        space.set_large_pages(true);
        Ok(va)
    }

    fn allocate_nonpaged(&self, space: &AddressSpace, pages: u64, protection: Protection, kind: VadKind) -> Result<VirtAddr, MmError> {
        if pages == 0 {
            return Err(MmError::InvalidAddress);
        }
        self.check_usable(space)?;
        let _as_lock = space.lock_address_space();
        let mut state = space.lock_working_set();
        let top = state.top()?;
        let start = state
            .vads
            .find_free_region(pages, self.depth().user_boundary())
            .ok_or(MmError::NoVad)?;

        space.charge_commit(self, pages)?;
        if let Err(e) = self.commitment().charge_resident_available(pages) {
            space.return_commit(self, pages);
            return Err(e);
        }
        let vad = Vad::new(start, pages, protection, kind).committed(pages);
        if let Err(e) = self.insert_vad(space, &mut state, vad.clone()) {
            self.commitment().return_resident_available(pages);
            space.return_commit(self, pages);
            return Err(e);
        }

        let placed = {
            let mut guard = self.pfn().lock();
            self.place_nonpaged(&mut guard, space, top, start, pages, protection, kind)
        };
        if let Err((installed, e)) = placed {
            // Removing the VAD returns its commitment and the installed
            // pages' resident charge.
            state.vads.remove(start);
            self.remove_vad_pages(space, &mut state, &vad);
            self.commitment().return_resident_available(pages - installed);
            log::warn!("{}: nonpaged allocation of {} pages failed: {}", space.id(), pages, e);
            return Err(e);
        }
        log::debug!("{}: {} {:?} pages at {:#x}", space.id(), pages, kind, start.as_u64());
        Ok(start)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_nonpaged(
        &self,
        guard: &mut PfnGuard<'_>,
        space: &AddressSpace,
        top: Pfn,
        start: VirtAddr,
        pages: u64,
        protection: Protection,
        kind: VadKind,
    ) -> Result<(), (u64, MmError)> {
        let usage = match kind {
            VadKind::LargePage => PageUsage::LargePage,
            _ => PageUsage::Physical,
        };
        for n in 0..pages {
            let page = start + n * PAGE_SIZE;
            let loc = match self.locate_pte(guard, top, page, Walk::Create(space)) {
                Ok(Some(loc)) => loc,
                Ok(None) => unreachable_walk(),
                Err(e) => return Err((n, e)),
            };
            let frame = self.take_zero_page(guard, space.next_color()).map_err(|e| (n, e))?;
            let address = PteAddress::Table(loc);
            guard.activate(frame, address, usage, Pte::DemandZero { protection }, true);
            guard.set_pte(
                address,
                Pte::Valid {
                    frame,
                    protection,
                    dirty: true,
                    global: false,
                },
            );
        }
        Ok(())
    }

    /// Lock `pages` pages at `va` into memory on behalf of a driver.
    ///
    /// Each page is faulted in and pinned in the locked prefix of the
    /// working set. With tracking on, every lock is recorded.
    pub fn lock_pages(&self, space: &AddressSpace, va: VirtAddr, pages: u64) -> Result<(), MmError> {
        let start = page_align_down(va);
        range_end(start, pages)?;
        for n in 0..pages {
            let page = start + n * PAGE_SIZE;
            let frame = self.lock_one_page(space, page)?;
            let mut locked = space.locked.lock();
            locked.count += 1;
            if self.tracking_locked_pages() {
                locked.tracked.push(LockedPage { va: page, frame });
            }
        }
        log::trace!("{}: locked {} pages at {:#x}", space.id(), pages, start.as_u64());
        Ok(())
    }

    fn lock_one_page(&self, space: &AddressSpace, page: VirtAddr) -> Result<Pfn, MmError> {
        const ATTEMPTS: usize = 4;
        for _ in 0..ATTEMPTS {
            let status = self.resolve_user_fault(space, None, page, false, PreviousMode::Kernel, Default::default())?;
            if !status.is_success() {
                return Err(MmError::InvalidAddress);
            }
            let mut state = space.lock_working_set();
            let top = state.top()?;
            let uses_ws = state.vads.find(page).is_some_and(Vad::uses_working_set);
            let (_, pte) = self.read_user_pte(&mut self.pfn().lock(), top, page)?;
            let Pte::Valid { frame, .. } = pte else {
                // Trimmed again before the lock was taken
                continue;
            };
            if !uses_ws || state.ws.lock_entry(page) {
                return Ok(frame);
            }
        }
        Err(MmError::PageCollision)
    }

    /// Undo [`MemoryManager::lock_pages`]
    pub fn unlock_pages(&self, space: &AddressSpace, va: VirtAddr, pages: u64) {
        let start = page_align_down(va);
        let mut state = space.lock_working_set();
        let mut locked = space.locked.lock();
        for n in 0..pages {
            let page = start + n * PAGE_SIZE;
            state.ws.unlock_entry(page);
            locked.count = locked.count.saturating_sub(1);
            if let Some(at) = locked.tracked.iter().position(|l| l.va == page) {
                locked.tracked.swap_remove(at);
            }
        }
    }

    /// Reserve a user stack for `thread` and fill in its stack bounds.
    ///
    /// The top `commit` pages are committed read-write with the guard
    /// page(s) right below them; the lowest page of the reservation is
    /// never committed.
    pub fn create_user_stack(
        &self,
        space: &AddressSpace,
        thread: &Thread,
        reserve: u64,
        commit: u64,
        guaranteed_bytes: u64,
    ) -> Result<StackBounds, MmError> {
        let guard_pages = guard_page_count(guaranteed_bytes);
        if commit == 0 || commit + guard_pages >= reserve {
            return Err(MmError::InvalidAddress);
        }
        let base = self.allocate_virtual_memory(space, None, reserve, Protection::READ_WRITE, false)?;
        let top = base + reserve * PAGE_SIZE;
        let limit = top - commit * PAGE_SIZE;
        let guard_start = limit - guard_pages * PAGE_SIZE;

        let committed = self
            .commit_pages(space, limit, commit, Protection::READ_WRITE)
            .and_then(|_| self.commit_pages(space, guard_start, guard_pages, Protection::READ_WRITE | Protection::GUARD));
        if let Err(e) = committed {
            if let Err(free) = self.free_virtual_memory(space, base) {
                log::error!("{}: cannot release failed stack at {:#x}: {}", space.id(), base.as_u64(), free);
            }
            return Err(e);
        }

        let bounds = StackBounds {
            base: top,
            limit,
            deallocation: base,
        };
        thread.teb.set(TebFields {
            stack: bounds,
            guaranteed_stack_bytes: guaranteed_bytes,
            guest: None,
        });
        log::debug!(
            "{}: thread {} stack {:#x}..{:#x}, limit {:#x}",
            space.id(),
            thread.id(),
            base.as_u64(),
            top.as_u64(),
            limit.as_u64()
        );
        Ok(bounds)
    }
}

/// `Walk::Create` always reaches a leaf
fn unreachable_walk() -> ! {
    super::bugcheck::bugcheck(super::bugcheck::BugCheck::MemoryManagement, [0x4601, 0, 0, 0])
}
