//! Address-space teardown
//!
//! Two phases. Clean removes every VAD and the pages and tables under
//! them, leaving the skeleton. Destroy frees the skeleton. Each phase
//! claims its lifecycle transition before touching anything, so calling
//! either one again is a no-op.

use super::bugcheck::{bugcheck, BugCheck};
use super::process_memory::{AddressSpace, Lifecycle, SpaceState};
use super::stats::MmStats;
use super::tlb::FlushList;
use super::vad::{Vad, VadKind};
use super::MemoryManager;
use alloc::vec::Vec;

impl MemoryManager {
    /// Remove every VAD of `space`, shared user data last.
    ///
    /// The caller holds the address-space lock.
    pub(crate) fn remove_all_vads(&self, space: &AddressSpace) {
        let mut state = space.lock_working_set();
        let (mut order, shared): (Vec<Vad>, Vec<Vad>) = state
            .vads
            .iter()
            .cloned()
            .partition(|vad| vad.kind != VadKind::SharedUserData);
        order.extend(shared);
        for vad in order {
            state.vads.remove(vad.start);
            self.remove_vad_pages(space, &mut state, &vad);
        }
    }

    /// Delete the pages of a VAD that is already out of the tree and
    /// return what it was charged
    pub(crate) fn remove_vad_pages(&self, space: &AddressSpace, state: &mut SpaceState, vad: &Vad) {
        if let Ok(top) = state.top() {
            let mut guard = self.pfn().lock();
            let mut flush = FlushList::new();
            match vad.kind {
                VadKind::Physical | VadKind::LargePage => {
                    let outcome = self.delete_range(&mut guard, space, top, vad.start, vad.end, None, &mut flush);
                    self.commitment().return_resident_available(outcome.pages_deleted);
                }
                VadKind::Private | VadKind::MappedView { .. } | VadKind::SharedUserData => {
                    self.delete_range(&mut guard, space, top, vad.start, vad.end, Some(&mut state.ws), &mut flush);
                }
            }
        } else {
            log::warn!("{}: VAD {:#x} removed without a skeleton", space.id(), vad.start.as_u64());
        }
        space.return_commit(self, vad.commit_charge);
    }

    /// First teardown phase: remove all user memory.
    ///
    /// Only acts on a fully constructed space.
    pub fn clean_address_space(&self, space: &AddressSpace) {
        if !space.transition(Lifecycle::Full, Lifecycle::Skeleton) {
            return;
        }
        space.set_deleting();
        if let Err(e) = self.ensure_resident(space) {
            log::error!("{}: cannot swap in for teardown: {}", space.id(), e);
            bugcheck(BugCheck::MemoryManagement, [0x4501, u64::from(space.id().0), 0, 0]);
        }

        let _as_lock = space.lock_address_space();
        self.remove_all_vads(space);
        self.expansion().lock().remove(space.id());
        self.check_locked_pages(space);
        log::debug!(
            "{}: cleaned, {} pages still committed",
            space.id(),
            space.committed_pages()
        );
    }

    /// Report driver-held page locks that outlived the process
    fn check_locked_pages(&self, space: &AddressSpace) {
        let mut locked = space.locked.lock();
        if locked.count == 0 {
            return;
        }
        MmStats::bump(&self.stats().locked_page_leaks);
        log::error!("{}: {} locked pages outstanding at teardown", space.id(), locked.count);
        for page in &locked.tracked {
            log::error!("  locked {:#x} ({})", page.va.as_u64(), page.frame);
        }
        if self.config().locked_page_leaks_fatal {
            bugcheck(
                BugCheck::DriverLeftLockedPagesInProcess,
                [u64::from(space.id().0), locked.count, locked.tracked.len() as u64, 0],
            );
        }
        if !self.tracking_locked_pages() {
            self.enable_locked_page_tracking();
            log::warn!("locked page tracking enabled");
        }
        locked.count = 0;
        locked.tracked.clear();
    }

    /// Second teardown phase: free the skeleton
    pub fn destroy_address_space(&self, space: &AddressSpace) {
        if !space.transition(Lifecycle::Skeleton, Lifecycle::Uninitialized) {
            return;
        }
        let Some(skeleton) = space.lock_working_set().skeleton.take() else {
            log::warn!("{}: destroyed without a skeleton", space.id());
            return;
        };
        let pages = skeleton.pages(space.id(), self.depth());
        {
            let mut guard = self.pfn().lock();
            self.release_skeleton_pages(&mut guard, space.id(), &pages);
        }
        let count = self.depth().skeleton_pages();
        self.commitment().return_resident_available(count);
        space.return_commit(self, count);
        self.expansion().lock().remove(space.id());
        log::debug!("{}: destroyed", space.id());
    }
}
