//! User stack growth
//!
//! A user stack is a reserved VAD with its committed pages at the top and
//! one guard page (two while a stack guarantee is set) right below them.
//! When the access check reports a guard-page hit inside a thread's stack,
//! the detector below either slides the guard down or, once there is no
//! room left above the deallocation page, commits what remains and reports
//! a stack overflow.
//!
//! The stack bounds live in the thread's environment block, which user
//! code can unmap; a failed probe just returns the guard-page signal.

use super::error::{FaultStatus, MmError};
use super::layout::{bytes_to_pages, page_align_down, PAGE_SIZE};
use super::page_table::Walk;
use super::process_memory::AddressSpace;
use super::pte::{Protection, Pte, PteAddress};
use super::MemoryManager;
use crate::task::thread::{StackBounds, Thread};
use x86_64::VirtAddr;

/// Guard pages kept below a stack's committed region
pub fn guard_page_count(guaranteed_bytes: u64) -> u64 {
    1 + u64::from(guaranteed_bytes > 0)
}

/// What to do about a guard-page hit at `fault_page`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackDecision {
    /// Not inside this stack
    NotStack,
    /// Commit `pages` guard pages from `guard`; the new limit is the fault page
    Grow { guard: VirtAddr, pages: u64 },
    /// Commit `[from, to)` read-write and report an overflow
    Overflow { from: VirtAddr, to: VirtAddr },
}

/// Decide how a stack with `bounds` grows past a guard page at
/// `fault_page`.
///
/// All arithmetic is in units of `page`, the stack's own page size.
pub(crate) fn plan_growth(bounds: &StackBounds, fault_page: VirtAddr, page: u64, guard_pages: u64) -> StackDecision {
    let fault = fault_page.as_u64();
    let dealloc = bounds.deallocation.as_u64();
    if fault < dealloc || fault >= bounds.base.as_u64() {
        return StackDecision::NotStack;
    }
    // With a guarantee the floor drops by the extra guard page so the
    // highest guard placement stays reachable.
    let floor = (dealloc + page).saturating_sub((guard_pages - 1) * page);
    let new_guard = fault.checked_sub(guard_pages * page);
    match new_guard {
        Some(guard) if guard >= floor && guard - floor >= page => StackDecision::Grow {
            guard: VirtAddr::new(guard),
            pages: guard_pages,
        },
        _ => StackDecision::Overflow {
            from: VirtAddr::new(dealloc + page),
            to: VirtAddr::new(fault + page),
        },
    }
}

impl MemoryManager {
    /// Handle a guard-page hit at `va` on behalf of `thread`.
    ///
    /// Returns [`FaultStatus::GuardPageViolation`] when the fault should be
    /// retried (a new guard page is in place, or `va` was not a stack
    /// address), and [`FaultStatus::StackOverflow`] when the stack is
    /// exhausted. Failing to commit the new guard or the overflow pages is
    /// an error, not a stack outcome.
    pub fn check_for_stack_overflow(&self, thread: &Thread, space: &AddressSpace, va: VirtAddr) -> Result<FaultStatus, MmError> {
        let teb = match thread.teb.probe_read() {
            Ok(teb) => teb,
            Err(e) => {
                log::debug!("thread {}: stack bounds unreadable ({}), plain guard page", thread.id(), e);
                return Ok(FaultStatus::GuardPageViolation);
            }
        };
        let guard_pages = guard_page_count(teb.guaranteed_stack_bytes);

        if let Some(guest) = teb.guest {
            let page = guest.page_size.max(PAGE_SIZE);
            let fault_page = VirtAddr::new(va.as_u64() - va.as_u64() % page);
            let decision = plan_growth(&guest.bounds, fault_page, page, 1);
            if decision != StackDecision::NotStack {
                return self.apply_stack_decision(thread, space, decision, page, true);
            }
        }

        let decision = plan_growth(&teb.stack, page_align_down(va), PAGE_SIZE, guard_pages);
        if decision == StackDecision::NotStack {
            return Ok(FaultStatus::GuardPageViolation);
        }
        if self.config().disable_stack_extension {
            if let StackDecision::Grow { guard, .. } = decision {
                if !self.is_committed(space, guard) {
                    self.strip_stack_guards(space, &teb.stack);
                    log::warn!("thread {}: stack extension disabled at {:#x}", thread.id(), va.as_u64());
                    return Ok(FaultStatus::StackOverflow);
                }
            }
        }
        self.apply_stack_decision(thread, space, decision, PAGE_SIZE, false)
    }

    fn apply_stack_decision(
        &self,
        thread: &Thread,
        space: &AddressSpace,
        decision: StackDecision,
        page: u64,
        guest: bool,
    ) -> Result<FaultStatus, MmError> {
        match decision {
            StackDecision::NotStack => Ok(FaultStatus::GuardPageViolation),
            StackDecision::Grow { guard, pages } => {
                let host_pages = bytes_to_pages(pages * page);
                let protection = Protection::READ_WRITE | Protection::GUARD;
                if let Err(e) = self.commit_pages(space, guard, host_pages, protection) {
                    log::warn!("thread {}: cannot commit stack guard at {:#x}: {}", thread.id(), guard.as_u64(), e);
                    return Err(e);
                }
                let limit = guard + pages * page;
                let updated = thread.teb.probe_write(|teb| match (guest, teb.guest.as_mut()) {
                    (true, Some(stack)) => stack.bounds.limit = limit,
                    _ => teb.stack.limit = limit,
                });
                if let Err(e) = updated {
                    log::debug!("thread {}: stack limit not updated: {}", thread.id(), e);
                }
                log::trace!("thread {}: stack guard moved to {:#x}", thread.id(), guard.as_u64());
                Ok(FaultStatus::GuardPageViolation)
            }
            StackDecision::Overflow { from, to } => {
                let pages = bytes_to_pages(to - from);
                if pages > 0 {
                    if let Err(e) = self.commit_pages(space, from, pages, Protection::READ_WRITE) {
                        log::warn!("thread {}: overflow commit failed: {}", thread.id(), e);
                        return Err(e);
                    }
                }
                log::debug!("thread {}: stack overflow at {:#x}", thread.id(), to.as_u64() - page);
                Ok(FaultStatus::StackOverflow)
            }
        }
    }

    /// The PTE at `va` is committed, or its VAD was committed whole
    fn is_committed(&self, space: &AddressSpace, va: VirtAddr) -> bool {
        let state = space.lock_working_set();
        if state.vads.find(va).is_some_and(|vad| vad.mem_commit) {
            return true;
        }
        let Ok(top) = state.top() else {
            return false;
        };
        let mut guard = self.pfn().lock();
        matches!(self.read_user_pte(&mut guard, top, va), Ok((_, pte)) if !pte.is_zero())
    }

    /// Remove every guard bit in a stack so an overflow is reported once
    fn strip_stack_guards(&self, space: &AddressSpace, bounds: &StackBounds) {
        let state = space.lock_working_set();
        let Ok(top) = state.top() else {
            return;
        };
        let mut guard = self.pfn().lock();
        let mut va = bounds.deallocation;
        while va < bounds.base {
            if let Ok(Some(loc)) = self.locate_pte(&mut guard, top, va, Walk::Existing) {
                let address = PteAddress::Table(loc);
                let pte = guard.read_pte(address);
                if let Some(protection) = pte.protection().filter(|p| p.is_guard()) {
                    guard.set_pte(address, pte.with_protection(protection.without_guard()));
                }
                if let Pte::Transition { frame, .. } = pte {
                    let entry = guard.entry_mut(frame);
                    if let Some(saved) = entry.original_pte.protection() {
                        entry.original_pte = entry.original_pte.with_protection(saved.without_guard());
                    }
                }
            }
            va += PAGE_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE;

    fn bounds(base: u64, dealloc: u64) -> StackBounds {
        StackBounds {
            base: VirtAddr::new(base),
            limit: VirtAddr::new(base),
            deallocation: VirtAddr::new(dealloc),
        }
    }

    #[test]
    fn test_guard_count() {
        assert_eq!(guard_page_count(0), 1);
        assert_eq!(guard_page_count(1), 2);
        assert_eq!(guard_page_count(64 * 1024), 2);
    }

    #[test]
    fn test_guard_slides_with_headroom() {
        let base = 0x10_0000;
        let stack = bounds(base, base - 4 * P);
        assert_eq!(
            plan_growth(&stack, VirtAddr::new(base - P), P, 1),
            StackDecision::Grow {
                guard: VirtAddr::new(base - 2 * P),
                pages: 1
            }
        );
    }

    #[test]
    fn test_overflow_without_headroom() {
        let base = 0x10_0000;
        let stack = bounds(base, base - 3 * P);
        assert_eq!(
            plan_growth(&stack, VirtAddr::new(base - P), P, 1),
            StackDecision::Overflow {
                from: VirtAddr::new(base - 2 * P),
                to: VirtAddr::new(base),
            }
        );
    }

    #[test]
    fn test_guarantee_lowers_the_floor() {
        let base = 0x10_0000;
        // Two guard pages need two pages of room, but the floor sits one
        // page lower than without a guarantee.
        let stack = bounds(base, base - 5 * P);
        assert_eq!(
            plan_growth(&stack, VirtAddr::new(base - P), P, 2),
            StackDecision::Grow {
                guard: VirtAddr::new(base - 3 * P),
                pages: 2
            }
        );
        let stack = bounds(base, base - 3 * P);
        assert!(matches!(
            plan_growth(&stack, VirtAddr::new(base - P), P, 2),
            StackDecision::Overflow { .. }
        ));
    }

    #[test]
    fn test_fault_outside_stack() {
        let stack = bounds(0x10_0000, 0x8_0000);
        assert_eq!(plan_growth(&stack, VirtAddr::new(0x20_0000), P, 1), StackDecision::NotStack);
        assert_eq!(plan_growth(&stack, VirtAddr::new(0x7_f000), P, 1), StackDecision::NotStack);
    }
}
