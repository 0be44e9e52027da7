//! Page fault resolution
//!
//! [`MemoryManager::handle_page_fault`] is what the trap handler calls. It
//! runs the access check, hands guard-page hits to the stack-overflow
//! detector and otherwise makes the faulting PTE valid:
//!
//! - committed but untouched pages get a zero page
//! - transition pages are reclaimed, paged-out ones read back
//! - fork-shared pages are mapped from their clone block, read-only with
//!   copy-on-write
//! - writes to copy-on-write pages get a private copy
//!
//! Every page made valid in a process goes into its working set.

use super::access::{AccessRequest, PfnLockState, TrapContext};
use super::error::{FaultStatus, MmError};
use super::frame_metadata::{PageUsage, PfnGuard};
use super::layout::page_align_down;
use super::page_table::Walk;
use super::process_memory::{AddressSpace, Lifecycle, SpaceState};
use super::pte::{Pfn, Protection, Pte, PteAddress, PteLocation};
use super::tlb::FlushList;
use super::vad::{Vad, VadKind};
use super::MemoryManager;
use crate::task::thread::{PreviousMode, Thread};
use x86_64::VirtAddr;

impl MemoryManager {
    /// Handle a page fault taken by `thread` at `va`
    pub fn handle_page_fault(
        &self,
        thread: &Thread,
        va: VirtAddr,
        write: bool,
        mode: PreviousMode,
        trap: TrapContext,
    ) -> Result<FaultStatus, MmError> {
        if va >= self.depth().user_boundary() {
            return Ok(self.system_fault(thread, va, write, mode, trap));
        }
        let Some(space) = thread.current_process() else {
            log::debug!("thread {}: user fault at {:#x} without a process", thread.id(), va.as_u64());
            return Ok(FaultStatus::AccessViolation);
        };
        self.resolve_user_fault(&space, Some(thread), va, write, mode, trap)
    }

    /// Faults on system addresses are only legal against valid entries
    fn system_fault(&self, thread: &Thread, va: VirtAddr, write: bool, mode: PreviousMode, trap: TrapContext) -> FaultStatus {
        let Some(loc) = self.system_pte_location(va) else {
            return FaultStatus::AccessViolation;
        };
        let address = PteAddress::Table(loc);
        let mut guard = self.pfn().lock();
        let pte = guard.read_pte(address);
        if !pte.is_valid() {
            log::warn!("thread {}: system fault at {:#x} on {:?}", thread.id(), va.as_u64(), pte);
            return FaultStatus::AccessViolation;
        }
        let request = AccessRequest {
            va,
            write,
            mode,
            attached_foreign: thread.is_attached_foreign(),
            trap,
        };
        self.check_access(&request, address, pte, Protection::empty(), PfnLockState::Held(&mut guard))
    }

    /// Resolve a fault on a user address of `space`.
    ///
    /// `thread` is `None` when the kernel touches the page on its own
    /// behalf (locking pages); guard pages are then reported, not grown.
    pub(crate) fn resolve_user_fault(
        &self,
        space: &AddressSpace,
        thread: Option<&Thread>,
        va: VirtAddr,
        write: bool,
        mode: PreviousMode,
        trap: TrapContext,
    ) -> Result<FaultStatus, MmError> {
        if space.is_deleting() || space.lifecycle() != Lifecycle::Full {
            return Ok(FaultStatus::AccessViolation);
        }
        self.ensure_resident(space)?;

        let page = page_align_down(va);
        let request = AccessRequest {
            va,
            write,
            mode,
            attached_foreign: thread.is_some_and(Thread::is_attached_foreign),
            trap,
        };

        let mut state = space.lock_working_set();
        let top = state.top()?;
        let Some(vad) = state.vads.find(page).cloned() else {
            return Ok(FaultStatus::AccessViolation);
        };
        let mut guard = self.pfn().lock();
        let (loc, pte) = self.read_user_pte(&mut guard, top, page)?;
        if pte.is_zero() && !vad.mem_commit && vad.kind != VadKind::SharedUserData {
            return Ok(FaultStatus::AccessViolation);
        }
        let loc = match loc {
            Some(loc) => loc,
            None => self
                .locate_pte(&mut guard, top, page, Walk::Create(space))?
                .ok_or(MmError::InvalidAddress)?,
        };

        let (address, checked) = match pte {
            Pte::Prototype { block } => (PteAddress::Clone(block), guard.read_pte(PteAddress::Clone(block))),
            other => (PteAddress::Table(loc), other),
        };
        let status = self.check_access(&request, address, checked, vad.protection, PfnLockState::Held(&mut guard));
        match status {
            FaultStatus::Success => {}
            FaultStatus::GuardPageViolation => {
                drop(guard);
                drop(state);
                return match thread {
                    Some(thread) => self.check_for_stack_overflow(thread, space, va),
                    None => Ok(FaultStatus::GuardPageViolation),
                };
            }
            other => return Ok(other),
        }

        let result = self.make_valid(&mut guard, &mut state, space, &vad, loc, page, write);
        match result {
            Ok(()) => Ok(FaultStatus::Success),
            // Someone else is reading the page in; retrying finds it valid
            Err(MmError::PageCollision) => Ok(FaultStatus::Success),
            Err(e) => {
                log::debug!("{}: fault at {:#x} failed: {}", space.id(), va.as_u64(), e);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn make_valid(
        &self,
        guard: &mut PfnGuard<'_>,
        state: &mut SpaceState,
        space: &AddressSpace,
        vad: &Vad,
        loc: PteLocation,
        page: VirtAddr,
        write: bool,
    ) -> Result<(), MmError> {
        let address = PteAddress::Table(loc);
        // The access check may have rewritten the entry
        let pte = guard.read_pte(address);
        match pte {
            Pte::Valid { frame, protection, .. } => {
                if write && protection.contains(Protection::COPY_ON_WRITE) {
                    self.copy_on_write(guard, space, loc, page, frame, protection)?;
                }
            }
            Pte::Zero if vad.kind == VadKind::SharedUserData => {
                let frame = self.shared_user_data_frame();
                guard.increment_share(frame);
                guard.set_pte(address, Pte::valid(frame, Protection::READ));
            }
            Pte::Zero => {
                guard.set_pte(
                    address,
                    Pte::DemandZero {
                        protection: vad.protection.without_guard(),
                    },
                );
                self.materialize_private(guard, address, write)?;
            }
            Pte::DemandZero { .. } | Pte::Transition { .. } | Pte::PagingFile { .. } => {
                self.materialize_private(guard, address, write)?;
            }
            Pte::Prototype { block } => {
                let shared = PteAddress::Clone(block);
                let (frame, protection) = match guard.read_pte(shared) {
                    Pte::Valid { frame, protection, .. } => {
                        guard.increment_share(frame);
                        (frame, protection)
                    }
                    _ => {
                        // The mapping made here is the one share the
                        // materialized frame starts with.
                        let (frame, valid) = self.materialize(guard, shared, PageUsage::ProcessPrivate)?;
                        let protection = valid.protection().unwrap_or(Protection::READ);
                        guard.set_pte(shared, valid);
                        (frame, protection)
                    }
                };
                guard.set_pte(
                    address,
                    Pte::Valid {
                        frame,
                        protection,
                        dirty: false,
                        global: false,
                    },
                );
                if write && protection.contains(Protection::COPY_ON_WRITE) {
                    self.copy_on_write(guard, space, loc, page, frame, protection)?;
                }
            }
        }
        if vad.uses_working_set() {
            state.ws.insert(page);
        }
        Ok(())
    }

    fn materialize_private(&self, guard: &mut PfnGuard<'_>, address: PteAddress, write: bool) -> Result<(), MmError> {
        let (_, valid) = self.materialize(guard, address, PageUsage::ProcessPrivate)?;
        let valid = match valid.protection() {
            Some(protection) if write && protection.contains(Protection::COPY_ON_WRITE) => {
                valid.with_protection(protection.private_copy())
            }
            _ => valid,
        };
        guard.set_pte(address, valid);
        Ok(())
    }

    /// Give the process a private, writable copy of `frame`.
    ///
    /// A frame the process already owns alone just becomes writable.
    fn copy_on_write(
        &self,
        guard: &mut PfnGuard<'_>,
        space: &AddressSpace,
        loc: PteLocation,
        page: VirtAddr,
        frame: Pfn,
        protection: Protection,
    ) -> Result<(), MmError> {
        let address = PteAddress::Table(loc);
        let private = protection.private_copy();
        let mut flush = FlushList::new();
        if guard.entry(frame).pte_address == address {
            guard.set_pte(
                address,
                Pte::Valid {
                    frame,
                    protection: private,
                    dirty: true,
                    global: false,
                },
            );
        } else {
            let copy = self.take_any_page(guard, space.next_color())?;
            guard.activate(copy, address, PageUsage::ProcessPrivate, Pte::DemandZero { protection: private }, true);
            guard.copy_frame(frame, copy);
            guard.set_pte(
                address,
                Pte::Valid {
                    frame: copy,
                    protection: private,
                    dirty: true,
                    global: false,
                },
            );
            self.release_mapping(guard, frame, address);
            log::trace!("{}: copied {} to {} at {:#x}", space.id(), frame, copy, page.as_u64());
        }
        flush.add(page);
        flush.flush(self.stats());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::PAGE_SIZE;
    use crate::memory::test_support::small_manager;
    use alloc::sync::Arc;

    fn ready(mm: &MemoryManager) -> Arc<AddressSpace> {
        let space = mm.create_address_space(20).unwrap();
        mm.finish_address_space(&space, None, None).unwrap();
        space
    }

    fn user_fault(mm: &MemoryManager, thread: &Thread, va: VirtAddr, write: bool) -> FaultStatus {
        mm.handle_page_fault(thread, va, write, PreviousMode::User, TrapContext::default())
            .unwrap()
    }

    fn leaf(mm: &MemoryManager, space: &AddressSpace, va: VirtAddr) -> Pte {
        let top = space.top_frame().unwrap();
        mm.read_user_pte(&mut mm.pfn().lock(), top, va).unwrap().1
    }

    #[test]
    fn test_committed_page_gets_zero_page() {
        let (mm, _) = small_manager();
        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let va = mm
            .allocate_virtual_memory(&space, None, 4, Protection::READ_WRITE, true)
            .unwrap();
        assert_eq!(user_fault(&mm, &thread, va + 0x10u64, true), FaultStatus::Success);
        let Pte::Valid { frame, dirty, .. } = leaf(&mm, &space, va) else {
            panic!("page not valid");
        };
        assert!(dirty);
        assert_eq!(mm.pfn().lock().read_word(frame, 0), 0);
        assert_eq!(space.working_set_size(), 1);
        assert!(mm.pfn().lock().audit().is_ok());
    }

    #[test]
    fn test_reserved_page_is_access_violation() {
        let (mm, _) = small_manager();
        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let va = mm
            .allocate_virtual_memory(&space, None, 4, Protection::READ_WRITE, false)
            .unwrap();
        assert_eq!(user_fault(&mm, &thread, va, false), FaultStatus::AccessViolation);
        assert_eq!(user_fault(&mm, &thread, VirtAddr::new(0x1000), false), FaultStatus::AccessViolation);
        mm.commit_pages(&space, va, 1, Protection::READ).unwrap();
        assert_eq!(user_fault(&mm, &thread, va, true), FaultStatus::AccessViolation);
        assert_eq!(user_fault(&mm, &thread, va, false), FaultStatus::Success);
    }

    #[test]
    fn test_trimmed_page_comes_back_with_its_contents() {
        let (mm, _) = small_manager();
        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let va = mm
            .allocate_virtual_memory(&space, None, 1, Protection::READ_WRITE, true)
            .unwrap();
        user_fault(&mm, &thread, va, true);
        let frame = leaf(&mm, &space, va).frame().unwrap();
        mm.pfn().lock().write_word(frame, 3, 0xfeed);

        mm.trim_working_set(&space).unwrap();
        assert!(leaf(&mm, &space, va).is_transition());
        assert_eq!(user_fault(&mm, &thread, va, false), FaultStatus::Success);
        assert_eq!(leaf(&mm, &space, va).frame(), Some(frame));
        assert_eq!(mm.pfn().lock().read_word(frame, 3), 0xfeed);
    }

    #[test]
    fn test_written_page_is_reclaimed_and_slot_dropped() {
        let (mm, file) = small_manager();
        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let va = mm
            .allocate_virtual_memory(&space, None, 1, Protection::READ_WRITE, true)
            .unwrap();
        user_fault(&mm, &thread, va, true);
        let frame = leaf(&mm, &space, va).frame().unwrap();
        mm.pfn().lock().write_word(frame, 0, 42);
        mm.trim_working_set(&space).unwrap();
        mm.write_modified_pages();
        assert_eq!(file.slots_in_use(), 1);

        assert_eq!(user_fault(&mm, &thread, va, false), FaultStatus::Success);
        let frame = leaf(&mm, &space, va).frame().unwrap();
        assert_eq!(mm.pfn().lock().read_word(frame, 0), 42);
        assert_eq!(file.slots_in_use(), 0);
    }

    #[test]
    fn test_shared_user_data_is_read_only() {
        let (mm, _) = small_manager();
        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let shared = VirtAddr::new(crate::memory::layout::SHARED_USER_DATA_VA);
        assert_eq!(user_fault(&mm, &thread, shared, true), FaultStatus::AccessViolation);
        assert_eq!(user_fault(&mm, &thread, shared, false), FaultStatus::Success);
        assert_eq!(leaf(&mm, &space, shared).frame(), Some(mm.shared_user_data_frame()));
    }

    #[test]
    fn test_system_fault_on_unmapped_entry() {
        let (mm, _) = small_manager();
        let thread = Thread::new(None);
        let stack = mm.create_kernel_stack(false, 0).unwrap();
        let status = mm
            .handle_page_fault(&thread, stack.limit - PAGE_SIZE, true, PreviousMode::Kernel, TrapContext::default())
            .unwrap();
        assert_eq!(status, FaultStatus::AccessViolation);
        let status = mm
            .handle_page_fault(&thread, stack.limit, true, PreviousMode::Kernel, TrapContext::default())
            .unwrap();
        assert_eq!(status, FaultStatus::Success);
        mm.delete_kernel_stack(stack);
    }
}
