//! Paging of kernel stacks of waiting threads
//!
//! A thread that waits for a long time gives up its kernel stack pages. The
//! live part of the stack (from the base down to one page below the saved
//! stack pointer) goes to transition and keeps its contents; dead pages
//! below it are dropped. Pages inside the guaranteed region stay charged
//! so restoring the stack can never fail for lack of resident memory.
//!
//! The thread id is stamped just below the saved stack pointer and checked
//! on the way back in.

use super::bugcheck::{bugcheck, BugCheck};
use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::kernel_stack::KernelStack;
use super::layout::{page_align_down, PAGE_SIZE};
use super::pte::{Protection, Pte, PteAddress};
use super::stats::MmStats;
use super::tlb::FlushList;
use super::MemoryManager;
use crate::task::thread::Thread;
use x86_64::VirtAddr;

impl MemoryManager {
    /// Page out the kernel stack of a waiting thread
    pub fn evict_kernel_stack(&self, thread: &Thread) {
        if self.config().disable_page_kernel_stacks || !thread.kernel_stack_resident() {
            return;
        }
        let mut stacks = thread.kernel_stacks();
        if stacks.is_empty() {
            return;
        }
        let mut guard = self.pfn().lock();
        let mut flush = FlushList::new();
        let mut returned = 0;
        for stack in stacks.iter_mut() {
            returned += self.evict_segment(&mut guard, thread.id(), stack, &mut flush);
        }
        flush.flush(self.stats());
        drop(guard);
        self.commitment().return_resident_available(returned);
        thread.set_kernel_stack_resident(false);
        log::trace!("thread {}: kernel stack paged out, {} pages discarded", thread.id(), returned);
    }

    /// Returns the number of pages whose resident charge was given back
    fn evict_segment(&self, guard: &mut PfnGuard<'_>, id: u64, stack: &mut KernelStack, flush: &mut FlushList) -> u64 {
        let signature_va = stack.sp - 8u64;
        let signature_page = page_align_down(signature_va);
        let address = self.stack_pte(stack, signature_page);
        match guard.read_pte(address) {
            Pte::Valid { frame, .. } => {
                let word = ((signature_va.as_u64() % PAGE_SIZE) / 8) as usize;
                guard.write_word(frame, word, id);
            }
            other => bugcheck(BugCheck::KernelStackInpageError, [0x4801, other.raw(), signature_va.as_u64(), id]),
        }

        let keep_from = VirtAddr::new(signature_page.as_u64().saturating_sub(PAGE_SIZE)).max(stack.limit);
        let charged_from = keep_from.min(stack.watermark()).max(stack.limit);
        let mut returned = 0;
        let mut va = stack.limit;
        while va < stack.base {
            let address = self.stack_pte(stack, va);
            let Pte::Valid { frame, .. } = guard.read_pte(address) else {
                va += PAGE_SIZE;
                continue;
            };
            let protection = Protection::READ_WRITE;
            if va >= keep_from {
                guard.set_pte(address, Pte::Transition { frame, protection });
            } else {
                let replacement = if va >= charged_from {
                    Pte::DemandZero { protection }
                } else {
                    returned += 1;
                    Pte::Zero
                };
                guard.set_pte(address, replacement);
                guard.mark_deleted(frame);
            }
            guard.decrement_share(frame);
            MmStats::sub(&self.stats().kernel_stack_resident, 1);
            flush.add(va);
            va += PAGE_SIZE;
        }
        stack.limit = charged_from;
        returned
    }

    /// Bring a paged-out kernel stack back before the thread runs
    pub fn restore_kernel_stack(&self, thread: &Thread) -> Result<(), MmError> {
        if thread.kernel_stack_resident() {
            return Ok(());
        }
        let stacks = thread.kernel_stacks();
        let pages = stacks.iter().map(KernelStack::committed_pages).sum::<u64>();
        let mut guard = self.pfn().lock();
        self.ensure_available_pages(&mut guard, pages as usize)?;
        for stack in stacks.iter() {
            self.restore_segment(&mut guard, stack)?;
            let signature_va = stack.sp - 8u64;
            let frame = match guard.read_pte(self.stack_pte(stack, page_align_down(signature_va))) {
                Pte::Valid { frame, .. } => frame,
                other => bugcheck(BugCheck::KernelStackInpageError, [0x4802, other.raw(), signature_va.as_u64(), 0]),
            };
            let found = guard.read_word(frame, ((signature_va.as_u64() % PAGE_SIZE) / 8) as usize);
            if found != thread.id() {
                bugcheck(
                    BugCheck::KernelStackInpageError,
                    [0x4803, found, thread.id(), signature_va.as_u64()],
                );
            }
        }
        drop(guard);
        drop(stacks);
        thread.set_kernel_stack_resident(true);
        log::trace!("thread {}: kernel stack back in", thread.id());
        Ok(())
    }

    fn restore_segment(&self, guard: &mut PfnGuard<'_>, stack: &KernelStack) -> Result<(), MmError> {
        let mut va = stack.limit;
        while va < stack.base {
            let address = self.stack_pte(stack, va);
            let pte = guard.read_pte(address);
            if pte.is_zero() {
                bugcheck(BugCheck::KernelStackInpageError, [0x4804, 0, va.as_u64(), stack.limit.as_u64()]);
            }
            if !pte.is_valid() {
                let (_, valid) = self.materialize(guard, address, PageUsage::KernelStack)?;
                guard.set_pte(address, valid);
                MmStats::add(&self.stats().kernel_stack_resident, 1);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    fn stack_pte(&self, stack: &KernelStack, va: VirtAddr) -> PteAddress {
        match self.system_ptes().index_of(va) {
            Some(index) => self.system_ptes().address(index),
            None => bugcheck(BugCheck::MemoryManagement, [0x4805, va.as_u64(), stack.base.as_u64(), 0]),
        }
    }
}
