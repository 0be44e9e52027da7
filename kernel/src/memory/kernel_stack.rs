//! Kernel stack allocator
//!
//! Kernel stacks live in the system PTE pool. Each reservation starts with
//! a guard PTE that is never made valid, followed by the stack pages; the
//! committed pages sit at the top. Small stacks are fully committed; large
//! ones commit a few pages and grow on request up to their reservation.
//!
//! Recently freed small stacks are kept per NUMA node in a bounded
//! lock-free cache and handed out again without touching page tables.

use super::bugcheck::{bugcheck, BugCheck};
use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::layout::{
    page_align_down, KERNEL_LARGE_STACK_COMMIT_PAGES, KERNEL_LARGE_STACK_PAGES, KERNEL_STACK_GUARD_PAGES,
    KERNEL_STACK_PAGES, PAGE_SIZE,
};
use super::pte::{Protection, Pte, PteAddress};
use super::stats::MmStats;
use super::tlb::FlushList;
use super::MemoryManager;
use crate::task::thread::Thread;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use x86_64::VirtAddr;

/// A kernel stack: its system PTE range and current extent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelStack {
    /// Pool index of the guard PTE
    first_pte: u32,
    /// Stack pages reserved above the guard
    reserved: u64,
    /// One past the highest stack byte
    pub base: VirtAddr,
    /// Lowest committed byte
    pub limit: VirtAddr,
    /// Where the stack pointer starts; the pages just below it are always
    /// kept resident
    pub initial_stack: VirtAddr,
    pub large: bool,
    pub node: u8,
    /// Saved stack pointer while the thread is not running
    pub sp: VirtAddr,
}

impl KernelStack {
    fn total_ptes(&self) -> u32 {
        (self.reserved + KERNEL_STACK_GUARD_PAGES) as u32
    }

    /// Pool index of the stack page at `va`
    fn pte_index(&self, mm: &MemoryManager, va: VirtAddr) -> u32 {
        let bottom = mm.system_ptes().va(self.first_pte);
        self.first_pte + ((va - bottom) / PAGE_SIZE) as u32
    }

    /// Lowest address the stack may ever grow to
    pub fn floor(&self) -> VirtAddr {
        self.base - self.reserved * PAGE_SIZE
    }

    pub fn committed_pages(&self) -> u64 {
        (self.base - self.limit) / PAGE_SIZE
    }

    /// Pages guaranteed to stay resident across eviction
    pub fn watermark(&self) -> VirtAddr {
        self.initial_stack - KERNEL_STACK_PAGES * PAGE_SIZE
    }
}

/// Per-node cache of freed small stacks
pub struct DeadStackCache {
    nodes: Vec<ArrayQueue<KernelStack>>,
}

impl DeadStackCache {
    pub fn new(nodes: u8, depth: usize) -> Self {
        let nodes = if depth == 0 {
            Vec::new()
        } else {
            (0..nodes.max(1)).map(|_| ArrayQueue::new(depth)).collect()
        };
        Self { nodes }
    }

    pub fn pop(&self, node: u8) -> Option<KernelStack> {
        self.nodes.get(usize::from(node))?.pop()
    }

    /// Cache `stack`; hands it back if the node's cache is full
    pub fn push(&self, node: u8, stack: KernelStack) -> Result<(), KernelStack> {
        match self.nodes.get(usize::from(node)) {
            Some(queue) => queue.push(stack),
            None => Err(stack),
        }
    }

    pub fn len(&self, node: u8) -> usize {
        self.nodes.get(usize::from(node)).map_or(0, ArrayQueue::len)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(ArrayQueue::is_empty)
    }
}

impl MemoryManager {
    /// Create a kernel stack on `node`.
    ///
    /// Small stacks come from the dead-stack cache when one is there.
    pub fn create_kernel_stack(&self, large: bool, node: u8) -> Result<KernelStack, MmError> {
        if !large {
            if let Some(mut stack) = self.dead_stacks().pop(node) {
                MmStats::bump(&self.stats().dead_stack_hits);
                MmStats::bump(&self.stats().small_stacks);
                stack.sp = stack.initial_stack;
                log::trace!("kernel stack {:#x} reused from node {}", stack.base.as_u64(), node);
                return Ok(stack);
            }
        }

        let (reserved, commit) = if large {
            (KERNEL_LARGE_STACK_PAGES, KERNEL_LARGE_STACK_COMMIT_PAGES)
        } else {
            (KERNEL_STACK_PAGES, KERNEL_STACK_PAGES)
        };
        let charge = reserved + KERNEL_STACK_GUARD_PAGES;
        self.commitment().charge_commitment(charge)?;
        let first_pte = match self.system_ptes().reserve(charge as u32) {
            Ok(first) => first,
            Err(e) => {
                self.commitment().return_commitment(charge);
                return Err(e);
            }
        };
        if !self.commitment().resident_headroom(commit) {
            self.system_ptes().release(first_pte, charge as u32);
            self.commitment().return_commitment(charge);
            log::warn!("no resident memory for a kernel stack");
            return Err(MmError::InsufficientResidentMemory);
        }

        let base = self.system_ptes().va(first_pte) + charge * PAGE_SIZE;
        let mut stack = KernelStack {
            first_pte,
            reserved,
            base,
            limit: base,
            initial_stack: base,
            large,
            node,
            sp: base,
        };

        let mut guard = self.pfn().lock();
        if let Err(e) = self.extend_stack(&mut guard, &mut stack, base - commit * PAGE_SIZE) {
            let placed = self.free_stack_pages(&mut guard, &stack);
            drop(guard);
            self.commitment().return_resident_available(placed);
            self.system_ptes().release(first_pte, charge as u32);
            self.commitment().return_commitment(charge);
            log::warn!("kernel stack creation failed: {}", e);
            return Err(e);
        }
        drop(guard);

        let counter = if large {
            &self.stats().large_stacks
        } else {
            &self.stats().small_stacks
        };
        MmStats::bump(counter);
        log::trace!("kernel stack {:#x} ({} pages) on node {}", base.as_u64(), commit, node);
        Ok(stack)
    }

    /// Make pages valid downwards from `stack.limit` until it reaches
    /// `target`. Each page is charged as it goes; pages made valid before a
    /// failure stay.
    fn extend_stack(&self, guard: &mut PfnGuard<'_>, stack: &mut KernelStack, target: VirtAddr) -> Result<(), MmError> {
        while stack.limit > target {
            let va = stack.limit - PAGE_SIZE;
            let index = stack.pte_index(self, va);
            self.commitment().charge_resident_available(1)?;
            let color = guard.color_for_node(stack.node, index);
            let frame = match self.take_zero_page(guard, color) {
                Ok(frame) => frame,
                Err(e) => {
                    self.commitment().return_resident_available(1);
                    return Err(e);
                }
            };
            let address = self.system_ptes().address(index);
            guard.activate(
                frame,
                address,
                PageUsage::KernelStack,
                Pte::DemandZero {
                    protection: Protection::READ_WRITE,
                },
                true,
            );
            guard.set_pte(
                address,
                Pte::Valid {
                    frame,
                    protection: Protection::READ_WRITE,
                    dirty: true,
                    global: false,
                },
            );
            stack.limit = va;
            MmStats::add(&self.stats().kernel_stack_resident, 1);
        }
        Ok(())
    }

    /// Grow the running stack of `thread` so that `bytes` below `sp` are
    /// committed.
    pub fn grow_kernel_stack(&self, thread: &Thread, sp: VirtAddr, bytes: u64) -> Result<(), MmError> {
        let mut stacks = thread.kernel_stacks();
        let Some(stack) = stacks.last_mut() else {
            return Err(MmError::InvalidAddress);
        };
        let target = sp
            .as_u64()
            .checked_sub(bytes)
            .map(|low| page_align_down(VirtAddr::new(low)))
            .ok_or(MmError::StackOverflow)?;
        if target >= stack.limit {
            return Ok(());
        }
        if target < stack.floor() {
            MmStats::bump(&self.stats().stack_growth_failures);
            log::warn!(
                "thread {}: kernel stack growth to {:#x} past floor {:#x}",
                thread.id(),
                target.as_u64(),
                stack.floor().as_u64()
            );
            return Err(MmError::StackOverflow);
        }

        let mut guard = self.pfn().lock();
        let result = self.extend_stack(&mut guard, stack, target);
        if let Err(e) = result {
            MmStats::bump(&self.stats().stack_growth_failures);
            log::warn!("thread {}: kernel stack growth stopped at {:#x}: {}", thread.id(), stack.limit.as_u64(), e);
            return Err(MmError::InsufficientMemory);
        }
        Ok(())
    }

    /// Release a kernel stack, caching it when it is small and all of its
    /// pages are resident on its node
    pub fn delete_kernel_stack(&self, stack: KernelStack) {
        let counter = if stack.large {
            &self.stats().large_stacks
        } else {
            &self.stats().small_stacks
        };
        MmStats::sub(counter, 1);

        let mut guard = self.pfn().lock();
        let guard_pte = guard.read_pte(self.system_ptes().address(stack.first_pte));
        if !guard_pte.is_zero() {
            bugcheck(BugCheck::MemoryManagement, [0x4701, guard_pte.raw(), u64::from(stack.first_pte), 0]);
        }

        if !stack.large && self.cacheable(&guard, &stack) {
            drop(guard);
            let node = stack.node;
            match self.dead_stacks().push(node, stack) {
                Ok(()) => return,
                Err(stack) => {
                    let mut guard = self.pfn().lock();
                    self.release_stack(&mut guard, stack);
                    return;
                }
            }
        }
        self.release_stack(&mut guard, stack);
    }

    fn cacheable(&self, guard: &PfnGuard<'_>, stack: &KernelStack) -> bool {
        let mut va = stack.limit;
        while va < stack.base {
            match guard.read_pte(self.system_ptes().address(stack.pte_index(self, va))) {
                Pte::Valid { frame, .. } if guard.entry(frame).node == stack.node => {}
                _ => return false,
            }
            va += PAGE_SIZE;
        }
        true
    }

    fn release_stack(&self, guard: &mut PfnGuard<'_>, stack: KernelStack) {
        let charged = self.free_stack_pages(guard, &stack);
        self.commitment().return_resident_available(charged);
        self.system_ptes().release(stack.first_pte, stack.total_ptes());
        self.commitment().return_commitment(u64::from(stack.total_ptes()));
        log::trace!("kernel stack {:#x} released", stack.base.as_u64());
    }

    /// Clear every stack PTE; returns how many held a charged page
    fn free_stack_pages(&self, guard: &mut PfnGuard<'_>, stack: &KernelStack) -> u64 {
        let mut flush = FlushList::new();
        let mut charged = 0;
        for index in stack.first_pte + 1..stack.first_pte + stack.total_ptes() {
            let address = self.system_ptes().address(index);
            let old = guard.set_pte(address, Pte::Zero);
            match old {
                Pte::Zero => continue,
                Pte::Valid { frame, .. } => {
                    flush.add(self.system_ptes().va(index));
                    guard.mark_deleted(frame);
                    guard.decrement_share(frame);
                    MmStats::sub(&self.stats().kernel_stack_resident, 1);
                }
                Pte::Transition { frame, .. } => guard.delete_unmapped(frame),
                Pte::PagingFile { slot, .. } => self.paging_file().release_backing_store(slot),
                Pte::DemandZero { .. } => {}
                Pte::Prototype { .. } => bugcheck(BugCheck::MemoryManagement, [0x4702, old.raw(), u64::from(index), 0]),
            }
            charged += 1;
        }
        flush.flush(self.stats());
        charged
    }

    /// Chain a new large segment in front of the thread's current stack
    pub fn push_stack_segment(&self, thread: &Thread, node: u8) -> Result<(), MmError> {
        let stack = self.create_kernel_stack(true, node)?;
        let mut stacks = thread.kernel_stacks();
        log::debug!("thread {}: stack segment {} at {:#x}", thread.id(), stacks.len(), stack.base.as_u64());
        stacks.push(stack);
        Ok(())
    }

    /// Drop the newest segment; the first one stays until the thread exits
    pub fn pop_stack_segment(&self, thread: &Thread) -> bool {
        let popped = {
            let mut stacks = thread.kernel_stacks();
            if stacks.len() < 2 {
                return false;
            }
            stacks.pop()
        };
        match popped {
            Some(stack) => {
                self.delete_kernel_stack(stack);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::config::MmConfig;
    use crate::memory::test_support::{manager, small_manager};

    #[test]
    fn test_small_stack_is_fully_committed_below_a_guard() {
        let (mm, _) = small_manager();
        let resident = mm.commitment().resident_available();
        let stack = mm.create_kernel_stack(false, 0).unwrap();
        assert_eq!(stack.committed_pages(), KERNEL_STACK_PAGES);
        assert_eq!(stack.limit, stack.floor());
        assert_eq!(mm.commitment().resident_available(), resident - KERNEL_STACK_PAGES as i64);
        let guard = mm.pfn().lock();
        assert!(guard.read_pte(mm.system_ptes().address(stack.first_pte)).is_zero());
        assert_eq!(guard.frames_with_usage(PageUsage::KernelStack), KERNEL_STACK_PAGES as usize);
    }

    #[test]
    fn test_dead_stack_is_reused() {
        let (mm, _) = small_manager();
        let stack = mm.create_kernel_stack(false, 0).unwrap();
        let base = stack.base;
        mm.delete_kernel_stack(stack);
        assert_eq!(mm.dead_stacks().len(0), 1);
        let again = mm.create_kernel_stack(false, 0).unwrap();
        assert_eq!(again.base, base);
        assert_eq!(mm.stats().snapshot().dead_stack_hits, 1);
    }

    #[test]
    fn test_full_cache_releases_the_stack() {
        let (mm, _) = manager(MmConfig::default().with_physical_pages(512).with_dead_stack_depth(1));
        let committed = mm.commitment().committed();
        let a = mm.create_kernel_stack(false, 0).unwrap();
        let b = mm.create_kernel_stack(false, 0).unwrap();
        mm.delete_kernel_stack(a);
        let in_use = mm.system_ptes().in_use();
        mm.delete_kernel_stack(b);
        assert_eq!(mm.dead_stacks().len(0), 1);
        assert_eq!(mm.system_ptes().in_use(), in_use - 7);
        assert_eq!(mm.commitment().committed(), committed + 7);
    }

    #[test]
    fn test_large_stack_grows_to_its_floor() {
        let (mm, _) = small_manager();
        let thread = Thread::new(None);
        let stack = mm.create_kernel_stack(true, 0).unwrap();
        assert_eq!(stack.committed_pages(), KERNEL_LARGE_STACK_COMMIT_PAGES);
        let (limit, floor) = (stack.limit, stack.floor());
        thread.set_kernel_stack(stack);

        mm.grow_kernel_stack(&thread, limit, 2 * PAGE_SIZE).unwrap();
        assert_eq!(thread.kernel_stack().unwrap().limit, limit - 2 * PAGE_SIZE);
        // Already satisfied
        mm.grow_kernel_stack(&thread, limit, PAGE_SIZE).unwrap();

        assert_eq!(
            mm.grow_kernel_stack(&thread, floor, PAGE_SIZE),
            Err(MmError::StackOverflow)
        );
        assert_eq!(mm.stats().snapshot().stack_growth_failures, 1);
        mm.grow_kernel_stack(&thread, floor + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(thread.kernel_stack().unwrap().limit, floor);
    }

    #[test]
    fn test_release_returns_every_charge() {
        let (mm, _) = small_manager();
        let committed = mm.commitment().committed();
        let resident = mm.commitment().resident_available();
        let in_use = mm.system_ptes().in_use();
        let thread = Thread::new(None);
        thread.set_kernel_stack(mm.create_kernel_stack(true, 0).unwrap());
        let limit = thread.kernel_stack().unwrap().limit;
        mm.grow_kernel_stack(&thread, limit, 3 * PAGE_SIZE).unwrap();
        for stack in thread.take_kernel_stacks() {
            mm.delete_kernel_stack(stack);
        }
        assert_eq!(mm.commitment().committed(), committed);
        assert_eq!(mm.commitment().resident_available(), resident);
        assert_eq!(mm.system_ptes().in_use(), in_use);
        assert_eq!(mm.stats().snapshot().kernel_stack_resident, 0);
        assert!(mm.pfn().lock().audit().is_ok());
    }

    #[test]
    fn test_failed_creation_returns_every_charge() {
        let (mm, _) = small_manager();
        let committed = mm.commitment().committed();
        let resident = mm.commitment().resident_available();
        let in_use = mm.system_ptes().in_use();

        // Leave fewer frames than a small stack needs
        let mut drained = Vec::new();
        {
            let mut guard = mm.pfn().lock();
            while guard.available_pages() > 3 {
                match guard.remove_any_page(0) {
                    Some(frame) => drained.push(frame),
                    None => break,
                }
            }
        }
        assert_eq!(mm.create_kernel_stack(false, 0), Err(MmError::InsufficientMemory));

        assert_eq!(mm.commitment().committed(), committed);
        assert_eq!(mm.commitment().resident_available(), resident);
        assert_eq!(mm.system_ptes().in_use(), in_use);
        assert_eq!(mm.stats().snapshot().kernel_stack_resident, 0);
        assert_eq!(mm.stats().snapshot().small_stacks, 0);
        let mut guard = mm.pfn().lock();
        assert_eq!(guard.available_pages(), 3);
        for frame in drained {
            guard.insert_free_page(frame);
        }
        assert!(guard.audit().is_ok());
    }

    #[test]
    fn test_segments_chain_and_unchain() {
        let (mm, _) = small_manager();
        let thread = Thread::new(None);
        thread.set_kernel_stack(mm.create_kernel_stack(false, 0).unwrap());
        assert!(!mm.pop_stack_segment(&thread));
        mm.push_stack_segment(&thread, 0).unwrap();
        assert_eq!(thread.stack_segments(), 2);
        assert!(thread.kernel_stack().unwrap().large);
        assert!(mm.pop_stack_segment(&thread));
        assert_eq!(thread.stack_segments(), 1);
    }
}
