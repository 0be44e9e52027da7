//! Address-space, kernel-stack and swap scenarios against a host-built
//! memory manager
//!
//! Run with: cargo test -p stratum-kernel --test memory_tests

use std::sync::Arc;

use kernel::memory::access::TrapContext;
use kernel::memory::config::{MmConfig, PagingDepth};
use kernel::memory::layout::{PAGE_SIZE, SHARED_USER_DATA_VA};
use kernel::memory::paging::HierarchyDepth;
use kernel::memory::paging_file::MemoryPagingFile;
use kernel::memory::pte::{Pfn, Protection, Pte};
use kernel::memory::AddressSpace;
use kernel::task::thread::{PreviousMode, Thread};
use kernel::{FaultStatus, MemoryManager};
use x86_64::VirtAddr;

fn manager(depth: PagingDepth) -> (MemoryManager, Arc<MemoryPagingFile>) {
    let file = Arc::new(MemoryPagingFile::new(0, 256));
    let config = MmConfig::default()
        .with_paging_depth(depth)
        .with_physical_pages(768)
        .with_commit_limit(4096);
    (MemoryManager::new(config, file.clone()).unwrap(), file)
}

fn ready(mm: &MemoryManager) -> Arc<AddressSpace> {
    let space = mm.create_address_space(20).unwrap();
    mm.finish_address_space(&space, None, None).unwrap();
    space
}

fn touch(mm: &MemoryManager, thread: &Thread, va: VirtAddr, write: bool) -> FaultStatus {
    mm.handle_page_fault(thread, va, write, PreviousMode::User, TrapContext::default())
        .unwrap()
}

/// Tables from the top down to the leaf covering `va`
fn table_path(mm: &MemoryManager, space: &AddressSpace, va: VirtAddr) -> Vec<Pfn> {
    let depth = mm.depth();
    let guard = mm.pfn().lock();
    let mut path = vec![space.top_frame().unwrap()];
    for level in (2..=depth.levels()).rev() {
        let table = *path.last().unwrap();
        match guard.table_entries(table)[depth.index(va, level)] {
            Pte::Valid { frame, .. } => path.push(frame),
            _ => break,
        }
    }
    path
}

fn leaf(mm: &MemoryManager, space: &AddressSpace, va: VirtAddr) -> Pte {
    let depth = mm.depth();
    let path = table_path(mm, space, va);
    if path.len() < depth.levels() {
        return Pte::Zero;
    }
    let table = *path.last().unwrap();
    mm.pfn().lock().table_entries(table)[depth.index(va, 1)]
}

#[test]
fn test_delete_range_reclaims_an_emptied_table() {
    let (mm, _) = manager(PagingDepth::Four);
    let space = ready(&mm);
    let thread = Thread::new(Some(space.clone()));
    let span = mm.depth().entry_span(2);
    let pages = span / PAGE_SIZE;

    // Two neighbouring leaf tables under the same parent
    let first = VirtAddr::new(0x4000_0000);
    let second = first + span;
    mm.allocate_virtual_memory(&space, Some(first), pages, Protection::READ_WRITE, true)
        .unwrap();
    mm.allocate_virtual_memory(&space, Some(second), 1, Protection::READ_WRITE, true)
        .unwrap();
    for offset in [0, 17, pages - 1] {
        assert_eq!(touch(&mm, &thread, first + offset * PAGE_SIZE, true), FaultStatus::Success);
    }
    assert_eq!(touch(&mm, &thread, second, true), FaultStatus::Success);

    let path = table_path(&mm, &space, first);
    assert_eq!(path.len(), mm.depth().levels());
    let (parent, table) = (path[path.len() - 2], path[path.len() - 1]);
    assert_eq!(table_path(&mm, &space, second)[path.len() - 2], parent);
    let parent_share = mm.pfn().lock().entry(parent).share_count;
    let tables = mm.pfn().lock().page_table_frames();

    assert_eq!(mm.free_virtual_memory(&space, first), Ok(pages));
    let guard = mm.pfn().lock();
    assert_eq!(guard.entry(parent).share_count, parent_share - 1);
    assert_eq!(guard.page_table_frames(), tables - 1);
    assert_eq!(guard.entry(table).share_count, 0);
    assert!(guard.audit().is_ok());
    drop(guard);
    assert_eq!(space.working_set_size(), 1);
}

#[test]
fn test_write_to_read_only_page() {
    let (mm, _) = manager(PagingDepth::Four);
    let space = ready(&mm);
    let thread = Thread::new(Some(space.clone()));
    let shared = VirtAddr::new(SHARED_USER_DATA_VA);
    assert_eq!(touch(&mm, &thread, shared, false), FaultStatus::Success);
    assert!(leaf(&mm, &space, shared).is_valid());
    // Same valid entry, now written
    assert_eq!(touch(&mm, &thread, shared, true), FaultStatus::AccessViolation);
    assert_eq!(touch(&mm, &thread, shared, false), FaultStatus::Success);
}

#[test]
fn test_user_fault_on_system_address() {
    let (mm, _) = manager(PagingDepth::Four);
    let space = ready(&mm);
    let thread = Thread::new(Some(space));
    let boundary = mm.depth().user_boundary();
    assert_eq!(touch(&mm, &thread, boundary, false), FaultStatus::AccessViolation);
}

#[test]
fn test_teardown_is_idempotent_on_every_depth() {
    for depth in [PagingDepth::Two, PagingDepth::Three, PagingDepth::Four] {
        let (mm, file) = manager(depth);
        let committed = mm.commitment().committed();
        let resident = mm.commitment().resident_available();
        let free = mm.pfn().lock().available_pages();

        let space = ready(&mm);
        let thread = Thread::new(Some(space.clone()));
        let va = mm
            .allocate_virtual_memory(&space, None, 16, Protection::READ_WRITE, true)
            .unwrap();
        for n in 0..16 {
            touch(&mm, &thread, va + n * PAGE_SIZE, true);
        }
        mm.trim_working_set(&space).unwrap();
        mm.write_modified_pages();
        for n in 0..4 {
            touch(&mm, &thread, va + n * PAGE_SIZE, false);
        }

        for _ in 0..2 {
            mm.clean_address_space(&space);
            mm.destroy_address_space(&space);
        }
        assert_eq!(mm.commitment().committed(), committed, "{:?}", depth);
        assert_eq!(mm.commitment().resident_available(), resident, "{:?}", depth);
        assert_eq!(mm.pfn().lock().available_pages(), free, "{:?}", depth);
        assert_eq!(file.slots_in_use(), 0, "{:?}", depth);
        assert!(mm.pfn().lock().audit().is_ok());
    }
}

#[test]
fn test_failed_finish_unwinds_in_destroy() {
    let (mm, _) = manager(PagingDepth::Four);
    let committed = mm.commitment().committed();
    let space = mm.create_address_space(20).unwrap();
    // Finishing twice is refused; teardown still unwinds the first one
    mm.finish_address_space(&space, None, None).unwrap();
    assert!(mm.finish_address_space(&space, None, None).is_err());
    mm.clean_address_space(&space);
    mm.destroy_address_space(&space);
    assert_eq!(mm.commitment().committed(), committed);

    // A skeleton that never became full is destroyed without cleaning
    let skeleton = mm.create_address_space(20).unwrap();
    mm.clean_address_space(&skeleton);
    mm.destroy_address_space(&skeleton);
    assert_eq!(mm.commitment().committed(), committed);
}

#[test]
fn test_swap_round_trip_keeps_top_and_contents() {
    let (mm, _) = manager(PagingDepth::Four);
    let space = ready(&mm);
    let thread = Thread::new(Some(space.clone()));
    let va = mm
        .allocate_virtual_memory(&space, None, 2, Protection::READ_WRITE, true)
        .unwrap();
    touch(&mm, &thread, va, true);
    let frame = leaf(&mm, &space, va).frame().unwrap();
    mm.pfn().lock().write_word(frame, 5, 0xabcd);
    let top = space.top_frame();

    // Not trimmed yet: refused
    assert!(!mm.swap_out_process(&space));
    mm.trim_working_set(&space).unwrap();
    assert!(mm.swap_out_process(&space));
    assert!(space.is_outswapped());
    assert_eq!(space.top_frame(), None);
    assert_eq!(mm.stats().snapshot().outswapped_processes, 1);

    mm.swap_in_process(&space).unwrap();
    assert!(!space.is_outswapped());
    assert_eq!(space.top_frame(), top);
    assert_eq!(touch(&mm, &thread, va, false), FaultStatus::Success);
    let frame = leaf(&mm, &space, va).frame().unwrap();
    assert_eq!(mm.pfn().lock().read_word(frame, 5), 0xabcd);
}

#[test]
fn test_fault_swaps_the_process_back_in() {
    let (mm, _) = manager(PagingDepth::Three);
    let space = ready(&mm);
    let thread = Thread::new(Some(space.clone()));
    let va = mm
        .allocate_virtual_memory(&space, None, 1, Protection::READ_WRITE, true)
        .unwrap();
    touch(&mm, &thread, va, true);
    mm.trim_working_set(&space).unwrap();
    assert!(mm.swap_out_process(&space));
    // Written out while the process was away
    mm.write_modified_pages();

    assert_eq!(touch(&mm, &thread, va, false), FaultStatus::Success);
    assert!(!space.is_outswapped());
    assert!(mm.pfn().lock().audit().is_ok());
}

#[test]
fn test_kernel_stack_evict_restore_round_trip() {
    let (mm, _) = manager(PagingDepth::Four);
    let thread = Thread::new(None);
    thread.set_kernel_stack(mm.create_kernel_stack(false, 0).unwrap());
    let stack = thread.kernel_stack().unwrap();
    thread.set_kernel_stack_pointer(stack.base - 3 * PAGE_SIZE + 0x80);

    let valid_before = valid_stack_pages(&mm, &thread);
    mm.evict_kernel_stack(&thread);
    mm.write_modified_pages();
    mm.restore_kernel_stack(&thread).unwrap();
    assert_eq!(valid_stack_pages(&mm, &thread), valid_before);

    for stack in thread.take_kernel_stacks() {
        mm.delete_kernel_stack(stack);
    }
    assert!(mm.pfn().lock().audit().is_ok());
}

fn valid_stack_pages(mm: &MemoryManager, thread: &Thread) -> Vec<VirtAddr> {
    let stack = thread.kernel_stack().unwrap();
    let mut pages = Vec::new();
    let mut va = stack.limit;
    while va < stack.base {
        let index = mm.system_ptes().index_of(va).unwrap();
        if mm.pfn().lock().read_pte(mm.system_ptes().address(index)).is_valid() {
            pages.push(va);
        }
        va += PAGE_SIZE;
    }
    pages
}
