//! User stack guard-page behavior through the public fault entry point
//!
//! Run with: cargo test -p stratum-kernel --test guard_page_tests

use std::sync::Arc;

use kernel::memory::access::TrapContext;
use kernel::memory::config::MmConfig;
use kernel::memory::layout::PAGE_SIZE;
use kernel::memory::paging::HierarchyDepth;
use kernel::memory::paging_file::MemoryPagingFile;
use kernel::memory::pte::{Protection, Pte};
use kernel::memory::AddressSpace;
use kernel::task::thread::{PreviousMode, Thread};
use kernel::{FaultStatus, MemoryManager, MmError};
use x86_64::VirtAddr;

fn setup(config: MmConfig) -> (MemoryManager, Arc<AddressSpace>, Thread) {
    let mm = MemoryManager::new(config, Arc::new(MemoryPagingFile::new(0, 64))).unwrap();
    let space = mm.create_address_space(20).unwrap();
    mm.finish_address_space(&space, None, None).unwrap();
    let thread = Thread::new(Some(space.clone()));
    (mm, space, thread)
}

fn small() -> MmConfig {
    MmConfig::default().with_physical_pages(512).with_commit_limit(2048)
}

fn fault(mm: &MemoryManager, thread: &Thread, va: VirtAddr) -> FaultStatus {
    mm.handle_page_fault(thread, va, true, PreviousMode::User, TrapContext::default())
        .unwrap()
}

/// Leaf entry for `va`, walked through the public table snapshots
fn leaf(mm: &MemoryManager, space: &AddressSpace, va: VirtAddr) -> Pte {
    let depth = mm.depth();
    let guard = mm.pfn().lock();
    let mut table = space.top_frame().unwrap();
    for level in (2..=depth.levels()).rev() {
        match guard.table_entries(table)[depth.index(va, level)] {
            Pte::Valid { frame, .. } => table = frame,
            _ => return Pte::Zero,
        }
    }
    guard.table_entries(table)[depth.index(va, 1)]
}

#[test]
fn test_guard_page_slides_down_with_headroom() {
    let (mm, space, thread) = setup(small());
    // One committed page, the guard below it, and room for one more guard
    // above the deallocation page
    let bounds = mm.create_user_stack(&space, &thread, 5, 1, 0).unwrap();
    let base = bounds.base;
    assert_eq!(bounds.limit, base - PAGE_SIZE);

    let guard_page = base - 2 * PAGE_SIZE;
    assert_eq!(fault(&mm, &thread, guard_page), FaultStatus::GuardPageViolation);

    let teb = thread.teb.probe_read().unwrap();
    assert_eq!(teb.stack.limit, guard_page);
    assert_eq!(
        leaf(&mm, &space, base - 3 * PAGE_SIZE),
        Pte::DemandZero {
            protection: Protection::READ_WRITE | Protection::GUARD
        }
    );
    // The retried access goes through
    assert_eq!(fault(&mm, &thread, guard_page), FaultStatus::Success);
    assert!(leaf(&mm, &space, guard_page).is_valid());
}

#[test]
fn test_no_headroom_reports_overflow() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 4, 1, 0).unwrap();
    let base = bounds.base;

    assert_eq!(fault(&mm, &thread, base - 2 * PAGE_SIZE), FaultStatus::StackOverflow);
    // The old guard page and everything down to the deallocation page is
    // plain read-write memory now
    let plain = Pte::DemandZero {
        protection: Protection::READ_WRITE,
    };
    assert_eq!(leaf(&mm, &space, base - 2 * PAGE_SIZE), plain);
    assert_eq!(leaf(&mm, &space, base - 3 * PAGE_SIZE), plain);
    assert!(leaf(&mm, &space, bounds.deallocation).is_zero());
    assert_eq!(thread.teb.probe_read().unwrap().stack.limit, base - PAGE_SIZE);
}

#[test]
fn test_stack_grows_repeatedly_until_overflow() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 8, 1, 0).unwrap();
    let mut statuses = Vec::new();
    let mut va = bounds.base - 2 * PAGE_SIZE;
    loop {
        let status = fault(&mm, &thread, va);
        statuses.push(status);
        if status == FaultStatus::StackOverflow {
            break;
        }
        assert_eq!(status, FaultStatus::GuardPageViolation);
        va -= PAGE_SIZE;
    }
    // Hits at base-2P through base-5P slide the guard; at base-6P the next
    // guard would land on the page above the deallocation page.
    assert_eq!(statuses.len(), 5);
    assert_eq!(mm.stats().snapshot().stack_growth_failures, 0);
}

#[test]
fn test_guard_commit_failure_is_an_error() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 5, 1, 0).unwrap();
    let base = bounds.base;
    let rest = mm.commitment().limit() - mm.commitment().committed();
    mm.commitment().charge_commitment(rest).unwrap();

    let guard_page = base - 2 * PAGE_SIZE;
    assert_eq!(
        mm.handle_page_fault(&thread, guard_page, true, PreviousMode::User, TrapContext::default()),
        Err(MmError::CommitmentExceeded)
    );
    // No new guard and no limit change
    assert!(leaf(&mm, &space, base - 3 * PAGE_SIZE).is_zero());
    assert_eq!(thread.teb.probe_read().unwrap().stack.limit, base - PAGE_SIZE);

    // The old guard was consumed, so the retry is an ordinary fault
    mm.commitment().return_commitment(rest);
    assert_eq!(fault(&mm, &thread, guard_page), FaultStatus::Success);
}

#[test]
fn test_guarantee_keeps_two_guard_pages() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 8, 1, 4096).unwrap();
    let base = bounds.base;
    let guarded = Pte::DemandZero {
        protection: Protection::READ_WRITE | Protection::GUARD,
    };
    assert_eq!(leaf(&mm, &space, base - 2 * PAGE_SIZE), guarded);
    assert_eq!(leaf(&mm, &space, base - 3 * PAGE_SIZE), guarded);

    // Both guard pages now sit right below the page that was hit
    assert_eq!(fault(&mm, &thread, base - 2 * PAGE_SIZE), FaultStatus::GuardPageViolation);
    assert_eq!(leaf(&mm, &space, base - 3 * PAGE_SIZE), guarded);
    assert_eq!(leaf(&mm, &space, base - 4 * PAGE_SIZE), guarded);
    assert!(leaf(&mm, &space, base - 5 * PAGE_SIZE).is_zero());
    assert_eq!(thread.teb.probe_read().unwrap().stack.limit, base - 2 * PAGE_SIZE);
}

#[test]
fn test_unreadable_bounds_degrade_to_guard_signal() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 5, 1, 0).unwrap();
    thread.teb.set_accessible(false);
    assert_eq!(
        fault(&mm, &thread, bounds.base - 2 * PAGE_SIZE),
        FaultStatus::GuardPageViolation
    );
    // Nothing was grown
    assert!(leaf(&mm, &space, bounds.base - 3 * PAGE_SIZE).is_zero());
}

#[test]
fn test_extension_disabled_strips_guards() {
    let (mm, space, thread) = setup(small().with_stack_extension_disabled(true));
    let bounds = mm.create_user_stack(&space, &thread, 8, 1, 4096).unwrap();
    let base = bounds.base;
    assert_eq!(fault(&mm, &thread, base - 2 * PAGE_SIZE), FaultStatus::StackOverflow);
    assert_eq!(
        leaf(&mm, &space, base - 3 * PAGE_SIZE),
        Pte::DemandZero {
            protection: Protection::READ_WRITE
        }
    );
}

#[test]
fn test_guard_hit_while_attached_is_access_violation() {
    let (mm, space, thread) = setup(small());
    let bounds = mm.create_user_stack(&space, &thread, 5, 1, 0).unwrap();
    let other = mm.create_address_space(20).unwrap();
    mm.finish_address_space(&other, None, None).unwrap();
    let visitor = Thread::new(Some(other));
    visitor.attach(space.clone());
    assert_eq!(
        fault(&mm, &visitor, bounds.base - 2 * PAGE_SIZE),
        FaultStatus::AccessViolation
    );
    // The guard is still armed for the owner
    assert_eq!(
        fault(&mm, &thread, bounds.base - 2 * PAGE_SIZE),
        FaultStatus::GuardPageViolation
    );
}
