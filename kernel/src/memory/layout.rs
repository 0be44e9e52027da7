//! Fixed memory-manager layout constants
//!
//! Page geometry, kernel stack sizes and the handful of fixed user-space
//! addresses every address space shares. Per-depth virtual layouts live in
//! [`super::paging`].

use super::paging::HierarchyDepth;
use x86_64::VirtAddr;

/// Size of a page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u64 = 12;

/// 64-bit words per page
pub const WORDS_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;

/// Committed pages in a small kernel stack
pub const KERNEL_STACK_PAGES: u64 = 6;

/// Reserved pages in a large kernel stack
pub const KERNEL_LARGE_STACK_PAGES: u64 = 18;

/// Pages committed when a large kernel stack is created
pub const KERNEL_LARGE_STACK_COMMIT_PAGES: u64 = 6;

/// Guard pages below every kernel stack
pub const KERNEL_STACK_GUARD_PAGES: u64 = 1;

/// Largest number of individual TLB entries flushed before falling back to
/// flushing the entire TLB
pub const MM_MAXIMUM_FLUSH_COUNT: usize = 16;

/// User-mode alias of the shared system data page
pub const SHARED_USER_DATA_VA: u64 = 0x7FFE_0000;

/// Start of the reserved compatibility region on wide-address layouts
pub const COMPAT_REGION_START: u64 = 0x7FFE_1000;

/// End (exclusive) of the reserved compatibility region
pub const COMPAT_REGION_END: u64 = 0x7FFF_0000;

/// Hyperspace leaf slot holding the VAD commit bitmap page
pub const VAD_BITMAP_SLOT: usize = 0;

/// Hyperspace leaf slot holding the working-set list page
pub const WORKING_SET_LIST_SLOT: usize = 1;

/// Lowest user address handed out when the caller does not pick one
pub const USER_ALLOCATION_BASE: u64 = 0x0001_0000;

/// Round a byte count up to whole pages
#[inline]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE - 1) >> PAGE_SHIFT
}

/// Page-align an address downward
#[inline]
pub fn page_align_down(addr: VirtAddr) -> VirtAddr {
    addr.align_down(PAGE_SIZE)
}

/// Log the layout the manager was configured with
pub fn log_layout(depth: &dyn HierarchyDepth) {
    log::info!("MM LAYOUT: {}-level hierarchy, {} entries per table", depth.levels(), depth.entries_per_table());
    log::info!("  user boundary:      {:#x}", depth.user_boundary().as_u64());
    log::info!("  system PTE base:    {:#x}", depth.system_pte_base().as_u64());
    log::info!("  self-map index:     {:#x}", depth.self_map_index());
    log::info!("  hyperspace index:   {:#x}", depth.hyperspace_index());
    log::info!(
        "  kernel stacks: {} pages small, {} reserved / {} committed large, {} guard",
        KERNEL_STACK_PAGES,
        KERNEL_LARGE_STACK_PAGES,
        KERNEL_LARGE_STACK_COMMIT_PAGES,
        KERNEL_STACK_GUARD_PAGES
    );
}
