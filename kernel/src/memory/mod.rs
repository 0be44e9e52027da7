//! Virtual-memory core
//!
//! [`MemoryManager`] owns every piece of shared state: the PFN database,
//! commitment counters, the system PTE pool, the dead kernel-stack cache,
//! the expansion list and statistics. The kernel installs one instance with
//! [`init`]; host tests build private ones with [`MemoryManager::new`].
//!
//! Lock order is address-space lock, then working-set lock, then the PFN
//! lock. Anything that blocks (paging I/O, waiting for free pages) drops
//! the PFN lock first.

pub mod access;
pub mod bugcheck;
pub mod commit;
pub mod config;
pub mod delete_range;
pub mod error;
pub mod fault;
pub mod fork_helpers;
pub mod frame_metadata;
pub mod hyperspace;
pub mod kernel_stack;
pub mod layout;
pub mod materialize;
pub mod modwriter;
pub mod page_table;
pub mod paging;
pub mod paging_file;
pub mod process_memory;
pub mod pte;
pub mod section;
pub mod stack;
pub mod stack_pager;
pub mod stats;
pub mod swap;
pub mod system_ptes;
pub mod teardown;
pub mod tlb;
pub mod vad;
pub mod virtual_alloc;
pub mod working_set;

use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use self::commit::Commitment;
use self::config::MmConfig;
use self::error::MmError;
use self::frame_metadata::{PageUsage, PfnDatabase, PfnGuard};
use self::hyperspace::HyperspaceWindow;
use self::kernel_stack::DeadStackCache;
use self::paging::HierarchyDepth;
use self::paging_file::BackingStore;
use self::pte::{Pfn, Protection, Pte, PteAddress, PteLocation};
use self::stats::MmStats;
use self::swap::ExpansionList;
use self::system_ptes::SystemPtePool;

pub use self::process_memory::AddressSpace;

/// Marker written to the first word of the shared user-data page
const SHARED_DATA_SIGNATURE: u64 = 0x5354_5241_5455_4D00;

pub struct MemoryManager {
    config: MmConfig,
    depth: &'static dyn HierarchyDepth,
    pfn: PfnDatabase,
    commit: Commitment,
    system_ptes: SystemPtePool,
    hyperspace: HyperspaceWindow,
    dead_stacks: DeadStackCache,
    expansion: Mutex<ExpansionList>,
    stats: MmStats,
    paging_file: Arc<dyn BackingStore>,
    system_top: Pfn,
    shared_user_data: Pfn,
    next_as_id: AtomicU32,
    track_locked_pages: AtomicBool,
}

impl MemoryManager {
    pub fn new(config: MmConfig, paging_file: Arc<dyn BackingStore>) -> Result<Self, MmError> {
        let depth = config.paging_depth.hierarchy();
        let entries = depth.entries_per_table();
        let pfn = PfnDatabase::new(&config, entries, paging_file.clone());
        let commit = Commitment::new(
            config.commit_limit,
            u64::from(config.physical_pages.saturating_sub(1)),
            config.resident_reserve,
        );

        let pool_tables = (config.system_ptes as usize).div_ceil(entries).max(1);
        let (system_top, shared_user_data, tables) = {
            let mut guard = pfn.lock();
            let top = guard.remove_zero_page(0).ok_or(MmError::InsufficientMemory)?;
            guard.activate(
                top,
                PteAddress::None,
                PageUsage::PageTable {
                    level: depth.levels() as u8,
                },
                Pte::Zero,
                true,
            );

            let mut tables = Vec::with_capacity(pool_tables);
            let span = depth.entry_span(2);
            for n in 0..pool_tables {
                let va = depth.system_pte_base() + n as u64 * span;
                let leaf = page_table::build_system_chain(&mut guard, depth, top, va)?;
                tables.push(leaf);
            }

            let shared = guard.remove_zero_page(0).ok_or(MmError::InsufficientMemory)?;
            guard.activate(shared, PteAddress::None, PageUsage::System, Pte::Zero, false);
            guard.write_word(shared, 0, SHARED_DATA_SIGNATURE);
            (top, shared, tables)
        };

        // System page tables and the shared page are never paged.
        let system_pages = pfn.lock().page_table_frames() as u64 + 1;
        commit.charge_resident_available(system_pages)?;

        let system_ptes = SystemPtePool::new(depth.system_pte_base(), config.system_ptes, entries, tables);
        let hyperspace = HyperspaceWindow::new(&system_ptes, config.hyperspace_slots)?;
        let dead_stacks = DeadStackCache::new(config.numa_nodes, config.dead_stack_depth);
        let track_locked_pages = AtomicBool::new(config.track_locked_pages);

        layout::log_layout(depth);
        log::info!(
            "Memory manager ready: {} frames, commit limit {} pages, {} system PTEs",
            config.physical_pages.saturating_sub(1),
            config.commit_limit,
            config.system_ptes
        );

        Ok(Self {
            config,
            depth,
            pfn,
            commit,
            system_ptes,
            hyperspace,
            dead_stacks,
            expansion: Mutex::new(ExpansionList::new()),
            stats: MmStats::new(),
            paging_file,
            system_top,
            shared_user_data,
            next_as_id: AtomicU32::new(1),
            track_locked_pages,
        })
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    pub fn depth(&self) -> &'static dyn HierarchyDepth {
        self.depth
    }

    pub fn pfn(&self) -> &PfnDatabase {
        &self.pfn
    }

    pub fn commitment(&self) -> &Commitment {
        &self.commit
    }

    pub fn stats(&self) -> &MmStats {
        &self.stats
    }

    pub fn system_ptes(&self) -> &SystemPtePool {
        &self.system_ptes
    }

    pub fn paging_file(&self) -> &Arc<dyn BackingStore> {
        &self.paging_file
    }

    pub fn system_top(&self) -> Pfn {
        self.system_top
    }

    pub fn shared_user_data_frame(&self) -> Pfn {
        self.shared_user_data
    }

    pub fn tracking_locked_pages(&self) -> bool {
        self.track_locked_pages.load(Ordering::Acquire)
    }

    pub(crate) fn enable_locked_page_tracking(&self) {
        self.track_locked_pages.store(true, Ordering::Release);
    }

    pub(crate) fn allocate_as_id(&self) -> pte::AsId {
        pte::AsId(self.next_as_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn expansion(&self) -> &Mutex<ExpansionList> {
        &self.expansion
    }

    pub(crate) fn hyperspace(&self) -> &HyperspaceWindow {
        &self.hyperspace
    }

    pub(crate) fn dead_stacks(&self) -> &DeadStackCache {
        &self.dead_stacks
    }

    /// Make sure `pages` frames can be removed.
    ///
    /// Below the low-water mark the PFN lock is released while modified
    /// pages are written out (turning them into repurposable standby pages),
    /// then the check is repeated a bounded number of times.
    pub(crate) fn ensure_available_pages(&self, guard: &mut PfnGuard<'_>, pages: usize) -> Result<(), MmError> {
        let needed = pages + self.config.low_water_pages;
        let retries = self.config.available_page_retries;
        for attempt in 0..=retries {
            if guard.available_pages() >= needed {
                return Ok(());
            }
            if attempt == retries {
                break;
            }
            log::debug!(
                "waiting for pages: {} available, {} needed (attempt {})",
                guard.available_pages(),
                needed,
                attempt + 1
            );
            guard.release_for(|| {
                self.write_modified_pages();
                core::hint::spin_loop();
            });
        }
        log::warn!("out of physical pages: {} needed", needed);
        Err(MmError::InsufficientMemory)
    }

    /// Remove a zero-filled frame, waiting for one if needed
    pub(crate) fn take_zero_page(&self, guard: &mut PfnGuard<'_>, color: u32) -> Result<Pfn, MmError> {
        self.ensure_available_pages(guard, 1)?;
        guard.remove_zero_page(color).ok_or(MmError::InsufficientMemory)
    }

    /// Remove a frame whose contents will be overwritten
    pub(crate) fn take_any_page(&self, guard: &mut PfnGuard<'_>, color: u32) -> Result<Pfn, MmError> {
        self.ensure_available_pages(guard, 1)?;
        guard.remove_any_page(color).ok_or(MmError::InsufficientMemory)
    }

    /// PTE slot of a system-space address
    pub(crate) fn system_pte_location(&self, va: x86_64::VirtAddr) -> Option<PteLocation> {
        self.system_ptes.index_of(va).map(|index| self.system_ptes.location(index))
    }

    /// Copy the system half of the top-level directory into `top`.
    ///
    /// The copies are global: they are never counted against the process
    /// top page.
    pub(crate) fn copy_system_mappings(&self, guard: &mut PfnGuard<'_>, top: Pfn) {
        let entries = guard.table_entries(self.system_top);
        let first = self.depth.first_system_top_index();
        for (index, pte) in entries.iter().enumerate().skip(first) {
            if index == self.depth.self_map_index() || index == self.depth.hyperspace_index() {
                continue;
            }
            if let Pte::Valid {
                frame, protection, ..
            } = *pte
            {
                guard.set_pte(
                    PteAddress::table(top, index),
                    Pte::Valid {
                        frame,
                        protection,
                        dirty: false,
                        global: true,
                    },
                );
            }
        }
    }
}

static MEMORY_MANAGER: OnceCell<MemoryManager> = OnceCell::uninit();

/// Initialize the kernel-wide memory manager
pub fn init(config: MmConfig, paging_file: Arc<dyn BackingStore>) -> Result<&'static MemoryManager, MmError> {
    log::info!("Initializing memory management...");
    let manager = MemoryManager::new(config, paging_file)?;
    if MEMORY_MANAGER.try_init_once(|| manager).is_err() {
        log::warn!("memory manager already initialized");
        return Err(MmError::InvalidLifecycle);
    }
    mm().ok_or(MmError::InvalidLifecycle)
}

/// The kernel-wide memory manager, once [`init`] has run
pub fn mm() -> Option<&'static MemoryManager> {
    MEMORY_MANAGER.get()
}

/// Protection used for page-table and skeleton pages
pub(crate) const TABLE_PROTECTION: Protection = Protection::READ_WRITE;


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::memory::config::PagingDepth;

    #[test]
    fn test_new_manager_builds_system_tables() {
        for depth in [PagingDepth::Two, PagingDepth::Three, PagingDepth::Four] {
            let (mm, _) = manager(MmConfig::default().with_paging_depth(depth));
            let guard = mm.pfn().lock();
            // One chain of tables from the top down to the pool's leaf tables.
            assert!(guard.page_table_frames() >= depth.hierarchy().levels());
            assert!(guard.audit().is_ok());
            let loc = mm.system_ptes().location(0);
            assert!(matches!(guard.entry(loc.table).usage, PageUsage::PageTable { level: 1 }));
        }
    }

    #[test]
    fn test_ensure_available_pages_fails_when_exhausted() {
        let (mm, _) = manager(MmConfig::default().with_physical_pages(16));
        let mut guard = mm.pfn().lock();
        while guard.remove_any_page(0).is_some() {}
        assert_eq!(mm.ensure_available_pages(&mut guard, 1), Err(MmError::InsufficientMemory));
    }
}
