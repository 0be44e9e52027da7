//! Property tests: whatever a process does to its memory, tearing it down
//! gives every frame, commitment charge and paging-file slot back.

use std::sync::Arc;

use kernel::memory::access::TrapContext;
use kernel::memory::config::MmConfig;
use kernel::memory::layout::PAGE_SIZE;
use kernel::memory::paging_file::MemoryPagingFile;
use kernel::memory::pte::Protection;
use kernel::task::thread::{PreviousMode, Thread};
use kernel::MemoryManager;
use proptest::prelude::*;
use x86_64::VirtAddr;

#[derive(Debug, Clone)]
enum Op {
    Allocate { pages: u64, commit: bool },
    Commit { region: usize },
    Touch { region: usize, page: u64, write: bool },
    Trim,
    WriteOut,
    Free { region: usize },
    Fork,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => (1u64..8, any::<bool>()).prop_map(|(pages, commit)| Op::Allocate { pages, commit }),
        1 => (0usize..8).prop_map(|region| Op::Commit { region }),
        4 => (0usize..8, 0u64..8, any::<bool>()).prop_map(|(region, page, write)| Op::Touch { region, page, write }),
        1 => Just(Op::Trim),
        1 => Just(Op::WriteOut),
        1 => (0usize..8).prop_map(|region| Op::Free { region }),
        1 => Just(Op::Fork),
    ]
}

fn manager() -> (MemoryManager, Arc<MemoryPagingFile>) {
    let file = Arc::new(MemoryPagingFile::new(0, 256));
    let config = MmConfig::default().with_physical_pages(768).with_commit_limit(4096);
    (MemoryManager::new(config, file.clone()).unwrap(), file)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn teardown_returns_everything(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (mm, file) = manager();
        let committed = mm.commitment().committed();
        let resident = mm.commitment().resident_available();
        let free = mm.pfn().lock().available_pages();

        let space = mm.create_address_space(20).unwrap();
        mm.finish_address_space(&space, None, None).unwrap();
        let thread = Thread::new(Some(space.clone()));
        let mut regions: Vec<(VirtAddr, u64)> = Vec::new();
        let mut children = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { pages, commit } => {
                    if let Ok(va) = mm.allocate_virtual_memory(&space, None, pages, Protection::READ_WRITE, commit) {
                        regions.push((va, pages));
                    }
                }
                Op::Commit { region } => {
                    if let Some(&(va, pages)) = regions.get(region) {
                        let _ = mm.commit_pages(&space, va, pages, Protection::READ_WRITE);
                    }
                }
                Op::Touch { region, page, write } => {
                    if let Some(&(va, pages)) = regions.get(region) {
                        let at = va + (page % pages) * PAGE_SIZE;
                        let _ = mm.handle_page_fault(&thread, at, write, PreviousMode::User, TrapContext::default());
                    }
                }
                Op::Trim => {
                    let _ = mm.trim_working_set(&space);
                }
                Op::WriteOut => {
                    mm.write_modified_pages();
                }
                Op::Free { region } => {
                    if region < regions.len() {
                        let (va, _) = regions.remove(region);
                        prop_assert!(mm.free_virtual_memory(&space, va).is_ok());
                    }
                }
                Op::Fork => {
                    let child = mm.create_address_space(20).unwrap();
                    if mm.finish_address_space(&child, Some(&space), None).is_ok() {
                        children.push(child);
                    } else {
                        mm.destroy_address_space(&child);
                    }
                }
            }
            prop_assert!(mm.pfn().lock().audit().is_ok());
        }

        for doomed in children.iter().chain(std::iter::once(&space)) {
            mm.clean_address_space(doomed);
            mm.destroy_address_space(doomed);
        }
        prop_assert_eq!(mm.commitment().committed(), committed);
        prop_assert_eq!(mm.commitment().resident_available(), resident);
        prop_assert_eq!(mm.pfn().lock().available_pages(), free);
        prop_assert_eq!(mm.pfn().lock().clone_block_count(), 0);
        prop_assert_eq!(file.slots_in_use(), 0);
        prop_assert!(mm.pfn().lock().audit().is_ok());
    }
}
