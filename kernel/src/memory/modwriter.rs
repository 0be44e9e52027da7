//! Modified page writer
//!
//! Moves dirty transition pages to the paging file so they become standby
//! pages that can be repurposed. A write holds an extra reference on the
//! frame; whoever reclaims or deletes the frame in the meantime leaves the
//! slot to the completion.

use super::frame_metadata::{original_protection, FrameContent, PageState, PfnGuard};
use super::paging_file::IoStatus;
use super::pte::{PagingSlot, Pfn, Pte};
use super::stats::MmStats;
use super::MemoryManager;

/// A page write in flight
#[derive(Debug)]
#[must_use]
pub struct PageWrite {
    pub frame: Pfn,
    pub slot: PagingSlot,
    content: FrameContent,
}

impl PageWrite {
    pub fn content(&self) -> &FrameContent {
        &self.content
    }
}

impl MemoryManager {
    /// Start writing a modified frame.
    ///
    /// Returns `None` if the frame is not on the modified list or the
    /// paging file is full.
    pub fn begin_page_write(&self, guard: &mut PfnGuard<'_>, frame: Pfn) -> Option<PageWrite> {
        let entry = guard.entry(frame);
        if entry.state != PageState::Modified || entry.write_in_progress {
            return None;
        }
        let Some(slot) = self.paging_file().allocate_slot() else {
            log::warn!("paging file full, {} stays modified", frame);
            return None;
        };
        guard.unlink_from_list(frame);
        guard.add_reference(frame);
        let entry = guard.entry_mut(frame);
        entry.state = PageState::Transition;
        entry.write_in_progress = true;
        entry.modified = false;
        let content = guard.content(frame).clone();
        log::trace!("writing {} to {:?}", frame, slot);
        Some(PageWrite { frame, slot, content })
    }

    /// Finish a write started by [`MemoryManager::begin_page_write`].
    ///
    /// On success the slot becomes the frame's original PTE unless the
    /// frame was deleted or dirtied again meanwhile, in which case the slot
    /// is released.
    pub fn complete_page_write(&self, write: PageWrite, status: IoStatus) {
        let mut guard = self.pfn().lock();
        let frame = write.frame;
        let entry = guard.entry_mut(frame);
        entry.write_in_progress = false;
        let keep_slot = status == IoStatus::Success && !entry.deleted && !entry.modified;
        if keep_slot {
            let protection = original_protection(&entry.original_pte);
            entry.original_pte = Pte::PagingFile {
                slot: write.slot,
                protection,
            };
            MmStats::bump(&self.stats().pages_written);
        } else {
            if status != IoStatus::Success {
                log::warn!("write of {} to {:?} failed: {:?}", frame, write.slot, status);
                entry.modified = true;
            }
            self.paging_file().release_backing_store(write.slot);
        }
        guard.decrement_reference(frame);
    }

    /// Write out everything on the modified list; returns pages written
    pub fn write_modified_pages(&self) -> usize {
        let budget = self.pfn().lock().modified_pages();
        let mut written = 0;
        for _ in 0..budget {
            let write = {
                let mut guard = self.pfn().lock();
                let Some(frame) = guard.modified_head() else {
                    break;
                };
                match self.begin_page_write(&mut guard, frame) {
                    Some(write) => write,
                    None => break,
                }
            };
            let status = self.paging_file().write_page(write.slot, write.content());
            let failed = status != IoStatus::Success;
            self.complete_page_write(write, status);
            if failed {
                break;
            }
            written += 1;
        }
        if written > 0 {
            log::debug!("modified writer: {} pages written", written);
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_metadata::PageUsage;
    use crate::memory::paging_file::BackingStore;
    use crate::memory::pte::{Protection, PteAddress};
    use crate::memory::test_support::small_manager;

    fn modified_frame(mm: &MemoryManager) -> Pfn {
        let mut guard = mm.pfn().lock();
        let frame = guard.remove_zero_page(0).unwrap();
        guard.activate(
            frame,
            PteAddress::None,
            PageUsage::ProcessPrivate,
            Pte::DemandZero {
                protection: Protection::READ_WRITE,
            },
            true,
        );
        guard.write_word(frame, 0, 42);
        guard.decrement_share(frame);
        frame
    }

    #[test]
    fn test_written_page_becomes_standby_with_slot() {
        let (mm, file) = small_manager();
        let frame = modified_frame(&mm);
        assert_eq!(mm.write_modified_pages(), 1);
        let guard = mm.pfn().lock();
        assert_eq!(guard.entry(frame).state, PageState::Standby);
        assert!(matches!(guard.entry(frame).original_pte, Pte::PagingFile { .. }));
        assert_eq!(file.slots_in_use(), 1);
        assert_eq!(mm.stats().snapshot().pages_written, 1);
    }

    #[test]
    fn test_delete_during_write_releases_slot() {
        let (mm, file) = small_manager();
        let frame = modified_frame(&mm);
        let write = {
            let mut guard = mm.pfn().lock();
            let write = mm.begin_page_write(&mut guard, frame).unwrap();
            guard.delete_unmapped(frame);
            // The write's reference keeps the frame off the free list.
            assert_eq!(guard.entry(frame).state, PageState::Transition);
            write
        };
        let status = file.write_page(write.slot, write.content());
        mm.complete_page_write(write, status);
        let guard = mm.pfn().lock();
        assert_eq!(guard.entry(frame).state, PageState::Free);
        assert_eq!(file.slots_in_use(), 0);
        assert!(guard.audit().is_ok());
    }

    #[test]
    fn test_failed_write_keeps_page_modified() {
        let (mm, file) = small_manager();
        let frame = modified_frame(&mm);
        file.fail_writes(true);
        assert_eq!(mm.write_modified_pages(), 0);
        let guard = mm.pfn().lock();
        assert_eq!(guard.entry(frame).state, PageState::Modified);
        assert_eq!(file.slots_in_use(), 0);
    }
}
