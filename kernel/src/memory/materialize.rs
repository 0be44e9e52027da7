//! Making an invalid PTE valid again
//!
//! Shared by the user fault path, swap-in and kernel-stack restore. The
//! caller owns the PTE (it holds the working-set lock or the thread is not
//! running) and writes the returned valid entry with `set_pte`.

use super::bugcheck::{bugcheck, BugCheck};
use super::error::MmError;
use super::frame_metadata::{FrameContent, PageState, PageUsage, PfnGuard};
use super::paging_file::IoStatus;
use super::pte::{PagingSlot, Pfn, Protection, Pte, PteAddress};
use super::stats::MmStats;
use super::MemoryManager;

/// State of one synchronous in-page read, owned by the faulting thread
struct InPageRead {
    slot: PagingSlot,
    frame: Pfn,
    buffer: FrameContent,
    attempts: u32,
}

impl MemoryManager {
    /// Bring the page behind `address` into memory.
    ///
    /// Returns the frame and the valid PTE to install. A read already in
    /// flight for the same frame reports [`MmError::PageCollision`]; the
    /// faulting access should simply be retried.
    pub(crate) fn materialize(
        &self,
        guard: &mut PfnGuard<'_>,
        address: PteAddress,
        usage: PageUsage,
    ) -> Result<(Pfn, Pte), MmError> {
        match guard.read_pte(address) {
            Pte::DemandZero { protection } => {
                let frame = self.take_zero_page(guard, color_hint(address))?;
                guard.activate(frame, address, usage, Pte::DemandZero { protection }, true);
                Ok((frame, dirty_valid(frame, protection)))
            }
            Pte::Transition { frame, protection } => {
                guard.reclaim_transition(frame)?;
                let entry = guard.entry_mut(frame);
                entry.modified = true;
                let writing = entry.write_in_progress;
                if !writing {
                    guard.release_backing(frame);
                }
                Ok((frame, dirty_valid(frame, protection)))
            }
            Pte::PagingFile { slot, protection } => self.page_in(guard, address, usage, slot, protection),
            valid @ Pte::Valid { frame, .. } => Ok((frame, valid)),
            other => bugcheck(BugCheck::MemoryManagement, [0x4401, other.raw(), usage_code(usage), 0]),
        }
    }

    fn page_in(
        &self,
        guard: &mut PfnGuard<'_>,
        address: PteAddress,
        usage: PageUsage,
        slot: PagingSlot,
        protection: Protection,
    ) -> Result<(Pfn, Pte), MmError> {
        let frame = self.take_any_page(guard, color_hint(address))?;
        guard.activate(frame, address, usage, Pte::PagingFile { slot, protection }, false);
        {
            // Held by the read, not yet mapped.
            let entry = guard.entry_mut(frame);
            entry.share_count = 0;
            entry.state = PageState::Transition;
            entry.read_in_progress = true;
        }
        guard.set_pte(address, Pte::Transition { frame, protection });

        let mut read = InPageRead {
            slot,
            frame,
            buffer: FrameContent::Zero,
            attempts: 0,
        };
        let status = loop {
            let status = guard.release_for(|| self.paging_file().read_page(read.slot, &mut read.buffer));
            if status != IoStatus::Transient || read.attempts >= self.config().inpage_retries {
                break status;
            }
            read.attempts += 1;
            MmStats::bump(&self.stats().inpage_retries);
            log::debug!("in-page retry {} for {:?}", read.attempts, read.slot);
            let delay = self.config().inpage_retry_delay;
            guard.release_for(|| {
                for _ in 0..delay {
                    core::hint::spin_loop();
                }
            });
        };

        if status != IoStatus::Success {
            let code = match usage {
                PageUsage::KernelStack => BugCheck::KernelStackInpageError,
                _ => BugCheck::KernelDataInpageError,
            };
            log::error!("in-page of {:?} into {} failed: {:?}", read.slot, read.frame, status);
            bugcheck(
                code,
                [status as u64, u64::from(read.slot.offset), u64::from(read.frame.0), read.attempts.into()],
            );
        }

        guard.set_content(frame, read.buffer);
        {
            let entry = guard.entry_mut(frame);
            entry.read_in_progress = false;
            entry.share_count = 1;
            entry.state = PageState::Active;
            // The slot is dropped below, so memory is the only copy.
            entry.modified = true;
        }
        if let PageUsage::PageTable { .. } = usage {
            let self_index = matches!(address, PteAddress::Directory(_)).then(|| self.depth().self_map_index());
            guard.recount_table(frame, self_index);
        }
        guard.release_backing(frame);
        Ok((frame, dirty_valid(frame, protection)))
    }
}

fn dirty_valid(frame: Pfn, protection: Protection) -> Pte {
    Pte::Valid {
        frame,
        protection,
        dirty: true,
        global: false,
    }
}

/// Spread pages of one table across colors by slot
fn color_hint(address: PteAddress) -> u32 {
    match address {
        PteAddress::Table(loc) => loc.index as u32,
        PteAddress::Directory(id) => id.0,
        PteAddress::Clone(id) => id.0,
        PteAddress::None => 0,
    }
}

fn usage_code(usage: PageUsage) -> u64 {
    match usage {
        PageUsage::Unused => 0,
        PageUsage::PageTable { level } => 0x10 + u64::from(level),
        PageUsage::Skeleton => 1,
        PageUsage::ProcessPrivate => 2,
        PageUsage::KernelStack => 3,
        PageUsage::System => 4,
        PageUsage::Physical => 5,
        PageUsage::LargePage => 6,
    }
}
