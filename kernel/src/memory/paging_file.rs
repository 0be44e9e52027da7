//! Backing-store interface and an in-memory paging file
//!
//! The I/O subsystem owns real paging files; the memory core only needs
//! slot allocation and synchronous page transfers. [`MemoryPagingFile`]
//! keeps page images in memory and can inject failures for the in-page
//! retry and fatal-error paths.

use super::frame_metadata::FrameContent;
use super::pte::PagingSlot;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Completion status of a paging transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// Retrying after a short delay may succeed
    Transient,
    Failed,
}

pub trait BackingStore: Send + Sync {
    fn allocate_slot(&self) -> Option<PagingSlot>;

    /// Synchronous read of `slot` into the caller-owned buffer
    fn read_page(&self, slot: PagingSlot, buffer: &mut FrameContent) -> IoStatus;

    fn write_page(&self, slot: PagingSlot, content: &FrameContent) -> IoStatus;

    /// Give the slot back; its contents are no longer needed
    fn release_backing_store(&self, slot: PagingSlot);
}

#[derive(Debug, Default)]
struct FaultPlan {
    transient_reads: u32,
    fail_reads: bool,
    fail_writes: bool,
}

struct PagingFileState {
    slots: Vec<Option<FrameContent>>,
    in_use: Vec<bool>,
    used: usize,
    faults: FaultPlan,
}

/// A paging file held in memory
pub struct MemoryPagingFile {
    file_number: u8,
    state: Mutex<PagingFileState>,
}

impl MemoryPagingFile {
    pub fn new(file_number: u8, slots: u32) -> Self {
        let slots = slots as usize;
        Self {
            file_number,
            state: Mutex::new(PagingFileState {
                slots: vec![None; slots],
                in_use: vec![false; slots],
                used: 0,
                faults: FaultPlan::default(),
            }),
        }
    }

    /// The next `count` reads report a transient failure
    pub fn inject_transient_reads(&self, count: u32) {
        self.state.lock().faults.transient_reads = count;
    }

    /// Every read fails permanently until cleared
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().faults.fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().faults.fail_writes = fail;
    }

    pub fn slots_in_use(&self) -> usize {
        self.state.lock().used
    }

    fn slot_index(&self, slot: PagingSlot) -> Option<usize> {
        if slot.file == self.file_number {
            Some(slot.offset as usize)
        } else {
            None
        }
    }
}

impl BackingStore for MemoryPagingFile {
    fn allocate_slot(&self) -> Option<PagingSlot> {
        let mut state = self.state.lock();
        let index = state.in_use.iter().position(|used| !used)?;
        state.in_use[index] = true;
        state.used += 1;
        Some(PagingSlot {
            file: self.file_number,
            offset: index as u32,
        })
    }

    fn read_page(&self, slot: PagingSlot, buffer: &mut FrameContent) -> IoStatus {
        let mut state = self.state.lock();
        if state.faults.fail_reads {
            return IoStatus::Failed;
        }
        if state.faults.transient_reads > 0 {
            state.faults.transient_reads -= 1;
            return IoStatus::Transient;
        }
        let Some(index) = self.slot_index(slot) else {
            return IoStatus::Failed;
        };
        match state.slots.get(index) {
            Some(Some(content)) => {
                *buffer = content.clone();
                IoStatus::Success
            }
            _ => IoStatus::Failed,
        }
    }

    fn write_page(&self, slot: PagingSlot, content: &FrameContent) -> IoStatus {
        let mut state = self.state.lock();
        if state.faults.fail_writes {
            return IoStatus::Failed;
        }
        let Some(index) = self.slot_index(slot) else {
            return IoStatus::Failed;
        };
        match state.slots.get_mut(index) {
            Some(entry) => {
                *entry = Some(content.clone());
                IoStatus::Success
            }
            None => IoStatus::Failed,
        }
    }

    fn release_backing_store(&self, slot: PagingSlot) {
        let Some(index) = self.slot_index(slot) else {
            log::warn!("release of foreign paging slot {:?}", slot);
            return;
        };
        let mut state = self.state.lock();
        if index < state.in_use.len() && state.in_use[index] {
            state.in_use[index] = false;
            state.slots[index] = None;
            state.used -= 1;
        } else {
            log::warn!("double release of paging slot {:?}", slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_write_then_read_back() {
        let file = MemoryPagingFile::new(0, 4);
        let slot = file.allocate_slot().unwrap();
        let page = FrameContent::Data(vec![7u64; 512].into_boxed_slice());
        assert_eq!(file.write_page(slot, &page), IoStatus::Success);

        let mut buffer = FrameContent::Zero;
        assert_eq!(file.read_page(slot, &mut buffer), IoStatus::Success);
        assert_eq!(buffer, page);
    }

    #[test]
    fn test_transient_reads_run_out() {
        let file = MemoryPagingFile::new(0, 1);
        let slot = file.allocate_slot().unwrap();
        file.write_page(slot, &FrameContent::Zero);
        file.inject_transient_reads(2);

        let mut buffer = FrameContent::Zero;
        assert_eq!(file.read_page(slot, &mut buffer), IoStatus::Transient);
        assert_eq!(file.read_page(slot, &mut buffer), IoStatus::Transient);
        assert_eq!(file.read_page(slot, &mut buffer), IoStatus::Success);
    }

    #[test]
    fn test_slots_exhaust_and_recycle() {
        let file = MemoryPagingFile::new(1, 2);
        let a = file.allocate_slot().unwrap();
        let _b = file.allocate_slot().unwrap();
        assert!(file.allocate_slot().is_none());
        file.release_backing_store(a);
        assert_eq!(file.slots_in_use(), 1);
        assert_eq!(file.allocate_slot(), Some(a));
    }
}
