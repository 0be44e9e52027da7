//! Virtual address descriptors (VADs)
//!
//! Each VAD describes one reserved range of a process's user space and how
//! pages inside it are backed. The tree is keyed by start address and lives
//! under the working-set lock.

use super::error::MmError;
use super::layout::{PAGE_SIZE, USER_ALLOCATION_BASE};
use super::pte::Protection;
use super::section::SectionId;
use alloc::collections::BTreeMap;
use x86_64::VirtAddr;

/// How pages inside a VAD are backed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadKind {
    /// Pagefile-backed private memory
    Private,
    /// A view of a section (image or data)
    MappedView { section: SectionId },
    /// Physical pages mapped directly; never in the working set
    Physical,
    /// Large-page memory; never in the working set
    LargePage,
    /// The read-only page shared with every process
    SharedUserData,
}

#[derive(Debug, Clone)]
pub struct Vad {
    pub start: VirtAddr,
    /// Exclusive
    pub end: VirtAddr,
    pub protection: Protection,
    pub kind: VadKind,
    /// Every page was committed when the VAD was created
    pub mem_commit: bool,
    /// Pages of commitment charged for this VAD
    pub commit_charge: u64,
    /// `free_virtual_memory` may remove it
    pub deletable: bool,
}

impl Vad {
    pub fn new(start: VirtAddr, pages: u64, protection: Protection, kind: VadKind) -> Self {
        Self {
            start,
            end: start + pages * PAGE_SIZE,
            protection,
            kind,
            mem_commit: false,
            commit_charge: 0,
            deletable: true,
        }
    }

    pub fn committed(mut self, charge: u64) -> Self {
        self.mem_commit = true;
        self.commit_charge = charge;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.deletable = false;
        self
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end
    }

    pub fn pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Pages in this VAD go through the working set
    pub fn uses_working_set(&self) -> bool {
        !matches!(self.kind, VadKind::Physical | VadKind::LargePage)
    }
}

#[derive(Debug, Default)]
pub struct VadTree {
    vads: BTreeMap<u64, Vad>,
}

impl VadTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vad: Vad) -> Result<(), MmError> {
        if vad.start >= vad.end || !vad.start.is_aligned(PAGE_SIZE) || !vad.end.is_aligned(PAGE_SIZE) {
            return Err(MmError::InvalidAddress);
        }
        if self.overlaps_any(vad.start, vad.end) {
            return Err(MmError::ConflictingAddresses);
        }
        self.vads.insert(vad.start.as_u64(), vad);
        Ok(())
    }

    pub fn remove(&mut self, start: VirtAddr) -> Option<Vad> {
        self.vads.remove(&start.as_u64())
    }

    /// The VAD containing `addr`
    pub fn find(&self, addr: VirtAddr) -> Option<&Vad> {
        self.vads
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.contains(addr))
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Vad> {
        self.vads
            .range_mut(..=addr.as_u64())
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.contains(addr))
    }

    pub fn overlaps_any(&self, start: VirtAddr, end: VirtAddr) -> bool {
        // Only the last VAD starting before `end` can reach into the range.
        self.vads
            .range(..end.as_u64())
            .next_back()
            .is_some_and(|(_, vad)| vad.overlaps(start, end))
    }

    /// Lowest free range of `pages` pages at or above the allocation base
    /// that ends at or below `limit`
    pub fn find_free_region(&self, pages: u64, limit: VirtAddr) -> Option<VirtAddr> {
        let size = pages.checked_mul(PAGE_SIZE)?;
        let mut candidate = USER_ALLOCATION_BASE;
        for vad in self.vads.values() {
            if vad.end.as_u64() <= candidate {
                continue;
            }
            if vad.start.as_u64() >= candidate.checked_add(size)? {
                break;
            }
            candidate = vad.end.as_u64();
        }
        let end = candidate.checked_add(size)?;
        (end <= limit.as_u64()).then(|| VirtAddr::new(candidate))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vad> {
        self.vads.values()
    }

    pub fn len(&self) -> usize {
        self.vads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private(start: u64, pages: u64) -> Vad {
        Vad::new(VirtAddr::new(start), pages, Protection::READ_WRITE, VadKind::Private)
    }

    #[test]
    fn test_find_uses_containing_range() {
        let mut tree = VadTree::new();
        tree.insert(private(0x10000, 4)).unwrap();
        tree.insert(private(0x20000, 1)).unwrap();
        assert_eq!(tree.find(VirtAddr::new(0x13fff)).map(|v| v.start.as_u64()), Some(0x10000));
        assert!(tree.find(VirtAddr::new(0x14000)).is_none());
        assert!(tree.find(VirtAddr::new(0x0fff)).is_none());
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut tree = VadTree::new();
        tree.insert(private(0x10000, 4)).unwrap();
        assert_eq!(tree.insert(private(0x12000, 4)), Err(MmError::ConflictingAddresses));
        assert_eq!(tree.insert(private(0x0e000, 3)), Err(MmError::ConflictingAddresses));
        assert!(tree.insert(private(0x14000, 1)).is_ok());
    }

    #[test]
    fn test_free_region_fills_gaps_bottom_up() {
        let mut tree = VadTree::new();
        let limit = VirtAddr::new(0x8000_0000);
        assert_eq!(tree.find_free_region(2, limit), Some(VirtAddr::new(USER_ALLOCATION_BASE)));
        tree.insert(private(0x10000, 2)).unwrap();
        tree.insert(private(0x13000, 4)).unwrap();
        // One-page hole at 0x12000
        assert_eq!(tree.find_free_region(1, limit), Some(VirtAddr::new(0x12000)));
        assert_eq!(tree.find_free_region(2, limit), Some(VirtAddr::new(0x17000)));
        assert_eq!(tree.find_free_region(1 << 40, limit), None);
    }
}
