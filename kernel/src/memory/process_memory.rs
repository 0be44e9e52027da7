//! Per-process address spaces
//!
//! An [`AddressSpace`] starts as a skeleton: the top-level directory (which
//! maps itself), the private hyperspace chain down to a leaf table, and
//! the VAD-bitmap and working-set-list pages hanging off that leaf.
//! [`MemoryManager::finish_address_space`] then adds the system mappings
//! and the permanent VADs. Teardown lives in `teardown.rs`.

use super::bugcheck::{bugcheck, BugCheck};
use super::commit::ProcessCommit;
use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::layout::{COMPAT_REGION_END, COMPAT_REGION_START, PAGE_SIZE, SHARED_USER_DATA_VA, VAD_BITMAP_SLOT, WORKING_SET_LIST_SLOT};
use super::page_table::install_page;
use super::paging::HierarchyDepth;
use super::pte::{AsId, Pfn, Protection, Pte, PteAddress};
use super::section::{ImageInfo, MapStatus, SectionId, SectionMapper};
use super::swap::TrimState;
use super::vad::{Vad, VadKind, VadTree};
use super::working_set::WorkingSetList;
use super::{MemoryManager, TABLE_PROTECTION};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};
use x86_64::VirtAddr;

/// Construction state of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    Skeleton = 1,
    Full = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Skeleton,
            2 => Lifecycle::Full,
            _ => Lifecycle::Uninitialized,
        }
    }
}

/// The pages every address space owns from creation to destruction
#[derive(Debug, Clone)]
pub(crate) struct Skeleton {
    pub top: Pfn,
    /// Hyperspace tables, from just below the top down to the leaf
    pub hyperspace: Vec<Pfn>,
    pub vad_bitmap: Pfn,
    pub working_set_list: Pfn,
}

/// One skeleton page and the PTE that maps it
#[derive(Debug, Clone, Copy)]
pub(crate) struct SkeletonPage {
    pub frame: Pfn,
    pub address: PteAddress,
    pub usage: PageUsage,
}

impl Skeleton {
    fn leaf(&self) -> Pfn {
        self.hyperspace.last().copied().unwrap_or(self.top)
    }

    /// Parent before child
    pub fn pages(&self, id: AsId, depth: &dyn HierarchyDepth) -> Vec<SkeletonPage> {
        let levels = depth.levels();
        let mut pages = Vec::with_capacity(levels + 2);
        pages.push(SkeletonPage {
            frame: self.top,
            address: PteAddress::Directory(id),
            usage: PageUsage::PageTable { level: levels as u8 },
        });
        let mut parent = PteAddress::table(self.top, depth.hyperspace_index());
        for (n, frame) in self.hyperspace.iter().enumerate() {
            pages.push(SkeletonPage {
                frame: *frame,
                address: parent,
                usage: PageUsage::PageTable {
                    level: (levels - 1 - n) as u8,
                },
            });
            parent = PteAddress::table(*frame, 0);
        }
        let leaf = self.leaf();
        pages.push(SkeletonPage {
            frame: self.vad_bitmap,
            address: PteAddress::table(leaf, VAD_BITMAP_SLOT),
            usage: PageUsage::Skeleton,
        });
        pages.push(SkeletonPage {
            frame: self.working_set_list,
            address: PteAddress::table(leaf, WORKING_SET_LIST_SLOT),
            usage: PageUsage::Skeleton,
        });
        pages
    }

    /// Rebuild from pages listed parent before child
    pub fn from_pages(pages: &[SkeletonPage]) -> Option<Self> {
        let (top, rest) = pages.split_first()?;
        let [hyperspace @ .., vad_bitmap, working_set_list] = rest else {
            return None;
        };
        Some(Self {
            top: top.frame,
            hyperspace: hyperspace.iter().map(|p| p.frame).collect(),
            vad_bitmap: vad_bitmap.frame,
            working_set_list: working_set_list.frame,
        })
    }
}

/// State guarded by the working-set lock
pub struct SpaceState {
    pub vads: VadTree,
    pub ws: WorkingSetList,
    pub(crate) skeleton: Option<Skeleton>,
    /// Directory PTE captured when the skeleton was swapped out
    pub(crate) outswapped_top: Option<Pte>,
}

impl SpaceState {
    pub(crate) fn top(&self) -> Result<Pfn, MmError> {
        self.skeleton.as_ref().map(|s| s.top).ok_or(MmError::InvalidLifecycle)
    }
}

/// A driver-held lock on a user page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedPage {
    pub va: VirtAddr,
    pub frame: Pfn,
}

#[derive(Debug, Default)]
pub(crate) struct LockedPages {
    pub count: u64,
    /// Only filled while tracking is enabled
    pub tracked: Vec<LockedPage>,
}

pub struct AddressSpace {
    id: AsId,
    lifecycle: AtomicU8,
    address_space_lock: Mutex<()>,
    working_set: Mutex<SpaceState>,
    commit: ProcessCommit,
    deleting: AtomicBool,
    outswapped: AtomicBool,
    large_pages: AtomicBool,
    pub(crate) locked: Mutex<LockedPages>,
    image: Mutex<Option<ImageInfo>>,
    color_seed: AtomicU32,
    minimum_working_set: u64,
}

impl AddressSpace {
    fn new(id: AsId, minimum_working_set: u64) -> Self {
        Self {
            id,
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            address_space_lock: Mutex::new(()),
            working_set: Mutex::new(SpaceState {
                vads: VadTree::new(),
                ws: WorkingSetList::new(),
                skeleton: None,
                outswapped_top: None,
            }),
            commit: ProcessCommit::new(),
            deleting: AtomicBool::new(false),
            outswapped: AtomicBool::new(false),
            large_pages: AtomicBool::new(false),
            locked: Mutex::new(LockedPages::default()),
            image: Mutex::new(None),
            color_seed: AtomicU32::new(id.0.wrapping_mul(7)),
            minimum_working_set,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false (and no change) if not in `from`
    pub(crate) fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleting(&self) {
        self.deleting.store(true, Ordering::Release);
    }

    pub fn is_outswapped(&self) -> bool {
        self.outswapped.load(Ordering::Acquire)
    }

    pub(crate) fn set_outswapped(&self, outswapped: bool) {
        self.outswapped.store(outswapped, Ordering::Release);
    }

    pub fn uses_large_pages(&self) -> bool {
        self.large_pages.load(Ordering::Acquire)
    }

    pub(crate) fn set_large_pages(&self, enabled: bool) {
        self.large_pages.store(enabled, Ordering::Release);
    }

    /// Pages of commitment currently charged to this process
    pub fn committed_pages(&self) -> u64 {
        self.commit.pages()
    }

    pub(crate) fn charge_commit(&self, mm: &MemoryManager, pages: u64) -> Result<(), MmError> {
        self.commit.charge(mm.commitment(), pages)
    }

    pub(crate) fn return_commit(&self, mm: &MemoryManager, pages: u64) {
        if pages != 0 {
            self.commit.release(mm.commitment(), pages);
        }
    }

    /// Page color for the next page of this process
    pub fn next_color(&self) -> u32 {
        self.color_seed.fetch_add(1, Ordering::Relaxed)
    }

    pub fn minimum_working_set(&self) -> u64 {
        self.minimum_working_set
    }

    /// Serializes VAD insertion and removal; taken before the working-set lock
    pub(crate) fn lock_address_space(&self) -> MutexGuard<'_, ()> {
        self.address_space_lock.lock()
    }

    pub(crate) fn lock_working_set(&self) -> MutexGuard<'_, SpaceState> {
        self.working_set.lock()
    }

    pub fn image(&self) -> Option<ImageInfo> {
        *self.image.lock()
    }

    pub fn working_set_size(&self) -> usize {
        self.working_set.lock().ws.len()
    }

    pub fn vad_count(&self) -> usize {
        self.working_set.lock().vads.len()
    }

    /// The VAD covering `va`, copied out
    pub fn vad_at(&self, va: VirtAddr) -> Option<Vad> {
        self.working_set.lock().vads.find(va).cloned()
    }

    pub fn locked_page_count(&self) -> u64 {
        self.locked.lock().count
    }

    pub fn tracked_locked_pages(&self) -> Vec<LockedPage> {
        self.locked.lock().tracked.clone()
    }

    pub fn top_frame(&self) -> Option<Pfn> {
        self.working_set.lock().skeleton.as_ref().map(|s| s.top)
    }
}

impl MemoryManager {
    /// Build the skeleton of a new address space.
    ///
    /// Charges `skeleton_pages` of commitment and resident-available up
    /// front; every page is placed before the space becomes a skeleton.
    pub fn create_address_space(&self, minimum_working_set: u64) -> Result<Arc<AddressSpace>, MmError> {
        let pages = self.depth().skeleton_pages();
        let space = Arc::new(AddressSpace::new(self.allocate_as_id(), minimum_working_set));
        space.charge_commit(self, pages)?;
        if let Err(e) = self.commitment().charge_resident_available(pages) {
            space.return_commit(self, pages);
            return Err(e);
        }

        let mut guard = self.pfn().lock();
        let mut placed = Vec::with_capacity(pages as usize);
        let built = self
            .ensure_available_pages(&mut guard, pages as usize)
            .and_then(|()| self.place_skeleton(&mut guard, &space, &mut placed));
        match built {
            Ok(skeleton) => {
                drop(guard);
                space.lock_working_set().skeleton = Some(skeleton);
                space.transition(Lifecycle::Uninitialized, Lifecycle::Skeleton);
                log::debug!("{}: skeleton of {} pages", space.id(), pages);
                Ok(space)
            }
            Err(e) => {
                self.release_skeleton_pages(&mut guard, space.id(), &placed);
                drop(guard);
                self.commitment().return_resident_available(pages);
                space.return_commit(self, pages);
                log::warn!("{}: skeleton creation failed: {}", space.id(), e);
                Err(e)
            }
        }
    }

    fn place_skeleton(
        &self,
        guard: &mut PfnGuard<'_>,
        space: &AddressSpace,
        placed: &mut Vec<SkeletonPage>,
    ) -> Result<Skeleton, MmError> {
        let depth = self.depth();
        let levels = depth.levels();
        let id = space.id();

        let top = self.take_zero_page(guard, space.next_color())?;
        let top_page = SkeletonPage {
            frame: top,
            address: PteAddress::Directory(id),
            usage: PageUsage::PageTable { level: levels as u8 },
        };
        install_page(guard, top, top_page.address, top_page.usage);
        placed.push(top_page);
        guard.set_pte(PteAddress::table(top, depth.self_map_index()), Pte::valid(top, TABLE_PROTECTION));

        let mut parent = PteAddress::table(top, depth.hyperspace_index());
        let mut hyperspace = Vec::with_capacity(levels - 1);
        for level in (1..levels).rev() {
            let frame = self.take_zero_page(guard, space.next_color())?;
            let page = SkeletonPage {
                frame,
                address: parent,
                usage: PageUsage::PageTable { level: level as u8 },
            };
            install_page(guard, frame, page.address, page.usage);
            placed.push(page);
            hyperspace.push(frame);
            parent = PteAddress::table(frame, 0);
        }

        let leaf = hyperspace.last().copied().unwrap_or(top);
        let mut data_page = |slot: usize| -> Result<Pfn, MmError> {
            let frame = self.take_zero_page(guard, space.next_color())?;
            let page = SkeletonPage {
                frame,
                address: PteAddress::table(leaf, slot),
                usage: PageUsage::Skeleton,
            };
            install_page(guard, frame, page.address, page.usage);
            placed.push(page);
            Ok(frame)
        };
        let vad_bitmap = data_page(VAD_BITMAP_SLOT)?;
        let working_set_list = data_page(WORKING_SET_LIST_SLOT)?;

        Ok(Skeleton {
            top,
            hyperspace,
            vad_bitmap,
            working_set_list,
        })
    }

    /// Unmap and free skeleton pages, child before parent.
    ///
    /// `pages` is in placement order (parent before child) and may be a
    /// prefix of the full skeleton.
    pub(crate) fn release_skeleton_pages(&self, guard: &mut PfnGuard<'_>, id: AsId, pages: &[SkeletonPage]) {
        for page in pages.iter().rev() {
            if let PteAddress::Directory(_) = page.address {
                guard.set_pte(PteAddress::table(page.frame, self.depth().self_map_index()), Pte::Zero);
                // Freed as ordinary process memory, not as a table.
                guard.entry_mut(page.frame).usage = PageUsage::ProcessPrivate;
            }
            guard.set_pte(page.address, Pte::Zero);
            let entry = guard.entry(page.frame);
            if entry.share_count != 1 {
                bugcheck(
                    BugCheck::PfnShareCount,
                    [u64::from(page.frame.0), u64::from(entry.share_count), u64::from(id.0), 3],
                );
            }
            guard.mark_deleted(page.frame);
            guard.decrement_share(page.frame);
        }
    }

    /// Complete a skeleton into a usable address space.
    ///
    /// With a clone source the space becomes a copy of it; otherwise an
    /// optional section is mapped and its status returned. On failure the
    /// space stays a skeleton with none of the VADs added here.
    pub fn finish_address_space(
        &self,
        space: &AddressSpace,
        clone_source: Option<&AddressSpace>,
        section: Option<(&dyn SectionMapper, SectionId)>,
    ) -> Result<MapStatus, MmError> {
        if space.lifecycle() != Lifecycle::Skeleton {
            return Err(MmError::InvalidLifecycle);
        }

        let result = self.populate_address_space(space, clone_source, section);
        match result {
            Ok(status) => {
                space.transition(Lifecycle::Skeleton, Lifecycle::Full);
                self.expansion().lock().insert(space.id(), TrimState::Listed);
                log::debug!("{}: address space ready ({:?})", space.id(), status);
                Ok(status)
            }
            Err(e) => {
                let _as_lock = space.lock_address_space();
                self.remove_all_vads(space);
                log::warn!("{}: finishing address space failed: {}", space.id(), e);
                Err(e)
            }
        }
    }

    fn populate_address_space(
        &self,
        space: &AddressSpace,
        clone_source: Option<&AddressSpace>,
        section: Option<(&dyn SectionMapper, SectionId)>,
    ) -> Result<MapStatus, MmError> {
        {
            let _as_lock = space.lock_address_space();
            let mut state = space.lock_working_set();
            let top = state.top()?;
            self.copy_system_mappings(&mut self.pfn().lock(), top);

            let shared = Vad::new(VirtAddr::new(SHARED_USER_DATA_VA), 1, Protection::READ, VadKind::SharedUserData)
                .committed(0)
                .permanent();
            self.insert_vad(space, &mut state, shared)?;

            if self.depth().wide_address() {
                let pages = (COMPAT_REGION_END - COMPAT_REGION_START) / PAGE_SIZE;
                let compat = Vad::new(VirtAddr::new(COMPAT_REGION_START), pages, Protection::empty(), VadKind::Private)
                    .permanent();
                self.insert_vad(space, &mut state, compat)?;
            }
        }

        if let Some(source) = clone_source {
            self.clone_address_space(source, space)?;
            space.set_large_pages(false);
            return Ok(MapStatus::Success);
        }

        match section {
            Some((mapper, id)) => {
                let view = mapper.map_view(self, space, id)?;
                *space.image.lock() = Some(ImageInfo {
                    section: id,
                    base: view.base,
                    pages: view.pages,
                    relocated: view.status == MapStatus::ImageNotAtBase,
                });
                Ok(view.status)
            }
            None => Ok(MapStatus::Success),
        }
    }

    /// Add a VAD and mark its 64K regions in the VAD bitmap
    pub(crate) fn insert_vad(&self, space: &AddressSpace, state: &mut SpaceState, vad: Vad) -> Result<(), MmError> {
        let (start, end) = (vad.start.as_u64(), vad.end.as_u64());
        state.vads.insert(vad)?;
        if let Some(skeleton) = state.skeleton.as_ref() {
            let mut guard = self.pfn().lock();
            let bitmap = skeleton.vad_bitmap;
            let last_region = (BITMAP_REGIONS - 1) as u64;
            let first = start / BITMAP_REGION_BYTES;
            let last = ((end - 1) / BITMAP_REGION_BYTES).min(last_region);
            for region in first..=last {
                let (word, bit) = ((region / 64) as usize, region % 64);
                let value = guard.read_word(bitmap, word);
                guard.write_word(bitmap, word, value | (1 << bit));
            }
        }
        log::trace!("{}: VAD {:#x}..{:#x}", space.id(), start, end);
        Ok(())
    }

    /// Whether the VAD bitmap marks the 64K region holding `va`
    pub fn vad_bitmap_marks(&self, space: &AddressSpace, va: VirtAddr) -> bool {
        let state = space.lock_working_set();
        let Some(skeleton) = state.skeleton.as_ref() else {
            return false;
        };
        let region = va.as_u64() / BITMAP_REGION_BYTES;
        if region >= BITMAP_REGIONS as u64 {
            return false;
        }
        let word = self.pfn().lock().read_word(skeleton.vad_bitmap, (region / 64) as usize);
        word & (1 << (region % 64)) != 0
    }
}

const BITMAP_REGION_BYTES: u64 = 64 * 1024;
const BITMAP_REGIONS: usize = super::layout::WORDS_PER_PAGE * 64;
