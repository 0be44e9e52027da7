//! PFN database
//!
//! One entry per physical frame, plus the colored free/zeroed lists and the
//! standby/modified transition lists. Everything here, including the
//! contents of page-table pages and data frames, sits behind the single PFN
//! lock; a [`PfnGuard`] is the only way in.
//!
//! Counting rules:
//! - a mapped frame has `reference_count == 1` while `share_count > 0`, plus
//!   one for each paging I/O in flight
//! - a page-table page's share count is one for its own mapping (or the
//!   self-map, for a top-level page) plus one per valid child it maps;
//!   [`PfnState::set_pte`] keeps that part current
//! - a frame is on the free or zeroed list exactly when both counts are zero
//!   and it is not reserved

use super::bugcheck::{bugcheck, BugCheck};
use super::config::MmConfig;
use super::error::MmError;
use super::layout::WORDS_PER_PAGE;
use super::paging_file::BackingStore;
use super::pte::{AsId, CloneId, Pfn, Protection, Pte, PteAddress, PteLocation};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Zeroed,
    Free,
    Standby,
    Modified,
    Active,
    /// Off every list with no mappings; paging I/O holds a reference
    Transition,
    /// Never handed out
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUsage {
    Unused,
    PageTable { level: u8 },
    /// Working-set list or VAD bitmap page
    Skeleton,
    ProcessPrivate,
    KernelStack,
    System,
    Physical,
    LargePage,
}

/// What a frame holds.
///
/// A zero-filled frame reads as an empty table or as zero words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameContent {
    Zero,
    Table(Box<[Pte]>),
    Data(Box<[u64]>),
}

#[derive(Debug, Clone)]
pub struct PfnEntry {
    /// Frame of the page table holding this frame's PTE
    pub pte_frame: Option<Pfn>,
    /// The frame maps itself (top-level self-map)
    pub self_mapped: bool,
    pub pte_address: PteAddress,
    pub share_count: u32,
    pub reference_count: u32,
    pub state: PageState,
    /// Release the frame as soon as the last reference goes away
    pub deleted: bool,
    pub write_in_progress: bool,
    pub read_in_progress: bool,
    /// Contents differ from the paging-file copy (if any)
    pub modified: bool,
    /// Value restored into the PTE when the frame is repurposed
    pub original_pte: Pte,
    pub color: u32,
    pub node: u8,
    pub usage: PageUsage,
    /// Non-zero entries of a page-table page, global and self entries excluded
    pub used_entries: u32,
    flink: Option<Pfn>,
    blink: Option<Pfn>,
}

impl PfnEntry {
    fn new(color: u32, node: u8) -> Self {
        Self {
            pte_frame: None,
            self_mapped: false,
            pte_address: PteAddress::None,
            share_count: 0,
            reference_count: 0,
            state: PageState::Zeroed,
            deleted: false,
            write_in_progress: false,
            read_in_progress: false,
            modified: false,
            original_pte: Pte::Zero,
            color,
            node,
            usage: PageUsage::Unused,
            used_entries: 0,
            flink: None,
            blink: None,
        }
    }

    fn reset(&mut self) {
        self.pte_frame = None;
        self.self_mapped = false;
        self.pte_address = PteAddress::None;
        self.deleted = false;
        self.write_in_progress = false;
        self.read_in_progress = false;
        self.modified = false;
        self.original_pte = Pte::Zero;
        self.usage = PageUsage::Unused;
        self.used_entries = 0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PageList {
    head: Option<Pfn>,
    tail: Option<Pfn>,
    count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Free(u32),
    Zeroed(u32),
    Standby,
    Modified,
}

/// A shared prototype PTE created by fork
#[derive(Debug, Clone)]
pub struct CloneBlock {
    pub pte: Pte,
    /// Process PTEs (valid or prototype) referring to this block
    pub refs: u32,
}

pub struct PfnState {
    entries: Vec<PfnEntry>,
    contents: Vec<FrameContent>,
    free: Vec<PageList>,
    zeroed: Vec<PageList>,
    standby: PageList,
    modified: PageList,
    clone_blocks: BTreeMap<CloneId, CloneBlock>,
    next_clone: u32,
    directory_ptes: BTreeMap<AsId, Pte>,
    colors_per_node: u32,
    total_colors: u32,
    entries_per_table: usize,
    repurposed: u64,
    paging_file: Arc<dyn BackingStore>,
}

pub struct PfnDatabase {
    state: Mutex<PfnState>,
}

impl PfnDatabase {
    pub fn new(config: &MmConfig, entries_per_table: usize, paging_file: Arc<dyn BackingStore>) -> Self {
        let total_colors = config.total_colors();
        let colors_per_node = u32::from(config.colors_per_node.max(1));
        let pages = config.physical_pages.max(2);

        let mut state = PfnState {
            entries: Vec::with_capacity(pages as usize),
            contents: vec![FrameContent::Zero; pages as usize],
            free: vec![PageList::default(); total_colors as usize],
            zeroed: vec![PageList::default(); total_colors as usize],
            standby: PageList::default(),
            modified: PageList::default(),
            clone_blocks: BTreeMap::new(),
            next_clone: 1,
            directory_ptes: BTreeMap::new(),
            colors_per_node,
            total_colors,
            entries_per_table,
            repurposed: 0,
            paging_file,
        };

        for frame in 0..pages {
            let color = frame % total_colors;
            let node = (color / colors_per_node) as u8;
            state.entries.push(PfnEntry::new(color, node));
        }

        // Frame 0 is never handed out.
        state.entries[0].state = PageState::Bad;
        for frame in 1..pages {
            let color = state.entries[frame as usize].color;
            state.link_tail(ListKind::Zeroed(color), Pfn(frame));
        }

        log::info!(
            "PFN database: {} frames, {} colors over {} node(s)",
            pages - 1,
            total_colors,
            total_colors / colors_per_node
        );

        Self {
            state: Mutex::new(state),
        }
    }

    /// Acquire the PFN lock
    pub fn lock(&self) -> PfnGuard<'_> {
        PfnGuard {
            lock: &self.state,
            state: Some(self.state.lock()),
        }
    }
}

/// Holder of the PFN lock.
///
/// [`PfnGuard::release_for`] drops the lock around a blocking operation
/// (paging I/O, waiting for pages) and takes it back afterwards.
pub struct PfnGuard<'a> {
    lock: &'a Mutex<PfnState>,
    state: Option<MutexGuard<'a, PfnState>>,
}

impl PfnGuard<'_> {
    pub fn release_for<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.state = None;
        let result = f();
        self.state = Some(self.lock.lock());
        result
    }
}

impl Deref for PfnGuard<'_> {
    type Target = PfnState;

    fn deref(&self) -> &PfnState {
        match self.state.as_deref() {
            Some(state) => state,
            None => bugcheck(BugCheck::MemoryManagement, [0x4101, 0, 0, 0]),
        }
    }
}

impl DerefMut for PfnGuard<'_> {
    fn deref_mut(&mut self) -> &mut PfnState {
        match self.state.as_deref_mut() {
            Some(state) => state,
            None => bugcheck(BugCheck::MemoryManagement, [0x4101, 1, 0, 0]),
        }
    }
}

impl PfnState {
    pub fn total_pages(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, pfn: Pfn) -> &PfnEntry {
        match self.entries.get(pfn.index()) {
            Some(entry) => entry,
            None => bugcheck(BugCheck::MemoryManagement, [0x4102, u64::from(pfn.0), 0, 0]),
        }
    }

    pub(crate) fn entry_mut(&mut self, pfn: Pfn) -> &mut PfnEntry {
        match self.entries.get_mut(pfn.index()) {
            Some(entry) => entry,
            None => bugcheck(BugCheck::MemoryManagement, [0x4102, u64::from(pfn.0), 1, 0]),
        }
    }

    pub fn entries_per_table(&self) -> usize {
        self.entries_per_table
    }

    pub fn node_of_color(&self, color: u32) -> u8 {
        ((color % self.total_colors) / self.colors_per_node) as u8
    }

    /// A color belonging to `node`, rotated by `seed`
    pub fn color_for_node(&self, node: u8, seed: u32) -> u32 {
        let nodes = self.total_colors / self.colors_per_node;
        let node = u32::from(node) % nodes.max(1);
        node * self.colors_per_node + seed % self.colors_per_node
    }

    pub fn paging_file(&self) -> &Arc<dyn BackingStore> {
        &self.paging_file
    }

    // ---------------------------------------------------------------------
    // Page lists
    // ---------------------------------------------------------------------

    fn list(&self, kind: ListKind) -> PageList {
        match kind {
            ListKind::Free(color) => self.free[color as usize],
            ListKind::Zeroed(color) => self.zeroed[color as usize],
            ListKind::Standby => self.standby,
            ListKind::Modified => self.modified,
        }
    }

    fn store_list(&mut self, kind: ListKind, list: PageList) {
        match kind {
            ListKind::Free(color) => self.free[color as usize] = list,
            ListKind::Zeroed(color) => self.zeroed[color as usize] = list,
            ListKind::Standby => self.standby = list,
            ListKind::Modified => self.modified = list,
        }
    }

    fn list_kind_of(&self, pfn: Pfn) -> Option<ListKind> {
        let entry = self.entry(pfn);
        match entry.state {
            PageState::Free => Some(ListKind::Free(entry.color)),
            PageState::Zeroed => Some(ListKind::Zeroed(entry.color)),
            PageState::Standby => Some(ListKind::Standby),
            PageState::Modified => Some(ListKind::Modified),
            _ => None,
        }
    }

    fn link_tail(&mut self, kind: ListKind, pfn: Pfn) {
        let mut list = self.list(kind);
        {
            let entry = self.entry_mut(pfn);
            entry.flink = None;
            entry.blink = list.tail;
            entry.state = match kind {
                ListKind::Free(_) => PageState::Free,
                ListKind::Zeroed(_) => PageState::Zeroed,
                ListKind::Standby => PageState::Standby,
                ListKind::Modified => PageState::Modified,
            };
        }
        match list.tail {
            Some(tail) => self.entry_mut(tail).flink = Some(pfn),
            None => list.head = Some(pfn),
        }
        list.tail = Some(pfn);
        list.count += 1;
        self.store_list(kind, list);
    }

    fn unlink(&mut self, kind: ListKind, pfn: Pfn) {
        let mut list = self.list(kind);
        if list.count == 0 {
            bugcheck(BugCheck::PfnListCorrupt, [u64::from(pfn.0), 0, 0, 0]);
        }
        let (flink, blink) = {
            let entry = self.entry_mut(pfn);
            let links = (entry.flink, entry.blink);
            entry.flink = None;
            entry.blink = None;
            entry.state = PageState::Active;
            links
        };
        match blink {
            Some(prev) => self.entry_mut(prev).flink = flink,
            None => list.head = flink,
        }
        match flink {
            Some(next) => self.entry_mut(next).blink = blink,
            None => list.tail = blink,
        }
        list.count -= 1;
        self.store_list(kind, list);
    }

    fn pop_head(&mut self, kind: ListKind) -> Option<Pfn> {
        let head = self.list(kind).head?;
        self.unlink(kind, head);
        Some(head)
    }

    /// Take a frame off whichever list it is on
    pub(crate) fn unlink_from_list(&mut self, pfn: Pfn) {
        if let Some(kind) = self.list_kind_of(pfn) {
            self.unlink(kind, pfn);
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free.iter().map(|l| l.count).sum()
    }

    pub fn zeroed_pages(&self) -> usize {
        self.zeroed.iter().map(|l| l.count).sum()
    }

    pub fn standby_pages(&self) -> usize {
        self.standby.count
    }

    pub fn modified_pages(&self) -> usize {
        self.modified.count
    }

    /// Pages that can be handed out without writing anything
    pub fn available_pages(&self) -> usize {
        self.free_pages() + self.zeroed_pages() + self.standby_pages()
    }

    pub fn repurposed_pages(&self) -> u64 {
        self.repurposed
    }

    pub(crate) fn modified_head(&self) -> Option<Pfn> {
        self.modified.head
    }

    /// Colors to try for `color`: itself, the rest of its node, then the rest
    fn color_order(&self, color: u32) -> impl Iterator<Item = u32> {
        let total = self.total_colors;
        let per_node = self.colors_per_node;
        let color = color % total;
        let node_base = color - color % per_node;
        let same_node = (0..per_node).map(move |i| node_base + (color - node_base + i) % per_node);
        let others = (0..total).filter(move |c| *c < node_base || *c >= node_base + per_node);
        same_node.chain(others)
    }

    /// Remove a zero-filled frame, zeroing one on demand if needed
    pub fn remove_zero_page(&mut self, color: u32) -> Option<Pfn> {
        let order: Vec<u32> = self.color_order(color).collect();
        for &c in &order {
            if let Some(pfn) = self.pop_head(ListKind::Zeroed(c)) {
                return Some(pfn);
            }
        }
        let pfn = order
            .iter()
            .find_map(|&c| self.pop_head(ListKind::Free(c)))
            .or_else(|| self.repurpose_standby())?;
        self.contents[pfn.index()] = FrameContent::Zero;
        Some(pfn)
    }

    /// Remove any frame; its contents are unspecified
    pub fn remove_any_page(&mut self, color: u32) -> Option<Pfn> {
        let order: Vec<u32> = self.color_order(color).collect();
        for &c in &order {
            if let Some(pfn) = self.pop_head(ListKind::Free(c)) {
                return Some(pfn);
            }
            if let Some(pfn) = self.pop_head(ListKind::Zeroed(c)) {
                return Some(pfn);
            }
        }
        self.repurpose_standby()
    }

    /// Return an unreferenced frame to the free list
    pub fn insert_free_page(&mut self, pfn: Pfn) {
        let entry = self.entry(pfn);
        if entry.share_count != 0 || entry.reference_count != 0 || entry.state == PageState::Bad {
            bugcheck(
                BugCheck::PfnListCorrupt,
                [
                    u64::from(pfn.0),
                    u64::from(entry.share_count),
                    u64::from(entry.reference_count),
                    1,
                ],
            );
        }
        let color = entry.color;
        self.unlink_from_list(pfn);
        self.entry_mut(pfn).reset();
        self.link_tail(ListKind::Free(color), pfn);
    }

    /// Steal the oldest standby frame whose PTE can be put back to its
    /// original value
    fn repurpose_standby(&mut self) -> Option<Pfn> {
        let mut cursor = self.standby.head;
        while let Some(pfn) = cursor {
            cursor = self.entry(pfn).flink;
            if self.holds_transition_entries(pfn) {
                continue;
            }
            self.unlink(ListKind::Standby, pfn);
            self.restore_original_pte(pfn);
            self.entry_mut(pfn).reset();
            self.repurposed += 1;
            log::trace!("repurposed standby {}", pfn);
            return Some(pfn);
        }
        None
    }

    fn holds_transition_entries(&self, pfn: Pfn) -> bool {
        matches!(self.entry(pfn).usage, PageUsage::PageTable { .. })
            && match &self.contents[pfn.index()] {
                FrameContent::Table(entries) => entries.iter().any(Pte::is_transition),
                _ => false,
            }
    }

    fn restore_original_pte(&mut self, pfn: Pfn) {
        let entry = self.entry(pfn);
        let original = entry.original_pte;
        let address = entry.pte_address;
        if let PteAddress::Table(loc) = address {
            // The table's paging-file copy is about to go stale.
            if self.entry(loc.table).state == PageState::Standby {
                self.unlink(ListKind::Standby, loc.table);
                self.release_backing(loc.table);
                self.entry_mut(loc.table).modified = true;
                self.link_tail(ListKind::Modified, loc.table);
            }
        }
        if address != PteAddress::None {
            self.set_pte(address, original);
        }
    }

    // ---------------------------------------------------------------------
    // Counts
    // ---------------------------------------------------------------------

    /// Set up a frame just removed from a list as mapped once at `address`
    pub fn activate(&mut self, pfn: Pfn, address: PteAddress, usage: PageUsage, original: Pte, modified: bool) {
        let entry = self.entry_mut(pfn);
        entry.share_count = 1;
        entry.reference_count = 1;
        entry.state = PageState::Active;
        entry.deleted = false;
        entry.write_in_progress = false;
        entry.read_in_progress = false;
        entry.modified = modified;
        entry.original_pte = original;
        entry.usage = usage;
        entry.used_entries = 0;
        entry.pte_address = address;
        let (pte_frame, self_mapped) = match address {
            PteAddress::Table(loc) => (Some(loc.table), false),
            PteAddress::Directory(_) => (Some(pfn), true),
            PteAddress::Clone(_) | PteAddress::None => (None, false),
        };
        entry.pte_frame = pte_frame;
        entry.self_mapped = self_mapped;
    }

    pub fn increment_share(&mut self, pfn: Pfn) {
        let entry = self.entry_mut(pfn);
        if entry.share_count == 0 {
            // Mapping into a frame that is not active; callers must make it
            // valid first.
            bugcheck(BugCheck::PfnShareCount, [u64::from(pfn.0), 0, 1, 0]);
        }
        entry.share_count += 1;
    }

    pub fn decrement_share(&mut self, pfn: Pfn) {
        let entry = self.entry_mut(pfn);
        if entry.share_count == 0 {
            bugcheck(BugCheck::PfnShareCount, [u64::from(pfn.0), 0, 0, 0]);
        }
        entry.share_count -= 1;
        if entry.share_count != 0 {
            return;
        }
        entry.state = PageState::Transition;
        let address = entry.pte_address;
        if let PteAddress::Clone(id) = address {
            if let Some(block) = self.clone_blocks.get_mut(&id) {
                block.pte = block.pte.to_transition();
            }
        }
        self.decrement_reference(pfn);
    }

    pub fn add_reference(&mut self, pfn: Pfn) {
        self.entry_mut(pfn).reference_count += 1;
    }

    pub fn decrement_reference(&mut self, pfn: Pfn) {
        let entry = self.entry_mut(pfn);
        if entry.reference_count == 0 {
            bugcheck(BugCheck::PfnReferenceCount, [u64::from(pfn.0), 0, 0, 0]);
        }
        entry.reference_count -= 1;
        if entry.reference_count != 0 {
            return;
        }
        if entry.share_count != 0 {
            bugcheck(
                BugCheck::PfnReferenceCount,
                [u64::from(pfn.0), u64::from(entry.share_count), 1, 0],
            );
        }
        let deleted = entry.deleted;
        let modified = entry.modified;
        if deleted {
            self.release_backing(pfn);
            self.insert_free_page(pfn);
        } else if modified {
            self.link_tail(ListKind::Modified, pfn);
        } else {
            self.link_tail(ListKind::Standby, pfn);
        }
    }

    /// Release the frame once its last reference goes away
    pub fn mark_deleted(&mut self, pfn: Pfn) {
        self.entry_mut(pfn).deleted = true;
    }

    /// Delete a frame that has no mappings left.
    ///
    /// A frame on a transition list goes straight back to the free list; one
    /// with paging I/O in flight is freed by the I/O completion.
    pub fn delete_unmapped(&mut self, pfn: Pfn) {
        self.mark_deleted(pfn);
        let entry = self.entry(pfn);
        if entry.reference_count == 0 && entry.share_count == 0 {
            self.unlink_from_list(pfn);
            self.release_backing(pfn);
            self.insert_free_page(pfn);
        }
    }

    /// Drop the paging-file copy recorded in the original PTE
    pub fn release_backing(&mut self, pfn: Pfn) {
        let entry = self.entry_mut(pfn);
        if let Pte::PagingFile { slot, protection } = entry.original_pte {
            entry.original_pte = Pte::DemandZero { protection };
            self.paging_file.release_backing_store(slot);
        }
    }

    /// Bring a transition frame back into use with one mapping
    pub fn reclaim_transition(&mut self, pfn: Pfn) -> Result<(), MmError> {
        let entry = self.entry(pfn);
        if entry.read_in_progress {
            return Err(MmError::PageCollision);
        }
        if entry.share_count != 0 {
            bugcheck(
                BugCheck::MemoryManagement,
                [0x4103, u64::from(pfn.0), u64::from(entry.share_count), 0],
            );
        }
        self.unlink_from_list(pfn);
        let entry = self.entry_mut(pfn);
        entry.reference_count += 1;
        entry.share_count = 1;
        entry.state = PageState::Active;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Page-table contents
    // ---------------------------------------------------------------------

    pub fn table_entry(&self, loc: PteLocation) -> Pte {
        match &self.contents[loc.table.index()] {
            FrameContent::Table(entries) => entries.get(loc.index).copied().unwrap_or_default(),
            _ => Pte::Zero,
        }
    }

    fn table_slot_mut(&mut self, loc: PteLocation) -> &mut Pte {
        let entries_per_table = self.entries_per_table;
        let content = &mut self.contents[loc.table.index()];
        if !matches!(content, FrameContent::Table(_)) {
            *content = FrameContent::Table(vec![Pte::Zero; entries_per_table].into_boxed_slice());
        }
        match content {
            FrameContent::Table(entries) if loc.index < entries.len() => &mut entries[loc.index],
            _ => bugcheck(
                BugCheck::MemoryManagement,
                [0x4104, u64::from(loc.table.0), loc.index as u64, 0],
            ),
        }
    }

    /// Snapshot of a page-table page
    pub fn table_entries(&self, table: Pfn) -> Vec<Pte> {
        match &self.contents[table.index()] {
            FrameContent::Table(entries) => entries.to_vec(),
            _ => vec![Pte::Zero; self.entries_per_table],
        }
    }

    pub fn read_pte(&self, address: PteAddress) -> Pte {
        match address {
            PteAddress::Table(loc) => self.table_entry(loc),
            PteAddress::Directory(id) => self.directory_ptes.get(&id).copied().unwrap_or_default(),
            PteAddress::Clone(id) => self.clone_blocks.get(&id).map(|b| b.pte).unwrap_or_default(),
            PteAddress::None => Pte::Zero,
        }
    }

    /// Store a PTE, keeping the containing table's used-entry and share
    /// counts current. The counts of the frame the PTE maps are the
    /// caller's business.
    pub fn set_pte(&mut self, address: PteAddress, new: Pte) -> Pte {
        match address {
            PteAddress::Table(loc) => {
                let old = {
                    let slot = self.table_slot_mut(loc);
                    core::mem::replace(slot, new)
                };
                self.account_slot(loc.table, old, new);
                old
            }
            PteAddress::Directory(id) => {
                if new.is_zero() {
                    self.directory_ptes.remove(&id).unwrap_or_default()
                } else {
                    self.directory_ptes.insert(id, new).unwrap_or_default()
                }
            }
            PteAddress::Clone(id) => match self.clone_blocks.get_mut(&id) {
                Some(block) => core::mem::replace(&mut block.pte, new),
                None => bugcheck(BugCheck::MemoryManagement, [0x4105, u64::from(id.0), 0, 0]),
            },
            PteAddress::None => bugcheck(BugCheck::MemoryManagement, [0x4106, new.raw(), 0, 0]),
        }
    }

    /// Recompute the counts of a page-table page whose contents were just
    /// read back from the paging file.
    ///
    /// For a top-level page, `self_index` is rewritten to map the frame it
    /// now lives in.
    pub fn recount_table(&mut self, table: Pfn, self_index: Option<usize>) {
        if let Some(index) = self_index {
            *self.table_slot_mut(PteLocation { table, index }) = Pte::valid(table, Protection::READ_WRITE);
            self.entry_mut(table).self_mapped = true;
        }
        let (used, children) = match &self.contents[table.index()] {
            FrameContent::Table(entries) => entries.iter().fold((0u32, 0u32), |(used, children), pte| {
                (
                    used + u32::from(self.counts_as_used(table, pte)),
                    children + u32::from(self.counts_as_valid_child(table, pte)),
                )
            }),
            _ => (0, 0),
        };
        let entry = self.entry_mut(table);
        entry.used_entries = used;
        entry.share_count += children;
    }

    fn counts_as_used(&self, table: Pfn, pte: &Pte) -> bool {
        !pte.is_zero() && !pte.is_global() && !self.is_self_edge(table, pte)
    }

    fn counts_as_valid_child(&self, table: Pfn, pte: &Pte) -> bool {
        pte.is_valid() && !pte.is_global() && !self.is_self_edge(table, pte)
    }

    fn is_self_edge(&self, table: Pfn, pte: &Pte) -> bool {
        pte.frame() == Some(table) && self.entry(table).self_mapped
    }

    fn account_slot(&mut self, table: Pfn, old: Pte, new: Pte) {
        let was_used = self.counts_as_used(table, &old);
        let is_used = self.counts_as_used(table, &new);
        if was_used != is_used {
            let entry = self.entry_mut(table);
            if is_used {
                entry.used_entries += 1;
            } else if entry.used_entries == 0 {
                bugcheck(BugCheck::MemoryManagement, [0x4107, u64::from(table.0), old.raw(), 0]);
            } else {
                entry.used_entries -= 1;
            }
        }

        let was_child = self.counts_as_valid_child(table, &old);
        let is_child = self.counts_as_valid_child(table, &new);
        if is_child && !was_child {
            self.increment_share(table);
        } else if was_child && !is_child {
            self.decrement_share(table);
        }
    }

    // ---------------------------------------------------------------------
    // Frame contents
    // ---------------------------------------------------------------------

    pub fn content(&self, pfn: Pfn) -> &FrameContent {
        &self.contents[pfn.index()]
    }

    pub fn set_content(&mut self, pfn: Pfn, content: FrameContent) {
        self.contents[pfn.index()] = content;
    }

    pub fn zero_frame(&mut self, pfn: Pfn) {
        self.contents[pfn.index()] = FrameContent::Zero;
    }

    pub fn read_word(&self, pfn: Pfn, word: usize) -> u64 {
        match &self.contents[pfn.index()] {
            FrameContent::Data(words) => words.get(word).copied().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn write_word(&mut self, pfn: Pfn, word: usize, value: u64) {
        let content = &mut self.contents[pfn.index()];
        if !matches!(content, FrameContent::Data(_)) {
            *content = FrameContent::Data(vec![0; WORDS_PER_PAGE].into_boxed_slice());
        }
        if let FrameContent::Data(words) = content {
            if let Some(slot) = words.get_mut(word) {
                *slot = value;
            }
        }
    }

    pub fn copy_frame(&mut self, from: Pfn, to: Pfn) {
        let content = self.contents[from.index()].clone();
        self.contents[to.index()] = content;
    }

    // ---------------------------------------------------------------------
    // Clone blocks
    // ---------------------------------------------------------------------

    pub fn create_clone_block(&mut self, pte: Pte, refs: u32) -> CloneId {
        let id = CloneId(self.next_clone);
        self.next_clone += 1;
        self.clone_blocks.insert(id, CloneBlock { pte, refs });
        id
    }

    pub fn clone_block(&self, id: CloneId) -> Option<&CloneBlock> {
        self.clone_blocks.get(&id)
    }

    pub fn add_clone_reference(&mut self, id: CloneId) {
        match self.clone_blocks.get_mut(&id) {
            Some(block) => block.refs += 1,
            None => bugcheck(BugCheck::MemoryManagement, [0x4108, u64::from(id.0), 0, 0]),
        }
    }

    /// Drop one sharer; the last one releases the block and its page
    pub fn decrement_clone_reference(&mut self, id: CloneId) {
        let remaining = match self.clone_blocks.get_mut(&id) {
            Some(block) if block.refs > 0 => {
                block.refs -= 1;
                block.refs
            }
            _ => bugcheck(BugCheck::MemoryManagement, [0x4108, u64::from(id.0), 1, 0]),
        };
        if remaining != 0 {
            return;
        }
        let Some(block) = self.clone_blocks.remove(&id) else {
            return;
        };
        match block.pte {
            Pte::Transition { frame, .. } => {
                self.entry_mut(frame).pte_address = PteAddress::None;
                self.delete_unmapped(frame);
            }
            Pte::PagingFile { slot, .. } => self.paging_file.release_backing_store(slot),
            Pte::Valid { frame, .. } => bugcheck(
                BugCheck::PfnShareCount,
                [u64::from(frame.0), u64::from(id.0), 2, 0],
            ),
            _ => {}
        }
    }

    pub fn clone_block_count(&self) -> usize {
        self.clone_blocks.len()
    }

    // ---------------------------------------------------------------------
    // Audits
    // ---------------------------------------------------------------------

    /// Check list membership against the counts of every frame.
    ///
    /// A frame sits on a page list exactly when it has neither mappings nor
    /// references, and a mapped frame always holds a reference. Returns the
    /// first offending frame.
    pub fn audit(&self) -> Result<(), Pfn> {
        let mut listed = 0usize;
        for (index, entry) in self.entries.iter().enumerate() {
            let pfn = Pfn(index as u32);
            if entry.state == PageState::Bad {
                continue;
            }
            let idle = entry.share_count == 0 && entry.reference_count == 0;
            let on_list = self.list_kind_of(pfn).is_some();
            if idle != on_list {
                return Err(pfn);
            }
            if entry.share_count > 0 && entry.reference_count == 0 {
                return Err(pfn);
            }
            if on_list {
                listed += 1;
            }
        }
        let counted = self.free_pages() + self.zeroed_pages() + self.standby_pages() + self.modified_pages();
        if listed != counted {
            return Err(Pfn(0));
        }
        Ok(())
    }

    /// Frames currently used for `usage`
    pub fn frames_with_usage(&self, usage: PageUsage) -> usize {
        self.entries
            .iter()
            .filter(|e| e.usage == usage && e.state != PageState::Bad)
            .count()
    }

    /// Frames in use as page tables at any level
    pub fn page_table_frames(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.usage, PageUsage::PageTable { .. }))
            .count()
    }

    pub(crate) fn directory_pte(&self, id: AsId) -> Pte {
        self.read_pte(PteAddress::Directory(id))
    }
}

/// Protection recorded for a frame's original PTE
pub fn original_protection(pte: &Pte) -> Protection {
    pte.protection().unwrap_or(Protection::READ_WRITE)
}
