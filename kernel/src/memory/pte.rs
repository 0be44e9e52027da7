//! Page-table entries and the addresses that identify them

use bitflags::bitflags;
use core::fmt;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(pub u32);

impl Pfn {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn {:#x}", self.0)
    }
}

bitflags! {
    /// Page protection as seen by the fault path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const COPY_ON_WRITE = 1 << 3;
        /// One-shot guard: the first touch signals instead of succeeding
        const GUARD = 1 << 4;
        const NO_CACHE = 1 << 5;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Protection {
    /// Permission level used by the access check.
    ///
    /// A fault is legal when `level - write` stays at or above
    /// [`Protection::ACCESS_THRESHOLD`], so a write needs level 11 and a read
    /// needs 10. No-access sits far below both.
    pub fn access_level(self) -> u32 {
        if self.intersects(Protection::WRITE | Protection::COPY_ON_WRITE) {
            11
        } else if self.intersects(Protection::READ | Protection::EXECUTE) {
            10
        } else {
            1
        }
    }

    pub const ACCESS_THRESHOLD: u32 = 10;

    /// Write or copy-on-write
    pub fn allows_write(self) -> bool {
        self.intersects(Protection::WRITE | Protection::COPY_ON_WRITE)
    }

    pub fn is_guard(self) -> bool {
        self.contains(Protection::GUARD)
    }

    pub fn without_guard(self) -> Self {
        self - Protection::GUARD
    }

    /// Protection used for a read-only mapping of a shared page whose
    /// writers must copy first
    pub fn shared_copy_on_write(self) -> Self {
        if self.allows_write() {
            (self - Protection::WRITE) | Protection::COPY_ON_WRITE | Protection::READ
        } else {
            self
        }
    }

    /// Protection of a private copy made by a copy-on-write fault
    pub fn private_copy(self) -> Self {
        if self.contains(Protection::COPY_ON_WRITE) {
            (self - Protection::COPY_ON_WRITE) | Protection::WRITE
        } else {
            self
        }
    }
}

/// Location of a page in the paging file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PagingSlot {
    pub file: u8,
    pub offset: u32,
}

/// Handle of a fork clone block (a shared prototype PTE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloneId(pub u32);

/// Address-space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub u32);

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

/// One slot of the page-table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pte {
    /// Nothing reserved or committed here
    #[default]
    Zero,
    /// Committed; the first touch gets a zero-filled page
    DemandZero { protection: Protection },
    Valid {
        frame: Pfn,
        protection: Protection,
        dirty: bool,
        /// Shared system mapping copied into a process; never accounted
        global: bool,
    },
    /// Not mapped, but the frame still holds the contents
    Transition { frame: Pfn, protection: Protection },
    /// Refers to a fork clone block shared with other processes
    Prototype { block: CloneId },
    /// Contents live in the paging file
    PagingFile { slot: PagingSlot, protection: Protection },
}

impl Pte {
    pub fn valid(frame: Pfn, protection: Protection) -> Self {
        Pte::Valid {
            frame,
            protection,
            dirty: false,
            global: false,
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        matches!(self, Pte::Zero)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self, Pte::Valid { .. })
    }

    #[inline]
    pub fn is_transition(&self) -> bool {
        matches!(self, Pte::Transition { .. })
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Pte::Valid { global: true, .. })
    }

    /// Frame referenced by a valid or transition entry
    pub fn frame(&self) -> Option<Pfn> {
        match *self {
            Pte::Valid { frame, .. } | Pte::Transition { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub fn protection(&self) -> Option<Protection> {
        match *self {
            Pte::DemandZero { protection }
            | Pte::Valid { protection, .. }
            | Pte::Transition { protection, .. }
            | Pte::PagingFile { protection, .. } => Some(protection),
            Pte::Zero | Pte::Prototype { .. } => None,
        }
    }

    /// Same entry with its protection replaced; entries without a protection
    /// are returned unchanged
    pub fn with_protection(self, protection: Protection) -> Self {
        match self {
            Pte::DemandZero { .. } => Pte::DemandZero { protection },
            Pte::Valid {
                frame,
                dirty,
                global,
                ..
            } => Pte::Valid {
                frame,
                protection,
                dirty,
                global,
            },
            Pte::Transition { frame, .. } => Pte::Transition { frame, protection },
            Pte::PagingFile { slot, .. } => Pte::PagingFile { slot, protection },
            other => other,
        }
    }

    /// Transition entry preserving this valid entry's frame and protection
    pub fn to_transition(self) -> Self {
        match self {
            Pte::Valid {
                frame, protection, ..
            } => Pte::Transition { frame, protection },
            other => other,
        }
    }

    /// Raw encoding used only for logging and bugcheck arguments
    pub fn raw(&self) -> u64 {
        match *self {
            Pte::Zero => 0,
            Pte::DemandZero { protection } => (u64::from(protection.bits()) << 5) | 0x2,
            Pte::Valid {
                frame, protection, ..
            } => (u64::from(frame.0) << 12) | (u64::from(protection.bits()) << 5) | 0x1,
            Pte::Transition { frame, protection } => {
                (u64::from(frame.0) << 12) | (u64::from(protection.bits()) << 5) | 0x4
            }
            Pte::Prototype { block } => (u64::from(block.0) << 12) | 0x8,
            Pte::PagingFile { slot, protection } => {
                (u64::from(slot.offset) << 20)
                    | (u64::from(slot.file) << 12)
                    | (u64::from(protection.bits()) << 5)
                    | 0x10
            }
        }
    }
}

/// A slot inside a page-table page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PteLocation {
    pub table: Pfn,
    pub index: usize,
}

/// Where the PTE that maps a frame lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PteAddress {
    #[default]
    None,
    Table(PteLocation),
    /// The directory-table-base entry of an address space's top page
    Directory(AsId),
    /// The prototype PTE inside a clone block
    Clone(CloneId),
}

impl PteAddress {
    pub fn table(table: Pfn, index: usize) -> Self {
        PteAddress::Table(PteLocation { table, index })
    }
}
