//! Section views
//!
//! Sections belong to the object manager. During process construction the
//! core asks a [`SectionMapper`] to map one, and the mapper calls back into
//! [`MemoryManager::map_view_vad`] to reserve the range. Pages of a view are
//! demand-zero as far as this core is concerned.

use super::error::MmError;
use super::process_memory::AddressSpace;
use super::pte::Protection;
use super::vad::{Vad, VadKind};
use super::MemoryManager;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub u32);

/// Result of mapping a view. `ImageNotAtBase` is a success that tells the
/// loader to apply relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    Success,
    ImageNotAtBase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewInfo {
    pub base: VirtAddr,
    pub pages: u64,
    pub status: MapStatus,
}

/// Image metadata recorded on the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub section: SectionId,
    pub base: VirtAddr,
    pub pages: u64,
    pub relocated: bool,
}

pub trait SectionMapper: Send + Sync {
    fn map_view(&self, mm: &MemoryManager, space: &AddressSpace, section: SectionId) -> Result<ViewInfo, MmError>;
}

/// Maps every section as an image of a fixed size at a preferred base
#[derive(Debug, Clone, Copy)]
pub struct FixedImageMapper {
    pub preferred_base: VirtAddr,
    pub pages: u64,
    pub protection: Protection,
}

impl SectionMapper for FixedImageMapper {
    fn map_view(&self, mm: &MemoryManager, space: &AddressSpace, section: SectionId) -> Result<ViewInfo, MmError> {
        let (base, status) = mm.map_view_vad(space, section, Some(self.preferred_base), self.pages, self.protection)?;
        Ok(ViewInfo {
            base,
            pages: self.pages,
            status,
        })
    }
}

impl MemoryManager {
    /// Reserve the range of a section view.
    ///
    /// Falls back to the lowest free range when `preferred` is taken,
    /// reporting [`MapStatus::ImageNotAtBase`].
    pub fn map_view_vad(
        &self,
        space: &AddressSpace,
        section: SectionId,
        preferred: Option<VirtAddr>,
        pages: u64,
        protection: Protection,
    ) -> Result<(VirtAddr, MapStatus), MmError> {
        if pages == 0 {
            return Err(MmError::InvalidAddress);
        }
        let kind = VadKind::MappedView { section };
        let mut state = space.lock_working_set();
        let limit = self.depth().user_boundary();
        if let Some(base) = preferred {
            let vad = Vad::new(base, pages, protection, kind).committed(0);
            if vad.end <= limit {
                match self.insert_vad(space, &mut state, vad) {
                    Ok(()) => return Ok((base, MapStatus::Success)),
                    Err(MmError::ConflictingAddresses) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        let base = state.vads.find_free_region(pages, limit).ok_or(MmError::NoVad)?;
        self.insert_vad(space, &mut state, Vad::new(base, pages, protection, kind).committed(0))?;
        let status = if preferred.is_some() {
            log::debug!("{}: section {:?} relocated to {:#x}", space.id(), section, base.as_u64());
            MapStatus::ImageNotAtBase
        } else {
            MapStatus::Success
        };
        Ok((base, status))
    }
}
