//! Page-table walks
//!
//! Walks run under the PFN lock. User walks may create missing tables
//! (charging one page of commitment and resident-available each) or bring
//! back tables that were paged out while the process was swapped.

use super::error::MmError;
use super::frame_metadata::{PageUsage, PfnGuard};
use super::paging::HierarchyDepth;
use super::process_memory::AddressSpace;
use super::pte::{Pfn, Pte, PteAddress, PteLocation};
use super::{MemoryManager, TABLE_PROTECTION};
use x86_64::VirtAddr;

/// How a walk treats a missing table
#[derive(Clone, Copy)]
pub(crate) enum Walk<'a> {
    /// Stop and report that nothing is mapped
    Existing,
    /// Create it, charged to this address space
    Create(&'a AddressSpace),
}

/// Install a fresh table below `parent`.
///
/// `owner` pays for user tables; system tables are never charged.
pub(crate) fn create_table(
    mm: Option<&MemoryManager>,
    guard: &mut PfnGuard<'_>,
    owner: Option<&AddressSpace>,
    parent: PteLocation,
    level: usize,
) -> Result<Pfn, MmError> {
    let color = owner.map_or(0, AddressSpace::next_color);
    let frame = match (mm, owner) {
        (Some(mm), Some(space)) => {
            space.charge_commit(mm, 1)?;
            if let Err(e) = mm.commitment().charge_resident_available(1) {
                space.return_commit(mm, 1);
                return Err(e);
            }
            match mm.take_zero_page(guard, color) {
                Ok(frame) => frame,
                Err(e) => {
                    mm.commitment().return_resident_available(1);
                    space.return_commit(mm, 1);
                    return Err(e);
                }
            }
        }
        _ => guard.remove_zero_page(color).ok_or(MmError::InsufficientMemory)?,
    };

    install_page(guard, frame, PteAddress::Table(parent), PageUsage::PageTable { level: level as u8 });
    log::trace!("level {} table {} at {:?}", level, frame, parent);
    Ok(frame)
}

/// Map a freshly removed frame at `address` as a valid, dirty entry
pub(crate) fn install_page(guard: &mut PfnGuard<'_>, frame: Pfn, address: PteAddress, usage: PageUsage) {
    guard.activate(
        frame,
        address,
        usage,
        Pte::DemandZero {
            protection: TABLE_PROTECTION,
        },
        true,
    );
    guard.set_pte(
        address,
        Pte::Valid {
            frame,
            protection: TABLE_PROTECTION,
            dirty: true,
            global: false,
        },
    );
}

/// Build the system tables covering `va`, returning its leaf table
pub(crate) fn build_system_chain(
    guard: &mut PfnGuard<'_>,
    depth: &dyn HierarchyDepth,
    top: Pfn,
    va: VirtAddr,
) -> Result<Pfn, MmError> {
    let mut table = top;
    for level in (2..=depth.levels()).rev() {
        let slot = PteLocation {
            table,
            index: depth.index(va, level),
        };
        table = match guard.table_entry(slot) {
            Pte::Valid { frame, .. } => frame,
            _ => create_table(None, guard, None, slot, level - 1)?,
        };
    }
    Ok(table)
}

impl MemoryManager {
    /// Find the leaf PTE slot for a user address.
    ///
    /// Returns `Ok(None)` when an intermediate table is missing and `walk` is
    /// [`Walk::Existing`].
    pub(crate) fn locate_pte(
        &self,
        guard: &mut PfnGuard<'_>,
        top: Pfn,
        va: VirtAddr,
        walk: Walk<'_>,
    ) -> Result<Option<PteLocation>, MmError> {
        let depth = self.depth();
        let mut table = top;
        for level in (2..=depth.levels()).rev() {
            let slot = PteLocation {
                table,
                index: depth.index(va, level),
            };
            table = match guard.table_entry(slot) {
                Pte::Valid { frame, .. } => frame,
                Pte::Zero => match walk {
                    Walk::Existing => return Ok(None),
                    Walk::Create(space) => create_table(Some(self), guard, Some(space), slot, level - 1)?,
                },
                Pte::Transition { .. } | Pte::PagingFile { .. } => {
                    let address = PteAddress::Table(slot);
                    let (frame, valid) = self.materialize(guard, address, PageUsage::PageTable { level: (level - 1) as u8 })?;
                    guard.set_pte(address, valid);
                    frame
                }
                other => {
                    log::error!("unexpected {:?} in level {} table {}", other, level, table);
                    return Err(MmError::InvalidAddress);
                }
            };
        }
        Ok(Some(PteLocation {
            table,
            index: depth.index(va, 1),
        }))
    }

    /// Leaf PTE for `va`, or `Pte::Zero` when no table maps it
    pub(crate) fn read_user_pte(&self, guard: &mut PfnGuard<'_>, top: Pfn, va: VirtAddr) -> Result<(Option<PteLocation>, Pte), MmError> {
        let loc = self.locate_pte(guard, top, va, Walk::Existing)?;
        let pte = loc.map_or(Pte::Zero, |loc| guard.table_entry(loc));
        Ok((loc, pte))
    }
}
