//! Address-space cloning for fork
//!
//! Private pages are not copied. Each one is moved into a clone block that
//! both processes reference through prototype entries; resident pages stay
//! mapped in the parent read-only with copy-on-write. The first write in
//! either process copies the page out of the block.

use super::error::MmError;
use super::frame_metadata::PfnGuard;
use super::layout::PAGE_SIZE;
use super::page_table::Walk;
use super::process_memory::AddressSpace;
use super::pte::{CloneId, Pfn, Protection, Pte, PteAddress, PteLocation};
use super::tlb::FlushList;
use super::vad::{Vad, VadKind};
use super::MemoryManager;
use alloc::vec::Vec;
use x86_64::VirtAddr;

/// A PTE to install in the child
type ChildEntry = (VirtAddr, Pte);

impl MemoryManager {
    /// Make `target` a copy of `source`'s deletable private and mapped
    /// memory. Commitment for the copied VADs is charged to `target`.
    pub(crate) fn clone_address_space(&self, source: &AddressSpace, target: &AddressSpace) -> Result<(), MmError> {
        self.ensure_resident(source)?;
        let (vads, entries) = self.share_source_pages(source)?;

        let mut placed = 0;
        let result = self.place_child_entries(target, &vads, &entries, &mut placed);
        if let Err(e) = result {
            let mut guard = self.pfn().lock();
            drop_child_entries(&mut guard, &entries[placed..]);
            log::warn!("{}: clone of {} failed: {}", target.id(), source.id(), e);
            return Err(e);
        }
        log::debug!(
            "{}: cloned {} VADs, {} entries from {}",
            target.id(),
            vads.len(),
            entries.len(),
            source.id()
        );
        Ok(())
    }

    fn share_source_pages(&self, source: &AddressSpace) -> Result<(Vec<Vad>, Vec<ChildEntry>), MmError> {
        let _as_lock = source.lock_address_space();
        let state = source.lock_working_set();
        let top = state.top()?;
        let vads: Vec<Vad> = state
            .vads
            .iter()
            .filter(|vad| vad.deletable && matches!(vad.kind, VadKind::Private | VadKind::MappedView { .. }))
            .cloned()
            .collect();

        let leaf_span = self.depth().entry_span(2);
        let mut guard = self.pfn().lock();
        let mut flush = FlushList::new();
        let mut entries = Vec::new();
        for vad in &vads {
            let mut va = vad.start;
            while va < vad.end {
                let loc = match self.locate_pte(&mut guard, top, va, Walk::Existing) {
                    Ok(Some(loc)) => loc,
                    Ok(None) => {
                        va = VirtAddr::new((va.as_u64() / leaf_span + 1) * leaf_span);
                        continue;
                    }
                    Err(e) => {
                        flush.flush(self.stats());
                        drop_child_entries(&mut guard, &entries);
                        return Err(e);
                    }
                };
                if let Some(child) = self.share_for_clone(&mut guard, loc, va, &mut flush) {
                    entries.push((va, child));
                }
                va += PAGE_SIZE;
            }
        }
        flush.flush(self.stats());
        Ok((vads, entries))
    }

    /// Turn the source entry at `loc` into something both processes can
    /// reference; returns the entry for the child
    fn share_for_clone(&self, guard: &mut PfnGuard<'_>, loc: PteLocation, va: VirtAddr, flush: &mut FlushList) -> Option<Pte> {
        let address = PteAddress::Table(loc);
        match guard.table_entry(loc) {
            Pte::Zero => None,
            demand_zero @ Pte::DemandZero { .. } => Some(demand_zero),
            Pte::Prototype { block } => {
                guard.add_clone_reference(block);
                Some(Pte::Prototype { block })
            }
            Pte::Valid { frame, protection, .. } => match guard.entry(frame).pte_address {
                PteAddress::Clone(block) => {
                    guard.add_clone_reference(block);
                    Some(Pte::Prototype { block })
                }
                owner if owner == address => {
                    let shared = protection.shared_copy_on_write();
                    let block = guard.create_clone_block(Pte::valid(frame, shared), 2);
                    hand_frame_to_block(guard, frame, block, shared);
                    guard.set_pte(
                        address,
                        Pte::Valid {
                            frame,
                            protection: shared,
                            dirty: false,
                            global: false,
                        },
                    );
                    flush.add(va);
                    Some(Pte::Prototype { block })
                }
                other => {
                    log::warn!("clone: {} at {:#x} owned by {:?}, not copied", frame, va.as_u64(), other);
                    None
                }
            },
            Pte::Transition { frame, protection } => {
                let shared = protection.shared_copy_on_write();
                let block = guard.create_clone_block(Pte::Transition { frame, protection: shared }, 2);
                hand_frame_to_block(guard, frame, block, shared);
                guard.set_pte(address, Pte::Prototype { block });
                Some(Pte::Prototype { block })
            }
            Pte::PagingFile { slot, protection } => {
                let block = guard.create_clone_block(
                    Pte::PagingFile {
                        slot,
                        protection: protection.shared_copy_on_write(),
                    },
                    2,
                );
                guard.set_pte(address, Pte::Prototype { block });
                Some(Pte::Prototype { block })
            }
        }
    }

    fn place_child_entries(
        &self,
        target: &AddressSpace,
        vads: &[Vad],
        entries: &[ChildEntry],
        placed: &mut usize,
    ) -> Result<(), MmError> {
        let _as_lock = target.lock_address_space();
        let mut state = target.lock_working_set();
        let top = state.top()?;
        for vad in vads {
            target.charge_commit(self, vad.commit_charge)?;
            if let Err(e) = self.insert_vad(target, &mut state, vad.clone()) {
                target.return_commit(self, vad.commit_charge);
                return Err(e);
            }
        }

        let mut guard = self.pfn().lock();
        for (va, pte) in entries {
            let loc = self
                .locate_pte(&mut guard, top, *va, Walk::Create(target))?
                .ok_or(MmError::InvalidAddress)?;
            guard.set_pte(PteAddress::Table(loc), *pte);
            *placed += 1;
        }
        Ok(())
    }
}

/// Make `block` the owner of `frame`
fn hand_frame_to_block(guard: &mut PfnGuard<'_>, frame: Pfn, block: CloneId, shared: Protection) {
    let entry = guard.entry_mut(frame);
    entry.pte_address = PteAddress::Clone(block);
    entry.pte_frame = None;
    entry.original_pte = entry.original_pte.with_protection(shared);
}

/// Give back the clone references held by entries never installed
fn drop_child_entries(guard: &mut PfnGuard<'_>, entries: &[ChildEntry]) {
    for (_, pte) in entries {
        if let Pte::Prototype { block } = pte {
            guard.decrement_clone_reference(*block);
        }
    }
}
