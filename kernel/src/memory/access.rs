//! Fault access check
//!
//! Decides whether a faulting access may proceed, before anything is
//! resolved. Access violations win over guard pages. A guard page is
//! one-shot: the first access clears the guard attribute and reports
//! [`FaultStatus::GuardPageViolation`]; a thread that loses the race to
//! clear it sees plain success.

use super::error::FaultStatus;
use super::frame_metadata::{PfnDatabase, PfnGuard};
use super::pte::{Protection, Pte, PteAddress};
use super::MemoryManager;
use crate::task::thread::PreviousMode;
use x86_64::VirtAddr;

/// Trap details the dispatcher passes along with a fault
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapContext {
    /// The fault hit the retry window of a lock-free list pop; a guard
    /// signal must not surface from it
    pub slist_fault: bool,
}

/// One access to check
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest {
    pub va: VirtAddr,
    pub write: bool,
    pub mode: PreviousMode,
    /// The faulting thread is attached to a process other than its own
    pub attached_foreign: bool,
    pub trap: TrapContext,
}

/// Whether the caller already holds the PFN lock
pub enum PfnLockState<'g, 'a> {
    Held(&'g mut PfnGuard<'a>),
    NotHeld(&'g PfnDatabase),
}

impl MemoryManager {
    /// Check `request` against the PTE at `address`.
    ///
    /// `pte` is the entry as the fault path read it; `protection` is the
    /// protection that applies when the entry carries none of its own (the
    /// VAD's, for a never-touched page).
    pub fn check_access(
        &self,
        request: &AccessRequest,
        address: PteAddress,
        pte: Pte,
        protection: Protection,
        pfn: PfnLockState<'_, '_>,
    ) -> FaultStatus {
        if request.mode == PreviousMode::User && request.va >= self.depth().user_boundary() {
            return FaultStatus::AccessViolation;
        }

        if let Pte::Valid { protection: current, .. } = pte {
            return if !request.write || current.allows_write() {
                FaultStatus::Success
            } else {
                FaultStatus::AccessViolation
            };
        }

        let protection = pte.protection().unwrap_or(protection);
        let level = protection.access_level().saturating_sub(u32::from(request.write));
        if level < Protection::ACCESS_THRESHOLD {
            return FaultStatus::AccessViolation;
        }
        if !protection.is_guard() {
            return FaultStatus::Success;
        }

        if request.attached_foreign || request.trap.slist_fault {
            log::debug!(
                "guard page at {:#x} not reported (foreign={}, slist={})",
                request.va.as_u64(),
                request.attached_foreign,
                request.trap.slist_fault
            );
            return FaultStatus::AccessViolation;
        }

        match pfn {
            PfnLockState::Held(guard) => clear_guard(guard, address, pte, protection),
            PfnLockState::NotHeld(db) => clear_guard(&mut db.lock(), address, pte, protection),
        }
    }
}

/// Remove the guard attribute, once
fn clear_guard(guard: &mut PfnGuard<'_>, address: PteAddress, pte: Pte, protection: Protection) -> FaultStatus {
    if let Pte::Transition { frame, .. } = pte {
        // The saved copy is restored if the frame is repurposed.
        let entry = guard.entry_mut(frame);
        if let Some(saved) = entry.original_pte.protection().filter(|p| p.is_guard()) {
            entry.original_pte = entry.original_pte.with_protection(saved.without_guard());
        }
    }

    let current = guard.read_pte(address);
    match current.protection() {
        Some(p) if p.is_guard() => {
            guard.set_pte(address, current.with_protection(p.without_guard()));
            log::trace!("guard cleared at {:?}", address);
            FaultStatus::GuardPageViolation
        }
        None if current.is_zero() => {
            guard.set_pte(
                address,
                Pte::DemandZero {
                    protection: protection.without_guard(),
                },
            );
            FaultStatus::GuardPageViolation
        }
        _ => FaultStatus::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::small_manager;

    fn request(write: bool) -> AccessRequest {
        AccessRequest {
            va: VirtAddr::new(0x40_0000),
            write,
            mode: PreviousMode::User,
            attached_foreign: false,
            trap: TrapContext::default(),
        }
    }

    fn scratch(mm: &MemoryManager) -> PteAddress {
        mm.system_ptes().address(mm.system_ptes().capacity() - 1)
    }

    #[test]
    fn test_write_to_read_only_valid_page() {
        let (mm, _) = small_manager();
        let pte = Pte::valid(mm.shared_user_data_frame(), Protection::READ);
        let address = scratch(&mm);
        let status = mm.check_access(&request(true), address, pte, Protection::READ, PfnLockState::NotHeld(mm.pfn()));
        assert_eq!(status, FaultStatus::AccessViolation);
        let status = mm.check_access(&request(false), address, pte, Protection::READ, PfnLockState::NotHeld(mm.pfn()));
        assert_eq!(status, FaultStatus::Success);
    }

    #[test]
    fn test_user_fault_above_boundary() {
        let (mm, _) = small_manager();
        let mut req = request(false);
        req.va = mm.depth().user_boundary();
        let status = mm.check_access(&req, scratch(&mm), Pte::Zero, Protection::READ, PfnLockState::NotHeld(mm.pfn()));
        assert_eq!(status, FaultStatus::AccessViolation);
    }

    #[test]
    fn test_no_access_beats_guard() {
        let (mm, _) = small_manager();
        let pte = Pte::DemandZero {
            protection: Protection::GUARD,
        };
        let status = mm.check_access(&request(false), scratch(&mm), pte, Protection::empty(), PfnLockState::NotHeld(mm.pfn()));
        assert_eq!(status, FaultStatus::AccessViolation);
    }

    #[test]
    fn test_guard_is_one_shot() {
        let (mm, _) = small_manager();
        let address = scratch(&mm);
        let guarded = Pte::DemandZero {
            protection: Protection::READ_WRITE | Protection::GUARD,
        };
        let mut guard = mm.pfn().lock();
        guard.set_pte(address, guarded);
        let status = mm.check_access(&request(true), address, guarded, Protection::READ_WRITE, PfnLockState::Held(&mut guard));
        assert_eq!(status, FaultStatus::GuardPageViolation);
        assert_eq!(
            guard.read_pte(address),
            Pte::DemandZero {
                protection: Protection::READ_WRITE
            }
        );
        // A second thread that read the guarded entry before it was cleared
        let status = mm.check_access(&request(true), address, guarded, Protection::READ_WRITE, PfnLockState::Held(&mut guard));
        assert_eq!(status, FaultStatus::Success);
    }

    #[test]
    fn test_guard_while_attached_is_access_violation() {
        let (mm, _) = small_manager();
        let address = scratch(&mm);
        let guarded = Pte::DemandZero {
            protection: Protection::READ_WRITE | Protection::GUARD,
        };
        mm.pfn().lock().set_pte(address, guarded);
        let mut req = request(false);
        req.attached_foreign = true;
        assert_eq!(
            mm.check_access(&req, address, guarded, Protection::READ_WRITE, PfnLockState::NotHeld(mm.pfn())),
            FaultStatus::AccessViolation
        );
        req.attached_foreign = false;
        req.trap.slist_fault = true;
        assert_eq!(
            mm.check_access(&req, address, guarded, Protection::READ_WRITE, PfnLockState::NotHeld(mm.pfn())),
            FaultStatus::AccessViolation
        );
        assert_eq!(mm.pfn().lock().read_pte(address), guarded);
    }
}
