//! Commitment and resident-available accounting
//!
//! Every path that takes a page off the free lists first promises backing
//! store (commitment) and, for pages that cannot be trimmed, physical memory
//! (resident-available). Each charge has exactly one matching return.

use super::bugcheck::{bugcheck, BugCheck};
use super::error::MmError;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug)]
pub struct Commitment {
    limit: u64,
    committed: AtomicU64,
    resident_available: AtomicI64,
    /// Resident-available pages that are never handed out
    reserve: i64,
}

impl Commitment {
    pub fn new(limit: u64, resident_pages: u64, reserve: u64) -> Self {
        Self {
            limit,
            committed: AtomicU64::new(0),
            resident_available: AtomicI64::new(resident_pages as i64),
            reserve: reserve as i64,
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn resident_available(&self) -> i64 {
        self.resident_available.load(Ordering::Acquire)
    }

    pub fn charge_commitment(&self, pages: u64) -> Result<(), MmError> {
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(pages).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|current| {
                log::warn!(
                    "commitment of {} pages refused ({} of {} committed)",
                    pages,
                    current,
                    self.limit
                );
                MmError::CommitmentExceeded
            })
    }

    pub fn return_commitment(&self, pages: u64) {
        if self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(pages))
            .is_err()
        {
            bugcheck(BugCheck::MemoryManagement, [0x4201, pages, self.committed(), 0]);
        }
    }

    /// Whether `pages` more could be charged without dipping into the reserve
    pub fn resident_headroom(&self, pages: u64) -> bool {
        self.resident_available() - pages as i64 >= self.reserve
    }

    pub fn charge_resident_available(&self, pages: u64) -> Result<(), MmError> {
        let pages = pages as i64;
        self.resident_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current - pages >= self.reserve {
                    Some(current - pages)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| MmError::InsufficientResidentMemory)
    }

    pub fn return_resident_available(&self, pages: u64) {
        self.resident_available.fetch_add(pages as i64, Ordering::AcqRel);
    }
}

/// Per-process commitment counter.
///
/// Charged and returned only alongside the system-wide counter.
#[derive(Debug, Default)]
pub struct ProcessCommit {
    pages: AtomicU64,
}

impl ProcessCommit {
    pub const fn new() -> Self {
        Self {
            pages: AtomicU64::new(0),
        }
    }

    pub fn pages(&self) -> u64 {
        self.pages.load(Ordering::Acquire)
    }

    /// Charge both the system and this process
    pub fn charge(&self, system: &Commitment, pages: u64) -> Result<(), MmError> {
        system.charge_commitment(pages)?;
        self.pages.fetch_add(pages, Ordering::AcqRel);
        Ok(())
    }

    /// Return to both the system and this process
    pub fn release(&self, system: &Commitment, pages: u64) {
        if self
            .pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(pages))
            .is_err()
        {
            bugcheck(BugCheck::MemoryManagement, [0x4202, pages, self.pages(), 0]);
        }
        system.return_commitment(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_limit_is_enforced() {
        let commit = Commitment::new(10, 100, 0);
        assert!(commit.charge_commitment(8).is_ok());
        assert_eq!(commit.charge_commitment(3), Err(MmError::CommitmentExceeded));
        commit.return_commitment(8);
        assert_eq!(commit.committed(), 0);
    }

    #[test]
    fn test_resident_reserve_is_kept() {
        let commit = Commitment::new(10, 10, 4);
        assert!(commit.resident_headroom(6));
        assert!(!commit.resident_headroom(7));
        assert!(commit.charge_resident_available(6).is_ok());
        assert_eq!(
            commit.charge_resident_available(1),
            Err(MmError::InsufficientResidentMemory)
        );
        commit.return_resident_available(6);
        assert_eq!(commit.resident_available(), 10);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_process_commit_cannot_go_negative() {
        let system = Commitment::new(10, 10, 0);
        let process = ProcessCommit::new();
        process.charge(&system, 2).unwrap();
        process.release(&system, 3);
    }
}
