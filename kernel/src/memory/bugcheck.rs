//! Fatal structural-corruption stops.
//!
//! A corrupted page graph cannot be repaired in place, so these never
//! return. The panic message carries the code name so the host tests can
//! match on it.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugCheck {
    /// A restored kernel stack failed its signature check
    KernelStackInpageError,
    /// Unrecoverable paging I/O for kernel data
    KernelDataInpageError,
    /// A PFN share count would go negative
    PfnShareCount,
    /// A PFN reference count would go negative
    PfnReferenceCount,
    /// A page list link or a frame's list state is inconsistent
    PfnListCorrupt,
    /// A PTE or PFN was found in a state its caller cannot produce
    MemoryManagement,
    /// A process was deleted while driver-held page locks were outstanding
    DriverLeftLockedPagesInProcess,
}

impl BugCheck {
    pub fn name(self) -> &'static str {
        match self {
            BugCheck::KernelStackInpageError => "KERNEL_STACK_INPAGE_ERROR",
            BugCheck::KernelDataInpageError => "KERNEL_DATA_INPAGE_ERROR",
            BugCheck::PfnShareCount => "PFN_SHARE_COUNT",
            BugCheck::PfnReferenceCount => "PFN_REFERENCE_COUNT",
            BugCheck::PfnListCorrupt => "PFN_LIST_CORRUPT",
            BugCheck::MemoryManagement => "MEMORY_MANAGEMENT",
            BugCheck::DriverLeftLockedPagesInProcess => "DRIVER_LEFT_LOCKED_PAGES_IN_PROCESS",
        }
    }
}

impl fmt::Display for BugCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stop the system.
#[cold]
#[track_caller]
pub fn bugcheck(code: BugCheck, args: [u64; 4]) -> ! {
    log::error!(
        "*** STOP: {} ({:#x}, {:#x}, {:#x}, {:#x})",
        code,
        args[0],
        args[1],
        args[2],
        args[3]
    );
    panic!(
        "{} ({:#x}, {:#x}, {:#x}, {:#x})",
        code, args[0], args[1], args[2], args[3]
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "KERNEL_STACK_INPAGE_ERROR")]
    fn test_bugcheck_panics_with_code_name() {
        bugcheck(BugCheck::KernelStackInpageError, [1, 2, 3, 4]);
    }
}
