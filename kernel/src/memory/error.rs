//! Memory-manager error and fault-status types

use thiserror::Error;

/// Recoverable failures surfaced to callers.
///
/// Exhaustion errors are always unwound before they are returned: no
/// commitment, resident-available charge or page is left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmError {
    #[error("commitment limit exceeded")]
    CommitmentExceeded,
    #[error("insufficient resident memory")]
    InsufficientResidentMemory,
    #[error("no free physical pages")]
    InsufficientMemory,
    #[error("system PTE pool exhausted")]
    NoSystemPtes,
    #[error("stack overflow")]
    StackOverflow,
    #[error("address range conflicts with an existing descriptor")]
    ConflictingAddresses,
    #[error("invalid address or range")]
    InvalidAddress,
    #[error("no virtual address descriptor covers the address")]
    NoVad,
    #[error("address space is not in the required lifecycle state")]
    InvalidLifecycle,
    #[error("paging file is full")]
    PagingFileFull,
    #[error("page is being read by another thread")]
    PageCollision,
    #[error("paging I/O failed")]
    IoFailure,
}

/// Outcome of handling a page fault.
///
/// These are expected results reported to the fault dispatcher, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Success,
    AccessViolation,
    /// One-shot signal: a guard page was hit and its guard bit removed
    GuardPageViolation,
    StackOverflow,
}

impl FaultStatus {
    pub fn is_success(self) -> bool {
        self == FaultStatus::Success
    }
}
