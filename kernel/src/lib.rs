//! Virtual-memory core of the stratum kernel.
//!
//! The crate builds as `no_std` with `alloc`; the host test harness links it
//! against `std` so the page-table model, PFN accounting and the fault path
//! can be exercised without booting.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logger;
pub mod memory;
pub mod task;

pub use memory::error::{FaultStatus, MmError};
pub use memory::{init, mm, MemoryManager};
