//! Task-side collaborators of the memory core.
//!
//! Only the thread fields the fault path, the stack allocator and the stack
//! pager read live here; scheduling is elsewhere.

pub mod thread;

pub use thread::{PreviousMode, Thread};
