//! Thread control block, as seen by the memory core
//!
//! The scheduler owns threads; the memory core only needs:
//! - the owning and attached address spaces
//! - the previous processor mode of the current fault
//! - the chain of kernel stack segments
//! - the stack bounds cached in the user-mode environment block (TEB)
//!
//! The TEB lives in user memory, so every read of it goes through a
//! fallible probe instead of a plain load.

use crate::memory::kernel_stack::KernelStack;
use crate::memory::AddressSpace;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use thiserror::Error;
use x86_64::VirtAddr;

/// Global thread ID counter
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1); // 0 is reserved for the idle thread

/// Allocate a new thread ID
pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

/// Processor mode the faulting code ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousMode {
    Kernel,
    User,
}

/// Bounds of a user-mode stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address (exclusive)
    pub base: VirtAddr,
    /// Lowest committed address
    pub limit: VirtAddr,
    /// Bottom of the reservation; the stack never grows below one page
    /// above it
    pub deallocation: VirtAddr,
}

/// Second stack used while running a guest instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStack {
    pub bounds: StackBounds,
    /// Page size of the guest architecture
    pub page_size: u64,
}

/// The TEB fields the stack-overflow detector reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TebFields {
    pub stack: StackBounds,
    /// Bytes the thread asked to keep available for overflow handling
    pub guaranteed_stack_bytes: u64,
    pub guest: Option<GuestStack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("thread has no environment block")]
    NotPresent,
    #[error("environment block is not accessible")]
    Inaccessible,
}

/// Thread environment block
#[derive(Debug)]
pub struct Teb {
    fields: Mutex<Option<TebFields>>,
    accessible: AtomicBool,
}

impl Default for Teb {
    fn default() -> Self {
        Self::new()
    }
}

impl Teb {
    pub fn new() -> Self {
        Self {
            fields: Mutex::new(None),
            accessible: AtomicBool::new(true),
        }
    }

    pub fn set(&self, fields: TebFields) {
        *self.fields.lock() = Some(fields);
    }

    /// Mark the block unmapped (or mapped again)
    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::Release);
    }

    /// Copy the fields out
    pub fn probe_read(&self) -> Result<TebFields, ProbeError> {
        if !self.accessible.load(Ordering::Acquire) {
            return Err(ProbeError::Inaccessible);
        }
        (*self.fields.lock()).ok_or(ProbeError::NotPresent)
    }

    /// Update the fields in place
    pub fn probe_write(&self, update: impl FnOnce(&mut TebFields)) -> Result<(), ProbeError> {
        if !self.accessible.load(Ordering::Acquire) {
            return Err(ProbeError::Inaccessible);
        }
        let mut fields = self.fields.lock();
        let fields = fields.as_mut().ok_or(ProbeError::NotPresent)?;
        update(fields);
        Ok(())
    }
}

pub struct Thread {
    id: u64,
    /// Owning process; `None` for system threads
    process: Option<Arc<AddressSpace>>,
    /// Process the thread is temporarily attached to
    attached: Mutex<Option<Arc<AddressSpace>>>,
    previous_mode: Mutex<PreviousMode>,
    /// Kernel stack segments; the last one is in use
    kernel_stacks: Mutex<Vec<KernelStack>>,
    kernel_stack_resident: AtomicBool,
    pub teb: Teb,
}

impl Thread {
    /// Create a thread of `process` with no kernel stack yet
    pub fn new(process: Option<Arc<AddressSpace>>) -> Self {
        let id = allocate_thread_id();
        log::trace!("thread {} created", id);
        Self {
            id,
            process,
            attached: Mutex::new(None),
            previous_mode: Mutex::new(PreviousMode::Kernel),
            kernel_stacks: Mutex::new(Vec::new()),
            kernel_stack_resident: AtomicBool::new(true),
            teb: Teb::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn process(&self) -> Option<&Arc<AddressSpace>> {
        self.process.as_ref()
    }

    pub fn previous_mode(&self) -> PreviousMode {
        *self.previous_mode.lock()
    }

    pub fn set_previous_mode(&self, mode: PreviousMode) {
        *self.previous_mode.lock() = mode;
    }

    /// Run on `space`'s address space until [`Thread::detach`]
    pub fn attach(&self, space: Arc<AddressSpace>) {
        *self.attached.lock() = Some(space);
    }

    pub fn detach(&self) {
        *self.attached.lock() = None;
    }

    /// The address space faults are resolved against
    pub fn current_process(&self) -> Option<Arc<AddressSpace>> {
        self.attached.lock().clone().or_else(|| self.process.clone())
    }

    /// Attached to a process other than its own
    pub fn is_attached_foreign(&self) -> bool {
        match (self.attached.lock().as_ref(), self.process.as_ref()) {
            (Some(attached), Some(own)) => attached.id() != own.id(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub(crate) fn kernel_stacks(&self) -> MutexGuard<'_, Vec<KernelStack>> {
        self.kernel_stacks.lock()
    }

    /// The stack segment in use
    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stacks.lock().last().cloned()
    }

    /// Install the thread's first kernel stack, replacing any chain
    pub fn set_kernel_stack(&self, stack: KernelStack) -> Vec<KernelStack> {
        let mut stacks = self.kernel_stacks.lock();
        let previous = core::mem::take(&mut *stacks);
        stacks.push(stack);
        previous
    }

    /// Detach every stack segment, newest last, for deletion at exit
    pub fn take_kernel_stacks(&self) -> Vec<KernelStack> {
        core::mem::take(&mut *self.kernel_stacks.lock())
    }

    pub fn stack_segments(&self) -> usize {
        self.kernel_stacks.lock().len()
    }

    /// Record the saved stack pointer of the active segment
    pub fn set_kernel_stack_pointer(&self, sp: VirtAddr) {
        if let Some(stack) = self.kernel_stacks.lock().last_mut() {
            stack.sp = sp;
        }
    }

    pub fn kernel_stack_resident(&self) -> bool {
        self.kernel_stack_resident.load(Ordering::Acquire)
    }

    pub(crate) fn set_kernel_stack_resident(&self, resident: bool) {
        self.kernel_stack_resident.store(resident, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> TebFields {
        TebFields {
            stack: StackBounds {
                base: VirtAddr::new(0x20_0000),
                limit: VirtAddr::new(0x1f_f000),
                deallocation: VirtAddr::new(0x10_0000),
            },
            guaranteed_stack_bytes: 0,
            guest: None,
        }
    }

    #[test]
    fn test_probe_fails_when_inaccessible() {
        let teb = Teb::new();
        assert_eq!(teb.probe_read(), Err(ProbeError::NotPresent));
        teb.set(bounds());
        assert_eq!(teb.probe_read(), Ok(bounds()));
        teb.set_accessible(false);
        assert_eq!(teb.probe_read(), Err(ProbeError::Inaccessible));
        assert_eq!(teb.probe_write(|f| f.guaranteed_stack_bytes = 1), Err(ProbeError::Inaccessible));
    }

    #[test]
    fn test_probe_write_updates_limit() {
        let teb = Teb::new();
        teb.set(bounds());
        teb.probe_write(|f| f.stack.limit = VirtAddr::new(0x1f_e000)).unwrap();
        assert_eq!(teb.probe_read().unwrap().stack.limit, VirtAddr::new(0x1f_e000));
    }

    #[test]
    fn test_thread_ids_are_unique() {
        let a = Thread::new(None);
        let b = Thread::new(None);
        assert_ne!(a.id(), b.id());
        assert!(!a.is_attached_foreign());
        assert!(a.current_process().is_none());
    }
}
