//! Memory-manager statistics
//!
//! Counters live on the [`MemoryManager`](super::MemoryManager) rather than in
//! statics so that independent managers (one per host test) do not share
//! them.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MmStats {
    /// Small kernel stacks currently allocated
    pub small_stacks: AtomicU64,
    /// Large kernel stacks currently allocated
    pub large_stacks: AtomicU64,
    /// Kernel-stack pages currently resident
    pub kernel_stack_resident: AtomicU64,
    pub stack_growth_failures: AtomicU64,
    pub dead_stack_hits: AtomicU64,
    pub inpage_retries: AtomicU64,
    pub flush_single: AtomicU64,
    pub flush_multiple: AtomicU64,
    pub flush_entire: AtomicU64,
    pub outswapped_processes: AtomicU64,
    pub locked_page_leaks: AtomicU64,
    pub pages_written: AtomicU64,
}

impl MmStats {
    pub const fn new() -> Self {
        Self {
            small_stacks: AtomicU64::new(0),
            large_stacks: AtomicU64::new(0),
            kernel_stack_resident: AtomicU64::new(0),
            stack_growth_failures: AtomicU64::new(0),
            dead_stack_hits: AtomicU64::new(0),
            inpage_retries: AtomicU64::new(0),
            flush_single: AtomicU64::new(0),
            flush_multiple: AtomicU64::new(0),
            flush_entire: AtomicU64::new(0),
            outswapped_processes: AtomicU64::new(0),
            locked_page_leaks: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Saturating decrement; a gauge never wraps below zero.
    #[inline]
    pub(crate) fn sub(counter: &AtomicU64, value: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(value))
        });
    }

    pub fn snapshot(&self) -> MmStatsSnapshot {
        MmStatsSnapshot {
            small_stacks: self.small_stacks.load(Ordering::Relaxed),
            large_stacks: self.large_stacks.load(Ordering::Relaxed),
            kernel_stack_resident: self.kernel_stack_resident.load(Ordering::Relaxed),
            stack_growth_failures: self.stack_growth_failures.load(Ordering::Relaxed),
            dead_stack_hits: self.dead_stack_hits.load(Ordering::Relaxed),
            inpage_retries: self.inpage_retries.load(Ordering::Relaxed),
            flush_single: self.flush_single.load(Ordering::Relaxed),
            flush_multiple: self.flush_multiple.load(Ordering::Relaxed),
            flush_entire: self.flush_entire.load(Ordering::Relaxed),
            outswapped_processes: self.outswapped_processes.load(Ordering::Relaxed),
            locked_page_leaks: self.locked_page_leaks.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmStatsSnapshot {
    pub small_stacks: u64,
    pub large_stacks: u64,
    pub kernel_stack_resident: u64,
    pub stack_growth_failures: u64,
    pub dead_stack_hits: u64,
    pub inpage_retries: u64,
    pub flush_single: u64,
    pub flush_multiple: u64,
    pub flush_entire: u64,
    pub outswapped_processes: u64,
    pub locked_page_leaks: u64,
    pub pages_written: u64,
}

impl MmStatsSnapshot {
    pub fn log(&self) {
        log::info!(
            "[MM STATS] stacks small={} large={} resident={} grow_fail={} dead_hits={}",
            self.small_stacks,
            self.large_stacks,
            self.kernel_stack_resident,
            self.stack_growth_failures,
            self.dead_stack_hits
        );
        log::info!(
            "[MM STATS] inpage_retries={} flush single={} multiple={} entire={} outswapped={} leaks={}",
            self.inpage_retries,
            self.flush_single,
            self.flush_multiple,
            self.flush_entire,
            self.outswapped_processes,
            self.locked_page_leaks
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_saturates_at_zero() {
        let stats = MmStats::new();
        MmStats::add(&stats.kernel_stack_resident, 2);
        MmStats::sub(&stats.kernel_stack_resident, 5);
        assert_eq!(stats.snapshot().kernel_stack_resident, 0);
    }
}
