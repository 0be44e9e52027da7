//! Translation Lookaside Buffer (TLB) management
//!
//! Callers that invalidate many PTEs collect the addresses in a
//! [`FlushList`] and flush once at the end. Past
//! [`MM_MAXIMUM_FLUSH_COUNT`] entries the whole TLB is flushed instead.
//! The flush instructions are only issued on the bare-metal x86_64 target;
//! the host build just counts.

use super::layout::MM_MAXIMUM_FLUSH_COUNT;
use super::stats::MmStats;
use x86_64::VirtAddr;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64::instructions::tlb;

/// Flush a single page from the TLB
#[inline]
pub fn flush_page(addr: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    tlb::flush(addr);
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = addr;
}

/// Flush the entire TLB
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    tlb::flush_all();
}

/// Batched invalidation
#[derive(Debug)]
pub struct FlushList {
    addresses: [VirtAddr; MM_MAXIMUM_FLUSH_COUNT],
    count: usize,
    overflowed: bool,
}

impl Default for FlushList {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushList {
    pub const fn new() -> Self {
        Self {
            addresses: [VirtAddr::zero(); MM_MAXIMUM_FLUSH_COUNT],
            count: 0,
            overflowed: false,
        }
    }

    pub fn add(&mut self, addr: VirtAddr) {
        if self.overflowed {
            return;
        }
        if self.count == MM_MAXIMUM_FLUSH_COUNT {
            self.overflowed = true;
            return;
        }
        self.addresses[self.count] = addr;
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && !self.overflowed
    }

    pub fn will_flush_entire(&self) -> bool {
        self.overflowed
    }

    /// Issue the flush and reset the list
    pub fn flush(&mut self, stats: &MmStats) {
        if self.overflowed {
            flush_all();
            MmStats::bump(&stats.flush_entire);
        } else if self.count == 1 {
            flush_page(self.addresses[0]);
            MmStats::bump(&stats.flush_single);
        } else if self.count > 1 {
            for addr in &self.addresses[..self.count] {
                flush_page(*addr);
            }
            MmStats::bump(&stats.flush_multiple);
        }
        self.count = 0;
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_and_multiple_flushes_are_counted() {
        let stats = MmStats::new();
        let mut list = FlushList::new();
        list.add(VirtAddr::new(0x1000));
        list.flush(&stats);
        list.add(VirtAddr::new(0x1000));
        list.add(VirtAddr::new(0x2000));
        list.flush(&stats);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flush_single, 1);
        assert_eq!(snapshot.flush_multiple, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_overflow_falls_back_to_entire_flush() {
        let stats = MmStats::new();
        let mut list = FlushList::new();
        for page in 0..=MM_MAXIMUM_FLUSH_COUNT as u64 {
            list.add(VirtAddr::new(page << 12));
        }
        assert!(list.will_flush_entire());
        list.flush(&stats);
        assert_eq!(stats.snapshot().flush_entire, 1);
    }
}
