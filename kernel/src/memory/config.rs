//! Memory-manager configuration
//!
//! A plain value handed to [`MemoryManager::new`](super::MemoryManager::new).
//! Cargo features pick the defaults for the diagnostic switches so a kernel
//! image can be built with them on without touching the boot code.

use super::paging::{FourLevel, HierarchyDepth, ThreeLevel, TwoLevel};

/// Number of levels in the page-table hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingDepth {
    Two,
    Three,
    Four,
}

impl PagingDepth {
    /// The hierarchy implementation for this depth
    pub fn hierarchy(self) -> &'static dyn HierarchyDepth {
        static TWO: TwoLevel = TwoLevel;
        static THREE: ThreeLevel = ThreeLevel;
        static FOUR: FourLevel = FourLevel;
        match self {
            PagingDepth::Two => &TWO,
            PagingDepth::Three => &THREE,
            PagingDepth::Four => &FOUR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmConfig {
    pub paging_depth: PagingDepth,
    /// Physical frames managed by the PFN database (frame 0 is reserved)
    pub physical_pages: u32,
    /// Page colors per NUMA node
    pub colors_per_node: u16,
    pub numa_nodes: u8,
    /// System-wide commitment limit in pages
    pub commit_limit: u64,
    /// Resident-available pages that must never be handed out
    pub resident_reserve: u64,
    /// Free pages below which allocation paths release the PFN lock and wait
    pub low_water_pages: usize,
    /// Attempts made to get above the low-water mark before failing
    pub available_page_retries: u32,
    /// Slots in the system PTE pool (kernel stacks, hyperspace window)
    pub system_ptes: u32,
    /// Transient mapping slots carved out of the system PTE pool
    pub hyperspace_slots: u32,
    /// Cached dead kernel stacks per node
    pub dead_stack_depth: usize,
    pub minimum_working_set: u64,
    pub maximum_working_set: u64,
    /// Retries for a transient in-page error
    pub inpage_retries: u32,
    /// Spin iterations between in-page retries
    pub inpage_retry_delay: u32,
    pub disable_stack_extension: bool,
    /// Kernel stacks of waiting threads are never paged out when set
    pub disable_page_kernel_stacks: bool,
    pub track_locked_pages: bool,
    pub locked_page_leaks_fatal: bool,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            paging_depth: PagingDepth::Four,
            physical_pages: 1024,
            colors_per_node: 4,
            numa_nodes: 1,
            commit_limit: 4096,
            resident_reserve: 16,
            low_water_pages: 0,
            available_page_retries: 4,
            system_ptes: 1024,
            hyperspace_slots: 4,
            dead_stack_depth: 5,
            minimum_working_set: 20,
            maximum_working_set: 345,
            inpage_retries: 3,
            inpage_retry_delay: 64,
            disable_stack_extension: false,
            disable_page_kernel_stacks: cfg!(feature = "disable_page_kernel_stacks"),
            track_locked_pages: cfg!(feature = "strict_locked_pages"),
            locked_page_leaks_fatal: cfg!(feature = "strict_locked_pages"),
        }
    }
}

impl MmConfig {
    pub fn with_paging_depth(mut self, depth: PagingDepth) -> Self {
        self.paging_depth = depth;
        self
    }

    pub fn with_physical_pages(mut self, pages: u32) -> Self {
        self.physical_pages = pages;
        self
    }

    pub fn with_colors(mut self, colors_per_node: u16) -> Self {
        self.colors_per_node = colors_per_node.max(1);
        self
    }

    pub fn with_numa_nodes(mut self, nodes: u8) -> Self {
        self.numa_nodes = nodes.max(1);
        self
    }

    pub fn with_commit_limit(mut self, pages: u64) -> Self {
        self.commit_limit = pages;
        self
    }

    pub fn with_resident_reserve(mut self, pages: u64) -> Self {
        self.resident_reserve = pages;
        self
    }

    pub fn with_low_water_pages(mut self, pages: usize) -> Self {
        self.low_water_pages = pages;
        self
    }

    pub fn with_system_ptes(mut self, count: u32) -> Self {
        self.system_ptes = count;
        self
    }

    pub fn with_dead_stack_depth(mut self, depth: usize) -> Self {
        self.dead_stack_depth = depth;
        self
    }

    pub fn with_working_set_limits(mut self, minimum: u64, maximum: u64) -> Self {
        self.minimum_working_set = minimum;
        self.maximum_working_set = maximum.max(minimum);
        self
    }

    pub fn with_inpage_retries(mut self, retries: u32, delay: u32) -> Self {
        self.inpage_retries = retries;
        self.inpage_retry_delay = delay;
        self
    }

    pub fn with_stack_extension_disabled(mut self, disabled: bool) -> Self {
        self.disable_stack_extension = disabled;
        self
    }

    pub fn with_kernel_stack_paging_disabled(mut self, disabled: bool) -> Self {
        self.disable_page_kernel_stacks = disabled;
        self
    }

    pub fn with_locked_page_tracking(mut self, track: bool, fatal: bool) -> Self {
        self.track_locked_pages = track;
        self.locked_page_leaks_fatal = fatal;
        self
    }

    /// Total page colors across all nodes
    pub fn total_colors(&self) -> u32 {
        u32::from(self.colors_per_node.max(1)) * u32::from(self.numa_nodes.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_four_level() {
        let config = MmConfig::default();
        assert_eq!(config.paging_depth, PagingDepth::Four);
        assert_eq!(config.paging_depth.hierarchy().levels(), 4);
    }

    #[test]
    fn test_builder_clamps_degenerate_values() {
        let config = MmConfig::default()
            .with_colors(0)
            .with_numa_nodes(0)
            .with_working_set_limits(50, 10);
        assert_eq!(config.colors_per_node, 1);
        assert_eq!(config.numa_nodes, 1);
        assert_eq!(config.maximum_working_set, 50);
        assert_eq!(config.total_colors(), 1);
    }
}
