//! Page-table hierarchy depths
//!
//! Each supported depth describes how a virtual address splits into table
//! indices and where the fixed regions (self-map, hyperspace, system PTEs)
//! sit in the top-level directory. The manager picks one at construction.

use super::layout::{PAGE_SHIFT, PAGE_SIZE};
use x86_64::VirtAddr;

pub trait HierarchyDepth: Send + Sync {
    /// Number of levels; level 1 holds leaf PTEs, level `levels()` is the top
    fn levels(&self) -> usize;

    fn entries_per_table(&self) -> usize;

    /// Index of `va` within its table at `level`
    fn index(&self, va: VirtAddr, level: usize) -> usize;

    /// First address that is not user space
    fn user_boundary(&self) -> VirtAddr;

    /// Top-level slot through which the top page maps itself
    fn self_map_index(&self) -> usize;

    /// Top-level slot of the per-process hyperspace chain
    fn hyperspace_index(&self) -> usize;

    /// Base of the system PTE pool (kernel stacks, transient mappings)
    fn system_pte_base(&self) -> VirtAddr;

    /// 64-bit layouts reserve the compatibility region in every process
    fn wide_address(&self) -> bool;

    /// Pages a fresh address space needs: the top page, one hyperspace table
    /// per lower level, the VAD bitmap page and the working-set list page
    fn skeleton_pages(&self) -> u64 {
        self.levels() as u64 + 2
    }

    /// Bytes of address space covered by one entry at `level`
    fn entry_span(&self, level: usize) -> u64 {
        let bits = self.entries_per_table().trailing_zeros() as u64;
        PAGE_SIZE << (bits * (level as u64 - 1))
    }

    /// Top-level slot of the first system address
    fn first_system_top_index(&self) -> usize {
        self.index(self.user_boundary(), self.levels())
    }
}

/// Generic radix split used by the non-x86 layouts
#[inline]
fn radix_index(va: VirtAddr, level: usize, bits: u64) -> usize {
    let shift = PAGE_SHIFT + bits * (level as u64 - 1);
    ((va.as_u64() >> shift) & ((1 << bits) - 1)) as usize
}

/// Classic 32-bit two-level layout: 1024-entry directory and tables
#[derive(Debug, Default)]
pub struct TwoLevel;

impl HierarchyDepth for TwoLevel {
    fn levels(&self) -> usize {
        2
    }

    fn entries_per_table(&self) -> usize {
        1024
    }

    fn index(&self, va: VirtAddr, level: usize) -> usize {
        radix_index(va, level, 10)
    }

    fn user_boundary(&self) -> VirtAddr {
        VirtAddr::new(0x8000_0000)
    }

    fn self_map_index(&self) -> usize {
        0x200
    }

    fn hyperspace_index(&self) -> usize {
        0x201
    }

    fn system_pte_base(&self) -> VirtAddr {
        VirtAddr::new(0xC000_0000)
    }

    fn wide_address(&self) -> bool {
        false
    }
}

/// 39-bit three-level layout
#[derive(Debug, Default)]
pub struct ThreeLevel;

impl HierarchyDepth for ThreeLevel {
    fn levels(&self) -> usize {
        3
    }

    fn entries_per_table(&self) -> usize {
        512
    }

    fn index(&self, va: VirtAddr, level: usize) -> usize {
        radix_index(va, level, 9)
    }

    fn user_boundary(&self) -> VirtAddr {
        VirtAddr::new(0x40_0000_0000)
    }

    fn self_map_index(&self) -> usize {
        0x1FE
    }

    fn hyperspace_index(&self) -> usize {
        0x1FD
    }

    fn system_pte_base(&self) -> VirtAddr {
        VirtAddr::new(0xFFFF_FFC0_0000_0000)
    }

    fn wide_address(&self) -> bool {
        true
    }
}

/// x86_64 four-level layout
#[derive(Debug, Default)]
pub struct FourLevel;

impl HierarchyDepth for FourLevel {
    fn levels(&self) -> usize {
        4
    }

    fn entries_per_table(&self) -> usize {
        512
    }

    fn index(&self, va: VirtAddr, level: usize) -> usize {
        let index = match level {
            1 => va.p1_index(),
            2 => va.p2_index(),
            3 => va.p3_index(),
            _ => va.p4_index(),
        };
        usize::from(index)
    }

    fn user_boundary(&self) -> VirtAddr {
        VirtAddr::new(0x0000_8000_0000_0000)
    }

    fn self_map_index(&self) -> usize {
        0x1ED
    }

    fn hyperspace_index(&self) -> usize {
        0x1EE
    }

    /// PML4[402], the kernel-stack region of the boot layout
    fn system_pte_base(&self) -> VirtAddr {
        VirtAddr::new(0xFFFF_C900_0000_0000)
    }

    fn wide_address(&self) -> bool {
        true
    }
}

/// Virtual address of the first page of the hyperspace chain
pub fn hyperspace_base(depth: &dyn HierarchyDepth) -> VirtAddr {
    let top = depth.hyperspace_index() as u64;
    let raw = top * depth.entry_span(depth.levels());
    // Sign-extend for the 64-bit layouts.
    VirtAddr::new_truncate(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depths() -> [&'static dyn HierarchyDepth; 3] {
        [&TwoLevel, &ThreeLevel, &FourLevel]
    }

    #[test]
    fn test_fixed_slots_do_not_collide() {
        for depth in depths() {
            let system = depth.index(depth.system_pte_base(), depth.levels());
            assert_ne!(depth.self_map_index(), depth.hyperspace_index());
            assert_ne!(depth.self_map_index(), system);
            assert_ne!(depth.hyperspace_index(), system);
            assert!(depth.self_map_index() >= depth.first_system_top_index());
            assert!(depth.hyperspace_index() >= depth.first_system_top_index());
        }
    }

    #[test]
    fn test_four_level_matches_x86_split() {
        let va = VirtAddr::new(0xFFFF_C900_0000_0000);
        assert_eq!(FourLevel.index(va, 4), 402);
        assert_eq!(FourLevel.index(va, 1), 0);
        assert_eq!(FourLevel.first_system_top_index(), 256);
    }

    #[test]
    fn test_two_level_split() {
        let va = VirtAddr::new(0x7FFE_0000);
        assert_eq!(TwoLevel.index(va, 2), 0x1FF);
        assert_eq!(TwoLevel.index(va, 1), 0x3E0);
        assert_eq!(TwoLevel.entry_span(2), 4 * 1024 * 1024);
    }

    #[test]
    fn test_skeleton_page_counts() {
        assert_eq!(TwoLevel.skeleton_pages(), 4);
        assert_eq!(ThreeLevel.skeleton_pages(), 5);
        assert_eq!(FourLevel.skeleton_pages(), 6);
    }

    #[test]
    fn test_hyperspace_base_round_trips_index() {
        for depth in depths() {
            let base = hyperspace_base(depth);
            assert_eq!(depth.index(base, depth.levels()), depth.hyperspace_index());
            for level in 1..depth.levels() {
                assert_eq!(depth.index(base, level), 0);
            }
        }
    }
}
