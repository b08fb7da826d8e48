// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the 32-bit address types and the constants describing the
//! virtual memory layout.
//!
//! Lantern runs in x86 protected mode, so every address is 32 bits wide
//! and pages and frames are 4 KiB. The address space is split into the
//! kernel half (the lower 1 GiB, shared by alias between every address
//! space) and the user half (the upper 3 GiB, owned by each process):
//!
//! - [`KERNEL_BINARY`]: The kernel's code and data, identity mapped.
//! - [`VGA_MMIO`]: The VGA text-mode window, identity mapped.
//! - [`PAGE_TABLE_AREA`]: The backing store from which page tables are allocated.
//! - [`KERNEL_HEAP_START`]: The bottom of the kernel's heap.
//! - [`USERSPACE`]: The region holding each process's image and stack.
//! - [`KERNEL_STACK_TOP`]: The top of the kernel's stack, descending.
//! - [`USER_STACK_TOP`]: The top of a process's user stack, descending.
//! - [`SYSCALL_STACK_TOP`]: The top of a process's syscall kernel stack, descending.
//!
//! The memory layout is summarised below:
//!
//! | Region               | Start address | Last address  |
//! | -------------------- | ------------: | ------------: |
//! | [`KERNEL_BINARY`]    |         `0x0` |    `0x9_ffff` |
//! | [`VGA_MMIO`]         |    `0xa_0000` |    `0xb_ffff` |
//! | [`PAGE_TABLE_AREA`]  |   `0x10_0000` |   `0x4f_ffff` |
//! | kernel heap          |   `0x50_0000` | grows upward  |
//! | [`USERSPACE`]        | `0x4000_0000` | `0xbeff_ffff` |
//! | kernel/syscall stack | descending from `0xc000_0000` | |

#![no_std]

use align::{align_down_u32, align_up_u32};
use core::fmt;

/// The size of a single page of virtual memory, or a single
/// frame of physical memory.
///
pub const PAGE_SIZE: u32 = 4096;

/// The number of entries in a page table or a page directory.
///
pub const ENTRIES_PER_TABLE: usize = 1024;

/// The largest amount of physical memory the kernel will track.
///
pub const MAX_PHYSICAL_MEMORY: u64 = 3 * 1024 * 1024 * 1024;

/// The number of physical frames in [`MAX_PHYSICAL_MEMORY`].
///
pub const MAX_FRAMES: usize = (MAX_PHYSICAL_MEMORY / PAGE_SIZE as u64) as usize;

/// The kernel's code and data, identity mapped at bring-up.
///
pub const KERNEL_BINARY: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::zero(), VirtAddr::new(0x9_ffff));

/// The VGA text-mode MMIO window, identity mapped at bring-up.
///
pub const VGA_MMIO: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::new(0xa_0000), VirtAddr::new(0xb_ffff));

/// The reserved window from which every page table's backing
/// frame is allocated.
///
/// Keeping all page tables inside one fixed window means the
/// set of tables that can contain page-table frames is known
/// before paging is enabled, which breaks the circularity of
/// mapping the tables that map the tables.
///
pub const PAGE_TABLE_AREA: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::new(0x10_0000), VirtAddr::new(0x4f_ffff));

/// The bottom of the kernel's heap.
///
pub const KERNEL_HEAP_START: VirtAddr = VirtAddr::new(0x50_0000);

/// The number of pages mapped for the heap arena before the
/// first allocation.
///
pub const KERNEL_HEAP_INITIAL_PAGES: u32 = 1;

/// The number of pages at the bottom of the heap region that
/// are reserved for the heap's free-hole index.
///
pub const KERNEL_HEAP_INDEX_PAGES: u32 = 16;

/// The largest size the kernel heap arena may grow to.
///
pub const KERNEL_HEAP_MAX_SIZE: u32 = 64 * 1024 * 1024;

/// The boundary between the kernel half and the user half of
/// every address space.
///
/// Everything below this address is mapped identically in all
/// address spaces. Everything above it belongs to one process.
///
pub const KERNEL_HALF_END: VirtAddr = VirtAddr::new(0x4000_0000 - 1);

/// The region holding each process's image and user stack.
///
pub const USERSPACE: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::new(0x4000_0000), VirtAddr::new(0xbeff_ffff));

/// The top of a process's user stack, which descends from the
/// top of [`USERSPACE`].
///
pub const USER_STACK_TOP: VirtAddr = VirtAddr::new(0xbf00_0000);

/// The largest number of pages a process may request for its
/// user stack.
///
pub const USER_STACK_MAX_RESERVED_PAGES: u32 = 2048;

/// The largest number of pages reserved for the import stub
/// area, which sits immediately below the user stack's
/// reserved span.
///
pub const IMPORT_AREA_MAX_RESERVED_PAGES: u32 = 2048;

/// The bottom of the import stub area.
///
pub const IMPORT_AREA_START: VirtAddr = VirtAddr::new(
    USER_STACK_TOP.as_u32()
        - USER_STACK_MAX_RESERVED_PAGES * PAGE_SIZE
        - IMPORT_AREA_MAX_RESERVED_PAGES * PAGE_SIZE,
);

/// The top of the kernel's stack, which is identity mapped at
/// bring-up and descends from the 3 GiB boundary.
///
/// Each process's syscall kernel stack occupies the same span
/// of its own address space (see [`SYSCALL_STACK_TOP`]), so a
/// syscall runs on a per-process stack without changing the
/// stack layout the kernel booted with.
///
pub const KERNEL_STACK_TOP: VirtAddr = VirtAddr::new(0xc000_0000);

/// The number of pages in the kernel's boot stack.
///
pub const KERNEL_STACK_PAGES: u32 = 16;

/// The top of a process's syscall kernel stack.
///
pub const SYSCALL_STACK_TOP: VirtAddr = KERNEL_STACK_TOP;

/// The number of pages in each process's syscall kernel stack.
///
pub const SYSCALL_STACK_PAGES: u32 = 16;

/// Represents an address in physical memory.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Returns the given physical address.
    ///
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    /// Returns the zero physical address.
    ///
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns the address as a u32.
    ///
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the address as a usize.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns whether the address is frame-aligned.
    ///
    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Represents an address in virtual memory.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Returns the given virtual address.
    ///
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    /// Returns the zero virtual address.
    ///
    pub const fn zero() -> Self {
        VirtAddr(0)
    }

    /// Returns the address as a u32.
    ///
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the address as a usize.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns whether the address is page-aligned.
    ///
    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Returns the address, aligned up to the given alignment.
    ///
    pub const fn align_up(&self, align: u32) -> VirtAddr {
        VirtAddr(align_up_u32(self.0, align))
    }

    /// Returns the address, aligned down to the given alignment.
    ///
    pub const fn align_down(&self, align: u32) -> VirtAddr {
        VirtAddr(align_down_u32(self.0, align))
    }

    /// Returns whether this address is in the kernel half,
    /// which is mapped identically in every address space.
    ///
    pub const fn in_kernel_half(&self) -> bool {
        self.0 <= KERNEL_HALF_END.as_u32()
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Represents a 4 KiB frame of physical memory, identified by
/// its 20-bit index.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysFrame(u32);

impl PhysFrame {
    /// Returns the frame with the given index.
    ///
    pub const fn from_index(index: u32) -> Self {
        PhysFrame(index)
    }

    /// Returns the frame containing the given address.
    ///
    pub const fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame(addr.as_u32() / PAGE_SIZE)
    }

    /// Returns the frame starting at the given address.
    ///
    /// # Panics
    ///
    /// `from_start_address` will panic if the given address is
    /// not frame-aligned.
    ///
    pub fn from_start_address(addr: PhysAddr) -> Self {
        if !addr.is_frame_aligned() {
            panic!("frame start address {} is not frame-aligned", addr);
        }

        PhysFrame(addr.as_u32() / PAGE_SIZE)
    }

    /// Returns the frame's 20-bit index.
    ///
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Returns the address of the first byte in the frame.
    ///
    pub const fn start_address(&self) -> PhysAddr {
        PhysAddr::new(self.0 * PAGE_SIZE)
    }
}

/// Represents a 4 KiB page of virtual memory, identified by
/// its page number.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtPage(u32);

impl VirtPage {
    /// Returns the page with the given page number.
    ///
    pub const fn from_number(number: u32) -> Self {
        VirtPage(number)
    }

    /// Returns the page containing the given address.
    ///
    pub const fn containing_address(addr: VirtAddr) -> Self {
        VirtPage(addr.as_u32() / PAGE_SIZE)
    }

    /// Returns the page starting at the given address.
    ///
    /// # Panics
    ///
    /// `from_start_address` will panic if the given address is
    /// not page-aligned.
    ///
    pub fn from_start_address(addr: VirtAddr) -> Self {
        if !addr.is_page_aligned() {
            panic!("page start address {} is not page-aligned", addr);
        }

        VirtPage(addr.as_u32() / PAGE_SIZE)
    }

    /// Returns the page number.
    ///
    pub const fn number(&self) -> u32 {
        self.0
    }

    /// Returns the address of the first byte in the page.
    ///
    pub const fn start_address(&self) -> VirtAddr {
        VirtAddr::new(self.0 * PAGE_SIZE)
    }

    /// Returns the index into the page directory of the table
    /// containing this page.
    ///
    pub const fn table_index(&self) -> usize {
        (self.0 as usize) / ENTRIES_PER_TABLE
    }

    /// Returns the index of this page within its page table.
    ///
    pub const fn entry_index(&self) -> usize {
        (self.0 as usize) % ENTRIES_PER_TABLE
    }

    /// Returns an iterator over the pages from `start` to
    /// `end`, inclusive at both ends.
    ///
    pub fn range_inclusive(start: VirtPage, end: VirtPage) -> VirtPageRange {
        VirtPageRange {
            next: start.0,
            last: end.0,
            done: start.0 > end.0,
        }
    }
}

/// An iterator over a contiguous range of virtual pages.
///
#[derive(Clone, Copy, Debug)]
pub struct VirtPageRange {
    next: u32,
    last: u32,
    done: bool,
}

impl Iterator for VirtPageRange {
    type Item = VirtPage;

    fn next(&mut self) -> Option<VirtPage> {
        if self.done {
            return None;
        }

        let page = VirtPage::from_number(self.next);
        if self.next == self.last {
            self.done = true;
        } else {
            self.next += 1;
        }

        Some(page)
    }
}

/// Represents a contiguous sequence of virtual addresses.
///
pub struct VirtAddrRange {
    first: VirtAddr,
    last: VirtAddr,
}

impl VirtAddrRange {
    /// Returns a new range, from `start` to `end`, inclusive
    /// at both ends.
    ///
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        VirtAddrRange {
            first: start,
            last: end,
        }
    }

    /// Returns the first address in the range.
    ///
    pub const fn start(&self) -> VirtAddr {
        self.first
    }

    /// Returns the last address in the range.
    ///
    pub const fn end(&self) -> VirtAddr {
        self.last
    }

    /// Returns the number of addresses in the range.
    ///
    pub const fn size(&self) -> u32 {
        (self.last.as_u32() + 1) - self.first.as_u32()
    }

    /// Returns whether the given address exists in this range.
    ///
    pub const fn contains_addr(&self, addr: VirtAddr) -> bool {
        self.first.as_u32() <= addr.as_u32() && addr.as_u32() <= self.last.as_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        let addr = VirtAddr::new(0x1234);
        assert_eq!(addr.as_u32(), 0x1234);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_up(0x1000), VirtAddr::new(0x2000));
        assert_eq!(addr.align_down(0x1000), VirtAddr::new(0x1000));
        assert!(addr.in_kernel_half());
        assert!(!VirtAddr::new(0x4000_0000).in_kernel_half());
        assert!(VirtAddr::new(0x3fff_ffff).in_kernel_half());
    }

    #[test]
    fn test_frames_and_pages() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5432));
        assert_eq!(frame.index(), 5);
        assert_eq!(frame.start_address(), PhysAddr::new(0x5000));

        let page = VirtPage::containing_address(VirtAddr::new(0x0040_1234));
        assert_eq!(page.number(), 0x401);
        assert_eq!(page.table_index(), 1);
        assert_eq!(page.entry_index(), 1);
        assert_eq!(page.start_address(), VirtAddr::new(0x0040_1000));
    }

    #[test]
    fn test_page_range() {
        let start = VirtPage::from_number(3);
        let end = VirtPage::from_number(5);
        let mut range = VirtPage::range_inclusive(start, end);
        assert_eq!(range.next(), Some(VirtPage::from_number(3)));
        assert_eq!(range.next(), Some(VirtPage::from_number(4)));
        assert_eq!(range.next(), Some(VirtPage::from_number(5)));
        assert_eq!(range.next(), None);

        let mut single = VirtPage::range_inclusive(start, start);
        assert_eq!(single.next(), Some(VirtPage::from_number(3)));
        assert_eq!(single.next(), None);
    }

    #[test]
    fn test_layout() {
        // The page-table backing store must be large enough to
        // hold a table for every slot in a page directory.
        assert!(PAGE_TABLE_AREA.size() >= (ENTRIES_PER_TABLE as u32) * PAGE_SIZE);

        // The heap and its index must fit beneath the kernel
        // half boundary.
        let heap_end = KERNEL_HEAP_START.as_u32() + KERNEL_HEAP_MAX_SIZE;
        assert!(heap_end - 1 <= KERNEL_HALF_END.as_u32());

        // The import area sits wholly beneath the user stack's
        // reserved span, inside userspace.
        assert!(IMPORT_AREA_START.as_u32() >= USERSPACE.start().as_u32());
        assert!(
            IMPORT_AREA_START.as_u32() + IMPORT_AREA_MAX_RESERVED_PAGES * PAGE_SIZE
                <= USER_STACK_TOP.as_u32() - USER_STACK_MAX_RESERVED_PAGES * PAGE_SIZE
        );
    }
}
