// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Wires the kernel's memory subsystems together.
//!
//! Bring-up happens with paging disabled, in the order the
//! circularity demands: the frame bitmap first, with every region
//! the kernel already occupies reserved; then the page-table
//! window, from which every page table and directory is carved;
//! then the kernel's own address space, with every kernel-half
//! table pre-allocated and the identity map written; then paging
//! itself; and finally the heap, whose first pages are mapped by
//! hand before the allocator takes over.
//!
//! Pre-allocating the kernel-half tables means the kernel half of
//! every later address space aliases the same table objects, so a
//! kernel-half mapping made after paging is enabled (heap growth,
//! for instance) appears in every living address space with no
//! further work.

use crate::interrupts::InterruptContext;
use crate::{cpu, Locked};
use alloc::alloc::{GlobalAlloc, Layout};
use bitmap_index::words_for;
use core::arch::{asm, global_asm};
use heap::{Heap, HeapGrower};
use memlayout::{
    PhysFrame, VirtAddr, VirtPage, KERNEL_HEAP_INDEX_PAGES, KERNEL_HEAP_INITIAL_PAGES,
    KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_START, KERNEL_STACK_PAGES, KERNEL_STACK_TOP, MAX_FRAMES,
    PAGE_SIZE, PAGE_TABLE_AREA, VGA_MMIO,
};
use physmem::FrameBitmap;
use spin::{Mutex, Once};
use virtmem::{
    AddressSpace, FrameCopier, PageFaultError, TableArea, KERNEL_TABLE_COUNT,
};

global_asm!(include_str!("paging.s"));

// The trampolines are implemented in paging.s.
//
extern "C" {
    /// Copies one 4 KiB frame to another by physical address,
    /// with paging switched off for the duration.
    ///
    fn copy_frame_physical(dst: u32, src: u32);

    /// Loads CR3, discarding the stack-held return address
    /// first so the switch survives the stack contents
    /// changing underneath it.
    ///
    pub fn switch_address_space(cr3: u32);
}

// The first free byte after the kernel image, defined in
// linker.ld.
extern "C" {
    static __kernel_end: u8;
}

static mut FRAME_BITMAP_WORDS: [u32; words_for(MAX_FRAMES)] = [0; words_for(MAX_FRAMES)];
static mut TABLE_SLOT_WORDS: [u32; 32] = [0; 32];

/// FRAMES is the physical frame allocator.
///
static FRAMES: Once<Mutex<FrameBitmap<'static>>> = Once::new();

/// TABLES allocates page tables and directories from the
/// reserved window.
///
static TABLES: Once<Mutex<TableArea>> = Once::new();

/// KERNEL_SPACE is the kernel's own address space, the one the
/// machine boots into and the ancestor of every process's.
///
static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// HEAP is the kernel heap.
///
static HEAP: Once<Locked<Heap<VmGrower>>> = Once::new();

/// Returns the physical frame allocator.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn frames() -> &'static Mutex<FrameBitmap<'static>> {
    FRAMES.get().expect("memory manager not initialised")
}

/// Returns the page-table window allocator.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn tables() -> &'static Mutex<TableArea> {
    TABLES.get().expect("memory manager not initialised")
}

/// Returns the kernel's own address space.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn kernel_space() -> &'static Mutex<AddressSpace> {
    KERNEL_SPACE.get().expect("memory manager not initialised")
}

/// Copies frames through the paging-disabled trampoline.
///
pub struct TrampolineCopier;

impl FrameCopier for TrampolineCopier {
    unsafe fn copy_frame(&mut self, dst: PhysFrame, src: PhysFrame) {
        copy_frame_physical(dst.start_address().as_u32(), src.start_address().as_u32());
    }
}

/// Grows the heap arena by mapping kernel pages on demand.
///
pub struct VmGrower;

impl HeapGrower for VmGrower {
    fn grow(&mut self, addr: usize) {
        let end = KERNEL_HEAP_START.as_usize() + KERNEL_HEAP_MAX_SIZE as usize;
        if addr + PAGE_SIZE as usize > end {
            panic!("kernel heap exhausted its {} byte limit", KERNEL_HEAP_MAX_SIZE);
        }

        let page = VirtPage::from_start_address(VirtAddr::new(addr as u32));
        let mut space = kernel_space().lock();
        let mut frames = frames().lock();
        let mut tables = tables().lock();
        unsafe {
            space.map_page(page, false, &mut *frames, &mut *tables, true);
        }
    }
}

/// The kernel's global allocator, backed by [`HEAP`].
///
/// Allocation runs with interrupts disabled so an interrupt
/// handler can never spin on a heap lock its own CPU holds.
///
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        cpu::without_interrupts(|| {
            heap_ref().lock().alloc_aligned(layout.size(), layout.align())
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        cpu::without_interrupts(|| heap_ref().lock().free(ptr))
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

fn heap_ref() -> &'static Locked<Heap<VmGrower>> {
    HEAP.get().expect("kernel heap not initialised")
}

// Marks every frame overlapping [start, end) as in use.
//
fn reserve_range(frames: &mut FrameBitmap, start: u32, end: u32) {
    let first = start / PAGE_SIZE;
    let last = (end + PAGE_SIZE - 1) / PAGE_SIZE;
    for index in first..last {
        frames.mark_used(PhysFrame::from_index(index));
    }
}

// Identity-maps every page overlapping [start, end) into the
// given address space. The backing frames must already be
// reserved.
//
unsafe fn identity_map_range(
    space: &mut AddressSpace,
    tables: &mut TableArea,
    start: u32,
    end: u32,
) {
    let first = start / PAGE_SIZE;
    let last = (end + PAGE_SIZE - 1) / PAGE_SIZE;
    for number in first..last {
        space.map_page_to_frame(
            VirtPage::from_number(number),
            PhysFrame::from_index(number),
            false,
            tables,
        );
    }
}

// Enables paging with the given page directory.
//
// The directory must identity-map the executing code, the
// stack, and everything else the kernel touches before the
// first process switches address spaces.
//
unsafe fn enable_paging(directory: u32) {
    asm!(
        "mov cr3, {dir}",
        "mov {tmp}, cr0",
        "or {tmp}, 0x80010000", // Paging plus write protection.
        "mov cr0, {tmp}",
        dir = in(reg) directory,
        tmp = out(reg) _,
    );
}

/// Builds the identity map, enables paging, and starts the
/// kernel heap.
///
/// Runs with interrupts disabled, before any allocation.
///
pub fn init() {
    let kernel_end = unsafe { &__kernel_end as *const u8 as u32 };

    let mut frame_bitmap =
        FrameBitmap::new(unsafe { &mut FRAME_BITMAP_WORDS }, MAX_FRAMES);

    // Reserve everything the kernel already occupies: its own
    // image, the VGA window, the page-table window, and the
    // boot stack descending from 3 GiB.
    reserve_range(&mut frame_bitmap, 0, kernel_end);
    reserve_range(
        &mut frame_bitmap,
        VGA_MMIO.start().as_u32(),
        VGA_MMIO.end().as_u32() + 1,
    );
    reserve_range(
        &mut frame_bitmap,
        PAGE_TABLE_AREA.start().as_u32(),
        PAGE_TABLE_AREA.end().as_u32() + 1,
    );
    reserve_range(
        &mut frame_bitmap,
        KERNEL_STACK_TOP.as_u32() - KERNEL_STACK_PAGES * PAGE_SIZE,
        KERNEL_STACK_TOP.as_u32(),
    );

    let table_pages = (PAGE_TABLE_AREA.size() / PAGE_SIZE) as usize;
    let mut table_area = unsafe {
        TableArea::new(
            PAGE_TABLE_AREA.start().as_usize(),
            table_pages,
            &mut TABLE_SLOT_WORDS,
        )
    };

    let mut space = AddressSpace::new(&mut table_area);

    // Pre-allocate every kernel-half table, so all later
    // address spaces can alias them.
    for index in 0..KERNEL_TABLE_COUNT {
        space.ensure_table_at(index, &mut table_area);
    }

    unsafe {
        identity_map_range(&mut space, &mut table_area, 0, kernel_end);
        identity_map_range(
            &mut space,
            &mut table_area,
            VGA_MMIO.start().as_u32(),
            VGA_MMIO.end().as_u32() + 1,
        );
        identity_map_range(
            &mut space,
            &mut table_area,
            PAGE_TABLE_AREA.start().as_u32(),
            PAGE_TABLE_AREA.end().as_u32() + 1,
        );
        identity_map_range(
            &mut space,
            &mut table_area,
            KERNEL_STACK_TOP.as_u32() - KERNEL_STACK_PAGES * PAGE_SIZE,
            KERNEL_STACK_TOP.as_u32(),
        );

        enable_paging(space.hardware_tables_physical());
    }

    // Map the heap's index pages and initial arena page, then
    // hand the region to the allocator.
    let heap_pages = KERNEL_HEAP_INDEX_PAGES + KERNEL_HEAP_INITIAL_PAGES;
    let first_page = VirtPage::from_start_address(KERNEL_HEAP_START);
    for i in 0..heap_pages {
        let page = VirtPage::from_number(first_page.number() + i);
        unsafe {
            space.map_page(page, false, &mut frame_bitmap, &mut table_area, true);
        }
    }

    let index_len = (KERNEL_HEAP_INDEX_PAGES * PAGE_SIZE) as usize;
    let arena_start = KERNEL_HEAP_START.as_usize() + index_len;
    let kernel_heap = unsafe {
        Heap::new(
            KERNEL_HEAP_START.as_usize() as *mut u8,
            index_len,
            arena_start,
            (KERNEL_HEAP_INITIAL_PAGES * PAGE_SIZE) as usize,
            VmGrower,
        )
    };

    let free = frame_bitmap.free_frames();
    let total = frame_bitmap.num_frames();

    FRAMES.call_once(|| Mutex::new(frame_bitmap));
    TABLES.call_once(|| Mutex::new(table_area));
    KERNEL_SPACE.call_once(|| Mutex::new(space));
    HEAP.call_once(|| Locked::new(kernel_heap));

    crate::println!("Physical memory manager: {}/{} frames available.", free, total);
}

/// Handles a page fault: fatal for the kernel, fatal for the
/// offending process if it faulted in user mode.
///
pub fn handle_page_fault(ctx: &mut InterruptContext) {
    let faulting_address = cpu::read_cr2();
    let error = PageFaultError::from_bits(ctx.error_code);

    let cause = if error.protection_violation() {
        "protection violation"
    } else {
        "page not present"
    };
    let access = if error.instruction_fetch() {
        "fetching"
    } else if error.caused_by_write() {
        "writing"
    } else {
        "reading"
    };

    crate::println!(
        "page fault: {} {} {:#010x} at {:#010x}{}",
        cause,
        access,
        faulting_address,
        ctx.eip,
        if error.reserved_bit_set() {
            " (reserved bit set)"
        } else {
            ""
        },
    );

    if ctx.from_user_mode() {
        crate::multitasking::kill_current();
    }

    panic!(
        "page fault in kernel mode: {} {} {:#010x}",
        cause, access, faulting_address
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn present_entries_map_used_frames() {
        // Every present page entry in the kernel's address
        // space must point at a frame the bitmap has marked
        // as in use.
        let space = kernel_space().lock();
        let frames = frames().lock();
        unsafe {
            space.for_each_present_entry(&mut |page, entry| {
                let frame = entry.frame().expect("present entry with no frame");
                if !frames.is_used(frame) {
                    panic!(
                        "page {} maps frame {}, which is marked free",
                        page.start_address(),
                        frame.start_address()
                    );
                }
            });
        }
    }

    #[test_case]
    fn heap_allocations_hold_their_contents() {
        use alloc::vec::Vec;

        let mut values = Vec::new();
        for i in 0..2048usize {
            values.push(i);
        }

        for (i, value) in values.iter().enumerate() {
            assert_eq!(i, *value);
        }
    }
}
