// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages virtual memory through per-address-space page directories.
//!
//! An x86 page directory holds 1024 entries, each naming a page table
//! of 1024 entries, each mapping one 4 KiB page. The kernel keeps two
//! views of every directory: the logical view, an array of pointers it
//! uses to navigate, and the hardware view, an array of raw 32-bit
//! words the CPU consumes through CR3. [`PageDirectory`] holds both
//! and the code here keeps them in agreement.
//!
//! Page tables and directories are allocated from a fixed,
//! identity-mapped window of memory (see
//! [`PAGE_TABLE_AREA`](memlayout::PAGE_TABLE_AREA)), managed by
//! [`TableArea`]. Because the window is identity mapped in the kernel
//! half of every address space, a table's virtual address is also its
//! physical address, and tables are visible no matter which directory
//! is live.
//!
//! The kernel half of the address space is shared by alias: every
//! directory links the same 256 kernel page tables, all of which are
//! allocated at bring-up, so a kernel-half mapping made through any
//! directory is immediately visible in all of them. The user half is
//! owned by one process, and is cloned by value at fork.

#![no_std]

use bitflags::bitflags;
use bitmap_index::Bitmap;
use core::mem;
use core::ptr;
use memlayout::{
    PhysFrame, VirtAddr, VirtPage, ENTRIES_PER_TABLE, PAGE_SIZE, SYSCALL_STACK_PAGES,
    SYSCALL_STACK_TOP,
};
use physmem::{FrameAllocator, FrameDeallocator};

/// The number of page tables covering the kernel half (the
/// lower 1 GiB) of every address space.
///
/// All of them are allocated at bring-up and linked into every
/// directory, so kernel-half mappings never require a new
/// table after paging is enabled.
///
pub const KERNEL_TABLE_COUNT: usize = 256;

bitflags! {
    /// The flag bits of a page entry, with the layout fixed by
    /// the hardware.
    ///
    pub struct PageEntryFlags: u32 {
        /// The page is present in memory.
        const PRESENT = 1 << 0;

        /// The page is writable.
        const WRITABLE = 1 << 1;

        /// The page can be accessed from user mode.
        const USER_ACCESSIBLE = 1 << 2;

        /// Set by the CPU when the page is accessed.
        const ACCESSED = 1 << 5;

        /// Set by the CPU when the page is written.
        const DIRTY = 1 << 6;
    }
}

/// The directory-level flags used for every linked page table.
///
/// Access control is enforced at the entry level, so tables are
/// linked permissively, as the entry flags are the ones that
/// matter.
///
const TABLE_LINK_FLAGS: u32 = 0x7; // PRESENT | WRITABLE | USER_ACCESSIBLE.

/// A single 32-bit page entry: 12 bits of flags, then the
/// 20-bit index of the mapped frame.
///
/// Invariant: if [`PRESENT`](PageEntryFlags::PRESENT) is set,
/// the frame index refers to a frame that is marked as in use
/// by the frame allocator.
///
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Returns an empty, non-present entry.
    ///
    pub const fn empty() -> Self {
        PageEntry(0)
    }

    /// Returns an entry mapping the given frame with the given
    /// flags.
    ///
    pub const fn new(frame: PhysFrame, flags: PageEntryFlags) -> Self {
        PageEntry((frame.index() << 12) | flags.bits())
    }

    /// Returns whether the entry is present.
    ///
    pub const fn is_present(&self) -> bool {
        self.0 & PageEntryFlags::PRESENT.bits() != 0
    }

    /// Returns the entry's flag bits.
    ///
    pub const fn flags(&self) -> PageEntryFlags {
        PageEntryFlags::from_bits_truncate(self.0)
    }

    /// Returns the mapped frame, or None if the entry is not
    /// present.
    ///
    pub fn frame(&self) -> Option<PhysFrame> {
        if !self.is_present() {
            return None;
        }

        Some(PhysFrame::from_index(self.0 >> 12))
    }

    /// Returns the entry's raw 32-bit representation.
    ///
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// A page table: 1024 entries occupying exactly one 4 KiB
/// frame.
///
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Returns the entry for the given page.
    ///
    pub fn entry(&self, page: VirtPage) -> PageEntry {
        self.entries[page.entry_index()]
    }

    /// Sets the entry for the given page.
    ///
    pub fn set_entry(&mut self, page: VirtPage, entry: PageEntry) {
        self.entries[page.entry_index()] = entry;
    }

    /// Returns the entry at the given index.
    ///
    pub fn entry_at(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns whether no entry in the table is present.
    ///
    pub fn is_unused(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

/// A page directory, in both the form the kernel navigates and
/// the form the hardware consumes.
///
/// The two arrays agree on presence: `tables[i]` is non-null
/// exactly when `hardware[i]` has its present bit set, and the
/// hardware word holds the physical address of the same table.
/// The `hardware` array is what CR3 points at, so the structure
/// is allocated page-aligned from the identity-mapped table
/// window and the array's virtual address doubles as its
/// physical one.
///
#[repr(C, align(4096))]
pub struct PageDirectory {
    tables: [*mut PageTable; ENTRIES_PER_TABLE],
    hardware: [u32; ENTRIES_PER_TABLE],
}

/// The number of window pages occupied by one [`PageDirectory`].
///
pub const DIRECTORY_PAGES: usize = mem::size_of::<PageDirectory>() / PAGE_SIZE as usize;

/// Allocates page tables and page directories from the fixed,
/// identity-mapped window reserved for them.
///
/// The window's frames are reserved in the frame allocator
/// wholesale at bring-up, so the slot bookkeeping here is the
/// only per-table state.
///
pub struct TableArea {
    start: usize,
    slots: Bitmap<'static>,
}

impl TableArea {
    /// Returns an allocator over the window starting at
    /// `start` with `pages` page-sized slots, tracked in the
    /// given word storage.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the window is unused,
    /// page-aligned, and identity mapped (or, at bring-up, that
    /// paging is not yet enabled).
    ///
    pub unsafe fn new(start: usize, pages: usize, words: &'static mut [u32]) -> TableArea {
        TableArea {
            start,
            slots: Bitmap::new_unset(words, pages),
        }
    }

    // Finds `count` contiguous free slots, marks them used, and
    // returns the address of the first.
    //
    fn alloc_slots(&mut self, count: usize) -> usize {
        let total = self.slots.num_bits();
        let mut run = 0;
        for i in 0..total {
            if self.slots.get(i) {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                let first = i + 1 - count;
                for slot in first..first + count {
                    self.slots.set(slot);
                }

                return self.start + first * PAGE_SIZE as usize;
            }
        }

        panic!("page-table window exhausted");
    }

    fn free_slots(&mut self, addr: usize, count: usize) {
        let first = (addr - self.start) / PAGE_SIZE as usize;
        for slot in first..first + count {
            self.slots.unset(slot);
        }
    }

    /// Allocates a zeroed page table.
    ///
    pub fn alloc_table(&mut self) -> *mut PageTable {
        let addr = self.alloc_slots(1);
        unsafe { ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE as usize) };

        addr as *mut PageTable
    }

    /// Returns a page table's slot to the window.
    ///
    pub fn free_table(&mut self, table: *mut PageTable) {
        self.free_slots(table as usize, 1);
    }

    /// Allocates a zeroed page directory.
    ///
    pub fn alloc_directory(&mut self) -> *mut PageDirectory {
        let addr = self.alloc_slots(DIRECTORY_PAGES);
        unsafe { ptr::write_bytes(addr as *mut u8, 0, DIRECTORY_PAGES * PAGE_SIZE as usize) };

        addr as *mut PageDirectory
    }

    /// Returns a page directory's slots to the window.
    ///
    pub fn free_directory(&mut self, directory: *mut PageDirectory) {
        self.free_slots(directory as usize, DIRECTORY_PAGES);
    }
}

/// FrameCopier describes how the contents of one physical frame
/// are copied into another.
///
/// Neither frame need be mapped in the live address space: the
/// kernel's implementation is a trampoline that disables paging
/// around the copy, so both frames are reached through the
/// identity of physical memory itself.
///
pub trait FrameCopier {
    /// Copies the contents of `src` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must not be in use by any mapping the CPU could
    /// touch during the copy.
    ///
    unsafe fn copy_frame(&mut self, dst: PhysFrame, src: PhysFrame);
}

/// An address space: a page directory plus all the page tables
/// reachable from it.
///
/// The kernel half is shared by alias with every other address
/// space; the user half is owned.
///
pub struct AddressSpace {
    directory: *mut PageDirectory,
}

// AddressSpace is not Send by default because it holds a raw
// pointer. There is exactly one CPU, and every path that
// touches an address space runs with interrupts disabled, so
// handing the structure between contexts is sound.
//
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Creates an empty address space.
    ///
    /// Only the kernel's own address space is built this way,
    /// at bring-up; process address spaces are created with
    /// [`clone_from`](AddressSpace::clone_from) so that they
    /// alias the kernel half.
    ///
    pub fn new(area: &mut TableArea) -> AddressSpace {
        AddressSpace {
            directory: area.alloc_directory(),
        }
    }

    /// Returns the physical address loaded into CR3 to make
    /// this address space live: the address of the hardware
    /// entry array.
    ///
    /// The directory lives in the identity-mapped table
    /// window, so its virtual address is its physical address.
    ///
    pub fn hardware_tables_physical(&self) -> u32 {
        let directory = unsafe { &*self.directory };
        directory.hardware.as_ptr() as usize as u32
    }

    // Returns the table containing the given page, creating
    // and linking it first if needed.
    //
    // The table for a page in the reserved window was itself
    // allocated at bring-up, so the allocation here can never
    // recurse.
    //
    unsafe fn ensure_table(&mut self, page: VirtPage, area: &mut TableArea) -> *mut PageTable {
        let directory = &mut *self.directory;
        let index = page.table_index();
        if directory.tables[index].is_null() {
            let table = area.alloc_table();
            directory.tables[index] = table;
            directory.hardware[index] = (table as usize as u32) | TABLE_LINK_FLAGS;
        }

        directory.tables[index]
    }

    /// Ensures the table with the given directory index exists,
    /// creating and linking it if needed.
    ///
    /// Bring-up uses this to pre-allocate every kernel-half
    /// table before any other address space exists.
    ///
    pub fn ensure_table_at(&mut self, index: usize, area: &mut TableArea) {
        unsafe {
            self.ensure_table(
                VirtPage::from_number((index * ENTRIES_PER_TABLE) as u32),
                area,
            );
        }
    }

    /// Maps the given page to a newly allocated frame,
    /// returning the frame.
    ///
    /// If `probe` is set, a test byte is written through the
    /// new mapping and read back, to catch physical regions
    /// that are not truly addressable memory. Only pass `probe`
    /// when this address space is the live one (or when paging
    /// is not yet enabled and the mapping is an identity
    /// mapping).
    ///
    /// # Safety
    ///
    /// The caller must guarantee the address space is valid and
    /// that remapping the page cannot break references the
    /// kernel holds.
    ///
    /// # Panics
    ///
    /// `map_page` will panic if the page already has a frame,
    /// or if no frame is available.
    ///
    pub unsafe fn map_page(
        &mut self,
        page: VirtPage,
        user_mode: bool,
        frames: &mut dyn FrameAllocator,
        area: &mut TableArea,
        probe: bool,
    ) -> PhysFrame {
        let frame = match frames.allocate_frame() {
            Some(frame) => frame,
            None => panic!("out of physical memory mapping page {}", page.start_address()),
        };

        self.map_page_to_frame(page, frame, user_mode, area);

        if probe {
            let addr = page.start_address().as_usize() as *mut u8;
            ptr::write_volatile(addr, 0xab);
            if ptr::read_volatile(addr) != 0xab {
                panic!(
                    "frame at {} is not addressable memory",
                    frame.start_address()
                );
            }
        }

        frame
    }

    /// Maps the given page to the given frame.
    ///
    /// Bring-up uses this to construct the identity map; later
    /// mappings allocate their frames with
    /// [`map_page`](AddressSpace::map_page).
    ///
    /// # Safety
    ///
    /// As for [`map_page`](AddressSpace::map_page); the caller
    /// must also own `frame`.
    ///
    /// # Panics
    ///
    /// `map_page_to_frame` will panic if the page already has a
    /// frame.
    ///
    pub unsafe fn map_page_to_frame(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        user_mode: bool,
        area: &mut TableArea,
    ) {
        let table = self.ensure_table(page, area);
        if (*table).entry(page).is_present() {
            panic!(
                "page {} already has a frame assigned to it",
                page.start_address()
            );
        }

        let mut flags = PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE;
        if user_mode {
            flags |= PageEntryFlags::USER_ACCESSIBLE;
        }

        (*table).set_entry(page, PageEntry::new(frame, flags));
    }

    /// Returns the frame mapped for the given page, or None.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the address space is valid.
    ///
    pub unsafe fn frame_for_page(&self, page: VirtPage) -> Option<PhysFrame> {
        let directory = &*self.directory;
        let table = directory.tables[page.table_index()];
        if table.is_null() {
            return None;
        }

        (*table).entry(page).frame()
    }

    /// Translates a virtual address to the physical address it
    /// maps to, or None.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the address space is valid.
    ///
    pub unsafe fn translate(&self, addr: VirtAddr) -> Option<u32> {
        let page = VirtPage::containing_address(addr);
        let frame = self.frame_for_page(page)?;

        Some(frame.start_address().as_u32() + (addr.as_u32() % PAGE_SIZE))
    }

    /// Calls `visit` with every present page entry and the page
    /// it maps.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the address space is valid.
    ///
    pub unsafe fn for_each_present_entry<F: FnMut(VirtPage, PageEntry)>(&self, visit: &mut F) {
        let directory = &*self.directory;
        for (i, table) in directory.tables.iter().enumerate() {
            if table.is_null() {
                continue;
            }

            for j in 0..ENTRIES_PER_TABLE {
                let entry = (**table).entry_at(j);
                if entry.is_present() {
                    let page = VirtPage::from_number((i * ENTRIES_PER_TABLE + j) as u32);
                    visit(page, entry);
                }
            }
        }
    }

    /// Clones this address space for a new process.
    ///
    /// The kernel half is aliased: the new directory links the
    /// same page tables with identical hardware words, so every
    /// address space sees the same kernel mapping at the same
    /// address. The user half is copied by value: every present
    /// page gets a fresh frame and its contents are copied
    /// through `copier`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the address space is valid and
    /// that interrupts are disabled for the duration.
    ///
    pub unsafe fn clone_from(
        &self,
        frames: &mut dyn FrameAllocator,
        area: &mut TableArea,
        copier: &mut dyn FrameCopier,
    ) -> AddressSpace {
        let mut new_space = AddressSpace::new(area);
        let src_dir = &*self.directory;
        let dst_dir = &mut *new_space.directory;

        // Kernel half: link the same tables.
        for i in 0..KERNEL_TABLE_COUNT {
            dst_dir.tables[i] = src_dir.tables[i];
            dst_dir.hardware[i] = src_dir.hardware[i];
        }

        // User half: copy by value.
        for i in KERNEL_TABLE_COUNT..ENTRIES_PER_TABLE {
            let src_table = src_dir.tables[i];
            if src_table.is_null() {
                continue;
            }

            for j in 0..ENTRIES_PER_TABLE {
                let entry = (*src_table).entry_at(j);
                let src_frame = match entry.frame() {
                    Some(frame) => frame,
                    None => continue,
                };

                let page = VirtPage::from_number((i * ENTRIES_PER_TABLE + j) as u32);
                let dst_table = new_space.ensure_table(page, area);
                let dst_frame = match frames.allocate_frame() {
                    Some(frame) => frame,
                    None => panic!("out of physical memory cloning address space"),
                };

                copier.copy_frame(dst_frame, src_frame);
                (*dst_table).set_entry(page, PageEntry::new(dst_frame, entry.flags()));
            }
        }

        new_space
    }

    /// Unmaps every user-half page, returning its frame to the
    /// allocator, and frees the emptied user-half tables.
    ///
    /// If `keep_syscall_stack` is set, the process's syscall
    /// kernel-stack pages survive the wipe, as `execve` runs on
    /// that stack while it replaces the rest of the image.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that nothing the CPU is using
    /// (in particular, the current stack) lies in the wiped
    /// range.
    ///
    pub unsafe fn wipe_user_half(
        &mut self,
        frames: &mut dyn FrameDeallocator,
        area: &mut TableArea,
        keep_syscall_stack: bool,
    ) {
        let stack_first =
            VirtPage::containing_address(SYSCALL_STACK_TOP).number() - SYSCALL_STACK_PAGES;

        let directory = &mut *self.directory;
        for i in KERNEL_TABLE_COUNT..ENTRIES_PER_TABLE {
            let table = directory.tables[i];
            if table.is_null() {
                continue;
            }

            for j in 0..ENTRIES_PER_TABLE {
                let entry = (*table).entry_at(j);
                let frame = match entry.frame() {
                    Some(frame) => frame,
                    None => continue,
                };

                let page_number = (i * ENTRIES_PER_TABLE + j) as u32;
                if keep_syscall_stack
                    && page_number >= stack_first
                    && page_number < stack_first + SYSCALL_STACK_PAGES
                {
                    continue;
                }

                frames.deallocate_frame(frame);
                (*table).set_entry(VirtPage::from_number(page_number), PageEntry::empty());
            }

            if (*table).is_unused() {
                area.free_table(table);
                directory.tables[i] = ptr::null_mut();
                directory.hardware[i] = 0;
            }
        }
    }

    /// Destroys the address space: wipes the user half and
    /// frees the directory.
    ///
    /// Kernel-half tables are shared with every other address
    /// space, so they are left untouched.
    ///
    /// # Safety
    ///
    /// The address space must not be the live one.
    ///
    pub unsafe fn destroy(
        mut self,
        frames: &mut dyn FrameDeallocator,
        area: &mut TableArea,
    ) {
        self.wipe_user_half(frames, area, false);
        area.free_directory(self.directory);
    }
}

/// The decoded error bits pushed by the CPU for a page fault.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageFaultError(u32);

impl PageFaultError {
    /// Wraps the raw error code pushed by the CPU.
    ///
    pub const fn from_bits(bits: u32) -> Self {
        PageFaultError(bits)
    }

    /// Whether the faulting page was present, making this a
    /// protection violation rather than a missing page.
    ///
    pub const fn protection_violation(&self) -> bool {
        self.0 & 1 << 0 != 0
    }

    /// Whether the access was a write.
    ///
    pub const fn caused_by_write(&self) -> bool {
        self.0 & 1 << 1 != 0
    }

    /// Whether the access came from user mode.
    ///
    pub const fn from_user_mode(&self) -> bool {
        self.0 & 1 << 2 != 0
    }

    /// Whether a reserved bit was set in a paging structure.
    ///
    pub const fn reserved_bit_set(&self) -> bool {
        self.0 & 1 << 3 != 0
    }

    /// Whether the access was an instruction fetch.
    ///
    pub const fn instruction_fetch(&self) -> bool {
        self.0 & 1 << 4 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_entry_encoding() {
        let entry = PageEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.bits(), 0);

        let frame = PhysFrame::from_index(0xbffff);
        let entry = PageEntry::new(
            frame,
            PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::USER_ACCESSIBLE,
        );
        assert!(entry.is_present());
        assert_eq!(entry.frame(), Some(frame));
        assert_eq!(entry.bits(), 0xbffff007);
        assert!(entry.flags().contains(PageEntryFlags::USER_ACCESSIBLE));

        // Kernel-only mappings have no user bit.
        let entry = PageEntry::new(frame, PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE);
        assert!(!entry.flags().contains(PageEntryFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn page_table_size() {
        // A page table must occupy exactly one frame, and a
        // directory's two views must each occupy whole pages.
        assert_eq!(mem::size_of::<PageTable>(), PAGE_SIZE as usize);
        assert_eq!(mem::align_of::<PageTable>(), PAGE_SIZE as usize);
        assert_eq!(
            mem::size_of::<PageDirectory>() % PAGE_SIZE as usize,
            0
        );
    }

    #[test]
    fn page_fault_error_decoding() {
        let error = PageFaultError::from_bits(0b00111);
        assert!(error.protection_violation());
        assert!(error.caused_by_write());
        assert!(error.from_user_mode());
        assert!(!error.reserved_bit_set());
        assert!(!error.instruction_fetch());

        let error = PageFaultError::from_bits(0b10000);
        assert!(error.instruction_fetch());
        assert!(!error.protection_violation());
    }
}
