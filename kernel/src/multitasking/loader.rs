// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Loads RawX executable images into an address space.
//!
//! The loader maps each `.code` and `.data` section page by page
//! into the target address space and copies the section bytes in.
//! The `.import` section gets special treatment: for every
//! imported symbol, the matching syscall stub's machine code is
//! copied into a dedicated page just below the user stack's
//! reserved span, and the stub's address is written into the
//! import entry's call-address column before the section body is
//! placed. The image's own code calls through that column, so the
//! rewrite is what routes user calls into the `int 0x80` gate.
//!
//! The address space being loaded must be the live one: section
//! bytes are copied through their new virtual mappings.

use crate::{memory, syscalls};
use alloc::vec::Vec;
use core::ptr;
use memlayout::{
    VirtAddr, VirtPage, IMPORT_AREA_START, PAGE_SIZE, SYSCALL_STACK_PAGES, SYSCALL_STACK_TOP,
    USER_STACK_MAX_RESERVED_PAGES, USER_STACK_TOP,
};
use rawx::{Image, ImportTable, SectionKind};
use virtmem::AddressSpace;

/// Where a loaded image starts executing.
///
#[derive(Clone, Copy, Debug)]
pub struct LoadInfo {
    /// The virtual address of the image's entry point.
    pub entry_point: u32,

    /// The initial user stack pointer, if a stack was created.
    pub user_stack_top: Option<u32>,
}

/// The library name every import must come from.
///
const KERNEL_LIBRARY: &str = "kernel";

// Maps one user-accessible page in the live address space,
// allocating its frame.
//
fn map_user_page(space: &mut AddressSpace, page: VirtPage, user_mode: bool) {
    let mut frames = memory::frames().lock();
    let mut tables = memory::tables().lock();
    unsafe {
        space.map_page(page, user_mode, &mut *frames, &mut *tables, true);
    }
}

// Maps pages for `data` at `address` and copies it in, zeroing
// the tail of the last page.
//
fn map_and_copy(space: &mut AddressSpace, address: u32, data: &[u8]) {
    let mut offset = 0usize;
    while offset < data.len() {
        let target = address + offset as u32;
        let page = VirtPage::from_start_address(VirtAddr::new(target));
        let chunk = core::cmp::min(PAGE_SIZE as usize, data.len() - offset);

        map_user_page(space, page, true);
        unsafe {
            ptr::write_bytes(target as *mut u8, 0, PAGE_SIZE as usize);
            ptr::copy_nonoverlapping(data.as_ptr().add(offset), target as *mut u8, chunk);
        }

        offset += chunk;
    }
}

/// Loads the image in `bytes` into the live address space.
///
/// When `create_stack` is set, the user stack the header asks
/// for is mapped descending from the fixed user-stack top. When
/// `create_syscall_stack` is set, the process's syscall kernel
/// stack is mapped (kernel-mode only) descending from its fixed
/// address in the upper half.
///
/// Parse-level problems are returned as errors; placement
/// violations (unaligned sections, unknown imports, oversized
/// stacks) panic, as they mean the image was built wrong.
///
pub fn load(
    bytes: &[u8],
    space: &mut AddressSpace,
    create_stack: bool,
    create_syscall_stack: bool,
) -> Result<LoadInfo, &'static str> {
    let image = Image::parse(bytes)?;

    for section in image.sections() {
        let section_address = image
            .header
            .load_address
            .checked_add(section.virtual_address)
            .unwrap_or(u32::MAX);
        if section_address % PAGE_SIZE != 0 {
            panic!(
                "section {} at {:#010x} is not page-aligned",
                section.name_str(),
                section_address
            );
        }

        let section_end = section_address
            .checked_add(section.size_bytes)
            .unwrap_or(u32::MAX);
        if section_end >= IMPORT_AREA_START.as_u32() {
            panic!(
                "section {} at {:#010x} overlaps the import and stack area",
                section.name_str(),
                section_address
            );
        }

        match section.kind() {
            SectionKind::Code | SectionKind::Data => {
                let data = image.section_data(section)?;
                map_and_copy(space, section_address, data);
            }
            SectionKind::Import => {
                let body = image.section_data(section)?;
                let patched = place_imports(space, body)?;
                map_and_copy(space, section_address, &patched);
            }
            SectionKind::Unknown => {}
        }
    }

    let mut user_stack_top = None;
    if create_stack {
        let stack_size = image.header.stack_size;
        if stack_size == 0 {
            panic!("image requests a zero-sized stack");
        }
        if stack_size % PAGE_SIZE != 0 {
            panic!("image stack size {:#x} is not page-aligned", stack_size);
        }

        let pages = stack_size / PAGE_SIZE;
        if pages > USER_STACK_MAX_RESERVED_PAGES {
            panic!("image stack of {} pages exceeds the reserved span", pages);
        }

        let top = VirtPage::containing_address(USER_STACK_TOP).number();
        for i in 1..=pages {
            map_user_page(space, VirtPage::from_number(top - i), true);
        }

        user_stack_top = Some(USER_STACK_TOP.as_u32());
    }

    if create_syscall_stack {
        let top = VirtPage::containing_address(SYSCALL_STACK_TOP).number();
        for i in 1..=SYSCALL_STACK_PAGES {
            map_user_page(space, VirtPage::from_number(top - i), false);
        }
    }

    Ok(LoadInfo {
        entry_point: image.entry_point(),
        user_stack_top,
    })
}

// Copies the stub for each imported symbol into the import
// area and returns the section body with every call-address
// column rewritten to its stub's address.
//
fn place_imports(space: &mut AddressSpace, body: &[u8]) -> Result<Vec<u8>, &'static str> {
    let table = ImportTable::parse(body)?;
    let mut patched = Vec::new();
    patched.extend_from_slice(body);

    // One page holds every stub this kernel exports.
    let page = VirtPage::from_start_address(IMPORT_AREA_START);
    map_user_page(space, page, true);

    let mut current = IMPORT_AREA_START.as_u32();
    for i in 0..table.len() {
        let import = table.entry(i)?;
        let symbol = table.name_at(import.symbol_offset)?;
        let lib = table.name_at(import.lib_offset)?;
        if lib != KERNEL_LIBRARY {
            panic!("import of {}:{} from an unknown library", lib, symbol);
        }

        let stub = syscalls::stub(symbol)
            .unwrap_or_else(|| panic!("import of unknown symbol {:?}", symbol));
        if current + stub.len() as u32 > IMPORT_AREA_START.as_u32() + PAGE_SIZE {
            panic!("import stubs overflow their page");
        }

        unsafe {
            ptr::copy_nonoverlapping(stub.as_ptr(), current as *mut u8, stub.len());
        }

        // Route the image's calls at the placed stub.
        let offset = import.call_address_offset as usize;
        patched[offset..offset + 4].copy_from_slice(&current.to_le_bytes());

        crate::println!("loader: placed {}:{} at {:#010x}", lib, symbol, current);
        current += stub.len() as u32;
    }

    Ok(patched)
}
