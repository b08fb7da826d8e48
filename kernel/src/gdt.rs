// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Sets up the Global Descriptor Table.
//!
//! The kernel uses a flat segmentation model: code and data
//! segments for ring 0 and ring 3, each covering the whole 4 GiB
//! address space, plus one task state segment. The TSS only
//! matters for its `esp0` field, which tells the CPU which stack
//! to use when an interrupt or syscall arrives from ring 3.

use core::arch::asm;
use core::mem;

/// The ring-0 code segment selector.
///
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// The ring-0 data segment selector.
///
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// The ring-3 code segment selector, with the RPL bits set.
///
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;

/// The ring-3 data segment selector, with the RPL bits set.
///
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

/// The task state segment selector.
///
pub const TSS_SELECTOR: u16 = 0x28;

/// One 8-byte GDT descriptor.
///
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xffff) as u16,
            base_low: (base & 0xffff) as u16,
            base_middle: ((base >> 16) & 0xff) as u8,
            access,
            granularity: (((limit >> 16) & 0x0f) as u8) | (granularity & 0xf0),
            base_high: ((base >> 24) & 0xff) as u8,
        }
    }
}

/// The pointer structure loaded by the lgdt instruction.
///
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// The 32-bit task state segment.
///
/// Only `ss0` and `esp0` are used: the CPU loads them when an
/// interrupt arrives from ring 3. Everything else exists to
/// give the structure its architected layout.
///
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt_selector: u32,
    debug_trap: u16,
    iomap_base: u16,
}

const TSS_EMPTY: TaskStateSegment = TaskStateSegment {
    prev_task_link: 0,
    esp0: 0,
    ss0: 0,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldt_selector: 0,
    debug_trap: 0,
    iomap_base: 0,
};

static mut GDT: [GdtEntry; 6] = [GdtEntry::null(); 6];
static mut TSS: TaskStateSegment = TSS_EMPTY;

/// Builds and loads the GDT, reloads the segment registers,
/// and loads the task register.
///
pub fn init() {
    unsafe {
        // Flat 4 GiB segments: granularity 0xcf is 4 KiB pages
        // with 32-bit operands.
        GDT[1] = GdtEntry::new(0, 0xfffff, 0x9a, 0xcf); // Ring-0 code.
        GDT[2] = GdtEntry::new(0, 0xfffff, 0x92, 0xcf); // Ring-0 data.
        GDT[3] = GdtEntry::new(0, 0xfffff, 0xfa, 0xcf); // Ring-3 code.
        GDT[4] = GdtEntry::new(0, 0xfffff, 0xf2, 0xcf); // Ring-3 data.

        // The TSS descriptor is byte-granular with the access
        // bits for an available 32-bit TSS.
        let tss_base = &TSS as *const TaskStateSegment as u32;
        let tss_limit = mem::size_of::<TaskStateSegment>() as u32 - 1;
        GDT[5] = GdtEntry::new(tss_base, tss_limit, 0x89, 0x00);

        TSS.ss0 = KERNEL_DATA_SELECTOR as u32;
        TSS.iomap_base = mem::size_of::<TaskStateSegment>() as u16;

        let pointer = GdtPointer {
            limit: (mem::size_of::<[GdtEntry; 6]>() - 1) as u16,
            base: GDT.as_ptr() as u32,
        };

        asm!(
            "lgdt [{ptr}]",
            // Reload the data segment registers with the
            // ring-0 data selector.
            "mov ax, 0x10",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            // Reload CS (the ring-0 code selector) with a far
            // return.
            "push 0x08",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            // Load the task register.
            "mov ax, 0x28",
            "ltr ax",
            ptr = in(reg) &pointer,
            out("eax") _,
        );
    }
}

/// Records the stack the CPU switches to when an interrupt or
/// syscall arrives from ring 3.
///
pub fn set_kernel_stack(esp0: u32) {
    unsafe {
        TSS.esp0 = esp0;
    }
}
