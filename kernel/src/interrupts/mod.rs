// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Builds the Interrupt Descriptor Table and dispatches interrupts
//! to their registered handlers.
//!
//! All vectors funnel through the assembly stubs in `entry.s`,
//! which save the interrupted register file and call
//! [`interrupt_dispatch`] with a pointer to it. Hardware IRQs are
//! remapped so the master PIC delivers vectors 32-39 and the slave
//! 40-47, clear of the CPU's exception vectors. The syscall gate at
//! vector 0x80 is the one vector a ring-3 `int` instruction may
//! raise.
//!
//! Faults follow one policy: a fault raised from ring 0 is a
//! kernel bug and panics; a fault raised from ring 3 kills the
//! offending process and the scheduler carries on.

use crate::{cpu, gdt, Locked};
use core::arch::global_asm;
use core::mem;
use lantern_syscalls::SYSCALL_VECTOR;

global_asm!(include_str!("entry.s"));

/// The number of entries in the IDT.
///
const IDT_SIZE: usize = 256;

// I/O ports for the two PIC chips.
const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;

/// End-of-interrupt command code.
///
const PIC_EOI: u8 = 0x20;

/// The remapped vector of IRQ 0 on the master PIC.
///
pub const PIC1_VECTOR_OFFSET: u8 = 0x20;

/// The remapped vector of IRQ 8 on the slave PIC.
///
pub const PIC2_VECTOR_OFFSET: u8 = 0x28;

/// The timer's vector after remapping.
///
pub const TIMER_VECTOR: u8 = PIC1_VECTOR_OFFSET;

/// The keyboard's vector after remapping.
///
pub const KEYBOARD_VECTOR: u8 = PIC1_VECTOR_OFFSET + 1;

/// The register file saved by the entry stubs, in the order it
/// sits on the stack when `interrupt_dispatch` runs.
///
/// `user_esp` and `user_ss` are pushed by the CPU only when the
/// interrupt arrived from ring 3.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct InterruptContext {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

impl InterruptContext {
    /// Returns whether the interrupt arrived from ring 3.
    ///
    pub fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// An interrupt handler registered for one vector.
///
pub type Handler = fn(&mut InterruptContext);

/// One gate descriptor in the IDT.
///
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    always0: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            always0: 0,
            flags: 0,
            offset_high: 0,
        }
    }

    fn new(handler: unsafe extern "C" fn(), dpl: u8) -> Self {
        let offset = handler as usize as u32;

        // 0x8e is a present 32-bit interrupt gate; the DPL
        // bits control which ring may raise the vector with an
        // int instruction.
        IdtEntry {
            offset_low: (offset & 0xffff) as u16,
            selector: gdt::KERNEL_CODE_SELECTOR,
            always0: 0,
            flags: 0x8e | (dpl << 5),
            offset_high: (offset >> 16) as u16,
        }
    }
}

/// The pointer structure loaded by the lidt instruction.
///
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_SIZE] = [IdtEntry::missing(); IDT_SIZE];

/// HANDLERS holds the registered handler for each vector.
///
/// The dispatcher copies the handler out before calling it, so
/// the lock is never held across a handler (which may context
/// switch and not return for a while).
///
static HANDLERS: Locked<[Option<Handler>; IDT_SIZE]> = Locked::new([None; IDT_SIZE]);

/// The printable names of the CPU exceptions.
///
const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
    "virtualization error",
    "control protection error",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
];

// The entry stubs are implemented in entry.s.
//
extern "C" {
    fn interrupt_isr0();
    fn interrupt_isr1();
    fn interrupt_isr2();
    fn interrupt_isr3();
    fn interrupt_isr4();
    fn interrupt_isr5();
    fn interrupt_isr6();
    fn interrupt_isr7();
    fn interrupt_isr8();
    fn interrupt_isr9();
    fn interrupt_isr10();
    fn interrupt_isr11();
    fn interrupt_isr12();
    fn interrupt_isr13();
    fn interrupt_isr14();
    fn interrupt_isr15();
    fn interrupt_isr16();
    fn interrupt_isr17();
    fn interrupt_isr18();
    fn interrupt_isr19();
    fn interrupt_isr20();
    fn interrupt_isr21();
    fn interrupt_isr22();
    fn interrupt_isr23();
    fn interrupt_isr24();
    fn interrupt_isr25();
    fn interrupt_isr26();
    fn interrupt_isr27();
    fn interrupt_isr28();
    fn interrupt_isr29();
    fn interrupt_isr30();
    fn interrupt_isr31();
    fn interrupt_isr32();
    fn interrupt_isr33();
    fn interrupt_isr34();
    fn interrupt_isr35();
    fn interrupt_isr36();
    fn interrupt_isr37();
    fn interrupt_isr38();
    fn interrupt_isr39();
    fn interrupt_isr40();
    fn interrupt_isr41();
    fn interrupt_isr42();
    fn interrupt_isr43();
    fn interrupt_isr44();
    fn interrupt_isr45();
    fn interrupt_isr46();
    fn interrupt_isr47();
    fn interrupt_isr128();
}

// Remaps the two PIC chips so their vectors land above the CPU
// exceptions, then unmasks every IRQ line.
//
fn pic_remap() {
    unsafe {
        // ICW1: start the initialisation sequence in cascade
        // mode. The PICs then expect three initialisation
        // words on their data ports.
        cpu::outb(PIC1_COMMAND, 0x11);
        cpu::outb(PIC2_COMMAND, 0x11);

        // ICW2: the vector offsets.
        cpu::outb(PIC1_DATA, PIC1_VECTOR_OFFSET);
        cpu::outb(PIC2_DATA, PIC2_VECTOR_OFFSET);

        // ICW3: the master has a slave on IRQ 2; the slave's
        // cascade identity is 2.
        cpu::outb(PIC1_DATA, 0x04);
        cpu::outb(PIC2_DATA, 0x02);

        // ICW4: 8086 mode.
        cpu::outb(PIC1_DATA, 0x01);
        cpu::outb(PIC2_DATA, 0x01);

        // Unmask every line.
        cpu::outb(PIC1_DATA, 0x00);
        cpu::outb(PIC2_DATA, 0x00);
    }
}

// Acknowledges the given IRQ at the PICs.
//
fn acknowledge(irq: u8) {
    unsafe {
        if irq >= 8 {
            cpu::outb(PIC2_COMMAND, PIC_EOI);
        }

        cpu::outb(PIC1_COMMAND, PIC_EOI);
    }
}

/// Builds the IDT, remaps the PICs, and loads the table.
///
/// Interrupts remain disabled; they are first enabled on the
/// jump to user mode.
///
pub fn init() {
    pic_remap();

    let stubs: [unsafe extern "C" fn(); 48] = [
        interrupt_isr0,
        interrupt_isr1,
        interrupt_isr2,
        interrupt_isr3,
        interrupt_isr4,
        interrupt_isr5,
        interrupt_isr6,
        interrupt_isr7,
        interrupt_isr8,
        interrupt_isr9,
        interrupt_isr10,
        interrupt_isr11,
        interrupt_isr12,
        interrupt_isr13,
        interrupt_isr14,
        interrupt_isr15,
        interrupt_isr16,
        interrupt_isr17,
        interrupt_isr18,
        interrupt_isr19,
        interrupt_isr20,
        interrupt_isr21,
        interrupt_isr22,
        interrupt_isr23,
        interrupt_isr24,
        interrupt_isr25,
        interrupt_isr26,
        interrupt_isr27,
        interrupt_isr28,
        interrupt_isr29,
        interrupt_isr30,
        interrupt_isr31,
        interrupt_isr32,
        interrupt_isr33,
        interrupt_isr34,
        interrupt_isr35,
        interrupt_isr36,
        interrupt_isr37,
        interrupt_isr38,
        interrupt_isr39,
        interrupt_isr40,
        interrupt_isr41,
        interrupt_isr42,
        interrupt_isr43,
        interrupt_isr44,
        interrupt_isr45,
        interrupt_isr46,
        interrupt_isr47,
    ];

    unsafe {
        for (vector, stub) in stubs.iter().enumerate() {
            IDT[vector] = IdtEntry::new(*stub, 0);
        }

        // The syscall gate may be raised from ring 3.
        IDT[SYSCALL_VECTOR as usize] = IdtEntry::new(interrupt_isr128, 3);

        let pointer = IdtPointer {
            limit: (mem::size_of::<[IdtEntry; IDT_SIZE]>() - 1) as u16,
            base: IDT.as_ptr() as u32,
        };

        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(nostack));
    }
}

/// Registers a handler for the given vector, replacing any
/// existing registration.
///
pub fn register_handler(vector: u8, handler: Handler) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

// Called for an exception with no registered policy of its
// own: panic if the kernel faulted, kill the process if user
// code did.
//
fn handle_exception(ctx: &mut InterruptContext) {
    let name = EXCEPTION_NAMES[ctx.vector as usize];
    if ctx.from_user_mode() {
        crate::println!(
            "{} in user mode at {:#010x}; killing process",
            name,
            ctx.eip
        );
        crate::multitasking::kill_current();
    }

    panic!(
        "{} in kernel mode at {:#010x} (error code {:#x})",
        name, ctx.eip, ctx.error_code
    );
}

/// The common dispatcher every entry stub calls.
///
/// IRQs are acknowledged before their handler runs, as the
/// timer handler may context-switch and not return here until
/// the interrupted process is next scheduled.
///
#[no_mangle]
extern "C" fn interrupt_dispatch(ctx: &mut InterruptContext) {
    let vector = ctx.vector;
    if (PIC1_VECTOR_OFFSET as u32..PIC2_VECTOR_OFFSET as u32 + 8).contains(&vector) {
        acknowledge((vector - PIC1_VECTOR_OFFSET as u32) as u8);
    }

    match vector {
        14 => crate::memory::handle_page_fault(ctx),
        v if v < 32 => handle_exception(ctx),
        _ => {
            let handler = HANDLERS.lock()[vector as usize];
            match handler {
                Some(handler) => handler(ctx),
                None => crate::println!("unexpected interrupt {}", vector),
            }
        }
    }
}
