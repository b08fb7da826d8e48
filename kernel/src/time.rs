// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Programs the timer that drives pre-emption.
//!
//! The programmable interval timer's channel 0 is set to fire
//! IRQ 0 at [`TICK_RATE`] Hz. Each tick is the kernel's only
//! involuntary pre-emption point: the handler rotates the
//! scheduler, and the interrupted process resumes when its turn
//! comes round again.

use crate::interrupts::{self, InterruptContext, TIMER_VECTOR};
use crate::{cpu, multitasking};
use core::sync::atomic::{AtomicU32, Ordering};

/// The PIT's base oscillator frequency in Hz.
///
const PIT_FREQUENCY: u32 = 1193182;

/// The tick rate the timer is programmed to, in Hz.
///
pub const TICK_RATE: u32 = 100;

// The PIT's I/O ports.
const CHANNEL_0_PORT: u16 = 0x40;
const COMMAND_PORT: u16 = 0x43;

/// TICKS counts timer interrupts since boot.
///
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Returns the number of timer ticks since boot.
///
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

// The IRQ 0 handler: count the tick and rotate the scheduler.
//
fn timer_interrupt_handler(_ctx: &mut InterruptContext) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    multitasking::switch(multitasking::State::Ready);
}

/// Programs the timer and registers its interrupt handler.
///
pub fn init() {
    let divisor = PIT_FREQUENCY / TICK_RATE;
    unsafe {
        // Channel 0, lobyte/hibyte access, square wave mode.
        cpu::outb(COMMAND_PORT, 0x36);
        cpu::outb(CHANNEL_0_PORT, (divisor & 0xff) as u8);
        cpu::outb(CHANNEL_0_PORT, (divisor >> 8) as u8);
    }

    interrupts::register_handler(TIMER_VECTOR, timer_interrupt_handler);
}
