// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's entry point.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use kernel::{halt_loop, multitasking, println};

/// The program started as the first user process.
///
const INIT_PROGRAM: &str = "init.rawx";

// This function is called on panic.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("kernel panic: {}", info);
    halt_loop();
}

/// kmain is called by the boot stub (see boot.rs) with the
/// stack at the top of the kernel stack region and interrupts
/// disabled.
///
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    kernel::screen::init();
    println!("Welcome to Lantern.");

    kernel::init();

    // Hand over to the first user process. Interrupts are
    // enabled by the jump into user mode.
    multitasking::start_init_process(INIT_PROGRAM);
}
