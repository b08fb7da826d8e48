// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's syscalls, allowing user processes to
//! access kernel functionality.
//!
//! The gate is `int 0x80`: the syscall number arrives in `eax`,
//! up to three arguments in `ebx`, `ecx` and `edx`, and the
//! result goes back in `eax`. User programs reach the gate
//! through the stub routines in `stubs.s`, which the loader
//! copies into each process's import area and binds to the
//! symbols the program imports from the `kernel` library.
//!
//! A failing syscall returns -1 in `eax`; it never disturbs the
//! calling process.

use crate::interrupts::{self, InterruptContext};
use crate::{multitasking, screen, vfs};
use alloc::collections::BTreeMap;
use core::slice;
use core::str;
use lantern_syscalls::{Syscall, SYSCALL_ERROR, SYSCALL_VECTOR};
use spin::Once;

use core::arch::global_asm;

global_asm!(include_str!("stubs.s"));

// The stub bodies and their end markers, defined in stubs.s.
//
extern "C" {
    static syscall_print_stub: u8;
    static syscall_print_stub_end: u8;
    static syscall_exit_stub: u8;
    static syscall_exit_stub_end: u8;
    static syscall_pos_cursor_stub: u8;
    static syscall_pos_cursor_stub_end: u8;
    static syscall_clear_screen_stub: u8;
    static syscall_clear_screen_stub_end: u8;
    static syscall_execve_stub: u8;
    static syscall_execve_stub_end: u8;
    static syscall_fork_stub: u8;
    static syscall_fork_stub_end: u8;
    static syscall_open_stub: u8;
    static syscall_open_stub_end: u8;
    static syscall_read_stub: u8;
    static syscall_read_stub_end: u8;
    static syscall_write_stub: u8;
    static syscall_write_stub_end: u8;
    static syscall_close_stub: u8;
    static syscall_close_stub_end: u8;
}

/// STUBS maps each exported symbol to its stub's machine code.
///
/// The loader resolves a program's imports with one lookup
/// each.
///
static STUBS: Once<BTreeMap<&'static str, &'static [u8]>> = Once::new();

// Builds a byte slice spanning a stub's body.
//
unsafe fn stub_bytes(start: &'static u8, end: &'static u8) -> &'static [u8] {
    let start_addr = start as *const u8 as usize;
    let end_addr = end as *const u8 as usize;
    slice::from_raw_parts(start as *const u8, end_addr - start_addr)
}

/// Returns the machine code of the stub exported under the
/// given symbol, or None.
///
pub fn stub(symbol: &str) -> Option<&'static [u8]> {
    STUBS
        .get()
        .expect("syscall stubs not initialised")
        .get(symbol)
        .copied()
}

/// Builds the stub catalogue and registers the syscall gate.
///
pub fn init() {
    STUBS.call_once(|| {
        let mut stubs = BTreeMap::new();
        unsafe {
            stubs.insert(
                Syscall::Print.symbol(),
                stub_bytes(&syscall_print_stub, &syscall_print_stub_end),
            );
            stubs.insert(
                Syscall::Exit.symbol(),
                stub_bytes(&syscall_exit_stub, &syscall_exit_stub_end),
            );
            stubs.insert(
                Syscall::PosCursor.symbol(),
                stub_bytes(&syscall_pos_cursor_stub, &syscall_pos_cursor_stub_end),
            );
            stubs.insert(
                Syscall::ClearScreen.symbol(),
                stub_bytes(&syscall_clear_screen_stub, &syscall_clear_screen_stub_end),
            );
            stubs.insert(
                Syscall::Execve.symbol(),
                stub_bytes(&syscall_execve_stub, &syscall_execve_stub_end),
            );
            stubs.insert(
                Syscall::Fork.symbol(),
                stub_bytes(&syscall_fork_stub, &syscall_fork_stub_end),
            );
            stubs.insert(
                Syscall::Open.symbol(),
                stub_bytes(&syscall_open_stub, &syscall_open_stub_end),
            );
            stubs.insert(
                Syscall::Read.symbol(),
                stub_bytes(&syscall_read_stub, &syscall_read_stub_end),
            );
            stubs.insert(
                Syscall::Write.symbol(),
                stub_bytes(&syscall_write_stub, &syscall_write_stub_end),
            );
            stubs.insert(
                Syscall::Close.symbol(),
                stub_bytes(&syscall_close_stub, &syscall_close_stub_end),
            );
        }

        stubs
    });

    interrupts::register_handler(SYSCALL_VECTOR, syscall_handler);
}

// Reads the NUL-terminated string at the given user address.
//
// The walk trusts the pointer: a bad one page-faults, and the
// fault policy kills the process.
//
unsafe fn user_cstr<'bytes>(addr: u32) -> &'bytes str {
    let start = addr as *const u8;
    let mut len = 0usize;
    while *start.add(len) != 0 {
        len += 1;
    }

    str::from_utf8(slice::from_raw_parts(start, len)).unwrap_or("")
}

// The int 0x80 handler: index by eax and dispatch.
//
fn syscall_handler(ctx: &mut InterruptContext) {
    let syscall = match Syscall::from_u32(ctx.eax) {
        Some(syscall) => syscall,
        None => {
            crate::println!("unrecognised syscall {}", ctx.eax);
            ctx.eax = SYSCALL_ERROR;
            return;
        }
    };

    match syscall {
        Syscall::Print => {
            let message = unsafe { user_cstr(ctx.ebx) };
            crate::print!("{}", message);
        }
        Syscall::Exit => {
            multitasking::exit(ctx.ebx);
        }
        Syscall::PosCursor => {
            screen::pos_cursor(ctx.ebx as usize, ctx.ecx as usize);
        }
        Syscall::ClearScreen => {
            screen::clear();
        }
        Syscall::Execve => {
            let path = unsafe { user_cstr(ctx.ebx) };
            // Only returns on failure.
            ctx.eax = multitasking::execve(path) as u32;
        }
        Syscall::Fork => {
            ctx.eax = multitasking::fork();
        }
        Syscall::Open => {
            let path = unsafe { user_cstr(ctx.ebx) };
            ctx.eax = match vfs::lookup(path) {
                Some(node) => {
                    node.open();
                    multitasking::add_fd(node) as u32
                }
                None => SYSCALL_ERROR,
            };
        }
        Syscall::Read => {
            ctx.eax = match multitasking::fd_node(ctx.ebx as i32) {
                Some(node) => {
                    let buf =
                        unsafe { slice::from_raw_parts_mut(ctx.ecx as *mut u8, ctx.edx as usize) };
                    match node.read(0, buf) {
                        Ok(read) => read as u32,
                        Err(_) => SYSCALL_ERROR,
                    }
                }
                None => SYSCALL_ERROR,
            };
        }
        Syscall::Write => {
            ctx.eax = match multitasking::fd_node(ctx.ebx as i32) {
                Some(node) => {
                    let buf =
                        unsafe { slice::from_raw_parts(ctx.ecx as *const u8, ctx.edx as usize) };
                    match node.write(0, buf) {
                        Ok(written) => written as u32,
                        Err(_) => SYSCALL_ERROR,
                    }
                }
                None => SYSCALL_ERROR,
            };
        }
        Syscall::Close => {
            ctx.eax = match multitasking::fd_node(ctx.ebx as i32) {
                Some(node) => {
                    node.close();
                    multitasking::close_fd(ctx.ebx as i32);
                    0
                }
                None => SYSCALL_ERROR,
            };
        }
    }
}
