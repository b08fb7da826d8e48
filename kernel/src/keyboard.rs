// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Delivers keyboard bytes to blocked readers.
//!
//! The PS/2 controller raises IRQ 1 with a scancode waiting on
//! its data port. The interrupt handler pushes the byte onto a
//! bounded queue and wakes the longest-parked reader, if any.
//! Reading the `kbd` device node drains the queue, or parks the
//! calling process until a byte arrives: readers are served in
//! the order they registered, and each registration is good for
//! one wake-up.
//!
//! Scancode decoding is left to user programs; the device
//! delivers raw bytes in arrival order.

use crate::interrupts::{self, InterruptContext, KEYBOARD_VECTOR};
use crate::multitasking::Pid;
use crate::{cpu, multitasking, vfs};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use filesystem::{Error, FileInfo, FileNode, FileType, Permissions};
use lazy_static::lazy_static;

/// The PS/2 controller's data port.
///
const DATA_PORT: u16 = 0x60;

/// The PS/2 controller's status register port.
///
const STATUS_PORT: u16 = 0x64;

/// The most scancodes held while no reader is waiting. Bytes
/// beyond this are dropped, oldest first.
///
const QUEUE_CAPACITY: usize = 64;

/// The device node's name in the filesystem root.
///
pub const DEVICE_NAME: &str = "kbd";

/// The queue of undelivered scancodes and parked readers.
///
struct EventQueue {
    bytes: VecDeque<u8>,
    waiters: VecDeque<Pid>,
}

lazy_static! {
    static ref QUEUE: spin::Mutex<EventQueue> = spin::Mutex::new(EventQueue {
        bytes: VecDeque::new(),
        waiters: VecDeque::new(),
    });
}

// The IRQ 1 handler: pull the scancode, queue it, and wake the
// first parked reader.
//
fn keyboard_interrupt_handler(_ctx: &mut InterruptContext) {
    let status = unsafe { cpu::inb(STATUS_PORT) };
    if status & 0x01 == 0 {
        // IRQ 1 with an empty output buffer; nothing to read.
        return;
    }

    let scancode = unsafe { cpu::inb(DATA_PORT) };

    let waiter = {
        let mut queue = QUEUE.lock();
        if queue.bytes.len() == QUEUE_CAPACITY {
            queue.bytes.pop_front();
        }

        queue.bytes.push_back(scancode);
        queue.waiters.pop_front()
    };

    if let Some(pid) = waiter {
        multitasking::unblock(pid);
    }
}

/// The keyboard device node.
///
/// Reads block until at least one byte is available, then
/// return as many queued bytes as fit the buffer. Writes are
/// not supported.
///
pub struct KeyboardNode;

impl FileNode for KeyboardNode {
    fn info(&self) -> FileInfo {
        FileInfo {
            name: String::from(DEVICE_NAME),
            file_type: FileType::Device,
            permissions: Permissions::READ,
            size: 0,
        }
    }

    fn read(&self, _offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut queue = QUEUE.lock();
                if !queue.bytes.is_empty() {
                    let mut filled = 0;
                    while filled < buf.len() {
                        match queue.bytes.pop_front() {
                            Some(byte) => {
                                buf[filled] = byte;
                                filled += 1;
                            }
                            None => break,
                        }
                    }

                    return Ok(filled);
                }

                // Nothing queued: park until the interrupt
                // handler delivers a byte. The registration is
                // consumed by a single wake-up.
                queue.waiters.push_back(multitasking::current_pid());
            }

            multitasking::block_current();
        }
    }

    fn write(&self, _offset: usize, _buf: &[u8]) -> Result<usize, Error> {
        Err(Error::NotSupported)
    }
}

/// Registers the interrupt handler and the device node.
///
pub fn init() {
    interrupts::register_handler(KEYBOARD_VECTOR, keyboard_interrupt_handler);
    vfs::register(Arc::new(KeyboardNode));
}
