// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Prints text to the VGA text-mode buffer.
//!
//! The buffer is the identity-mapped MMIO window at 0xb8000: 25
//! rows of 80 cells, each a character byte plus a colour byte.
//! Writes go through [`volatile`] so the compiler cannot elide
//! or reorder them.

use crate::cpu;
use core::fmt;
use core::fmt::Write;
use lazy_static::lazy_static;
use volatile::Volatile;

/// The address of the VGA text buffer.
///
const VGA_BUFFER: usize = 0xb8000;

/// The height of the text buffer.
///
const BUFFER_HEIGHT: usize = 25;

/// The width of the text buffer.
///
const BUFFER_WIDTH: usize = 80;

/// The attribute byte used for all kernel output: light grey
/// on black.
///
const COLOUR: u8 = 0x07;

// The CRT controller's cursor registers.
const CRTC_ADDRESS_PORT: u16 = 0x3d4;
const CRTC_DATA_PORT: u16 = 0x3d5;
const CURSOR_HIGH: u8 = 0x0e;
const CURSOR_LOW: u8 = 0x0f;

/// One cell of the text buffer.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    character: u8,
    colour: u8,
}

#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Writes text into the VGA buffer, tracking the cursor and
/// scrolling when the bottom row fills.
///
pub struct Writer {
    row: usize,
    column: usize,
    buffer: &'static mut Buffer,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }

                Volatile::new(&mut self.buffer.chars[self.row][self.column]).write(ScreenChar {
                    character: byte,
                    colour: COLOUR,
                });
                self.column += 1;
            }
        }
    }

    fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                // Printable ASCII or newline.
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                // Anything else gets a placeholder.
                _ => self.write_byte(0xfe),
            }
        }

        self.update_cursor();
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }

        // Scroll everything up one row.
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = Volatile::new(&self.buffer.chars[row][col]).read();
                Volatile::new(&mut self.buffer.chars[row - 1][col]).write(cell);
            }
        }

        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            character: b' ',
            colour: COLOUR,
        };
        for col in 0..BUFFER_WIDTH {
            Volatile::new(&mut self.buffer.chars[row][col]).write(blank);
        }
    }

    /// Clears the whole screen and homes the cursor.
    ///
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }

        self.row = 0;
        self.column = 0;
        self.update_cursor();
    }

    /// Moves the cursor to the given column and row, clamping
    /// both to the buffer's bounds.
    ///
    pub fn pos_cursor(&mut self, x: usize, y: usize) {
        self.column = core::cmp::min(x, BUFFER_WIDTH - 1);
        self.row = core::cmp::min(y, BUFFER_HEIGHT - 1);
        self.update_cursor();
    }

    // Mirrors the writer's position into the hardware cursor.
    //
    fn update_cursor(&mut self) {
        let position = (self.row * BUFFER_WIDTH + self.column) as u16;
        unsafe {
            cpu::outb(CRTC_ADDRESS_PORT, CURSOR_HIGH);
            cpu::outb(CRTC_DATA_PORT, (position >> 8) as u8);
            cpu::outb(CRTC_ADDRESS_PORT, CURSOR_LOW);
            cpu::outb(CRTC_DATA_PORT, (position & 0xff) as u8);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    /// WRITER is the screen writer used by the print macros.
    ///
    pub static ref WRITER: spin::Mutex<Writer> = spin::Mutex::new(Writer {
        row: 0,
        column: 0,
        buffer: unsafe { &mut *(VGA_BUFFER as *mut Buffer) },
    });
}

/// Clears the screen.
///
pub fn init() {
    WRITER.lock().clear();
}

/// Clears the screen and homes the cursor.
///
pub fn clear() {
    cpu::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

/// Moves the cursor to the given column and row.
///
pub fn pos_cursor(x: usize, y: usize) {
    cpu::without_interrupts(|| {
        WRITER.lock().pos_cursor(x, y);
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    cpu::without_interrupts(|| {
        WRITER.lock().write_fmt(args).expect("printing to VGA failed");
    });
}

/// Prints to the screen.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::screen::_print(format_args!($($arg)*))
    };
}

/// Prints to the screen, appending a newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
