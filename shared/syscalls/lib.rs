// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the list of syscalls implemented by the Lantern kernel.
//!
//! Syscalls are entered with `int 0x80`. The syscall number is
//! passed in `eax`, up to three arguments in `ebx`, `ecx` and
//! `edx`, and the result is returned in `eax`. User programs do
//! not issue `int 0x80` themselves: they call the stub routines
//! the loader copies into their address space, named by the
//! symbol each [`Syscall`] reports from [`symbol`](Syscall::symbol).

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

/// The interrupt vector used to enter the kernel.
///
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The result returned in `eax` when a syscall fails.
///
pub const SYSCALL_ERROR: u32 = (-1i32) as u32;

/// The exit code recorded for a process killed by the kernel,
/// such as after a fatal fault in user mode.
///
pub const KILLED_BY_KERNEL: u32 = 255;

/// The set of syscalls implemented by the Lantern kernel.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Syscall {
    /// Print a NUL-terminated string to the screen.
    Print = 0,

    /// Exit the current process. Does not return.
    Exit = 1,

    /// Position the screen cursor at (x, y).
    PosCursor = 2,

    /// Clear the screen.
    ClearScreen = 3,

    /// Replace the current process image with the executable
    /// at the given path.
    Execve = 4,

    /// Duplicate the current process, returning the child's
    /// pid to the parent and 0 to the child.
    Fork = 5,

    /// Open the file at the given path, returning a file
    /// descriptor.
    Open = 6,

    /// Read from a file descriptor.
    Read = 7,

    /// Write to a file descriptor.
    Write = 8,

    /// Close a file descriptor.
    Close = 9,
    // Ensure new values are added to check_numerical_conversion below.
}

impl Syscall {
    /// Returns the syscall with the given numerical value
    /// or None.
    ///
    pub fn from_u32(num: u32) -> Option<Self> {
        match num {
            0 => Some(Self::Print),
            1 => Some(Self::Exit),
            2 => Some(Self::PosCursor),
            3 => Some(Self::ClearScreen),
            4 => Some(Self::Execve),
            5 => Some(Self::Fork),
            6 => Some(Self::Open),
            7 => Some(Self::Read),
            8 => Some(Self::Write),
            9 => Some(Self::Close),
            _ => None,
        }
    }

    /// Returns the symbol a user program imports to call this
    /// syscall through its stub.
    ///
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Exit => "exit",
            Self::PosCursor => "pos_cursor",
            Self::ClearScreen => "clear_screen",
            Self::Execve => "execve",
            Self::Fork => "fork",
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
        }
    }

    /// Returns the syscall imported under the given symbol,
    /// or None.
    ///
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "print" => Some(Self::Print),
            "exit" => Some(Self::Exit),
            "pos_cursor" => Some(Self::PosCursor),
            "clear_screen" => Some(Self::ClearScreen),
            "execve" => Some(Self::Execve),
            "fork" => Some(Self::Fork),
            "open" => Some(Self::Open),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

/// The set of all syscalls, in numerical order.
///
pub const ALL_SYSCALLS: [Syscall; 10] = [
    Syscall::Print,
    Syscall::Exit,
    Syscall::PosCursor,
    Syscall::ClearScreen,
    Syscall::Execve,
    Syscall::Fork,
    Syscall::Open,
    Syscall::Read,
    Syscall::Write,
    Syscall::Close,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_numerical_conversion() {
        for syscall in ALL_SYSCALLS.iter().copied() {
            assert_eq!(Some(syscall), Syscall::from_u32(syscall as u32));
        }

        assert_eq!(Syscall::from_u32(10), None);
        assert_eq!(Syscall::from_u32(u32::MAX), None);
    }

    #[test]
    fn check_symbol_conversion() {
        for syscall in ALL_SYSCALLS.iter().copied() {
            assert_eq!(Some(syscall), Syscall::from_symbol(syscall.symbol()));
        }

        assert_eq!(Syscall::from_symbol("reboot"), None);
    }
}
