// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the logical design for Lantern's virtual filesystem.
//!
//! This crate does not implement a specific filesystem. Instead, it
//! provides the node interface through which the rest of the kernel
//! reads and writes files, and the types used to describe them. The
//! initial RAM disk and the keyboard device implement [`FileNode`];
//! the syscall layer consumes it through each process's
//! file-descriptor table.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::string::String;
use bitflags::bitflags;

/// The separator used in file paths.
///
/// The RAM-disk root is flat, so a well-formed path never
/// actually contains a separator; stored names containing one
/// are rejected when the disk is packed.
///
pub const SEPARATOR: char = '/';

bitflags! {
    /// Describes the actions that can be taken on a file.
    ///
    pub struct Permissions: u8 {
        /// No actions can be performed on a file with
        /// no permission bits set.
        ///
        const NONE = 0;

        /// A file with this bit set can be executed
        /// to start a new process.
        ///
        const EXECUTE = 1 << 0;

        /// A file with this bit set can be modified.
        ///
        const WRITE = 1 << 1;

        /// A file with this bit set can be read.
        ///
        const READ = 1 << 2;
    }
}

/// Describes a file's type.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FileType {
    /// A regular file.
    RegularFile = 1,

    /// A device, such as the keyboard.
    Device = 2,
}

/// Describes a file or device.
///
#[derive(Debug)]
pub struct FileInfo {
    /// The file's name. The RAM-disk root is flat, so names
    /// never contain a separator.
    ///
    pub name: String,

    /// The file's type.
    ///
    pub file_type: FileType,

    /// The set of actions that can be performed on the file.
    ///
    pub permissions: Permissions,

    /// The file's size.
    ///
    /// A device will have size `0`.
    ///
    pub size: usize,
}

/// Describes an error encountered while acting on a file node.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Error {
    /// The node does not support the requested action, such
    /// as writing to a read-only file.
    NotSupported,

    /// The requested offset is beyond the end of the file.
    BadOffset,
}

/// The interface implemented by everything that can sit behind
/// a file descriptor.
///
/// A node's `read` may block the calling process until data
/// arrives, as the keyboard device does. Nodes are shared
/// between processes (a fork deep-copies the descriptor table,
/// not the nodes), so they take `&self` and manage their own
/// interior state.
///
pub trait FileNode: Send + Sync {
    /// Returns the description of this file.
    ///
    fn info(&self) -> FileInfo;

    /// Called when a process opens the file.
    ///
    fn open(&self) {}

    /// Called when a process closes the file.
    ///
    fn close(&self) {}

    /// Reads up to `buf.len()` bytes from the file, starting
    /// at `offset`, returning the number of bytes read.
    ///
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error>;

    /// Writes `buf` to the file, starting at `offset`,
    /// returning the number of bytes written.
    ///
    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions() {
        let all = Permissions::READ | Permissions::WRITE | Permissions::EXECUTE;
        assert!(all.contains(Permissions::READ));
        assert!(!Permissions::READ.contains(Permissions::WRITE));
        assert_eq!(Permissions::NONE.bits(), 0);
    }
}
