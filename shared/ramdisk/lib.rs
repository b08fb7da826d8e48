// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the RAM-disk image format.
//!
//! A RAM-disk image is the kernel's initial filesystem, packed on
//! the host by `tools/ramdisk` and read back by the kernel's initrd
//! driver. The layout is bit-exact:
//!
//! - 4 bytes, little-endian: the number of stored files.
//! - One record per file: a 256-byte NUL-padded file name, then the
//!   file's size as a 4-byte little-endian integer.
//! - The files' contents, concatenated in record order with no
//!   padding.
//!
//! The root is flat: stored names must not contain slashes or
//! backslashes.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::str;

/// The fixed size of a stored file name, including its NUL
/// padding.
///
pub const FILE_NAME_MAX: usize = 256;

/// The encoded size of one file record.
///
pub const RECORD_LEN: usize = FILE_NAME_MAX + 4;

/// Returns whether the given name may be stored in a RAM disk.
///
/// The root is flat, so slashes and backslashes are forbidden,
/// and the name must fit its fixed-size field with at least one
/// byte of NUL padding.
///
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < FILE_NAME_MAX
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// One file stored in a RAM disk.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileEntry<'data> {
    /// The file's name.
    pub name: &'data str,

    /// The file's contents.
    pub data: &'data [u8],
}

/// A parsed view over the bytes of a RAM-disk image.
///
pub struct Disk<'data> {
    entries: Vec<FileEntry<'data>>,
}

impl<'data> Disk<'data> {
    /// Parses the RAM-disk image in the given bytes.
    ///
    pub fn parse(data: &'data [u8]) -> Result<Disk<'data>, &'static str> {
        if data.len() < 4 {
            return Err("end of image within file count");
        }

        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if (data.len() - 4) / RECORD_LEN < count {
            return Err("end of image within file records");
        }

        let mut entries = Vec::with_capacity(count);
        let mut content_offset = 4 + count * RECORD_LEN;
        for i in 0..count {
            let record = &data[4 + i * RECORD_LEN..4 + (i + 1) * RECORD_LEN];
            let name_end = match record[..FILE_NAME_MAX].iter().position(|&b| b == 0) {
                Some(end) => end,
                None => return Err("stored file name is not NUL-terminated"),
            };

            let name = str::from_utf8(&record[..name_end])
                .map_err(|_| "stored file name is not valid UTF-8")?;

            let size = u32::from_le_bytes([
                record[FILE_NAME_MAX],
                record[FILE_NAME_MAX + 1],
                record[FILE_NAME_MAX + 2],
                record[FILE_NAME_MAX + 3],
            ]) as usize;

            if content_offset > data.len() || data.len() - content_offset < size {
                return Err("end of image within file contents");
            }

            entries.push(FileEntry {
                name,
                data: &data[content_offset..content_offset + size],
            });
            content_offset += size;
        }

        Ok(Disk { entries })
    }

    /// Returns the number of stored files.
    ///
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the disk stores no files.
    ///
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the stored files, in record order.
    ///
    pub fn entries(&self) -> &[FileEntry<'data>] {
        &self.entries
    }

    /// Returns the stored file with the given name, or None.
    ///
    pub fn lookup(&self, name: &str) -> Option<FileEntry<'data>> {
        self.entries.iter().find(|e| e.name == name).copied()
    }
}

/// Packs files into a RAM-disk image.
///
pub struct Builder {
    files: Vec<(String, Vec<u8>)>,
}

impl Builder {
    /// Returns an empty builder.
    ///
    pub fn new() -> Builder {
        Builder { files: Vec::new() }
    }

    /// Adds a file to the image.
    ///
    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<&mut Builder, &'static str> {
        if !valid_name(name) {
            return Err("all files must be in the root folder (slashes are not allowed in the name)");
        }

        self.files.push((String::from(name), Vec::from(data)));
        Ok(self)
    }

    /// Encodes the image.
    ///
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.files.len() as u32).to_le_bytes());

        for (name, data) in self.files.iter() {
            let mut record = [0u8; FILE_NAME_MAX];
            record[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&record);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }

        for (_name, data) in self.files.iter() {
            out.extend_from_slice(data);
        }

        out
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_parse() {
        let mut builder = Builder::new();
        builder.add_file("a", b"foo").unwrap();
        builder.add_file("b", b"bar").unwrap();
        let bytes = builder.build();

        // Check the fixed layout: count, two records, then the
        // concatenated contents with no padding.
        assert_eq!(bytes.len(), 4 + 2 * RECORD_LEN + 6);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(bytes[4], b'a');
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[4 + 2 * RECORD_LEN..], b"foobar");

        let disk = Disk::parse(&bytes).unwrap();
        assert_eq!(disk.len(), 2);
        assert_eq!(disk.entries()[0].name, "a");
        assert_eq!(disk.entries()[0].data, b"foo");
        assert_eq!(disk.entries()[1].name, "b");
        assert_eq!(disk.entries()[1].data, b"bar");

        assert_eq!(disk.lookup("b").unwrap().data, b"bar");
        assert_eq!(disk.lookup("c"), None);
    }

    #[test]
    fn empty_disk() {
        let bytes = Builder::new().build();
        let disk = Disk::parse(&bytes).unwrap();
        assert!(disk.is_empty());
    }

    #[test]
    fn rejects_nested_names() {
        let mut builder = Builder::new();
        assert!(builder.add_file("dir/file", b"x").is_err());
        assert!(builder.add_file("dir\\file", b"x").is_err());
        assert!(builder.add_file("", b"x").is_err());

        let long = "n".repeat(FILE_NAME_MAX);
        assert!(builder.add_file(&long, b"x").is_err());
        assert!(builder.add_file(&long[..FILE_NAME_MAX - 1], b"x").is_ok());
    }

    #[test]
    fn rejects_truncated_images() {
        let mut builder = Builder::new();
        builder.add_file("a", b"foo").unwrap();
        let bytes = builder.build();

        assert_eq!(Disk::parse(&bytes[..2]).err(), Some("end of image within file count"));
        assert_eq!(
            Disk::parse(&bytes[..100]).err(),
            Some("end of image within file records")
        );
        assert_eq!(
            Disk::parse(&bytes[..bytes.len() - 1]).err(),
            Some("end of image within file contents")
        );
    }
}
