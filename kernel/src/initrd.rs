// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Exposes the initial RAM disk's files through the filesystem.
//!
//! The RAM-disk image is embedded into the kernel binary by
//! objcopy at build time, between the `_binary_initrd_img_start`
//! and `_binary_initrd_img_end` symbols (the linker script
//! provides empty fallbacks, so a kernel built without an image
//! simply has no files). Each stored file becomes a read-only
//! node in the filesystem root.

use crate::vfs;
use alloc::string::String;
use alloc::sync::Arc;
use filesystem::{Error, FileInfo, FileNode, FileType, Permissions};
use ramdisk::Disk;

// The embedded RAM-disk image's bounds, provided by the linker.
//
extern "C" {
    static _binary_initrd_img_start: u8;
    static _binary_initrd_img_end: u8;
}

/// One file stored in the RAM disk.
///
/// The data is a view into the embedded image, so reads copy
/// straight out of the kernel binary.
///
struct InitrdFile {
    name: &'static str,
    data: &'static [u8],
}

impl FileNode for InitrdFile {
    fn info(&self) -> FileInfo {
        FileInfo {
            name: String::from(self.name),
            file_type: FileType::RegularFile,
            permissions: Permissions::READ | Permissions::EXECUTE,
            size: self.data.len(),
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.data.len() {
            return Ok(0);
        }

        let available = self.data.len() - offset;
        let count = core::cmp::min(buf.len(), available);
        buf[..count].copy_from_slice(&self.data[offset..offset + count]);

        Ok(count)
    }

    fn write(&self, _offset: usize, _buf: &[u8]) -> Result<usize, Error> {
        Err(Error::NotSupported)
    }
}

/// Parses the embedded RAM disk and registers its files.
///
/// # Panics
///
/// Panics if an image is present but malformed.
///
pub fn init() {
    let (start, end) = unsafe {
        (
            &_binary_initrd_img_start as *const u8 as usize,
            &_binary_initrd_img_end as *const u8 as usize,
        )
    };

    if start == end {
        crate::println!("no initial RAM disk embedded.");
        return;
    }

    let data = unsafe { core::slice::from_raw_parts(start as *const u8, end - start) };
    let disk = match Disk::parse(data) {
        Ok(disk) => disk,
        Err(err) => panic!("bad initial RAM disk: {}", err),
    };

    for entry in disk.entries() {
        vfs::register(Arc::new(InitrdFile {
            name: entry.name,
            data: entry.data,
        }));
    }

    crate::println!("initial RAM disk: {} files.", disk.len());
}
