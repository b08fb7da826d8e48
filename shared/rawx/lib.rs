// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the RawX executable image format.
//!
//! A RawX image is a header, a table of section descriptors, and the
//! raw bytes of each section. All integers are little-endian, and
//! the header and descriptors are laid out exactly as the on-disk
//! format prescribes, including the two padding bytes after the
//! header's version field.
//!
//! Three section names are recognised: `.code`, `.data` and
//! `.import`. The import section starts with a symbol count,
//! followed by one entry per imported symbol giving the offsets of
//! its symbol and library names within the section, plus a
//! call-address column that is zero on disk and rewritten by the
//! kernel's loader once the matching syscall stub has been placed in
//! the new address space.
//!
//! This crate only reads and writes the format. Mapping an image
//! into an address space is the kernel loader's job.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::str;

/// The magic number at the start of every image.
///
pub const MAGIC: [u8; 4] = *b"RAWX";

/// The only recognised format version.
///
pub const VERSION: u16 = 0;

/// The architecture flag bit for x86.
///
pub const ARCH_X86: u32 = 0x1;

/// The lowest permitted load address. Everything below 1 GiB
/// is the kernel half of the address space.
///
pub const MIN_LOAD_ADDRESS: u32 = 1024 * 1024 * 1024;

/// The length of a NUL-padded section name.
///
pub const SECTION_NAME_LEN: usize = 8;

/// The encoded length of the image header, including the two
/// padding bytes after the version field.
///
pub const HEADER_LEN: usize = 28;

/// The encoded length of one section descriptor.
///
pub const SECTION_LEN: usize = 20;

/// The encoded length of one import table entry.
///
pub const IMPORT_ENTRY_LEN: usize = 12;

/// The name of the code section.
///
pub const SECTION_CODE: &str = ".code";

/// The name of the data section.
///
pub const SECTION_DATA: &str = ".data";

/// The name of the import section.
///
pub const SECTION_IMPORT: &str = ".import";

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// The fixed fields at the start of every image.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    /// The format version. Always [`VERSION`].
    pub version: u16,

    /// Architecture flags. Must include [`ARCH_X86`].
    pub flags: u32,

    /// The virtual address the image is loaded at.
    pub load_address: u32,

    /// The entry point's offset from `load_address`.
    pub entry_point_offset: u32,

    /// The requested user stack size in bytes. Must be
    /// page-aligned and non-zero if a stack is requested.
    pub stack_size: u32,

    /// The number of section descriptors that follow.
    pub section_count: u32,
}

/// The kind of a section, derived from its name.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SectionKind {
    Code,
    Data,
    Import,

    /// A section with an unrecognised name, which loaders
    /// skip.
    Unknown,
}

/// One section descriptor.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Section {
    /// The NUL-padded section name.
    pub name: [u8; SECTION_NAME_LEN],

    /// The section's size in bytes.
    pub size_bytes: u32,

    /// The section's offset from the image's load address.
    pub virtual_address: u32,

    /// The offset within the file of the section's bytes.
    pub file_ptr_to_data: u32,
}

impl Section {
    /// Returns the section's name, with NUL padding removed.
    ///
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SECTION_NAME_LEN);

        str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Returns the section's kind, derived from its name.
    ///
    pub fn kind(&self) -> SectionKind {
        match self.name_str() {
            SECTION_CODE => SectionKind::Code,
            SECTION_DATA => SectionKind::Data,
            SECTION_IMPORT => SectionKind::Import,
            _ => SectionKind::Unknown,
        }
    }
}

/// One entry in an import section's table.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Import {
    /// The offset from the start of the section of the
    /// imported symbol's NUL-terminated name.
    pub symbol_offset: u32,

    /// The offset from the start of the section of the
    /// providing library's NUL-terminated name.
    pub lib_offset: u32,

    /// The address user code calls to reach the import. Zero
    /// on disk; the loader writes the placed stub's address
    /// here.
    pub call_address: u32,

    /// The offset of this entry's call-address column within
    /// the section, so the loader can rewrite it in place.
    pub call_address_offset: u32,
}

/// A parsed view over an import section's bytes.
///
pub struct ImportTable<'data> {
    section: &'data [u8],
    count: usize,
}

impl<'data> ImportTable<'data> {
    /// Parses the import table at the start of the given
    /// section bytes.
    ///
    pub fn parse(section: &'data [u8]) -> Result<ImportTable<'data>, &'static str> {
        if section.len() < 4 {
            return Err("end of section within import symbol count");
        }

        let count = u32_at(section, 0) as usize;
        if section.len() < 4 + count * IMPORT_ENTRY_LEN {
            return Err("end of section within import table");
        }

        Ok(ImportTable { section, count })
    }

    /// Returns the number of imported symbols.
    ///
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns whether the table has no entries.
    ///
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the import table entry at the given index.
    ///
    pub fn entry(&self, index: usize) -> Result<Import, &'static str> {
        if index >= self.count {
            return Err("import entry index out of range");
        }

        let offset = 4 + index * IMPORT_ENTRY_LEN;
        Ok(Import {
            symbol_offset: u32_at(self.section, offset),
            lib_offset: u32_at(self.section, offset + 4),
            call_address: u32_at(self.section, offset + 8),
            call_address_offset: (offset + 8) as u32,
        })
    }

    /// Returns the NUL-terminated string at the given offset
    /// within the section.
    ///
    pub fn name_at(&self, offset: u32) -> Result<&'data str, &'static str> {
        let offset = offset as usize;
        if offset >= self.section.len() {
            return Err("import name offset beyond end of section");
        }

        let rest = &self.section[offset..];
        let end = match rest.iter().position(|&b| b == 0) {
            Some(end) => end,
            None => return Err("import name is not NUL-terminated"),
        };

        str::from_utf8(&rest[..end]).map_err(|_| "import name is not valid UTF-8")
    }
}

/// A parsed view over the bytes of a RawX image.
///
pub struct Image<'data> {
    /// The image's header.
    pub header: Header,

    sections: Vec<Section>,
    data: &'data [u8],
}

impl<'data> Image<'data> {
    /// Parses and validates the image in the given bytes.
    ///
    pub fn parse(data: &'data [u8]) -> Result<Image<'data>, &'static str> {
        if data.len() < HEADER_LEN {
            return Err("end of file within header");
        }

        if data[0..4] != MAGIC {
            return Err("expected RAWX magic");
        }

        let header = Header {
            version: u16_at(data, 4),
            flags: u32_at(data, 8),
            load_address: u32_at(data, 12),
            entry_point_offset: u32_at(data, 16),
            stack_size: u32_at(data, 20),
            section_count: u32_at(data, 24),
        };

        if header.version != VERSION {
            return Err("expected version 0");
        }
        if header.flags & ARCH_X86 == 0 {
            return Err("expected architecture x86");
        }

        if (data.len() - HEADER_LEN) / SECTION_LEN < header.section_count as usize {
            return Err("end of file within section table");
        }

        if header.load_address < MIN_LOAD_ADDRESS {
            return Err("load address must be at least 1 GiB");
        }

        let mut sections = Vec::with_capacity(header.section_count as usize);
        for i in 0..header.section_count as usize {
            let offset = HEADER_LEN + i * SECTION_LEN;
            let mut name = [0u8; SECTION_NAME_LEN];
            name.copy_from_slice(&data[offset..offset + SECTION_NAME_LEN]);
            sections.push(Section {
                name,
                size_bytes: u32_at(data, offset + 8),
                virtual_address: u32_at(data, offset + 12),
                file_ptr_to_data: u32_at(data, offset + 16),
            });
        }

        Ok(Image {
            header,
            sections,
            data,
        })
    }

    /// Returns the image's section descriptors.
    ///
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Returns the bytes of the given section.
    ///
    pub fn section_data(&self, section: &Section) -> Result<&'data [u8], &'static str> {
        let start = section.file_ptr_to_data as usize;
        let len = section.size_bytes as usize;
        if start >= self.data.len() || self.data.len() - start < len {
            return Err("end of file within section data");
        }

        Ok(&self.data[start..start + len])
    }

    /// Returns the virtual address of the image's entry point.
    ///
    pub fn entry_point(&self) -> u32 {
        self.header.load_address + self.header.entry_point_offset
    }
}

/// Builds RawX images, for tests and for tooling that packages
/// user programs.
///
pub struct Builder {
    load_address: u32,
    entry_point_offset: u32,
    stack_size: u32,
    sections: Vec<(Vec<u8>, u32, Vec<u8>)>,
}

impl Builder {
    /// Returns a builder for an image loaded at the given
    /// address.
    ///
    pub fn new(load_address: u32) -> Builder {
        Builder {
            load_address,
            entry_point_offset: 0,
            stack_size: 0,
            sections: Vec::new(),
        }
    }

    /// Sets the entry point's offset from the load address.
    ///
    pub fn entry_point_offset(&mut self, offset: u32) -> &mut Builder {
        self.entry_point_offset = offset;
        self
    }

    /// Sets the requested user stack size in bytes.
    ///
    pub fn stack_size(&mut self, size: u32) -> &mut Builder {
        self.stack_size = size;
        self
    }

    /// Adds a section with the given name, offset from the
    /// load address, and bytes.
    ///
    /// # Panics
    ///
    /// `section` will panic if the name does not fit in
    /// [`SECTION_NAME_LEN`] bytes.
    ///
    pub fn section(&mut self, name: &str, virtual_address: u32, data: &[u8]) -> &mut Builder {
        if name.len() > SECTION_NAME_LEN {
            panic!("section name {:?} is too long", name);
        }

        let mut padded = Vec::from(name.as_bytes());
        padded.resize(SECTION_NAME_LEN, 0);
        self.sections
            .push((padded, virtual_address, Vec::from(data)));
        self
    }

    /// Encodes the image.
    ///
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]); // Padding after the version field.
        out.extend_from_slice(&ARCH_X86.to_le_bytes());
        out.extend_from_slice(&self.load_address.to_le_bytes());
        out.extend_from_slice(&self.entry_point_offset.to_le_bytes());
        out.extend_from_slice(&self.stack_size.to_le_bytes());
        out.extend_from_slice(&(self.sections.len() as u32).to_le_bytes());

        // Section data follows the descriptor table.
        let mut file_ptr = (HEADER_LEN + self.sections.len() * SECTION_LEN) as u32;
        for (name, virtual_address, data) in self.sections.iter() {
            out.extend_from_slice(name);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&virtual_address.to_le_bytes());
            out.extend_from_slice(&file_ptr.to_le_bytes());
            file_ptr += data.len() as u32;
        }

        for (_name, _virtual_address, data) in self.sections.iter() {
            out.extend_from_slice(data);
        }

        out
    }
}

/// Builds the bytes of an import section: the table at the
/// start, with all call addresses zero, then the symbol and
/// library name strings.
///
pub fn build_import_section(imports: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(imports.len() as u32).to_le_bytes());

    // Name strings go after the table.
    let mut name_offset = (4 + imports.len() * IMPORT_ENTRY_LEN) as u32;
    let mut names = Vec::new();
    for (symbol, lib) in imports.iter() {
        out.extend_from_slice(&name_offset.to_le_bytes());
        name_offset += symbol.len() as u32 + 1;
        names.extend_from_slice(symbol.as_bytes());
        names.push(0);

        out.extend_from_slice(&name_offset.to_le_bytes());
        name_offset += lib.len() as u32 + 1;
        names.extend_from_slice(lib.as_bytes());
        names.push(0);

        out.extend_from_slice(&0u32.to_le_bytes()); // Call address, filled by the loader.
    }

    out.extend_from_slice(&names);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Vec<u8> {
        let imports = build_import_section(&[("print", "kernel"), ("exit", "kernel")]);
        Builder::new(0x4000_0000)
            .entry_point_offset(0x10)
            .stack_size(0x2000)
            .section(SECTION_CODE, 0, &[0x90, 0x90, 0xc3])
            .section(SECTION_DATA, 0x1000, b"hello")
            .section(SECTION_IMPORT, 0x2000, &imports)
            .build()
    }

    #[test]
    fn parse_built_image() {
        let bytes = sample_image();
        let image = Image::parse(&bytes).unwrap();

        assert_eq!(image.header.version, VERSION);
        assert_eq!(image.header.flags & ARCH_X86, ARCH_X86);
        assert_eq!(image.header.load_address, 0x4000_0000);
        assert_eq!(image.header.stack_size, 0x2000);
        assert_eq!(image.entry_point(), 0x4000_0010);
        assert_eq!(image.sections().len(), 3);

        let code = &image.sections()[0];
        assert_eq!(code.kind(), SectionKind::Code);
        assert_eq!(code.name_str(), SECTION_CODE);
        assert_eq!(image.section_data(code).unwrap(), &[0x90, 0x90, 0xc3]);

        let data = &image.sections()[1];
        assert_eq!(data.kind(), SectionKind::Data);
        assert_eq!(data.virtual_address, 0x1000);
        assert_eq!(image.section_data(data).unwrap(), b"hello");
    }

    #[test]
    fn parse_import_table() {
        let bytes = sample_image();
        let image = Image::parse(&bytes).unwrap();
        let section = image.sections()[2];
        assert_eq!(section.kind(), SectionKind::Import);

        let body = image.section_data(&section).unwrap();
        let table = ImportTable::parse(body).unwrap();
        assert_eq!(table.len(), 2);

        let first = table.entry(0).unwrap();
        assert_eq!(table.name_at(first.symbol_offset).unwrap(), "print");
        assert_eq!(table.name_at(first.lib_offset).unwrap(), "kernel");
        assert_eq!(first.call_address, 0);

        let second = table.entry(1).unwrap();
        assert_eq!(table.name_at(second.symbol_offset).unwrap(), "exit");
        assert_eq!(table.name_at(second.lib_offset).unwrap(), "kernel");

        assert!(table.entry(2).is_err());
    }

    #[test]
    fn header_layout_is_fixed() {
        // The encoded header must match the on-disk layout,
        // including the padding after the version field.
        let bytes = sample_image();
        assert_eq!(&bytes[0..4], b"RAWX");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), VERSION);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(
            u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            0x4000_0000
        );

        // The first section descriptor starts right after the
        // header, and its data pointer lands after the table.
        let image = Image::parse(&bytes).unwrap();
        assert_eq!(
            image.sections()[0].file_ptr_to_data as usize,
            HEADER_LEN + 3 * SECTION_LEN
        );
    }

    #[test]
    fn rejects_bad_images() {
        let bytes = sample_image();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert_eq!(Image::parse(&bad_magic).err(), Some("expected RAWX magic"));

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert_eq!(Image::parse(&bad_version).err(), Some("expected version 0"));

        let mut bad_arch = bytes.clone();
        bad_arch[8] = 0;
        assert_eq!(
            Image::parse(&bad_arch).err(),
            Some("expected architecture x86")
        );

        // A load address below 1 GiB points into the kernel
        // half.
        let low = Builder::new(0x1000_0000).build();
        assert_eq!(
            Image::parse(&low).err(),
            Some("load address must be at least 1 GiB")
        );

        let truncated = &bytes[..HEADER_LEN + SECTION_LEN];
        assert_eq!(
            Image::parse(truncated).err(),
            Some("end of file within section table")
        );

        assert_eq!(
            Image::parse(&bytes[..10]).err(),
            Some("end of file within header")
        );
    }
}
