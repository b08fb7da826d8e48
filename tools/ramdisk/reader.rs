// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Dumps the contents of a RAM-disk image.
//!
//! With no arguments, lists the stored files and their sizes.
//! With the single argument `true`, also prints each file's
//! contents.

use ramdisk::Disk;
use std::env;
use std::fs;
use std::process;

/// The image file produced by the writer and consumed by the
/// reader.
///
const INPUT_FILE: &str = "initrd.img";

fn main() {
    let args: Vec<String> = env::args().collect();
    let print_file_contents = args.len() == 2 && args[1] == "true";

    let bytes = match fs::read(INPUT_FILE) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error opening image file {}: {}", INPUT_FILE, err);
            process::exit(1);
        }
    };

    let disk = match Disk::parse(&bytes) {
        Ok(disk) => disk,
        Err(err) => {
            eprintln!("error parsing image file {}: {}", INPUT_FILE, err);
            process::exit(1);
        }
    };

    for (i, entry) in disk.entries().iter().enumerate() {
        println!("\tFile {}: {} (size: {})", i + 1, entry.name, entry.data.len());
        if print_file_contents {
            println!("{}", String::from_utf8_lossy(entry.data));
        }
    }
}
