// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Packs host files into a RAM-disk image for the kernel to use as
//! its initial filesystem.
//!
//! Arguments come in pairs: the path of a file on the host, then
//! the name it is stored under in the image. Stored names must not
//! contain path separators, as the RAM-disk root is flat.

use ramdisk::Builder;
use std::env;
use std::fs;
use std::process;

/// The image file produced by the writer and consumed by the
/// reader.
///
const OUTPUT_FILE: &str = "initrd.img";

fn print_usage(program_name: &str) {
    eprintln!("usage:");
    eprintln!(
        "{} input_file_1 stored_name_1 input_file_2 stored_name_2 ...",
        program_name
    );
    eprintln!("example: {} ./my_file my_file ./my_other_file my_other_file", program_name);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() == 1 || args.len() % 2 == 0 {
        print_usage(&args[0]);
        process::exit(1);
    }

    let mut builder = Builder::new();
    for pair in args[1..].chunks(2) {
        let input = &pair[0];
        let stored_name = &pair[1];

        let contents = match fs::read(input) {
            Ok(contents) => contents,
            Err(err) => {
                eprintln!("error opening file {}: {}", input, err);
                process::exit(1);
            }
        };

        if let Err(err) = builder.add_file(stored_name, &contents) {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = fs::write(OUTPUT_FILE, builder.build()) {
        eprintln!("error writing output file {}: {}", OUTPUT_FILE, err);
        process::exit(1);
    }
}
