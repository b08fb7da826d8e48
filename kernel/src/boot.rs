// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's entry stub.
//!
//! The boot sector loads the kernel image at its link address and
//! jumps to `_start` in protected mode with paging disabled.
//! `_start` only establishes the kernel stack, which descends from
//! the 3 GiB boundary, and calls [`kmain`](crate::main). The stack
//! pages are identity mapped during memory bring-up, so the stack
//! stays valid when paging is enabled.

use core::arch::global_asm;

global_asm!(
    r#"
.section .boot, "ax"
.code32
.global _start
_start:
    cli
    cld
    mov esp, 0xc0000000
    xor ebp, ebp
    call kmain
1:
    hlt
    jmp 1b
"#
);
