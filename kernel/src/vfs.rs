// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The filesystem root.
//!
//! The kernel's filesystem is a flat root: the files from the
//! initial RAM disk plus the device nodes. This module only
//! keeps the registry and resolves names; everything behind a
//! name speaks the [`FileNode`] interface.

use crate::Locked;
use alloc::sync::Arc;
use alloc::vec::Vec;
use filesystem::{FileNode, SEPARATOR};

/// ROOT holds every registered node.
///
static ROOT: Locked<Vec<Arc<dyn FileNode>>> = Locked::new(Vec::new());

/// Adds a node to the root.
///
pub fn register(node: Arc<dyn FileNode>) {
    ROOT.lock().push(node);
}

/// Resolves a path to its node, or None.
///
/// The root is flat, so a path is just a name, with any leading
/// separator ignored.
///
pub fn lookup(path: &str) -> Option<Arc<dyn FileNode>> {
    let name = path.trim_start_matches(SEPARATOR);

    ROOT.lock()
        .iter()
        .find(|node| node.info().name == name)
        .cloned()
}
