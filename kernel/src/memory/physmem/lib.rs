// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a bitmap frame allocator, which can be used to allocate
//! and deallocate physical memory frames.
//!
//! One bit tracks each 4 KiB frame of physical memory: set means
//! in use, clear means free. All callers run with interrupts
//! disabled inside the memory manager, so the allocator needs no
//! concurrency guard of its own.

#![no_std]

use bitmap_index::Bitmap;
use memlayout::PhysFrame;

/// FrameAllocator describes a type that can allocate physical
/// memory frames.
///
pub trait FrameAllocator {
    /// Returns the next available physical frame, or `None`.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// FrameDeallocator describes a type that can return physical
/// memory frames for later re-use.
///
pub trait FrameDeallocator {
    /// Marks the given physical memory frame as unused and
    /// returns it to the set of free frames for later use.
    ///
    fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// A physical memory allocator, tracking every frame of
/// physical memory with one bit each.
///
/// The caller provides the word storage backing the bitmap, so
/// the allocator can be built before any heap exists.
///
pub struct FrameBitmap<'bits> {
    // num_frames is the number of 4 kiB frames tracked.
    //
    num_frames: usize,

    // free_frames is the number of tracked frames that have
    // not been allocated. There is no guarantee that the free
    // frames will be consecutive.
    //
    free_frames: usize,

    // bitmap tracks each frame, with set meaning the frame is
    // in use.
    //
    bitmap: Bitmap<'bits>,
}

impl<'bits> FrameBitmap<'bits> {
    /// Returns a new allocator tracking `num_frames` frames,
    /// all initially free.
    ///
    pub fn new(words: &'bits mut [u32], num_frames: usize) -> Self {
        FrameBitmap {
            num_frames,
            free_frames: num_frames,
            bitmap: Bitmap::new_unset(words, num_frames),
        }
    }

    /// Returns the number of frames tracked.
    ///
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Returns the number of tracked frames that are free.
    ///
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Returns whether the given frame is marked as in use.
    ///
    /// # Panics
    ///
    /// `is_used` will panic if the frame is not tracked.
    ///
    pub fn is_used(&self, frame: PhysFrame) -> bool {
        self.bitmap.get(frame.index() as usize)
    }

    /// Marks the given frame as in use.
    ///
    /// # Panics
    ///
    /// `mark_used` will panic if the frame is not tracked, or
    /// if the frame is already marked as in use.
    ///
    pub fn mark_used(&mut self, frame: PhysFrame) {
        if self.bitmap.get(frame.index() as usize) {
            panic!(
                "cannot mark frame at {}: frame already marked allocated",
                frame.start_address()
            );
        }

        self.bitmap.set(frame.index() as usize);
        self.free_frames -= 1;
    }

    /// Marks the given frame as free for use.
    ///
    /// # Panics
    ///
    /// `mark_free` will panic if the frame is not tracked, or
    /// if the frame is already free.
    ///
    pub fn mark_free(&mut self, frame: PhysFrame) {
        if !self.bitmap.get(frame.index() as usize) {
            panic!(
                "cannot deallocate frame at {}: frame already free",
                frame.start_address()
            );
        }

        self.bitmap.unset(frame.index() as usize);
        self.free_frames += 1;
    }

    /// Returns the first free frame without allocating it, or
    /// `None` if every tracked frame is in use.
    ///
    pub fn first_free(&self) -> Option<PhysFrame> {
        match self.bitmap.next_unset() {
            None => None,
            Some(index) => Some(PhysFrame::from_index(index as u32)),
        }
    }
}

impl<'bits> FrameAllocator for FrameBitmap<'bits> {
    /// Returns the next available physical frame, or `None`.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        match self.first_free() {
            None => None,
            Some(frame) => {
                self.mark_used(frame);
                Some(frame)
            }
        }
    }
}

impl<'bits> FrameDeallocator for FrameBitmap<'bits> {
    /// Marks the given physical memory frame as unused and
    /// returns it to the set of free frames for later use.
    ///
    fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.mark_free(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlayout::PhysAddr;

    // Helper function to speed up making frames.
    fn frame_for(addr: u32) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(addr))
    }

    #[test]
    fn bitmap_frame_allocator() {
        let mut words = [0u32; 1];
        let mut alloc = FrameBitmap::new(&mut words, 6);
        assert_eq!(alloc.num_frames(), 6);
        assert_eq!(alloc.free_frames(), 6);

        // Do some allocations.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x0000)));
        assert_eq!(alloc.free_frames(), 5);
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x1000)));
        assert_eq!(alloc.free_frames(), 4);

        // Do a free.
        alloc.deallocate_frame(frame_for(0x0000));
        assert_eq!(alloc.free_frames(), 5);

        // Next allocation should return the address we just freed.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x0000)));
        assert_eq!(alloc.free_frames(), 4);

        // Check that all remaining allocations are as we expect.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x2000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x3000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x4000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x5000)));
        assert_eq!(alloc.free_frames(), 0);

        // Check that we get nothing once we run out of frames.
        assert_eq!(alloc.allocate_frame(), None);
        assert_eq!(alloc.free_frames(), 0);
    }

    #[test]
    fn bitmap_frame_reservations() {
        let mut words = [0u32; 2];
        let mut alloc = FrameBitmap::new(&mut words, 40);

        // Reserve a frame in the middle, as the bring-up code
        // does for the kernel image.
        alloc.mark_used(frame_for(0x2000));
        assert!(alloc.is_used(frame_for(0x2000)));
        assert_eq!(alloc.free_frames(), 39);

        // Allocations skip the reserved frame.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x0000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x1000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x3000)));
    }

    #[test]
    #[should_panic]
    fn bitmap_frame_double_free() {
        let mut words = [0u32; 1];
        let mut alloc = FrameBitmap::new(&mut words, 6);
        let frame = alloc.allocate_frame().unwrap();
        alloc.deallocate_frame(frame);
        alloc.deallocate_frame(frame);
    }

    #[test]
    #[should_panic]
    fn bitmap_frame_double_use() {
        let mut words = [0u32; 1];
        let mut alloc = FrameBitmap::new(&mut words, 6);
        alloc.mark_used(frame_for(0x1000));
        alloc.mark_used(frame_for(0x1000));
    }
}
