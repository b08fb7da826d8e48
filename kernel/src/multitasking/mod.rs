// Copyright 2022 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements processes and the round-robin scheduler.
//!
//! Processes live in slots of a fixed table and form a circular,
//! doubly-linked ring through `prev` and `next` slot indices, so
//! election walks the ring and removal is O(1). `active` names the
//! running process; only `ready` processes are electable, and
//! `blocked` processes are skipped until something unblocks them.
//!
//! A context switch is cooperative within the kernel: the timer
//! interrupt and explicit blocking calls both funnel into
//! [`switch`], which saves the outgoing register state into the
//! process's [`Context`] and hands the CPU to the elected process
//! through the trampoline in `switch.s`. When nothing is ready,
//! the kernel parks in an idle loop on its own boot stack with
//! interrupts enabled, waiting for an interrupt to make a process
//! ready again.
//!
//! Every entry point here runs with interrupts disabled: either
//! the caller is an interrupt handler, or the function disables
//! them itself before touching the process table.

pub mod loader;

use crate::memory::{self, TrampolineCopier};
use crate::{cpu, gdt, vfs};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::global_asm;
use filesystem::FileNode;
use lantern_syscalls::KILLED_BY_KERNEL;
use memlayout::{SYSCALL_STACK_PAGES, SYSCALL_STACK_TOP, KERNEL_STACK_TOP};
use memlayout::VirtPage;
use spin::{Mutex, Once};
use virtmem::{AddressSpace, FrameCopier};

global_asm!(include_str!("switch.s"));

// The trampolines are implemented in switch.s.
//
extern "C" {
    /// Saves the calling context into `prev` and resumes
    /// `next`. Returns when something switches back to `prev`.
    ///
    fn switch_context(prev: *mut Context, next: *const Context);

    /// Resumes `next`, abandoning the calling context.
    ///
    fn load_context(next: *const Context) -> !;

    /// Captures the calling context into `child`, returning 0.
    /// Returns a second time, with 1, when the child context is
    /// first scheduled.
    ///
    fn fork_capture(child: *mut Context) -> u32;

    /// Drops to ring 3 at the given stack and entry point,
    /// re-enabling interrupts as part of the jump.
    ///
    fn enter_user_mode(esp: u32, entry: u32) -> !;
}

/// Uniquely identifies a process for its whole life.
///
pub type Pid = u32;

/// A process's saved execution state: enough to resume it from
/// exactly where it left off, in its own address space.
///
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Context {
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub cr3: u32,
}

/// Describes the scheduling state of a process.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
    /// The process is executing. Only the process `active`
    /// points at is ever Running.
    Running,

    /// The process is ready to execute.
    Ready,

    /// The process is waiting for an event (a keyboard byte)
    /// and is skipped by election.
    Blocked,
}

/// One process: its identity, saved context, address space, and
/// open files, plus its ring links.
///
pub struct Process {
    pid: Pid,
    state: State,
    context: Context,
    space: AddressSpace,
    files: BTreeMap<u32, Arc<dyn FileNode>>,
    next_fd: u32,
    prev: usize,
    next: usize,
}

/// The process table: slot storage plus the scheduling ring.
///
struct ProcessTable {
    slots: Vec<Option<Process>>,
    active: Option<usize>,

    // Where election starts when no process is active. Kept
    // pointing at a live ring member whenever count > 0.
    cursor: usize,

    next_pid: Pid,
    count: usize,
}

impl ProcessTable {
    fn new() -> ProcessTable {
        ProcessTable {
            slots: Vec::new(),
            active: None,
            cursor: 0,
            next_pid: 1,
            count: 0,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn get(&self, idx: usize) -> &Process {
        self.slots[idx].as_ref().expect("empty process slot")
    }

    fn get_mut(&mut self, idx: usize) -> &mut Process {
        self.slots[idx].as_mut().expect("empty process slot")
    }

    fn find_pid(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(p) if p.pid == pid))
    }

    // Inserts the process into a free slot and links it into
    // the ring after the active process (or the cursor, when
    // nothing is active).
    //
    fn insert(&mut self, mut process: Process) -> usize {
        let idx = match self.slots.iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        if self.count == 0 {
            process.prev = idx;
            process.next = idx;
            self.cursor = idx;
            self.slots[idx] = Some(process);
        } else {
            let anchor = self.active.unwrap_or(self.cursor);
            let after = self.get(anchor).next;
            process.prev = anchor;
            process.next = after;
            self.slots[idx] = Some(process);
            self.get_mut(anchor).next = idx;
            self.get_mut(after).prev = idx;
        }

        self.count += 1;
        idx
    }

    // Unlinks the process from the ring and vacates its slot.
    //
    fn remove(&mut self, idx: usize) -> Process {
        let process = self.slots[idx].take().expect("empty process slot");
        self.count -= 1;

        if self.count > 0 {
            self.get_mut(process.prev).next = process.next;
            self.get_mut(process.next).prev = process.prev;
            if self.cursor == idx {
                self.cursor = process.next;
            }
        } else {
            self.cursor = 0;
        }

        if self.active == Some(idx) {
            self.active = None;
        }

        process
    }

    // Walks the ring once, starting after `from`, and returns
    // the first ready process.
    //
    fn next_ready(&self, from: usize) -> Option<usize> {
        let mut idx = self.get(from).next;
        loop {
            if self.get(idx).state == State::Ready {
                return Some(idx);
            }
            if idx == from {
                return None;
            }

            idx = self.get(idx).next;
        }
    }

    // Returns any ready process, walking the ring from the
    // cursor. Used when nothing is active.
    //
    fn elect_any_ready(&self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }

        let start = if self.slots[self.cursor].is_some() {
            self.cursor
        } else {
            self.slots
                .iter()
                .position(|slot| slot.is_some())
                .expect("process count out of sync")
        };

        let mut idx = start;
        loop {
            if self.get(idx).state == State::Ready {
                return Some(idx);
            }

            idx = self.get(idx).next;
            if idx == start {
                return None;
            }
        }
    }
}

static PROCESSES: Once<Mutex<ProcessTable>> = Once::new();

fn table() -> &'static Mutex<ProcessTable> {
    PROCESSES.call_once(|| Mutex::new(ProcessTable::new()))
}

// A context or process stashed while control moves onto the
// kernel's own stack. Single CPU, interrupts disabled: no
// concurrent access is possible.
static mut JUMP_CONTEXT: Context = Context {
    eip: 0,
    esp: 0,
    ebp: 0,
    cr3: 0,
};
static mut PENDING_REAP: Option<Process> = None;

/// Returns the pid of the running process.
///
/// # Panics
///
/// Panics if no process is active.
///
pub fn current_pid() -> Pid {
    let table = table().lock();
    let idx = table.active.expect("no active process");
    table.get(idx).pid
}

/// Loads the named program as the first user process and jumps
/// into it. Does not return.
///
/// The new address space is cloned from the kernel's: the
/// kernel half is aliased and the kernel's boot stack (which
/// lives in the user half, descending from 3 GiB) is copied by
/// value. The copied stack doubles as the process's syscall
/// kernel stack, so the loader is not asked to create one.
///
pub fn start_init_process(path: &str) -> ! {
    cpu::disable_interrupts();

    let node = vfs::lookup(path)
        .unwrap_or_else(|| panic!("unable to find the init program {:?}", path));
    let size = node.info().size;
    let mut image = Vec::new();
    image.resize(size, 0);
    let read = node.read(0, &mut image).expect("reading the init program failed");
    if read != size {
        panic!("short read loading the init program");
    }

    let space = {
        let kernel = memory::kernel_space().lock();
        let mut frames = memory::frames().lock();
        let mut tables = memory::tables().lock();
        let mut copier = TrampolineCopier;
        unsafe { kernel.clone_from(&mut *frames, &mut *tables, &mut copier) }
    };
    let cr3 = space.hardware_tables_physical();

    // The clone snapshotted this stack. Anything written to the
    // stack after the clone is absent from the copy the process
    // will run on, so everything the post-switch code needs is
    // parked in shared kernel memory first: the process (and
    // its address space) in the table, the image bytes in a
    // static.
    {
        let mut table = table().lock();
        let pid = table.alloc_pid();
        let idx = table.insert(Process {
            pid,
            state: State::Running,
            context: Context {
                eip: 0,
                esp: 0,
                ebp: 0,
                cr3,
            },
            space,
            files: BTreeMap::new(),
            next_fd: 0,
            prev: 0,
            next: 0,
        });
        table.active = Some(idx);
    }

    unsafe {
        PENDING_INIT_IMAGE = Some(image);

        // The trampoline re-reads its return address, so the
        // switch survives the stack contents changing
        // underneath it. From here on, only pre-clone locals
        // and shared kernel memory are read.
        memory::switch_address_space(cr3);
    }

    finish_init_process()
}

static mut PENDING_INIT_IMAGE: Option<Vec<u8>> = None;

// The second half of init-process creation, entered on the
// cloned stack with the new address space live. Re-derives its
// state from the process table and the parked image.
//
fn finish_init_process() -> ! {
    let image = unsafe { PENDING_INIT_IMAGE.take() }.expect("no parked init image");

    let (pid, space) = {
        let mut table = table().lock();
        let idx = table.active.expect("init process not in the table");
        let process = table.get_mut(idx);
        (process.pid, &mut process.space as *mut AddressSpace)
    };

    // The table lock is dropped, but interrupts are disabled
    // and nothing below re-enters the process table, so the
    // address space pointer stays valid.
    let load = loader::load(&image, unsafe { &mut *space }, true, false)
        .unwrap_or_else(|err| panic!("bad init program image: {}", err));
    drop(image);

    // Syscalls and interrupts from ring 3 run on the process's
    // syscall kernel stack. Its top is the same virtual address
    // in every process, so this is set once.
    gdt::set_kernel_stack(SYSCALL_STACK_TOP.as_u32());

    let stack = load.user_stack_top.expect("init program requested no stack");
    crate::println!("starting init as pid {}", pid);
    unsafe { enter_user_mode(stack, load.entry_point) }
}

/// Duplicates the calling process.
///
/// Returns the child's pid in the parent, and 0 in the child
/// once the child is first scheduled. The child gets a
/// by-value copy of the parent's user half (including the
/// syscall kernel stack the parent is executing on) and a deep
/// copy of its file-descriptor table.
///
pub fn fork() -> u32 {
    let parent_idx;
    let child_idx;
    let child_pid;
    let child_context: *mut Context;
    {
        let mut table = table().lock();
        parent_idx = table.active.expect("fork with no active process");

        // Clone the address space first, releasing the memory
        // locks before the table grows (growing may allocate).
        let space = {
            let parent = table.get(parent_idx);
            let mut frames = memory::frames().lock();
            let mut tables = memory::tables().lock();
            let mut copier = TrampolineCopier;
            unsafe { parent.space.clone_from(&mut *frames, &mut *tables, &mut copier) }
        };

        child_pid = table.alloc_pid();
        let cr3 = space.hardware_tables_physical();
        let files = table.get(parent_idx).files.clone();
        let next_fd = table.get(parent_idx).next_fd;
        child_idx = table.insert(Process {
            pid: child_pid,
            state: State::Ready,
            context: Context {
                eip: 0,
                esp: 0,
                ebp: 0,
                cr3,
            },
            space,
            files,
            next_fd,
            prev: 0,
            next: 0,
        });

        child_context = &mut table.get_mut(child_idx).context;
    }

    // This runs twice: the parent falls through with 0 now,
    // and the child returns 1 from here when first scheduled.
    let is_child = unsafe { fork_capture(child_context) };
    if is_child != 0 {
        return 0;
    }

    // Parent: refresh the child's copy of the syscall kernel
    // stack so the child resumes with the stack exactly as it
    // was at the capture. Everything at or above the captured
    // stack pointer is untouched by the code below, so the
    // refreshed copy is consistent.
    {
        let table = table().lock();
        let parent = table.get(parent_idx);
        let child = table.get(child_idx);
        let top = VirtPage::containing_address(SYSCALL_STACK_TOP).number();
        let mut copier = TrampolineCopier;
        for i in 1..=SYSCALL_STACK_PAGES {
            let page = VirtPage::from_number(top - i);
            let src = unsafe { parent.space.frame_for_page(page) }
                .expect("parent syscall stack page not mapped");
            let dst = unsafe { child.space.frame_for_page(page) }
                .expect("child syscall stack page not mapped");
            unsafe { copier.copy_frame(dst, src) };
        }
    }

    child_pid
}

/// Replaces the calling process's image with the named program.
///
/// Returns -1 if the path does not resolve, without disturbing
/// the caller. On success the process's user half is wiped
/// (except the syscall stack this call is running on), the new
/// image is loaded into the same address space, and execution
/// jumps to its entry point in ring 3. File descriptors are
/// preserved across the swap.
///
pub fn execve(path: &str) -> i32 {
    let node = match vfs::lookup(path) {
        Some(node) => node,
        None => return -1,
    };

    let size = node.info().size;
    let mut image = Vec::new();
    image.resize(size, 0);
    match node.read(0, &mut image) {
        Ok(read) if read == size => {}
        _ => return -1,
    }

    // Validate before wiping anything, so a malformed image
    // panics without half-destroying the caller.
    if let Err(err) = rawx::Image::parse(&image) {
        panic!("bad image in execve of {:?}: {}", path, err);
    }

    let space: *mut AddressSpace = {
        let mut table = table().lock();
        let idx = table.active.expect("execve with no active process");
        &mut table.get_mut(idx).space
    };

    // The table lock is dropped, but interrupts are disabled
    // and nothing below re-enters the process table, so the
    // address space pointer stays valid.
    unsafe {
        {
            let mut frames = memory::frames().lock();
            let mut tables = memory::tables().lock();
            (*space).wipe_user_half(&mut *frames, &mut *tables, true);
        }
        cpu::flush_tlb();

        let load = loader::load(&image, &mut *space, true, false)
            .unwrap_or_else(|err| panic!("bad image in execve of {:?}: {}", path, err));
        drop(image);

        let stack = load
            .user_stack_top
            .expect("execve image requested no stack");
        enter_user_mode(stack, load.entry_point)
    }
}

/// Terminates the calling process with the given exit code and
/// hands the CPU to the next ready process. Does not return.
///
pub fn exit(code: u32) -> ! {
    cpu::disable_interrupts();

    let process = {
        let mut table = table().lock();
        let idx = table.active.expect("exit with no active process");
        table.remove(idx)
    };

    crate::println!("process {} exited with code {}", process.pid, code);

    // The dying process's stack and address space are still
    // live, so reclamation happens on the kernel's own stack,
    // in the kernel's address space.
    unsafe {
        PENDING_REAP = Some(process);
        jump_to_kernel(reap_and_schedule);
    }
}

/// Kills the running process on the kernel's behalf, with the
/// reserved exit code.
///
pub fn kill_current() -> ! {
    exit(KILLED_BY_KERNEL)
}

// Builds a context for the kernel's own stack and address
// space, and jumps to `entry` on it.
//
unsafe fn jump_to_kernel(entry: extern "C" fn() -> !) -> ! {
    let cr3 = memory::kernel_space().lock().hardware_tables_physical();
    JUMP_CONTEXT = Context {
        eip: entry as usize as u32,
        esp: KERNEL_STACK_TOP.as_u32(),
        ebp: 0,
        cr3,
    };

    load_context(&JUMP_CONTEXT)
}

// Running on the kernel stack: free the dead process's address
// space and elect the next process.
//
extern "C" fn reap_and_schedule() -> ! {
    let process = unsafe { PENDING_REAP.take() }.expect("nothing to reap");
    {
        let mut frames = memory::frames().lock();
        let mut tables = memory::tables().lock();
        unsafe { process.space.destroy(&mut *frames, &mut *tables) };
    }

    // The rest of the process (its descriptor table) is plain
    // heap state.
    drop(process.files);

    schedule()
}

// The kernel's idle-and-elect loop, running on the kernel's
// own stack. Resumes the first process to become ready; if
// none is, idles with interrupts enabled until an interrupt
// makes one ready.
//
fn schedule() -> ! {
    loop {
        let next = {
            let mut table = table().lock();
            if table.count == 0 {
                crate::println!("no processes left; halting.");
                crate::halt_loop();
            }

            match table.elect_any_ready() {
                Some(idx) => {
                    table.get_mut(idx).state = State::Running;
                    table.active = Some(idx);
                    Some(table.get(idx).context)
                }
                None => None,
            }
        };

        match next {
            Some(context) => unsafe {
                JUMP_CONTEXT = context;
                load_context(&JUMP_CONTEXT)
            },
            None => {
                // Everything is blocked: wait for an interrupt
                // to deliver the event something is parked on.
                cpu::enable_interrupts_and_halt();
                cpu::disable_interrupts();
            }
        }
    }
}

// schedule as an extern "C" entry point, for contexts built by
// hand.
//
extern "C" fn schedule_entry() -> ! {
    schedule()
}

/// Saves the running process with the given state and switches
/// to the next ready process.
///
/// Called from the timer interrupt (with `State::Ready`, for
/// pre-emption) and from blocking paths (with `State::Blocked`).
/// If nothing else is ready: a pre-empted process simply keeps
/// the CPU, and a blocking process hands it to the idle loop.
///
pub fn switch(new_state: State) {
    let prev: *mut Context;
    let next: *const Context;
    {
        let mut table = table().lock();
        let current = match table.active {
            Some(idx) => idx,
            None => return,
        };

        match table.next_ready(current) {
            Some(elected) => {
                table.get_mut(current).state = new_state;
                table.get_mut(elected).state = State::Running;
                table.active = Some(elected);
                table.cursor = elected;
                prev = &mut table.get_mut(current).context;
                next = &table.get(elected).context;
            }
            None => {
                if new_state != State::Blocked {
                    // Nothing else to run; keep the CPU.
                    return;
                }

                // The only runnable process is blocking: park
                // it and fall back to the idle loop.
                table.get_mut(current).state = State::Blocked;
                table.active = None;
                table.cursor = current;
                prev = &mut table.get_mut(current).context;
                let cr3 = memory::kernel_space().lock().hardware_tables_physical();
                unsafe {
                    JUMP_CONTEXT = Context {
                        eip: schedule_entry as usize as u32,
                        esp: KERNEL_STACK_TOP.as_u32(),
                        ebp: 0,
                        cr3,
                    };
                    next = &JUMP_CONTEXT;
                }
            }
        }
    }

    // The locks are released before the switch; the incoming
    // context resumes inside its own older switch call and
    // unwinds from there.
    unsafe { switch_context(prev, next) }
}

/// Blocks the running process until [`unblock`] is called with
/// its pid.
///
pub fn block_current() {
    switch(State::Blocked);
}

/// Makes the given process ready again.
///
/// If nothing was running (every process was blocked), the idle
/// loop picks the process up as soon as the calling interrupt
/// handler returns.
///
pub fn unblock(pid: Pid) {
    let mut table = table().lock();
    if let Some(idx) = table.find_pid(pid) {
        if table.get(idx).state == State::Blocked {
            table.get_mut(idx).state = State::Ready;
        }
    }
}

/// Registers an open file with the running process, returning
/// the new file descriptor.
///
pub fn add_fd(node: Arc<dyn FileNode>) -> i32 {
    let mut table = table().lock();
    let idx = table.active.expect("no active process");
    let process = table.get_mut(idx);
    let fd = process.next_fd;
    process.next_fd += 1;
    process.files.insert(fd, node);

    fd as i32
}

/// Returns the file behind the running process's descriptor,
/// or None.
///
pub fn fd_node(fd: i32) -> Option<Arc<dyn FileNode>> {
    if fd < 0 {
        return None;
    }

    let table = table().lock();
    let idx = table.active.expect("no active process");
    table.get(idx).files.get(&(fd as u32)).cloned()
}

/// Removes the running process's descriptor, returning whether
/// it existed.
///
pub fn close_fd(fd: i32) -> bool {
    if fd < 0 {
        return false;
    }

    let mut table = table().lock();
    let idx = table.active.expect("no active process");
    table.get_mut(idx).files.remove(&(fd as u32)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a table entry that never runs: ring bookkeeping
    // only.
    fn dummy(table: &mut ProcessTable, state: State) -> usize {
        let pid = table.alloc_pid();
        table.insert(Process {
            pid,
            state,
            context: Context::default(),
            space: AddressSpace::new(&mut test_table_area()),
            files: BTreeMap::new(),
            next_fd: 0,
            prev: 0,
            next: 0,
        })
    }

    fn test_table_area() -> virtmem::TableArea {
        use alloc::boxed::Box;
        use alloc::vec;

        let words = Box::leak(vec![0u32; 32].into_boxed_slice());
        let backing = Box::leak(vec![0u8; 64 * 4096].into_boxed_slice());
        let start = (backing.as_ptr() as usize + 4095) & !4095;
        unsafe { virtmem::TableArea::new(start, 32, words) }
    }

    #[test_case]
    fn ring_insert_remove() {
        let mut table = ProcessTable::new();
        let a = dummy(&mut table, State::Ready);
        let b = dummy(&mut table, State::Ready);
        let c = dummy(&mut table, State::Blocked);
        assert_eq!(table.count, 3);

        // The ring is circular in both directions.
        let mut idx = a;
        for _ in 0..3 {
            idx = table.get(idx).next;
        }
        assert_eq!(idx, a);

        // Blocked processes are skipped by election.
        assert_eq!(table.next_ready(c), Some(table.get(c).next));

        // Removal unlinks in O(1) and keeps the ring closed.
        table.remove(b);
        assert_eq!(table.count, 2);
        let mut idx = a;
        for _ in 0..2 {
            idx = table.get(idx).next;
        }
        assert_eq!(idx, a);

        table.remove(a);
        table.remove(c);
        assert_eq!(table.count, 0);
    }
}
