//! End-to-end kernel tests. The test body plays the role of every user
//! program: it issues syscalls on behalf of whichever process is current
//! and drives clock and terminal traps by hand.

use rynix::kernel::{copy_from_user, copy_to_user, Kernel, KernelConfig, KILLED};
use rynix::loader::{ImageRegistry, Program};
use rynix::sync::ReclaimPolicy;
use rynix::syscalls::SyscallOutcome::{Blocked, Complete};
use rynix::{Pid, ERROR, PAGE_SIZE, TERMINAL_MAX_LINE, VMEM_1_BASE, VMEM_1_LIMIT};

fn registry() -> ImageRegistry {
    let mut reg = ImageRegistry::new();
    reg.register(
        "init",
        Program {
            text: b"init text".to_vec(),
            // Two data pages of scratch space for syscall buffers.
            data: vec![0u8; 2 * PAGE_SIZE],
        },
    );
    reg.register(
        "alt",
        Program {
            text: b"alt text".to_vec(),
            data: vec![0u8; 16],
        },
    );
    reg
}

fn boot() -> Kernel {
    Kernel::boot(KernelConfig::default(), Box::new(registry()), "init", &[]).unwrap()
}

/// Boot and run until init is the current process.
fn boot_running() -> Kernel {
    let mut k = boot();
    k.on_clock().unwrap();
    assert_eq!(k.current(), k.init_pid());
    k
}

/// A writable address in the image's data pages.
fn data_addr() -> usize {
    VMEM_1_BASE + PAGE_SIZE
}

fn poke(k: &mut Kernel, pid: Pid, addr: usize, bytes: &[u8]) {
    let table = k.procs.get(pid).and_then(|p| p.region1.as_ref()).unwrap();
    copy_to_user(&mut k.machine, table, addr, bytes).unwrap();
}

fn peek(k: &Kernel, pid: Pid, addr: usize, len: usize) -> Vec<u8> {
    let table = k.procs.get(pid).and_then(|p| p.region1.as_ref()).unwrap();
    let mut buf = vec![0u8; len];
    copy_from_user(&k.machine, table, addr, &mut buf).unwrap();
    buf
}

fn fork_child(k: &mut Kernel) -> Pid {
    match k.handle_fork().unwrap() {
        Complete(pid) if pid > 0 => pid as Pid,
        other => panic!("fork did not produce a child: {:?}", other),
    }
}

// ---- process lifecycle ----

#[test]
fn fork_returns_child_pid_and_child_sees_zero() {
    let mut k = boot_running();
    let parent = k.current();
    let child = fork_child(&mut k);
    assert_ne!(child, parent);
    // The child's saved context returns 0 from the fork.
    assert_eq!(k.procs.get(child).unwrap().user_context.regs[0], 0);
    assert_eq!(k.procs.get(parent).unwrap().children, vec![child]);
}

#[test]
fn fork_duplicates_memory_then_isolates_it() {
    let mut k = boot_running();
    let parent = k.current();
    poke(&mut k, parent, data_addr(), b"before fork");
    let child = fork_child(&mut k);
    assert_eq!(peek(&k, child, data_addr(), 11), b"before fork");

    poke(&mut k, parent, data_addr(), b"parent only");
    assert_eq!(peek(&k, child, data_addr(), 11), b"before fork");
    assert_eq!(peek(&k, parent, data_addr(), 11), b"parent only");
}

#[test]
fn failed_fork_changes_nothing() {
    let mut k = boot_running();
    // Drain the free pool below what a fork needs.
    while k.frame_table.count_free() > 2 {
        k.frame_table.allocate(0).unwrap();
    }
    let free_before = k.frame_table.count_free();
    let children_before = k.procs.get(k.current()).unwrap().children.len();
    assert_eq!(k.handle_fork().unwrap(), Complete(ERROR));
    assert_eq!(k.frame_table.count_free(), free_before);
    assert_eq!(
        k.procs.get(k.current()).unwrap().children.len(),
        children_before
    );
}

#[test]
fn frames_are_conserved_across_a_process_lifetime() {
    let mut k = boot_running();
    let baseline = k.frame_table.count_free();
    let child = fork_child(&mut k);

    k.on_clock().unwrap();
    assert_eq!(k.current(), child);
    k.handle_exit(7).unwrap();
    assert_eq!(k.current(), k.init_pid());

    let status_addr = data_addr();
    assert_eq!(k.handle_wait(status_addr).unwrap(), Complete(child as isize));
    let status = i32::from_ne_bytes(peek(&k, k.init_pid(), status_addr, 4).try_into().unwrap());
    assert_eq!(status, 7);
    assert_eq!(k.frame_table.count_free(), baseline);
    assert!(!k.procs.contains(child));
}

#[test]
fn wait_blocks_until_a_child_exits() {
    let mut k = boot_running();
    let parent = k.current();
    let child = fork_child(&mut k);
    let status_addr = data_addr();

    assert_eq!(k.handle_wait(status_addr).unwrap(), Blocked);
    assert_eq!(k.current(), child);

    k.handle_exit(3).unwrap();
    // The parent was woken with the child's pid and status in place.
    assert_eq!(k.current(), parent);
    assert_eq!(k.machine.live_user_context().regs[0], child as isize);
    let status = i32::from_ne_bytes(peek(&k, parent, status_addr, 4).try_into().unwrap());
    assert_eq!(status, 3);
}

#[test]
fn wait_with_no_children_fails_immediately() {
    let mut k = boot_running();
    assert_eq!(k.handle_wait(data_addr()).unwrap(), Complete(ERROR));
}

#[test]
fn orphaned_zombie_is_reaped_without_a_wait() {
    let mut k = boot_running();
    let a = fork_child(&mut k);
    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    let b = fork_child(&mut k);

    // A dies; B is orphaned but keeps running.
    k.handle_exit(0).unwrap();
    assert!(k.procs.get(a).unwrap().is_zombie());
    assert_eq!(k.procs.get(b).unwrap().parent, None);

    // Get B current and exit it: no parent, so nothing is kept.
    k.on_clock().unwrap();
    assert_eq!(k.current(), b);
    k.handle_exit(0).unwrap();
    assert!(!k.procs.contains(b));
}

#[test]
fn exiting_init_halts_the_machine() {
    let mut k = boot_running();
    k.handle_exit(0).unwrap();
    assert!(k.halted);
}

#[test]
fn getpid_names_the_current_process() {
    let mut k = boot_running();
    let init = k.init_pid();
    assert_eq!(k.handle_getpid().unwrap(), Complete(init as isize));
    let child = fork_child(&mut k);
    k.on_clock().unwrap();
    assert_eq!(k.handle_getpid().unwrap(), Complete(child as isize));
}

// ---- exec ----

#[test]
fn exec_replaces_the_image() {
    let mut k = boot_running();
    let init = k.current();
    let free_before = k.frame_table.count_free();
    let name_addr = data_addr();
    poke(&mut k, init, name_addr, b"alt\0");

    match k.handle_exec(name_addr, 0).unwrap() {
        Complete(argc) => assert_eq!(argc, 0),
        other => panic!("exec failed: {:?}", other),
    }
    assert_eq!(k.machine.live_user_context().pc, VMEM_1_BASE);
    assert_eq!(peek(&k, init, VMEM_1_BASE, 8), b"alt text");
    // Old image: 1 text + 2 data + 1 stack; new: 1 text + 1 data + 1 stack.
    assert_eq!(k.frame_table.count_free(), free_before + 1);
}

#[test]
fn exec_with_a_bad_name_pointer_leaves_the_caller_intact() {
    let mut k = boot_running();
    let init = k.current();
    let unmapped = VMEM_1_BASE + 100 * PAGE_SIZE;
    assert_eq!(k.handle_exec(unmapped, 0).unwrap(), Complete(ERROR));
    assert!(k.procs.get(init).unwrap().region1.is_some());
    assert_eq!(k.current(), init);
}

#[test]
fn exec_of_a_missing_program_kills_the_caller() {
    let mut k = boot_running();
    let child = fork_child(&mut k);
    k.on_clock().unwrap();
    assert_eq!(k.current(), child);
    let name_addr = data_addr();
    poke(&mut k, child, name_addr, b"no-such-program\0");
    assert_eq!(k.handle_exec(name_addr, 0).unwrap(), Blocked);
    assert!(k.procs.get(child).unwrap().is_zombie());
}

// ---- heap and stack ----

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let mut k = boot_running();
    let init = k.current();
    let floor = k.procs.get(init).unwrap().brk_floor_page;
    let free_before = k.frame_table.count_free();

    let grown = VMEM_1_BASE + (floor + 4) * PAGE_SIZE;
    assert_eq!(k.handle_brk(grown).unwrap(), Complete(0));
    assert_eq!(k.procs.get(init).unwrap().brk_page, floor + 4);
    assert_eq!(k.frame_table.count_free(), free_before - 4);

    let shrunk = VMEM_1_BASE + floor * PAGE_SIZE;
    assert_eq!(k.handle_brk(shrunk).unwrap(), Complete(0));
    assert_eq!(k.frame_table.count_free(), free_before);
}

#[test]
fn brk_cannot_cross_into_the_stack_or_below_the_floor() {
    let mut k = boot_running();
    let init = k.current();
    let floor = k.procs.get(init).unwrap().brk_floor_page;

    assert_eq!(k.handle_brk(VMEM_1_LIMIT).unwrap(), Complete(ERROR));
    let below = VMEM_1_BASE + (floor - 1) * PAGE_SIZE;
    assert_eq!(k.handle_brk(below).unwrap(), Complete(ERROR));
    // Neither failure moved the break.
    assert_eq!(k.procs.get(init).unwrap().brk_page, floor);
}

#[test]
fn stack_faults_near_the_stack_grow_it() {
    let mut k = boot_running();
    let init = k.current();
    let fault = VMEM_1_LIMIT - 2 * PAGE_SIZE - 4;
    k.on_memory_fault(fault).unwrap();
    assert_eq!(k.current(), init);
    // The faulting page is now usable.
    poke(&mut k, init, fault, b"grown");
    assert_eq!(peek(&k, init, fault, 5), b"grown");
}

#[test]
fn wild_memory_faults_kill_the_process() {
    let mut k = boot_running();
    let child = fork_child(&mut k);
    k.on_clock().unwrap();
    assert_eq!(k.current(), child);

    let wild = VMEM_1_BASE + 100 * PAGE_SIZE;
    k.on_memory_fault(wild).unwrap();
    assert!(k.procs.get(child).unwrap().is_zombie());

    let status_addr = data_addr();
    assert_eq!(k.handle_wait(status_addr).unwrap(), Complete(child as isize));
    let status = i32::from_ne_bytes(peek(&k, k.init_pid(), status_addr, 4).try_into().unwrap());
    assert_eq!(status, KILLED);
}

// ---- delay and the clock ----

#[test]
fn delay_sleeps_for_the_requested_ticks() {
    let mut k = boot_running();
    let init = k.current();
    assert_eq!(k.handle_delay(0).unwrap(), Complete(0));
    assert_eq!(k.handle_delay(-1).unwrap(), Complete(ERROR));

    assert_eq!(k.handle_delay(2).unwrap(), Blocked);
    assert_ne!(k.current(), init);
    k.on_clock().unwrap();
    assert_ne!(k.current(), init);
    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
    assert_eq!(k.machine.live_user_context().regs[0], 0);
}

#[test]
fn clock_round_robins_ready_processes() {
    let mut k = boot_running();
    let init = k.current();
    let a = fork_child(&mut k);
    let b = fork_child(&mut k);
    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    k.on_clock().unwrap();
    assert_eq!(k.current(), b);
    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
}

// ---- locks ----

#[test]
fn contended_lock_hands_off_in_fifo_order() {
    let mut k = boot_running();
    let init = k.current();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("lock_init: {:?}", other),
    };
    let a = fork_child(&mut k);
    let b = fork_child(&mut k);
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.handle_acquire(lock).unwrap(), Blocked);
    assert_eq!(k.current(), b);
    assert_eq!(k.handle_acquire(lock).unwrap(), Blocked);
    assert_eq!(k.current(), init);

    // Repeat acquire by the holder succeeds without deadlock.
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));

    assert_eq!(k.handle_release(lock).unwrap(), Complete(0));
    assert_eq!(k.locks.get(&lock).unwrap().owner(), Some(a));
    // Ownership moved, so the old holder cannot release again.
    assert_eq!(k.handle_release(lock).unwrap(), Complete(ERROR));

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.machine.live_user_context().regs[0], 0);
    assert_eq!(k.handle_release(lock).unwrap(), Complete(0));
    assert_eq!(k.locks.get(&lock).unwrap().owner(), Some(b));
}

#[test]
fn operations_on_unknown_resources_fail() {
    let mut k = boot_running();
    assert_eq!(k.handle_acquire(99).unwrap(), Complete(ERROR));
    assert_eq!(k.handle_release(99).unwrap(), Complete(ERROR));
    assert_eq!(k.handle_cvar_signal(99).unwrap(), Complete(ERROR));
    assert_eq!(k.handle_reclaim(99).unwrap(), Complete(ERROR));
}

// ---- condition variables ----

#[test]
fn cvar_wait_releases_lock_and_reacquires_on_signal() {
    let mut k = boot_running();
    let init = k.current();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let cvar = match k.handle_cvar_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let a = fork_child(&mut k);

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));
    assert_eq!(k.handle_cvar_wait(cvar, lock).unwrap(), Blocked);
    // The wait released the lock on its way to sleep.
    assert_eq!(k.locks.get(&lock).unwrap().owner(), None);
    assert_eq!(k.current(), init);

    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));
    assert_eq!(k.handle_cvar_signal(cvar).unwrap(), Complete(0));
    // Mesa: the signalled waiter queues on the lock, it does not run yet.
    assert_eq!(k.locks.get(&lock).unwrap().owner(), Some(init));
    assert!(k.sched.ready.is_empty());

    assert_eq!(k.handle_release(lock).unwrap(), Complete(0));
    assert_eq!(k.locks.get(&lock).unwrap().owner(), Some(a));
    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.machine.live_user_context().regs[0], 0);
}

#[test]
fn cvar_wait_requires_holding_the_lock() {
    let mut k = boot_running();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let cvar = match k.handle_cvar_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    assert_eq!(k.handle_cvar_wait(cvar, lock).unwrap(), Complete(ERROR));
}

#[test]
fn cvar_broadcast_wakes_every_waiter() {
    let mut k = boot_running();
    let init = k.current();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let cvar = match k.handle_cvar_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let a = fork_child(&mut k);
    let b = fork_child(&mut k);

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));
    assert_eq!(k.handle_cvar_wait(cvar, lock).unwrap(), Blocked);
    // Blocking A handed the machine straight to B.
    assert_eq!(k.current(), b);
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));
    assert_eq!(k.handle_cvar_wait(cvar, lock).unwrap(), Blocked);
    assert_eq!(k.current(), init);
    assert_eq!(k.handle_cvar_broadcast(cvar).unwrap(), Complete(0));
    // The lock was free, so the first waiter got it; the second queues.
    assert_eq!(k.locks.get(&lock).unwrap().owner(), Some(a));
    assert_eq!(k.handle_cvar_signal(cvar).unwrap(), Complete(0));
}

// ---- pipes ----

#[test]
fn pipe_read_blocks_until_bytes_arrive() {
    let mut k = boot_running();
    let init = k.current();
    let pipe = match k.handle_pipe_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let a = fork_child(&mut k);

    let raddr = data_addr();
    assert_eq!(k.handle_pipe_read(pipe, raddr, 16).unwrap(), Blocked);
    assert_eq!(k.current(), a);

    let waddr = data_addr() + 64;
    poke(&mut k, a, waddr, b"hello");
    assert_eq!(k.handle_pipe_write(pipe, waddr, 5).unwrap(), Complete(5));

    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
    assert_eq!(k.machine.live_user_context().regs[0], 5);
    assert_eq!(peek(&k, init, raddr, 5), b"hello");
}

#[test]
fn oversized_pipe_write_completes_as_the_reader_drains() {
    let mut k = boot_running();
    let init = k.current();
    let pipe = match k.handle_pipe_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let a = fork_child(&mut k);
    let cap = k.pipes.get(&pipe).unwrap().capacity();

    let total = cap + 44;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let waddr = data_addr();
    poke(&mut k, init, waddr, &payload);
    assert_eq!(k.handle_pipe_write(pipe, waddr, total).unwrap(), Blocked);
    assert_eq!(k.current(), a);

    let raddr = data_addr();
    assert_eq!(
        k.handle_pipe_read(pipe, raddr, total).unwrap(),
        Complete(cap as isize)
    );
    assert_eq!(peek(&k, a, raddr, cap), &payload[..cap]);

    // The writer finished its trailing bytes and is runnable again.
    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
    assert_eq!(k.machine.live_user_context().regs[0], total as isize);
    assert_eq!(k.pipes.get(&pipe).unwrap().len(), 44);
}

#[test]
fn zero_length_pipe_read_returns_immediately() {
    let mut k = boot_running();
    let pipe = match k.handle_pipe_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    assert_eq!(k.handle_pipe_read(pipe, data_addr(), 0).unwrap(), Complete(0));
}

#[test]
fn absurd_buffer_lengths_fail_cleanly() {
    let mut k = boot_running();
    let pipe = match k.handle_pipe_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let cur = k.current();
    poke(&mut k, cur, data_addr(), b"x");
    assert_eq!(k.handle_pipe_write(pipe, data_addr(), 1).unwrap(), Complete(1));

    // Lengths whose end address wraps past zero must be rejected up
    // front, not allocated for or partially served.
    assert_eq!(
        k.handle_pipe_read(pipe, data_addr(), usize::MAX).unwrap(),
        Complete(ERROR)
    );
    assert_eq!(
        k.handle_pipe_write(pipe, data_addr(), usize::MAX - data_addr()).unwrap(),
        Complete(ERROR)
    );
    assert_eq!(
        k.handle_tty_write(0, data_addr(), usize::MAX).unwrap(),
        Complete(ERROR)
    );
    assert_eq!(k.pipes.get(&pipe).unwrap().len(), 1);
}

// ---- terminals ----

#[test]
fn tty_write_transmits_in_hardware_sized_chunks() {
    let mut k = boot_running();
    let init = k.current();
    let total = 2 * TERMINAL_MAX_LINE + 10;
    let payload: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
    let addr = data_addr();
    poke(&mut k, init, addr, &payload);

    assert_eq!(k.handle_tty_write(0, addr, total).unwrap(), Blocked);
    for _ in 0..3 {
        k.on_tty_transmit(0).unwrap();
    }
    let chunks = k.machine.tty_output(0);
    assert_eq!(
        chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
        vec![TERMINAL_MAX_LINE, TERMINAL_MAX_LINE, 10]
    );
    assert_eq!(chunks.concat(), payload);

    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
    assert_eq!(k.machine.live_user_context().regs[0], total as isize);
}

#[test]
fn queued_tty_writers_do_not_interleave() {
    let mut k = boot_running();
    let init = k.current();
    let a = fork_child(&mut k);

    let addr = data_addr();
    poke(&mut k, init, addr, b"first!");
    assert_eq!(k.handle_tty_write(0, addr, 6).unwrap(), Blocked);
    assert_eq!(k.current(), a);
    poke(&mut k, a, addr, b"second");
    assert_eq!(k.handle_tty_write(0, addr, 6).unwrap(), Blocked);

    // First transmit completes, which starts the queued writer's.
    k.on_tty_transmit(0).unwrap();
    k.on_tty_transmit(0).unwrap();
    let chunks = k.machine.tty_output(0).to_vec();
    assert_eq!(chunks, vec![b"first!".to_vec(), b"second".to_vec()]);
    assert!(k.ttys[0].active.is_none());
}

#[test]
fn tty_read_blocks_until_a_line_is_typed() {
    let mut k = boot_running();
    let init = k.current();
    let addr = data_addr();
    assert_eq!(k.handle_tty_read(0, addr, 10).unwrap(), Blocked);

    k.machine.tty_type_line(0, b"hello, world").unwrap();
    k.on_tty_receive(0).unwrap();

    k.on_clock().unwrap();
    assert_eq!(k.current(), init);
    assert_eq!(k.machine.live_user_context().regs[0], 10);
    assert_eq!(peek(&k, init, addr, 10), b"hello, wor");
    // The tail of the line stays buffered for the next read.
    assert_eq!(k.handle_tty_read(0, addr, 10).unwrap(), Complete(2));
}

#[test]
fn tty_ops_validate_the_terminal_and_buffer() {
    let mut k = boot_running();
    assert_eq!(k.handle_tty_read(17, data_addr(), 4).unwrap(), Complete(ERROR));
    let unmapped = VMEM_1_BASE + 100 * PAGE_SIZE;
    assert_eq!(k.handle_tty_write(0, unmapped, 4).unwrap(), Complete(ERROR));
    assert_eq!(k.handle_tty_read(0, data_addr(), 0).unwrap(), Complete(0));
}

// ---- reclaim ----

#[test]
fn reclaim_releases_waiters_with_an_error() {
    let mut k = boot_running();
    let init = k.current();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    let a = fork_child(&mut k);
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.handle_acquire(lock).unwrap(), Blocked);
    assert_eq!(k.current(), init);

    assert_eq!(k.handle_reclaim(lock).unwrap(), Complete(0));
    // The id is gone for every further use.
    assert_eq!(k.handle_release(lock).unwrap(), Complete(ERROR));
    assert_eq!(k.handle_reclaim(lock).unwrap(), Complete(ERROR));

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.machine.live_user_context().regs[0], ERROR);
}

#[test]
fn reclaim_can_kill_waiters_and_orphans_their_children() {
    let mut k = boot_running();
    let init = k.current();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id as u32,
        other => panic!("{:?}", other),
    };
    assert_eq!(k.handle_acquire(lock).unwrap(), Complete(0));
    let a = fork_child(&mut k);

    k.on_clock().unwrap();
    assert_eq!(k.current(), a);
    let b = fork_child(&mut k);
    assert_eq!(k.handle_acquire(lock).unwrap(), Blocked);
    assert_eq!(k.current(), init);

    assert_eq!(
        k.handle_reclaim_with(lock, ReclaimPolicy::KillWaiters).unwrap(),
        Complete(0)
    );
    // The waiter died on the spot; its child no longer points at it.
    assert!(k.procs.get(a).unwrap().is_zombie());
    assert_eq!(k.procs.get(b).unwrap().parent, None);

    let status_addr = data_addr();
    assert_eq!(k.handle_wait(status_addr).unwrap(), Complete(a as isize));
    let status = i32::from_ne_bytes(peek(&k, init, status_addr, 4).try_into().unwrap());
    assert_eq!(status, KILLED);

    // Orphaned processes vanish entirely when they exit.
    k.on_clock().unwrap();
    assert_eq!(k.current(), b);
    k.handle_exit(0).unwrap();
    assert!(!k.procs.contains(b));
    assert_eq!(k.current(), init);
}

#[test]
fn resource_ids_are_unique_across_kinds() {
    let mut k = boot_running();
    let lock = match k.handle_lock_init().unwrap() {
        Complete(id) => id,
        other => panic!("{:?}", other),
    };
    let cvar = match k.handle_cvar_init().unwrap() {
        Complete(id) => id,
        other => panic!("{:?}", other),
    };
    let pipe = match k.handle_pipe_init().unwrap() {
        Complete(id) => id,
        other => panic!("{:?}", other),
    };
    assert!(lock != cvar && cvar != pipe && lock != pipe);
    // Reclaim dispatches on the shared id space.
    assert_eq!(k.handle_reclaim(cvar as u32).unwrap(), Complete(0));
    assert!(k.cvars.is_empty());
    assert!(k.locks.contains_key(&(lock as u32)));
}
