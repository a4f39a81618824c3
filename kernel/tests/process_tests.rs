//! Process lifecycle integration tests: load, fork (copy-on-write),
//! fault-driven termination, exit and reaping — driven through the same
//! entry points the trap path uses.

use ferrox_kernel::arch::x86::trap::{self, TrapFrame};
use ferrox_kernel::mm::addr::test_arena;
use ferrox_kernel::mm::paging::{self, entry_frame, PteFlags};
use ferrox_kernel::mm::{early, frame_ptr, pmm, PhysAddr, VirtAddr};
use ferrox_kernel::task::{self, exit, fork, loader, TaskState, TASKS};
use ferrox_kernel::{bootstrap, sched};

const MANAGED_BASE: u32 = 0x0100_0000;
const CODE_VA: u32 = 0x0804_8000;

fn setup() {
    test_arena::install(early::EARLY_PT_BASE, 3584 + 512);
    early::reset_for_tests();
    paging::reset_for_tests();
    task::reset_for_tests();
    // As in bootstrap: the kernel directory covers the managed range
    // before the first task directory is cloned (the K1 strategy).
    paging::ensure_direct_map(PhysAddr::new(MANAGED_BASE), 512).expect("direct map");
    pmm::PMM
        .lock()
        .init(PhysAddr::new(MANAGED_BASE), 512, 128);
}

/// Minimal ELF32 executable: one PT_LOAD at CODE_VA with 4 file bytes.
fn build_elf() -> Vec<u8> {
    let mut img = vec![0u8; 52 + 32 + 8];
    img[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    img[4] = 1; // ELFCLASS32
    img[5] = 1; // little-endian
    img[16..18].copy_from_slice(&2u16.to_le_bytes());
    img[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    img[24..28].copy_from_slice(&CODE_VA.to_le_bytes());
    img[28..32].copy_from_slice(&52u32.to_le_bytes());
    img[42..44].copy_from_slice(&32u16.to_le_bytes());
    img[44..46].copy_from_slice(&1u16.to_le_bytes());
    img[52..56].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    img[56..60].copy_from_slice(&84u32.to_le_bytes());
    img[60..64].copy_from_slice(&CODE_VA.to_le_bytes());
    img[68..72].copy_from_slice(&4u32.to_le_bytes());
    img[72..76].copy_from_slice(&4u32.to_le_bytes());
    img[84..88].copy_from_slice(&[0xEB, 0xFE, 0x90, 0x90]); // jmp $
    img
}

fn current_task() -> task::Task {
    let id = task::current_id().expect("current task");
    TASKS.lock().get(id).cloned().expect("live task")
}

#[test]
fn boot_to_first_task() {
    let _guard = test_arena::lock_for_test();
    setup();
    let pid = bootstrap::spawn_init(&build_elf()).expect("spawn");
    assert!(pid > 0);

    let t = current_task();
    assert_eq!(t.state, TaskState::Created);
    assert_eq!(t.user_stack_top, loader::USER_STACK_TOP);
    assert!(paging::kernel_half_matches(t.cr3), "K1 holds for the task");

    // The entry frame is ready for the first iret.
    let tf = task::read_trap_frame(&t);
    assert_eq!(tf.eip, CODE_VA);
    assert!(tf.from_user());
    assert_eq!(tf.esp, loader::USER_STACK_TOP - 140);
}

#[test]
fn fork_is_copy_on_write_and_exit_reaps() {
    let _guard = test_arena::lock_for_test();
    setup();
    bootstrap::spawn_init(&build_elf()).expect("spawn");
    let parent_id = task::current_id().expect("parent");
    let parent = current_task();

    // An idle-style kernel task keeps the system runnable after exits.
    let idle = {
        let mut tbl = TASKS.lock();
        task::task_load(&mut tbl, 0, false).expect("idle")
    };
    TASKS.lock().get_mut(idle).expect("idle").state = TaskState::Ready;

    let before_fork = pmm::stats();
    let child_pid = fork::do_fork().expect("fork");
    assert!(child_pid > parent.pid);

    let (child_id, child) = {
        let tbl = TASKS.lock();
        let id = tbl
            .iter_ids()
            .find(|&id| tbl.get(id).is_some_and(|t| t.pid == child_pid))
            .expect("child slot");
        (id, tbl.get(id).cloned().expect("child"))
    };
    assert_eq!(child.state, TaskState::Created);
    assert_eq!(child.ppid, parent.pid);
    assert!(paging::kernel_half_matches(child.cr3));

    // Child resumes from the parent's frame with eax = 0.
    let child_tf = task::read_trap_frame(&child);
    let parent_tf = task::read_trap_frame(&parent);
    assert_eq!(child_tf.eax, 0);
    assert_eq!(child_tf.eip, parent_tf.eip);
    assert_eq!(child_tf.esp, parent_tf.esp);

    // Both views of the code page are the same write-protected frame.
    let va = VirtAddr::new(CODE_VA);
    let p_pte = paging::pte_at(parent.cr3, va).expect("parent pte");
    let c_pte = paging::pte_at(child.cr3, va).expect("child pte");
    assert_eq!(p_pte, c_pte);
    assert_eq!(p_pte & PteFlags::WRITABLE.bits(), 0);
    let shared = entry_frame(p_pte);
    assert_eq!(pmm::frame_refs(shared), 2);

    // The child writes to the inherited page: it gets a private copy,
    // the parent keeps the original bytes.
    task::set_current(child_id);
    assert!(fork::try_resolve_cow(va));
    let c_frame = entry_frame(paging::pte_at(child.cr3, va).expect("pte"));
    assert_ne!(c_frame, shared);
    // SAFETY: arena-backed frames.
    unsafe {
        assert_eq!(*frame_ptr(c_frame), 0xEB, "copy carries the old bytes");
        *frame_ptr(c_frame) = 0x41;
        assert_eq!(*frame_ptr(shared), 0xEB, "parent bytes unchanged");
    }

    // Child exits; its user half goes back to the allocator.
    exit::exit_current(7);
    assert_eq!(
        TASKS.lock().get(child_id).expect("zombie").exit_code,
        7
    );
    assert_eq!(pmm::frame_refs(shared), 1, "parent still owns its frames");
    assert!(sched::take_need_resched());

    // Reap from the idle side; the child's stack page returns too.
    task::set_current(idle);
    exit::reap_zombies();
    assert!(TASKS.lock().get(child_id).is_none());

    // Parent exits as well; afterwards only bookkeeping pages differ.
    task::set_current(parent_id);
    exit::exit_current(0);
    task::set_current(idle);
    exit::reap_zombies();
    let after = pmm::stats();
    assert!(
        after.free >= before_fork.free,
        "all task memory was reclaimed"
    );
}

#[test]
fn user_page_fault_terminates_the_task() {
    let _guard = test_arena::lock_for_test();
    setup();
    bootstrap::spawn_init(&build_elf()).expect("spawn");
    let id = task::current_id().expect("task");
    {
        let mut tbl = TASKS.lock();
        let other = task::task_load(&mut tbl, 0, false).expect("other");
        tbl.get_mut(other).expect("other").state = TaskState::Ready;
    }

    // Dereferencing 0x10: not present, user mode — not a COW candidate.
    let mut tf = TrapFrame::for_user_entry(CODE_VA, loader::USER_STACK_TOP - 140);
    tf.trapno = 14;
    tf.err = 0b100; // user-mode, non-present
    trap::page_fault(&mut tf, VirtAddr::new(0x10));

    assert_eq!(
        TASKS.lock().get(id).expect("task").state,
        TaskState::Terminated
    );
    assert_eq!(TASKS.lock().get(id).expect("task").exit_code, -1);
}

#[test]
fn write_syscall_reaches_the_console() {
    let _guard = test_arena::lock_for_test();
    setup();
    // PutChar carries its payload in a register, so it works without a
    // user address space; three calls stand in for write(1, "Hi\n", 3).
    static OUT: spin::Mutex<Vec<u8>> = spin::Mutex::new(Vec::new());
    fn sink(b: u8) {
        OUT.lock().push(b);
    }
    ferrox_kernel::drivers::console::register_sink(sink);
    OUT.lock().clear();
    for &b in b"Hi\n" {
        let mut tf = TrapFrame::for_user_entry(CODE_VA, 0xBFFF_EF74);
        tf.trapno = 0x80;
        tf.eax = ferrox_kernel::syscall::Syscall::PutChar as u32;
        tf.ebx = b as u32;
        trap::dispatch(&mut tf);
        assert_eq!(tf.eax, 0);
    }
    assert_eq!(OUT.lock().as_slice(), b"Hi\n");
}
