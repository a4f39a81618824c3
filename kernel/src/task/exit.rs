//! Task termination and the zombie reaper.
//!
//! `exit_current` tears down the user half of the address space at once
//! (dropping one share reference per mapped frame, then the page tables
//! and the directory), marks the task TERMINATED and asks for a
//! reschedule. The record and its kernel stack cannot be freed yet — we
//! are still running on that stack — so the idle path calls
//! [`reap_zombies`] to return them once a successor has been scheduled.

use super::{current_id, TaskState, TASKS};
use crate::arch::x86::cr;
use crate::mm::paging::{self, entry_frame, entry_present};
use crate::mm::{dma, frame_ptr, pmm, PhysAddr};

fn table_ref(pa: PhysAddr) -> *mut paging::PageTable {
    frame_ptr(pa) as *mut paging::PageTable
}

/// Free everything the user half of `pd` references: one share reference
/// per mapped frame, each user page table, and finally the directory
/// itself.
pub fn release_address_space(pd: PhysAddr) {
    for di in 0..paging::KERNEL_PDE_FIRST {
        if dma::pde_in_window(di) {
            continue;
        }
        // SAFETY: the directory belongs to a task that no longer runs
        // user code; interrupts are off.
        let pde = unsafe { (*table_ref(pd)).0[di] };
        if !entry_present(pde) {
            continue;
        }
        let pt = entry_frame(pde);
        for ti in 0..1024 {
            // SAFETY: the page table is live until freed below.
            let pte = unsafe { (*table_ref(pt)).0[ti] };
            if entry_present(pte) {
                pmm::frame_put(entry_frame(pte));
            }
        }
        pmm::free_page(pt);
    }
    pmm::free_page(pd);
}

/// Terminate the current task. Returns (into the trap-exit path, which
/// will reschedule); the caller must not touch user memory afterwards.
pub fn exit_current(code: i32) {
    let Some(id) = current_id() else {
        log::error!("exit: no current task");
        return;
    };
    let (pd, pid) = {
        let mut table = TASKS.lock();
        let Some(task) = table.get_mut(id) else {
            return;
        };
        if task.state == TaskState::Terminated {
            return;
        }
        task.state = TaskState::Terminated;
        task.exit_code = code;
        let pd = task.cr3;
        // The zombie keeps running kernel code for a moment; move it to
        // the canonical directory before its own is torn down.
        task.cr3 = paging::kernel_pd_phys();
        (pd, task.pid)
    };

    if pd != paging::kernel_pd_phys() {
        // SAFETY: the canonical directory maps all kernel code and data;
        // switching to it mid-kernel is always sound.
        unsafe {
            cr::write_cr3(paging::kernel_pd_phys());
        }
        release_address_space(pd);
    }

    log::info!("task {} exited with code {}", pid, code);
    crate::sched::set_need_resched();

    let any_runnable = {
        let table = TASKS.lock();
        let result = table.iter_ids().any(|other| {
            other != id
                && table
                    .get(other)
                    .is_some_and(|t| {
                        matches!(
                            t.state,
                            TaskState::Ready | TaskState::Created | TaskState::Running
                        )
                    })
        });
        result
    };
    if !any_runnable {
        crate::println!("exit: no runnable task remains, halting");
        #[cfg(target_os = "none")]
        crate::arch::x86::halt_forever();
    }
}

/// Return terminated tasks' slots and kernel stacks to the allocator.
/// Runs from the idle path, never while the zombie is current.
pub fn reap_zombies() {
    let mut table = TASKS.lock();
    let current = current_id();
    for id in 0..super::MAX_TASKS {
        if Some(id) == current {
            continue;
        }
        let is_zombie = table
            .get(id)
            .is_some_and(|t| t.state == TaskState::Terminated);
        if !is_zombie {
            continue;
        }
        if let Some(task) = table.remove(id) {
            if task.kstack_phys.as_u32() != 0 {
                pmm::free_page(task.kstack_phys);
            }
            log::debug!("reaped task {}", task.pid);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::addr::test_arena;
    use crate::mm::{early, zero_frame, VirtAddr, PAGE_SIZE};
    use crate::mm::paging::PteFlags;
    use crate::task::{fork, task_load, TASKS};

    const BASE: u32 = 0x100_0000;

    fn setup() {
        test_arena::install(early::EARLY_PT_BASE, 3584 + 512);
        early::reset_for_tests();
        paging::reset_for_tests();
        crate::task::reset_for_tests();
        pmm::PMM.lock().init(PhysAddr::new(BASE), 512, 128);
    }

    #[test]
    fn exit_releases_user_memory_and_reaper_frees_stack() {
        let _guard = test_arena::lock_for_test();
        setup();
        // An "idle" task so exit does not hit the halt branch.
        let idle = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, false).expect("idle")
        };
        {
            let mut t = TASKS.lock();
            t.get_mut(idle).expect("idle").state = crate::task::TaskState::Ready;
        }

        let id = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, true).expect("task")
        };
        crate::task::set_current(id);

        // Give it an address space with two mapped frames.
        let pd = pmm::alloc_page().expect("pd");
        zero_frame(pd);
        paging::clone_kernel_half(pd);
        for va in [0x0800_0000u32, loader_stack_page()] {
            let f = pmm::alloc_pages_kind(1, pmm::AllocKind::User).expect("frame");
            paging::map_page(pd, VirtAddr::new(va), f, PteFlags::USER_RW).expect("map");
        }
        TASKS.lock().get_mut(id).expect("task").cr3 = pd;

        let before = pmm::stats();
        exit_current(7);
        {
            let t = TASKS.lock();
            let task = t.get(id).expect("zombie slot");
            assert_eq!(task.state, crate::task::TaskState::Terminated);
            assert_eq!(task.exit_code, 7);
        }
        // User frames (2), page tables (2) and the directory came back.
        assert_eq!(pmm::stats().free, before.free + 5);

        // The zombie is not current anymore; the reaper takes the rest.
        crate::task::set_current(idle);
        let before_reap = pmm::stats().free;
        reap_zombies();
        assert_eq!(pmm::stats().free, before_reap + 1, "kernel stack freed");
        assert!(TASKS.lock().get(id).is_none(), "slot cleared exactly once");
        reap_zombies();
        assert!(TASKS.lock().get(id).is_none());
    }

    #[test]
    fn exit_after_fork_leaves_parent_frames_alive() {
        let _guard = test_arena::lock_for_test();
        setup();
        let idle = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, false).expect("idle")
        };
        TASKS.lock().get_mut(idle).expect("idle").state = crate::task::TaskState::Ready;

        let parent = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, true).expect("parent")
        };
        crate::task::set_current(parent);
        let pd = pmm::alloc_page().expect("pd");
        zero_frame(pd);
        paging::clone_kernel_half(pd);
        let frame = pmm::alloc_pages_kind(1, pmm::AllocKind::User).expect("frame");
        paging::map_page(pd, VirtAddr::new(0x0800_0000), frame, PteFlags::USER_RW).expect("map");
        TASKS.lock().get_mut(parent).expect("parent").cr3 = pd;

        let child_pd = fork::clone_address_space(pd).expect("clone");
        assert_eq!(pmm::frame_refs(frame), 2);

        // "Child" exits: pretend the current task owns child_pd.
        let child = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, true).expect("child")
        };
        TASKS.lock().get_mut(child).expect("child").cr3 = child_pd;
        crate::task::set_current(child);
        exit_current(0);

        // The shared frame survived with one reference; the parent's
        // mapping is intact.
        assert_eq!(pmm::frame_refs(frame), 1);
        let pte = paging::pte_at(pd, VirtAddr::new(0x0800_0000)).expect("pte");
        assert_eq!(entry_frame(pte), frame);
    }

    fn loader_stack_page() -> u32 {
        crate::task::loader::USER_STACK_TOP - PAGE_SIZE as u32
    }
}
