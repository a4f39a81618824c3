//! Round-robin scheduler.
//!
//! One circular list, no priorities: `pick_next` walks the rotation from
//! the current task and takes the first runnable one. `schedule` runs
//! with interrupts off — called either from the trap-exit path after the
//! timer set `need_resched`, or from the idle loop — and commits by
//! writing `TSS.esp0`, updating the current id and handing control to
//! the context-switch primitive. A `Created` user task takes its first
//! dispatch through the same primitive; its seeded kernel stack returns
//! into the ring-3 entry thunk, which `iret`s into the prepared trap
//! frame and never comes back.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86::{context, gdt};
use crate::task::{self, Task, TaskId, TaskState, TaskTable, TASKS};

static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Ask for a reschedule at the next return to user mode.
pub fn set_need_resched() {
    NEED_RESCHED.store(true, Ordering::Release);
}

/// Consume the flag.
pub fn take_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::AcqRel)
}

/// Can this task be dispatched?
pub fn can_schedule(task: &Task) -> bool {
    matches!(task.state, TaskState::Ready | TaskState::Created)
}

/// Next runnable task after `current` in rotation order; `current` when
/// nothing else runs.
pub fn pick_next(table: &TaskTable, current: TaskId) -> TaskId {
    let mut candidate = match table.next_of(current) {
        Some(n) => n,
        None => return current,
    };
    while candidate != current {
        if table.get(candidate).is_some_and(can_schedule) {
            return candidate;
        }
        candidate = match table.next_of(candidate) {
            Some(n) => n,
            None => return current,
        };
    }
    current
}

enum Commit {
    Stay,
    Switch {
        prev_esp: *mut u32,
        next_esp: u32,
        next_cr3: u32,
    },
}

/// Pick and switch. Interrupts must be off; may return on a different
/// kernel stack (after this task is scheduled again), or not at all for
/// a while.
pub fn schedule() {
    let Some(current) = task::current_id() else {
        return;
    };
    let commit = {
        let mut table = TASKS.lock();
        let cur_state = match table.get(current) {
            Some(t) => t.state,
            None => return,
        };
        if cur_state == TaskState::Running {
            if let Some(t) = table.get_mut(current) {
                t.state = TaskState::Ready;
            }
        }
        let next = pick_next(&table, current);
        if next == current {
            // Nothing else runnable; keep running unless we just died.
            if cur_state == TaskState::Running {
                if let Some(t) = table.get_mut(current) {
                    t.state = TaskState::Running;
                }
            }
            Commit::Stay
        } else {
            let (next_esp, next_cr3, esp0) = {
                let t = table.get_mut(next).expect("picked task is live");
                t.state = TaskState::Running;
                (t.esp, t.cr3.as_u32(), t.esp0)
            };
            // The slot lives in the static table; the pointer stays
            // valid after the lock is dropped.
            let prev_esp = table
                .get_mut(current)
                .map(|t| &mut t.esp as *mut u32)
                .expect("current task is live");
            task::set_current(next);
            gdt::set_kernel_stack(esp0);
            Commit::Switch {
                prev_esp,
                next_esp,
                next_cr3,
            }
        }
    };
    match commit {
        Commit::Stay => {}
        Commit::Switch {
            prev_esp,
            next_esp,
            next_cr3,
        } => {
            // SAFETY: interrupts are off; prev_esp points into the
            // static task table; next's esp/cr3 were built by
            // prepare_user/fork (seeded stack) or by a previous
            // switch_to out of that task.
            unsafe {
                context::switch_to(prev_esp, next_esp, next_cr3);
            }
            // Back on this task's stack, still with interrupts off.
        }
    }
}

/// The idle loop the boot task settles into: reap, reschedule, sleep
/// until the next interrupt.
pub fn idle_loop() -> ! {
    loop {
        task::exit::reap_zombies();
        schedule();
        crate::arch::x86::interrupts::enable_and_halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::addr::test_arena;
    use crate::mm::{early, paging, pmm, PhysAddr};
    use crate::task::task_load;

    const BASE: u32 = 0x100_0000;

    fn setup() -> (TaskId, TaskId, TaskId) {
        test_arena::install(early::EARLY_PT_BASE, 3584 + 256);
        early::reset_for_tests();
        paging::reset_for_tests();
        crate::task::reset_for_tests();
        pmm::PMM.lock().init(PhysAddr::new(BASE), 256, 128);
        let mut t = TASKS.lock();
        let a = task_load(&mut t, 0, false).expect("a");
        let b = task_load(&mut t, 0, false).expect("b");
        let c = task_load(&mut t, 0, false).expect("c");
        (a, b, c)
    }

    fn set_state(id: TaskId, state: TaskState) {
        TASKS.lock().get_mut(id).expect("task").state = state;
    }

    #[test]
    fn round_robin_rotation() {
        let _guard = test_arena::lock_for_test();
        let (a, b, c) = setup();
        for id in [a, b, c] {
            set_state(id, TaskState::Ready);
        }
        let t = TASKS.lock();
        // Positional fairness: each task's successor is the next slot in
        // rotation order.
        assert_eq!(pick_next(&t, a), b);
        assert_eq!(pick_next(&t, b), c);
        assert_eq!(pick_next(&t, c), a);
    }

    #[test]
    fn skips_terminated_and_blocked() {
        let _guard = test_arena::lock_for_test();
        let (a, b, c) = setup();
        set_state(a, TaskState::Running);
        set_state(b, TaskState::Terminated);
        set_state(c, TaskState::Ready);
        let t = TASKS.lock();
        assert_eq!(pick_next(&t, a), c);
        drop(t);
        set_state(c, TaskState::Blocked);
        let t = TASKS.lock();
        assert_eq!(pick_next(&t, a), a, "nothing runnable but the current");
    }

    #[test]
    fn created_tasks_are_dispatchable() {
        let _guard = test_arena::lock_for_test();
        let (a, b, _c) = setup();
        set_state(a, TaskState::Running);
        // b stays Created (the first-entry state).
        let t = TASKS.lock();
        assert_eq!(pick_next(&t, a), b);
    }

    #[test]
    fn schedule_keeps_a_lone_runnable_task() {
        let _guard = test_arena::lock_for_test();
        test_arena::install(early::EARLY_PT_BASE, 3584 + 64);
        early::reset_for_tests();
        paging::reset_for_tests();
        crate::task::reset_for_tests();
        pmm::PMM.lock().init(PhysAddr::new(BASE), 64, 64);
        let id = {
            let mut t = TASKS.lock();
            task_load(&mut t, 0, false).expect("task")
        };
        set_state(id, TaskState::Running);
        crate::task::set_current(id);
        // Nothing else to run: schedule() must come straight back with
        // the task still Running.
        schedule();
        assert_eq!(
            TASKS.lock().get(id).expect("task").state,
            TaskState::Running
        );
        assert_eq!(crate::task::current_id(), Some(id));
    }

    #[test]
    fn need_resched_flag_is_consumed() {
        let _ = take_need_resched();
        set_need_resched();
        assert!(take_need_resched());
        assert!(!take_need_resched());
    }
}
