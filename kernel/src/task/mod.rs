//! Task records and their lifetime.
//!
//! Tasks live in a fixed slab ([`TaskTable`]); a `TaskId` is the slot
//! index, and the scheduler's circular list is the `prev`/`next` ids in
//! each record. Every task owns a one-page kernel stack whose top is
//! what goes into `TSS.esp0`; the trap frame of a user task always sits
//! at the top of that page, because the kernel is not preemptible and so
//! every trap out of ring 3 starts from an empty kernel stack.

pub mod exit;
pub mod fork;
pub mod loader;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::x86::context::seed_kernel_stack;
use crate::arch::x86::trap::TrapFrame;
use crate::arch::x86::{context, gdt};
use crate::error::{KernelError, TaskError};
use crate::mm::{
    kva_ptr, paging, phys_to_virt, pmm, zero_frame, PhysAddr, VirtAddr, PAGE_SIZE,
};

/// Slot capacity of the task table.
pub const MAX_TASKS: usize = 64;

/// Index into the task table.
pub type TaskId = usize;

const NO_TASK: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Built but never dispatched; first dispatch takes the ring-3 entry
    /// path.
    Created,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// One task record.
#[derive(Debug, Clone)]
pub struct Task {
    pub pid: u32,
    pub ppid: u32,
    pub state: TaskState,
    /// Kernel VA of the stack page base; 0 for the adopted boot task.
    pub kstack: u32,
    pub kstack_phys: PhysAddr,
    /// Stack top; loaded into TSS.esp0 whenever this task is dispatched.
    pub esp0: u32,
    /// Saved kernel ESP consumed by the context-switch primitive.
    pub esp: u32,
    /// VA of the task's trap frame (stack top minus the frame size).
    pub tf: u32,
    /// Physical address of the page directory (the canonical kernel
    /// directory for kernel tasks).
    pub cr3: PhysAddr,
    /// Top of the user stack; 0 marks a kernel task.
    pub user_stack_top: u32,
    pub exit_code: i32,
    prev: TaskId,
    next: TaskId,
}

impl Task {
    pub fn is_kernel(&self) -> bool {
        self.user_stack_top == 0
    }
}

/// Fixed-capacity task slab plus the circular scheduling list.
pub struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
    next_pid: u32,
    head: TaskId,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_TASKS],
            next_pid: 1,
            head: NO_TASK,
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id)?.as_mut()
    }

    pub fn head(&self) -> Option<TaskId> {
        (self.head != NO_TASK).then_some(self.head)
    }

    /// Next task in circular order (self when the list is a singleton).
    pub fn next_of(&self, id: TaskId) -> Option<TaskId> {
        Some(self.get(id)?.next)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
    }

    fn free_slot(&mut self) -> Option<TaskId> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Insert a built record, splicing it in just before the list head
    /// (i.e. at the tail of the rotation).
    pub fn insert(&mut self, mut task: Task) -> Result<TaskId, TaskError> {
        let id = self.free_slot().ok_or(TaskError::TooManyTasks)?;
        if self.head == NO_TASK {
            task.prev = id;
            task.next = id;
            self.head = id;
            self.slots[id] = Some(task);
        } else {
            let head = self.head;
            let tail = self.get(head).map(|h| h.prev).unwrap_or(head);
            task.prev = tail;
            task.next = head;
            self.slots[id] = Some(task);
            if let Some(t) = self.get_mut(tail) {
                t.next = id;
            }
            if let Some(h) = self.get_mut(head) {
                h.prev = id;
            }
        }
        Ok(id)
    }

    /// Unlink from the circular list, leaving the slot for the reaper.
    pub fn unlink(&mut self, id: TaskId) {
        let Some(task) = self.get(id) else { return };
        let (prev, next) = (task.prev, task.next);
        if prev == id {
            // Singleton list.
            self.head = NO_TASK;
        } else {
            if let Some(p) = self.get_mut(prev) {
                p.next = next;
            }
            if let Some(n) = self.get_mut(next) {
                n.prev = prev;
            }
            if self.head == id {
                self.head = next;
            }
        }
        if let Some(t) = self.get_mut(id) {
            t.prev = id;
            t.next = id;
        }
    }

    /// Drop a slot entirely (reaper only).
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.unlink(id);
        self.slots.get_mut(id)?.take()
    }

    fn take_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The global task table. Mutated with interrupts off only.
pub static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());

static CURRENT: AtomicUsize = AtomicUsize::new(NO_TASK);

pub fn current_id() -> Option<TaskId> {
    let id = CURRENT.load(Ordering::Acquire);
    (id != NO_TASK).then_some(id)
}

pub fn set_current(id: TaskId) {
    CURRENT.store(id, Ordering::Release);
}

/// Current task's pid, if any.
pub fn current_pid() -> Option<u32> {
    let id = current_id()?;
    TASKS.lock().get(id).map(|t| t.pid)
}

/// Build a task record with a fresh one-page kernel stack. The record
/// comes back `Created` with a zeroed trap frame at the stack top and
/// the canonical kernel directory as its address space; user tasks get
/// their own directory in [`prepare_user`].
pub fn task_load(table: &mut TaskTable, ppid: u32, with_user_stack: bool) -> Result<TaskId, KernelError> {
    let kstack_phys = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
    paging::ensure_kernel_reach(kstack_phys).map_err(KernelError::Vm)?;
    zero_frame(kstack_phys);
    let kstack = phys_to_virt(kstack_phys).as_u32();
    let esp0 = kstack + PAGE_SIZE as u32;
    let tf = esp0 - core::mem::size_of::<TrapFrame>() as u32;

    let pid = table.take_pid();
    let task = Task {
        pid,
        ppid,
        state: TaskState::Created,
        kstack,
        kstack_phys,
        esp0,
        esp: tf,
        tf,
        cr3: paging::kernel_pd_phys(),
        user_stack_top: if with_user_stack { loader::USER_STACK_TOP } else { 0 },
        exit_code: 0,
        prev: NO_TASK,
        next: NO_TASK,
    };
    let id = table.insert(task)?;
    if current_id().is_none() {
        set_current(id);
    }
    Ok(id)
}

/// Write `tf` to the task's trap-frame slot on its kernel stack.
pub fn write_trap_frame(task: &Task, tf: &TrapFrame) {
    // SAFETY: tf points at the reserved frame-sized area at the top of
    // the task's own stack page.
    unsafe {
        core::ptr::copy_nonoverlapping(
            tf as *const TrapFrame as *const u8,
            kva_ptr(VirtAddr::new(task.tf)),
            core::mem::size_of::<TrapFrame>(),
        );
    }
}

/// Read the task's trap frame back from its kernel stack.
pub fn read_trap_frame(task: &Task) -> TrapFrame {
    let mut tf = TrapFrame::zeroed();
    // SAFETY: same area as write_trap_frame.
    unsafe {
        core::ptr::copy_nonoverlapping(
            kva_ptr(VirtAddr::new(task.tf)),
            &mut tf as *mut TrapFrame as *mut u8,
            core::mem::size_of::<TrapFrame>(),
        );
    }
    tf
}

/// Give a `Created` task its own page directory and load the user image
/// into it; the trap frame is seeded for ring-3 entry and the kernel
/// stack below it is seeded so the first context switch lands in
/// [`to_user_mode`].
pub fn prepare_user(id: TaskId, image: &[u8]) -> Result<(), KernelError> {
    let pd = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
    paging::ensure_kernel_reach(pd).map_err(KernelError::Vm)?;
    zero_frame(pd);
    paging::clone_kernel_half(pd);

    let loaded = loader::load_module_to_user(pd, image)?;

    let mut table = TASKS.lock();
    let task = table
        .get_mut(id)
        .ok_or(KernelError::Task(TaskError::NoSuchTask { id }))?;
    task.cr3 = pd;
    let frame = TrapFrame::for_user_entry(loaded.entry, loaded.user_esp);
    let task_snapshot = task.clone();
    write_trap_frame(&task_snapshot, &frame);
    // First dispatch goes through switch_to like every other: the seeded
    // return address runs the ring-3 entry thunk on this task's stack.
    task.esp = seed_kernel_stack(task.tf, to_user_mode_entry_addr());

    // The kernel half of the address space is now replicated; no kernel
    // PDE may change from here on.
    paging::freeze_kernel_pdes();
    Ok(())
}

/// Address of the ring-3 entry thunk, for kernel-stack seeding.
pub(crate) fn to_user_mode_entry_addr() -> u32 {
    to_user_mode_entry as usize as u32
}

/// First entry into ring 3 for the current task. Runs on the task's own
/// kernel stack with interrupts off, right after `switch_to` released
/// the previous task; never returns.
extern "C" fn to_user_mode_entry() -> ! {
    let id = current_id().expect("user entry thunk with no current task");
    to_user_mode(id)
}

/// Load the task's TSS stack, adopt its directory, point ESP at its
/// prepared trap frame and `iret` into ring 3.
pub fn to_user_mode(id: TaskId) -> ! {
    let (tf, cr3, esp0) = {
        let table = TASKS.lock();
        let task = table.get(id).expect("to_user_mode on a dead task");
        (task.tf, task.cr3, task.esp0)
    };
    gdt::set_kernel_stack(esp0);
    // SAFETY: the frame at `tf` was fully seeded by prepare_user (or
    // fork); cr3 names a directory whose kernel half is the canonical
    // alias, so the exit path stays mapped across the switch.
    unsafe { context::enter_user(tf, cr3.as_u32()) }
}

/// Adopt the boot thread as task 0 (kernel task, currently running on
/// the boot stack). Gives the scheduler something to switch away from
/// and back to; the slot has no owned stack page, so the reaper skips
/// it.
pub fn adopt_boot_task(boot_stack_top: u32) -> Result<TaskId, KernelError> {
    let mut table = TASKS.lock();
    let pid = table.take_pid();
    let task = Task {
        pid,
        ppid: 0,
        state: TaskState::Running,
        kstack: 0,
        kstack_phys: PhysAddr::new(0),
        esp0: boot_stack_top,
        esp: 0,
        tf: 0,
        cr3: paging::kernel_pd_phys(),
        user_stack_top: 0,
        exit_code: 0,
        prev: NO_TASK,
        next: NO_TASK,
    };
    let id = table.insert(task)?;
    set_current(id);
    Ok(id)
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_tests() {
    *TASKS.lock() = TaskTable::new();
    CURRENT.store(NO_TASK, Ordering::Release);
}
