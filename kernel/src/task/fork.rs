//! fork: clone the current task, copy-on-write.
//!
//! The child gets its own directory: the kernel half (plus the DMA
//! window) aliases the canonical directory bitwise, and every present
//! user PDE gets a freshly allocated page table — page tables are never
//! shared between tasks. The mapped frames *are* shared, but read-only:
//! fork clears R/W in both parent and child entries and bumps the PMM
//! share count. The page-fault handler undoes the protection on first
//! write — copying the frame while others still reference it, or
//! flipping R/W back in place once the writer is the sole owner.

use super::{current_id, read_trap_frame, TaskId, TaskState, TASKS};
use crate::arch::x86::context::seed_kernel_stack;
use crate::arch::x86::tlb;
use crate::error::{KernelError, TaskError};
use crate::mm::paging::{self, entry_frame, entry_present, PageTable, PteFlags};
use crate::mm::{frame_ptr, pmm, zero_frame, PhysAddr, VirtAddr, PAGE_SIZE};

fn table_ref(pa: PhysAddr) -> *mut PageTable {
    frame_ptr(pa) as *mut PageTable
}

/// Duplicate the user half of `parent_pd` into a new directory,
/// write-protecting both sides and taking a share reference per mapped
/// frame. Returns the child directory.
pub fn clone_address_space(parent_pd: PhysAddr) -> Result<PhysAddr, KernelError> {
    let child_pd = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
    paging::ensure_kernel_reach(child_pd).map_err(KernelError::Vm)?;
    zero_frame(child_pd);
    paging::clone_kernel_half(child_pd);

    for di in 0..paging::KERNEL_PDE_FIRST {
        // SAFETY: parent directory is owned by the forking task, child
        // is fresh; interrupts are off.
        let pde = unsafe { (*table_ref(parent_pd)).0[di] };
        if !entry_present(pde) {
            continue;
        }
        if crate::mm::dma::pde_in_window(di) {
            // The DMA alias was copied with the kernel half; it is not
            // task-owned memory.
            continue;
        }
        let child_pt = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
        paging::ensure_kernel_reach(child_pt).map_err(KernelError::Vm)?;
        zero_frame(child_pt);
        let parent_pt = entry_frame(pde);
        for ti in 0..1024 {
            // SAFETY: both tables are live and exclusively reachable
            // from this path.
            let pte = unsafe { (*table_ref(parent_pt)).0[ti] };
            if !entry_present(pte) {
                continue;
            }
            let shared = pte & !PteFlags::WRITABLE.bits();
            // SAFETY: as above.
            unsafe {
                (*table_ref(parent_pt)).0[ti] = shared;
                (*table_ref(child_pt)).0[ti] = shared;
            }
            pmm::frame_get(entry_frame(pte));
        }
        // SAFETY: child directory is exclusively ours.
        unsafe {
            (*table_ref(child_pd)).0[di] = child_pt.as_u32() | (pde & 0xFFF);
        }
    }
    // Parent entries lost their write bits; drop every stale translation.
    tlb::flush_all();
    Ok(child_pd)
}

/// The fork syscall. Returns the child pid (the parent's return value);
/// the child's trap frame is a copy with `eax = 0`, so it resumes from
/// the same instruction reporting 0.
pub fn do_fork() -> Result<u32, KernelError> {
    let parent_id = current_id().ok_or(KernelError::Task(TaskError::NoCurrentTask))?;
    let (parent, parent_tf) = {
        let table = TASKS.lock();
        let parent = table
            .get(parent_id)
            .ok_or(KernelError::Task(TaskError::NoSuchTask { id: parent_id }))?
            .clone();
        let tf = read_trap_frame(&parent);
        (parent, tf)
    };
    if parent.is_kernel() {
        // Only tasks with a user half can fork.
        return Err(KernelError::Task(TaskError::NoCurrentTask));
    }

    let child_pd = clone_address_space(parent.cr3)?;

    let mut table = TASKS.lock();
    let child_id: TaskId = super::task_load(&mut table, parent.pid, true)?;
    let child = table
        .get_mut(child_id)
        .ok_or(KernelError::Task(TaskError::NoSuchTask { id: child_id }))?;
    child.cr3 = child_pd;
    child.user_stack_top = parent.user_stack_top;
    child.state = TaskState::Created;

    let mut child_tf = parent_tf;
    child_tf.eax = 0;
    let snapshot = child.clone();
    super::write_trap_frame(&snapshot, &child_tf);
    // First dispatch of the child irets straight into the copied frame.
    child.esp = seed_kernel_stack(child.tf, super::to_user_mode_entry_addr());

    let child_pid = child.pid;
    Ok(child_pid)
}

/// Resolve a write fault on a present read-only user page if it is a
/// copy-on-write page. Returns false when the fault is not ours.
pub fn try_resolve_cow(fault_va: VirtAddr) -> bool {
    let Some(id) = current_id() else {
        return false;
    };
    let cr3 = {
        let table = TASKS.lock();
        match table.get(id) {
            Some(t) if !t.is_kernel() => t.cr3,
            _ => return false,
        }
    };
    let va = fault_va.align_down();
    let Some(pte) = paging::pte_at(cr3, va) else {
        return false;
    };
    if !entry_present(pte) || pte & PteFlags::WRITABLE.bits() != 0 {
        return false;
    }
    let old = entry_frame(pte);
    let refs = pmm::frame_refs(old);
    if refs == 0 {
        // Not a tracked user frame: a genuinely read-only mapping.
        return false;
    }
    let flags = pte & 0xFFF;
    if refs > 1 {
        let Some(new) = pmm::alloc_pages_kind(1, pmm::AllocKind::User) else {
            log::error!("cow: out of user frames at {:#x}", va.as_u32());
            return false;
        };
        // SAFETY: both frames are full pages; the old one is mapped
        // read-only and cannot change under us (interrupts off).
        unsafe {
            core::ptr::copy_nonoverlapping(frame_ptr(old), frame_ptr(new), PAGE_SIZE);
        }
        if paging::set_pte(cr3, va, new.as_u32() | flags | PteFlags::WRITABLE.bits()).is_err() {
            pmm::free_page(new);
            return false;
        }
        pmm::frame_put(old);
        log::debug!(
            "cow: copied {:#x} -> {:#x} for va {:#x}",
            old.as_u32(),
            new.as_u32(),
            va.as_u32()
        );
    } else {
        // Last referent: write in place again.
        if paging::set_pte(cr3, va, pte | PteFlags::WRITABLE.bits()).is_err() {
            return false;
        }
    }
    true
}
