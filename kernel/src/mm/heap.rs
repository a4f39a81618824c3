//! Kernel heap: `kmalloc` / `kfree` for the driver boundary.
//!
//! Backed by `linked_list_allocator` over a direct-mapped region handed
//! over by the PMM at init. On bare metal the same heap serves as the
//! `#[global_allocator]` (installed in `lib.rs`); the C-style entry
//! points here additionally carry the allocation size in a header word so
//! `kfree` needs no layout from the caller.

use core::alloc::Layout;

use spin::Mutex;

use super::addr::{frame_ptr, PhysAddr, PAGE_SIZE};
use super::pmm;

/// Heap size carved from the kernel zone at init (4 MiB).
pub const HEAP_PAGES: u32 = 1024;

/// Header prepended to every kmalloc block.
const HEADER: usize = core::mem::size_of::<usize>() * 2;

static HEAP: Mutex<linked_list_allocator::Heap> = Mutex::new(linked_list_allocator::Heap::empty());

/// Bytes currently handed out (headers included).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    pub used_bytes: usize,
    pub free_bytes: usize,
}

/// Claim `HEAP_PAGES` from the PMM and turn them into the kernel heap.
pub fn init() -> Option<()> {
    let base = pmm::alloc_pages(HEAP_PAGES)?;
    init_at(base, HEAP_PAGES as usize * PAGE_SIZE)
}

/// Initialize the heap over an explicit region (tests use a small one).
pub fn init_at(base: PhysAddr, bytes: usize) -> Option<()> {
    let ptr = frame_ptr(base);
    // SAFETY: the region was just allocated (or reserved by the caller)
    // and is direct-mapped; the heap takes exclusive ownership of it.
    unsafe {
        HEAP.lock().init(ptr, bytes);
    }
    log::info!("heap: {} KiB at phys {:#x}", bytes / 1024, base.as_u32());
    Some(())
}

pub fn stats() -> HeapStats {
    let heap = HEAP.lock();
    HeapStats {
        used_bytes: heap.used(),
        free_bytes: heap.free(),
    }
}

/// Allocate `size` bytes, 8-byte aligned. Null on exhaustion.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let Ok(layout) = Layout::from_size_align(size + HEADER, 8) else {
        return core::ptr::null_mut();
    };
    match HEAP.lock().allocate_first_fit(layout) {
        Ok(block) => {
            let p = block.as_ptr();
            // SAFETY: the block is at least HEADER bytes; stash the full
            // layout size so kfree can rebuild it.
            unsafe {
                (p as *mut usize).write(layout.size());
                p.add(HEADER)
            }
        }
        Err(()) => {
            log::warn!("heap: kmalloc({}) failed", size);
            core::ptr::null_mut()
        }
    }
}

/// Allocate and zero.
pub fn kzalloc(size: usize) -> *mut u8 {
    let p = kmalloc(size);
    if !p.is_null() {
        // SAFETY: kmalloc returned a live block of at least `size` bytes.
        unsafe {
            core::ptr::write_bytes(p, 0, size);
        }
    }
    p
}

/// Return a block from [`kmalloc`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must come from `kmalloc`/`kzalloc` and must not be used again.
pub unsafe fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: per the contract, `ptr` is HEADER bytes past a block we
    // allocated, whose first word holds the layout size.
    unsafe {
        let base = ptr.sub(HEADER);
        let size = (base as *const usize).read();
        let layout = Layout::from_size_align_unchecked(size, 8);
        HEAP.lock()
            .deallocate(core::ptr::NonNull::new_unchecked(base), layout);
    }
}

/// Adapter installing the same heap as the Rust global allocator on bare
/// metal (see `lib.rs`).
pub struct KernelAllocator;

// SAFETY: delegates to the locked heap; blocks are never handed out
// twice and deallocate receives the layout alloc was given.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.lock()
            .allocate_first_fit(layout)
            .map(|p| p.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(p) = core::ptr::NonNull::new(ptr) {
            // SAFETY: `ptr`/`layout` come from a matching alloc call.
            unsafe {
                HEAP.lock().deallocate(p, layout);
            }
        }
    }
}
