//! Kernel initialization, in dependency order.
//!
//! The boot assembly has already enabled paging over the first 8 MiB
//! (identity + higher-half alias) and called in with the Multiboot-2
//! magic and info pointer. From here: logging → boot info → identity
//! window → direct map → DMA region → PMM → heap → highmem window →
//! descriptor tables → first user task → scheduler. After `run` hands
//! control to the scheduler the kernel is purely interrupt-driven.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::arch::x86::{gdt, idt, multiboot};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::{dma, early, heap, highmem, paging, pmm, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::task;

/// Physical base of the PMM-managed range: above the kernel image, the
/// early page-table arena and the DMA region.
pub const MANAGED_BASE: u32 = 0x0100_0000;

/// Bring the core up and enter the scheduler. Called from `kernel_main`
/// with interrupts off; never returns.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn run(magic: u32, mbi: u32) -> ! {
    crate::logging::init();

    // SAFETY: mbi is the EBX value the loader handed to the entry stub,
    // and the first 8 MiB (where GRUB puts the info) are mapped.
    let info = unsafe { multiboot::init(magic, mbi) }.unwrap_or_else(|| {
        crate::println!("bootstrap: no usable multiboot info, halting");
        crate::arch::x86::halt_forever()
    });

    // Make the first 8 MiB addressable one-to-one for the early
    // allocators and the module image.
    paging::identity_map_8m_4k(VirtAddr::new(0));

    // Direct-map the managed range, then hand it to the buddy allocator
    // (whose free lists live inside the managed frames).
    let total = info.total_memory().min(crate::mm::DIRECT_MAP_LIMIT as u64) as u32;
    let managed_pages = total.saturating_sub(MANAGED_BASE) / PAGE_SIZE as u32;
    if managed_pages == 0 {
        crate::println!("bootstrap: not enough memory ({} KiB), halting", total / 1024);
        crate::arch::x86::halt_forever()
    }
    if paging::ensure_direct_map(PhysAddr::new(MANAGED_BASE), managed_pages).is_err() {
        crate::println!("bootstrap: cannot populate the direct map, halting");
        crate::arch::x86::halt_forever()
    }
    pmm::init(
        PhysAddr::new(MANAGED_BASE),
        managed_pages,
        pmm::KERNEL_RESERVE_PAGES,
    );
    // The DMA window's page tables come from the PMM; its PDEs must be
    // in place before the first task directory aliases the kernel half.
    if dma::init().is_err() {
        crate::println!("bootstrap: cannot map the DMA region, halting");
        crate::arch::x86::halt_forever()
    }
    if heap::init().is_none() {
        crate::println!("bootstrap: heap init failed, halting");
        crate::arch::x86::halt_forever()
    }
    if highmem::init().is_err() {
        crate::println!("bootstrap: highmem window init failed, halting");
        crate::arch::x86::halt_forever()
    }
    log::info!(
        "bootstrap: early pool used {} bytes, {:?}",
        early::early_used(),
        pmm::stats()
    );

    gdt::init();
    idt::init();

    // The boot thread becomes task 0 (kernel task, the idle loop).
    extern "C" {
        static boot_stack_top: u8;
    }
    // SAFETY: address of the asm-defined stack top symbol.
    let stack_top = unsafe { &boot_stack_top as *const u8 as u32 };
    if task::adopt_boot_task(stack_top).is_err() {
        crate::println!("bootstrap: cannot adopt boot task, halting");
        crate::arch::x86::halt_forever()
    }

    // First user task from the boot module.
    match info.module {
        Some((start, end)) if end > start => {
            // SAFETY: the module lies in the identity-mapped low 8 MiB
            // (GRUB loads it right after the kernel image).
            let image = unsafe {
                core::slice::from_raw_parts(
                    crate::mm::frame_ptr(PhysAddr::new(start)),
                    (end - start) as usize,
                )
            };
            match spawn_init(image) {
                Ok(pid) => log::info!("bootstrap: init task pid {}", pid),
                Err(e) => {
                    crate::println!("bootstrap: cannot load init module: {}", e);
                    crate::arch::x86::halt_forever()
                }
            }
        }
        _ => crate::println!("bootstrap: no boot module, staying in the idle loop"),
    }

    crate::sched::idle_loop()
}

/// Create the first user task from an ELF image.
pub fn spawn_init(image: &[u8]) -> Result<u32, crate::KernelError> {
    let id = {
        let mut table = task::TASKS.lock();
        task::task_load(&mut table, 0, true)?
    };
    task::prepare_user(id, image)?;
    let pid = task::TASKS
        .lock()
        .get(id)
        .map(|t| t.pid)
        .unwrap_or_default();
    Ok(pid)
}
