//! Page-directory and page-table manipulation.
//!
//! IA-32 two-level paging: a 4 KiB page directory of 1024 entries, each
//! naming a 4 KiB page table of 1024 entries. PDE indices 768..1023 span
//! the kernel half (0xC0000000..). Three invariants rule this module:
//!
//! * every live task's directory aliases the canonical kernel directory
//!   bitwise in the kernel half, with the U/S bit left alone;
//! * a present user PDE names a page table owned by exactly one task;
//! * kernel-side PDEs never change once the first user task exists — all
//!   kernel page tables are in place before that (the canonical-directory
//!   strategy; a broadcast update scheme was rejected as needless here).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use super::addr::{frame_ptr, phys_to_virt, PhysAddr, VirtAddr, PAGE_SIZE};
use super::{early, pmm};
use crate::arch::x86::tlb;
use crate::error::VmError;

/// First page-directory index of the kernel half.
pub const KERNEL_PDE_FIRST: usize = 768;

bitflags! {
    /// Low twelve bits of a PDE/PTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const PAGE_SIZE_4M  = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

impl PteFlags {
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// One 4 KiB table of 1024 entries — used for both directories and
/// tables.
#[repr(C, align(4096))]
pub struct PageTable(pub [u32; 1024]);

impl PageTable {
    pub const fn zeroed() -> Self {
        Self([0; 1024])
    }
}

/// Frame number half of an entry.
pub const fn entry_frame(entry: u32) -> PhysAddr {
    PhysAddr::new(entry & !0xFFF)
}

pub const fn entry_present(entry: u32) -> bool {
    entry & PteFlags::PRESENT.bits() != 0
}

struct TableCell(UnsafeCell<PageTable>);

// SAFETY: mutation happens at init or under the interrupts-off
// discipline; the cell only makes the aliasing explicit.
unsafe impl Sync for TableCell {}

/// The canonical kernel page directory. The boot code installs it in CR3
/// and fills the first entries; everything else is populated here.
#[no_mangle]
static KERNEL_PAGE_DIR: TableCell = TableCell(UnsafeCell::new(PageTable::zeroed()));

/// Twin statically-allocated page tables backing the boot-time 8 MiB
/// window (both the identity view and the 0xC0000000 alias).
#[no_mangle]
static BOOT_PT0: TableCell = TableCell(UnsafeCell::new(PageTable::zeroed()));
#[no_mangle]
static BOOT_PT1: TableCell = TableCell(UnsafeCell::new(PageTable::zeroed()));

/// Set once the first user task exists; kernel PDEs are frozen from then
/// on (the canonical-directory aliasing strategy depends on it).
static KERNEL_PDES_FROZEN: AtomicBool = AtomicBool::new(false);

pub fn kernel_pd() -> *mut PageTable {
    KERNEL_PAGE_DIR.0.get()
}

/// Physical address the hardware uses for the canonical directory.
#[cfg(target_os = "none")]
pub fn kernel_pd_phys() -> PhysAddr {
    super::addr::virt_to_phys(VirtAddr::new(kernel_pd() as u32))
}

/// Host stand-in: a sentinel that is compared but never dereferenced as a
/// physical frame.
#[cfg(not(target_os = "none"))]
pub fn kernel_pd_phys() -> PhysAddr {
    PhysAddr::new(0xFFFF_F000)
}

pub fn freeze_kernel_pdes() {
    KERNEL_PDES_FROZEN.store(true, Ordering::Release);
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_tests() {
    KERNEL_PDES_FROZEN.store(false, Ordering::Release);
    // SAFETY: test-only, serialized by the arena test guard.
    unsafe {
        (*kernel_pd()).0 = [0; 1024];
        (*BOOT_PT0.0.get()).0 = [0; 1024];
        (*BOOT_PT1.0.get()).0 = [0; 1024];
    }
}

fn table_at(pa: PhysAddr) -> *mut PageTable {
    frame_ptr(pa) as *mut PageTable
}

/// Make `phys_to_virt(pa)` reachable through the canonical kernel
/// directory, allocating the kernel page table from the early arena if it
/// does not exist yet.
pub fn ensure_kernel_reach(pa: PhysAddr) -> Result<(), VmError> {
    let va = phys_to_virt(pa);
    let di = va.pde_index();
    // SAFETY: the canonical directory is mutated only at init or with
    // interrupts off; both hold for our callers.
    let pd = unsafe { &mut (*kernel_pd()).0 };
    if !entry_present(pd[di]) {
        if KERNEL_PDES_FROZEN.load(Ordering::Acquire) {
            log::error!(
                "paging: kernel PDE {} requested after freeze (pa={:#x})",
                di,
                pa.as_u32()
            );
        }
        let pt_pa = early::alloc_early_page_table().ok_or(VmError::EarlyTablesExhausted)?;
        pd[di] = pt_pa.as_u32() | PteFlags::KERNEL_RW.bits();
    }
    // SAFETY: the PDE is present and names a frame we own.
    let pt = unsafe { &mut (*table_at(entry_frame(pd[di]))).0 };
    let ti = va.pte_index();
    if !entry_present(pt[ti]) {
        pt[ti] = pa.as_u32() | PteFlags::KERNEL_RW.bits();
        tlb::flush_page(va);
    }
    Ok(())
}

/// Populate the direct map for a physical range in bulk (used at init,
/// before the PMM takes over the range — the buddy free lists live inside
/// the frames).
pub fn ensure_direct_map(base: PhysAddr, pages: u32) -> Result<(), VmError> {
    let mut pa = base.align_down();
    let end = base.as_u32() + pages * PAGE_SIZE as u32;
    while pa.as_u32() < end {
        ensure_kernel_reach(pa)?;
        pa = pa.offset(PAGE_SIZE as u32);
    }
    Ok(())
}

fn map_in(pd: *mut PageTable, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), VmError> {
    if !pa.is_page_aligned() || va.as_u32() % PAGE_SIZE as u32 != 0 {
        return Err(VmError::BadAddress {
            addr: if pa.is_page_aligned() {
                va.as_u32()
            } else {
                pa.as_u32()
            },
        });
    }
    let di = va.pde_index();
    // SAFETY: callers pass either the canonical directory or a directory
    // frame they own, under the interrupts-off discipline.
    let pd = unsafe { &mut (*pd).0 };
    if !entry_present(pd[di]) {
        let pt_pa = pmm::alloc_page().ok_or(VmError::OutOfMemory)?;
        // A fresh table frame may live where no kernel page table reaches
        // yet; populate the canonical directory on demand first.
        ensure_kernel_reach(pt_pa)?;
        super::addr::zero_frame(pt_pa);
        pd[di] = pt_pa.as_u32() | (flags.bits() & 0xFFF) | PteFlags::PRESENT.bits();
    }
    // SAFETY: the PDE is present; its frame is a page table reachable
    // through the direct map.
    let pt = unsafe { &mut (*table_at(entry_frame(pd[di]))).0 };
    pt[va.pte_index()] = (pa.as_u32() & !0xFFF) | (flags.bits() & 0xFFF) | PteFlags::PRESENT.bits();
    tlb::flush_page(va);
    Ok(())
}

/// Make sure the canonical directory has a page table for `va` without
/// installing any page mapping. Used at init to pre-create the PDEs
/// (highmem window, heap) that must exist before the kernel half is
/// frozen.
pub fn ensure_kernel_pde(va: VirtAddr) -> Result<(), VmError> {
    let di = va.pde_index();
    // SAFETY: init-time or interrupts-off mutation of the canonical
    // directory.
    let pd = unsafe { &mut (*kernel_pd()).0 };
    if entry_present(pd[di]) {
        return Ok(());
    }
    let pt_pa = pmm::alloc_page().ok_or(VmError::OutOfMemory)?;
    ensure_kernel_reach(pt_pa)?;
    super::addr::zero_frame(pt_pa);
    pd[di] = pt_pa.as_u32() | PteFlags::KERNEL_RW.bits();
    Ok(())
}

/// Install `va -> pa` in the directory at physical address `pd_pa`,
/// allocating the page table on demand.
pub fn map_page(pd_pa: PhysAddr, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), VmError> {
    map_in(table_at(pd_pa), va, pa, flags)
}

/// Install `va -> pa` in the canonical kernel directory.
pub fn map_kernel_page(va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), VmError> {
    map_in(kernel_pd(), va, pa, flags)
}

/// Drop the mapping for `va`; returns the frame it pointed at.
pub fn unmap_page(pd_pa: PhysAddr, va: VirtAddr) -> Result<PhysAddr, VmError> {
    // SAFETY: directory frame owned by the caller, interrupts off.
    let pd = unsafe { &mut (*table_at(pd_pa)).0 };
    let di = va.pde_index();
    if !entry_present(pd[di]) {
        return Err(VmError::NotMapped { va: va.as_u32() });
    }
    // SAFETY: present PDE names a live page table.
    let pt = unsafe { &mut (*table_at(entry_frame(pd[di]))).0 };
    let ti = va.pte_index();
    if !entry_present(pt[ti]) {
        return Err(VmError::NotMapped { va: va.as_u32() });
    }
    let pa = entry_frame(pt[ti]);
    pt[ti] = 0;
    tlb::flush_page(va);
    Ok(pa)
}

/// Read the raw PTE for `va` in the directory at `pd_pa`.
pub fn pte_at(pd_pa: PhysAddr, va: VirtAddr) -> Option<u32> {
    // SAFETY: read-only walk of caller-owned tables.
    let pd = unsafe { &(*table_at(pd_pa)).0 };
    let pde = pd[va.pde_index()];
    if !entry_present(pde) {
        return None;
    }
    // SAFETY: present PDE names a live page table.
    let pt = unsafe { &(*table_at(entry_frame(pde))).0 };
    Some(pt[va.pte_index()])
}

/// Rewrite the raw PTE for `va`; the page table must already exist.
pub fn set_pte(pd_pa: PhysAddr, va: VirtAddr, entry: u32) -> Result<(), VmError> {
    // SAFETY: caller owns the directory, interrupts off.
    let pd = unsafe { &mut (*table_at(pd_pa)).0 };
    let pde = pd[va.pde_index()];
    if !entry_present(pde) {
        return Err(VmError::NotMapped { va: va.as_u32() });
    }
    // SAFETY: present PDE names a live page table.
    let pt = unsafe { &mut (*table_at(entry_frame(pde))).0 };
    pt[va.pte_index()] = entry;
    tlb::flush_page(va);
    Ok(())
}

/// Fill the two boot page tables so the 8 MiB starting at `base_va` maps
/// one-to-one (va == pa) and hang them off the canonical directory.
///
/// Used on boot to make the first 8 MiB universally addressable before
/// the direct map is populated.
pub fn identity_map_8m_4k(base_va: VirtAddr) {
    let start = base_va.align_down().as_u32();
    // SAFETY: init-time, single thread; the twin tables are ours.
    let (pt0, pt1) = unsafe { (&mut (*BOOT_PT0.0.get()).0, &mut (*BOOT_PT1.0.get()).0) };
    for i in 0..1024u32 {
        pt0[i as usize] = (start + i * PAGE_SIZE as u32) | PteFlags::KERNEL_RW.bits();
        pt1[i as usize] = (start + 0x40_0000 + i * PAGE_SIZE as u32) | PteFlags::KERNEL_RW.bits();
    }
    let di = (start >> 22) as usize;
    // SAFETY: init-time mutation of the canonical directory.
    let pd = unsafe { &mut (*kernel_pd()).0 };
    pd[di] = pt0_phys() | PteFlags::KERNEL_RW.bits();
    pd[di + 1] = pt1_phys() | PteFlags::KERNEL_RW.bits();
    tlb::flush_all();
}

#[cfg(target_os = "none")]
fn pt0_phys() -> u32 {
    super::addr::virt_to_phys(VirtAddr::new(BOOT_PT0.0.get() as u32)).as_u32()
}

#[cfg(target_os = "none")]
fn pt1_phys() -> u32 {
    super::addr::virt_to_phys(VirtAddr::new(BOOT_PT1.0.get() as u32)).as_u32()
}

// Host stand-ins: stable sentinels, never dereferenced as frames.
#[cfg(not(target_os = "none"))]
fn pt0_phys() -> u32 {
    0xFFFF_D000
}

#[cfg(not(target_os = "none"))]
fn pt1_phys() -> u32 {
    0xFFFF_E000
}

/// Copy the kernel half of the canonical directory into a fresh task
/// directory, bit for bit. The U/S bits are deliberately untouched:
/// kernel pages stay supervisor-only in every address space. The DMA
/// region's identity window sits below the kernel split but must also be
/// present everywhere, so its PDEs are aliased the same way.
pub fn clone_kernel_half(child_pd_pa: PhysAddr) {
    // SAFETY: the child directory frame is fresh and exclusively ours;
    // the canonical directory is read-only here.
    let src = unsafe { &(*kernel_pd()).0 };
    let dst = unsafe { &mut (*table_at(child_pd_pa)).0 };
    dst[KERNEL_PDE_FIRST..1024].copy_from_slice(&src[KERNEL_PDE_FIRST..1024]);
    for di in 0..KERNEL_PDE_FIRST {
        if super::dma::pde_in_window(di) {
            dst[di] = src[di];
        }
    }
}

/// Debug check for the kernel-half aliasing invariant.
pub fn kernel_half_matches(pd_pa: PhysAddr) -> bool {
    // SAFETY: read-only comparison.
    let canon = unsafe { &(*kernel_pd()).0 };
    let other = unsafe { &(*table_at(pd_pa)).0 };
    canon[KERNEL_PDE_FIRST..1024] == other[KERNEL_PDE_FIRST..1024]
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::addr::test_arena;

    const BASE: u32 = 0x40_0000;

    fn setup(pages: u32) {
        // Arena spans the early PT window and the managed range so the
        // lazy kernel-table path works too.
        test_arena::install(early::EARLY_PT_BASE, ((BASE - early::EARLY_PT_BASE) / PAGE_SIZE as u32 + pages) as usize);
        early::reset_for_tests();
        reset_for_tests();
        pmm::PMM.lock().init(PhysAddr::new(BASE), pages, pages / 2);
    }

    #[test]
    fn map_page_reads_back() {
        let _guard = test_arena::lock_for_test();
        setup(64);
        let pd = pmm::alloc_page().expect("pd frame");
        crate::mm::addr::zero_frame(pd);
        let frame = pmm::alloc_page().expect("target frame");
        let va = VirtAddr::new(0x0800_0000);
        map_page(pd, va, frame, PteFlags::USER_RW).expect("map must succeed");
        let pte = pte_at(pd, va).expect("pte must be present");
        assert_eq!(
            pte,
            frame.as_u32() | PteFlags::USER_RW.bits() | PteFlags::PRESENT.bits()
        );
    }

    #[test]
    fn map_allocates_table_and_populates_kernel_window() {
        let _guard = test_arena::lock_for_test();
        setup(64);
        let pd = pmm::alloc_page().expect("pd frame");
        crate::mm::addr::zero_frame(pd);
        let before = pmm::stats().free;
        let frame = pmm::alloc_page().expect("target frame");
        map_page(pd, VirtAddr::new(0x0040_0000), frame, PteFlags::USER_RW)
            .expect("map must succeed");
        // One page went to the new page table besides the target frame.
        assert_eq!(pmm::stats().free, before - 2);
        // The canonical directory can reach the new table through the
        // direct map.
        let pte = pte_at(pd, VirtAddr::new(0x0040_0000)).expect("present");
        let pt_pa = {
            // SAFETY: test-only read of the mapped directory.
            let pdir = unsafe { &(*table_at(pd)).0 };
            entry_frame(pdir[1])
        };
        assert!(entry_present(pte));
        let kva = phys_to_virt(pt_pa);
        let kpd = unsafe { &(*kernel_pd()).0 };
        assert!(entry_present(kpd[kva.pde_index()]));
    }

    #[test]
    fn boundary_flags() {
        let _guard = test_arena::lock_for_test();
        setup(64);
        let pd = pmm::alloc_page().expect("pd frame");
        crate::mm::addr::zero_frame(pd);
        let f1 = pmm::alloc_page().expect("frame");
        let f2 = pmm::alloc_page().expect("frame");
        // Last user page maps with U/S=1; first kernel page only without.
        map_page(pd, VirtAddr::new(0xBFFF_F000), f1, PteFlags::USER_RW)
            .expect("user boundary page");
        map_page(pd, VirtAddr::new(0xC000_0000), f2, PteFlags::KERNEL_RW)
            .expect("kernel boundary page");
        let user = pte_at(pd, VirtAddr::new(0xBFFF_F000)).expect("present");
        let kern = pte_at(pd, VirtAddr::new(0xC000_0000)).expect("present");
        assert!(user & PteFlags::USER.bits() != 0);
        assert!(kern & PteFlags::USER.bits() == 0);
    }

    #[test]
    fn unmap_returns_frame() {
        let _guard = test_arena::lock_for_test();
        setup(64);
        let pd = pmm::alloc_page().expect("pd frame");
        crate::mm::addr::zero_frame(pd);
        let frame = pmm::alloc_page().expect("frame");
        let va = VirtAddr::new(0x0900_0000);
        map_page(pd, va, frame, PteFlags::USER_RW).expect("map");
        assert_eq!(unmap_page(pd, va).expect("unmap"), frame);
        assert_eq!(pte_at(pd, va), Some(0));
        assert_eq!(unmap_page(pd, va), Err(VmError::NotMapped { va: va.as_u32() }));
    }

    #[test]
    fn kernel_half_clone_is_bitwise() {
        let _guard = test_arena::lock_for_test();
        setup(64);
        // Put something in the kernel half first.
        ensure_kernel_reach(PhysAddr::new(BASE)).expect("direct map entry");
        let pd = pmm::alloc_page().expect("pd frame");
        crate::mm::addr::zero_frame(pd);
        clone_kernel_half(pd);
        assert!(kernel_half_matches(pd));
    }

    #[test]
    fn identity_fill_pattern() {
        let _guard = test_arena::lock_for_test();
        setup(16);
        identity_map_8m_4k(VirtAddr::new(0));
        // SAFETY: test-only read of the twin tables.
        let (pt0, pt1) = unsafe { (&(*BOOT_PT0.0.get()).0, &(*BOOT_PT1.0.get()).0) };
        assert_eq!(pt0[0], PteFlags::KERNEL_RW.bits());
        assert_eq!(pt0[5], 5 * PAGE_SIZE as u32 | PteFlags::KERNEL_RW.bits());
        assert_eq!(pt1[0], 0x40_0000 | PteFlags::KERNEL_RW.bits());
        let pd = unsafe { &(*kernel_pd()).0 };
        assert!(entry_present(pd[0]));
        assert!(entry_present(pd[1]));
    }
}
