//! ELF32 user-image loader.
//!
//! Reads the first Multiboot-2 module as a statically linked ELF32
//! executable: each PT_LOAD segment is copied page by page into freshly
//! allocated user frames (file bytes first, the .bss tail zeroed) and
//! mapped present+writable+user. Below the user/kernel boundary a
//! four-page stack is mapped, seeded with a minimal SysV-style block —
//! `argc = 0`, a NULL `argv` terminator, a NULL `envp` terminator, and a
//! guard band of trailing NULLs against runtime over-read.

use crate::error::{ElfError, KernelError};
use crate::mm::paging::{self, entry_frame, PteFlags};
use crate::mm::{frame_ptr, pmm, PhysAddr, VirtAddr, KERNEL_VA_OFFSET, PAGE_SIZE};

/// Exclusive top of the user stack (the user/kernel boundary; the
/// topmost stack page is 0xBFFFF000).
pub const USER_STACK_TOP: u32 = KERNEL_VA_OFFSET;

/// User stack size: 4 pages = 16 KiB.
pub const USER_STACK_PAGES: u32 = 4;

/// argc + argv NULL + envp NULL + 32 guard words.
const ABI_WORDS: u32 = 35;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// What the task core needs to seed the entry trap frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u32,
    pub user_esp: u32,
}

fn read_u16(image: &[u8], off: usize) -> Result<u16, ElfError> {
    let b = image.get(off..off + 2).ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(image: &[u8], off: usize) -> Result<u32, ElfError> {
    let b = image.get(off..off + 4).ok_or(ElfError::Truncated)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Map the page holding `va` in `pd`, reusing an existing frame when two
/// segments share a page, and return the frame.
fn user_frame_for(pd: PhysAddr, va: VirtAddr) -> Result<PhysAddr, KernelError> {
    if let Some(pte) = paging::pte_at(pd, va) {
        if paging::entry_present(pte) {
            return Ok(entry_frame(pte));
        }
    }
    let frame = pmm::alloc_pages_kind(1, pmm::AllocKind::User).ok_or(KernelError::OutOfMemory)?;
    crate::mm::zero_frame(frame);
    paging::map_page(pd, va, frame, PteFlags::USER_RW).map_err(KernelError::Vm)?;
    Ok(frame)
}

/// Load `image` into the directory `pd`. On success every PT_LOAD
/// segment and the user stack are mapped and the initial stack block is
/// in place.
pub fn load_module_to_user(pd: PhysAddr, image: &[u8]) -> Result<LoadedImage, KernelError> {
    if image.get(0..4) != Some(&ELF_MAGIC) {
        return Err(ElfError::BadMagic.into());
    }
    if image.get(4) != Some(&ELFCLASS32) || image.get(5) != Some(&ELFDATA2LSB) {
        return Err(ElfError::WrongClass.into());
    }
    if read_u16(image, 18)? != EM_386 {
        return Err(ElfError::WrongClass.into());
    }
    let entry = read_u32(image, 24)?;
    let phoff = read_u32(image, 28)? as usize;
    let phentsize = read_u16(image, 42)? as usize;
    let phnum = read_u16(image, 44)? as usize;

    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(image, ph)? != PT_LOAD {
            continue;
        }
        let p_offset = read_u32(image, ph + 4)? as usize;
        let p_vaddr = read_u32(image, ph + 8)?;
        let p_filesz = read_u32(image, ph + 16)? as usize;
        let p_memsz = read_u32(image, ph + 20)? as usize;
        if p_memsz == 0 {
            continue;
        }
        let seg_end = p_vaddr
            .checked_add(p_memsz as u32)
            .ok_or(ElfError::BadSegment { vaddr: p_vaddr })?;
        if seg_end > KERNEL_VA_OFFSET {
            return Err(ElfError::BadSegment { vaddr: p_vaddr }.into());
        }
        if p_offset + p_filesz > image.len() {
            return Err(ElfError::Truncated.into());
        }

        let mut va = VirtAddr::new(p_vaddr).align_down();
        while va.as_u32() < seg_end {
            let frame = user_frame_for(pd, va)?;
            // Overlap of this page with the segment's file bytes.
            let page_start = va.as_u32();
            let copy_from = p_vaddr.max(page_start);
            let copy_end = (p_vaddr + p_filesz as u32).min(page_start + PAGE_SIZE as u32);
            if copy_end > copy_from {
                let len = (copy_end - copy_from) as usize;
                let src = &image[p_offset + (copy_from - p_vaddr) as usize..][..len];
                // SAFETY: dst stays inside the single frame just mapped;
                // src bounds were checked against the image above.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        frame_ptr(frame).add((copy_from - page_start) as usize),
                        len,
                    );
                }
            }
            va = va.offset(PAGE_SIZE as u32);
        }
        log::debug!(
            "loader: segment va {:#x} filesz {:#x} memsz {:#x}",
            p_vaddr,
            p_filesz,
            p_memsz
        );
    }

    // User stack, top page flush against the user/kernel boundary.
    for i in 1..=USER_STACK_PAGES {
        let va = VirtAddr::new(USER_STACK_TOP - i * PAGE_SIZE as u32);
        let frame =
            pmm::alloc_pages_kind(1, pmm::AllocKind::User).ok_or(KernelError::OutOfMemory)?;
        crate::mm::zero_frame(frame);
        paging::map_page(pd, va, frame, PteFlags::USER_RW).map_err(KernelError::Vm)?;
    }

    // Initial stack block. The frames were zeroed, so argc and every
    // NULL are already in place; the ESP just has to point at it.
    let user_esp = USER_STACK_TOP - ABI_WORDS * 4;

    Ok(LoadedImage { entry, user_esp })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::addr::test_arena;
    use crate::mm::{early, zero_frame};

    const BASE: u32 = 0x100_0000;

    fn setup() -> PhysAddr {
        test_arena::install(early::EARLY_PT_BASE, 3584 + 512);
        early::reset_for_tests();
        paging::reset_for_tests();
        pmm::PMM.lock().init(PhysAddr::new(BASE), 512, 128);
        let pd = pmm::alloc_page().expect("pd");
        zero_frame(pd);
        pd
    }

    /// A tiny valid ELF32: one PT_LOAD at 0x08048000, 5 file bytes,
    /// 0x1800 memsz so the .bss tail spans a second page.
    fn build_elf(entry: u32) -> std::vec::Vec<u8> {
        let mut img = std::vec![0u8; 52 + 32 + 16];
        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = ELFCLASS32;
        img[5] = ELFDATA2LSB;
        img[6] = 1; // EV_CURRENT
        img[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        img[18..20].copy_from_slice(&EM_386.to_le_bytes());
        img[24..28].copy_from_slice(&entry.to_le_bytes());
        img[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        img[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        img[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum
        // Program header at 52.
        img[52..56].copy_from_slice(&PT_LOAD.to_le_bytes());
        img[56..60].copy_from_slice(&84u32.to_le_bytes()); // p_offset
        img[60..64].copy_from_slice(&0x0804_8000u32.to_le_bytes()); // p_vaddr
        img[68..72].copy_from_slice(&5u32.to_le_bytes()); // p_filesz
        img[72..76].copy_from_slice(&0x1800u32.to_le_bytes()); // p_memsz
        img[84..89].copy_from_slice(b"CODE!");
        img
    }

    #[test]
    fn loads_segments_stack_and_abi_block() {
        let _guard = test_arena::lock_for_test();
        let pd = setup();
        let img = build_elf(0x0804_8000);
        let loaded = load_module_to_user(pd, &img).expect("load");
        assert_eq!(loaded.entry, 0x0804_8000);
        assert_eq!(loaded.user_esp, USER_STACK_TOP - 140);

        // File bytes landed at the segment start; .bss page is mapped
        // and zeroed.
        let pte = paging::pte_at(pd, VirtAddr::new(0x0804_8000)).expect("pte");
        let frame = entry_frame(pte);
        // SAFETY: test arena frame.
        let bytes = unsafe { core::slice::from_raw_parts(frame_ptr(frame), 5) };
        assert_eq!(bytes, b"CODE!");
        let bss = paging::pte_at(pd, VirtAddr::new(0x0804_9000)).expect("bss page present");
        assert!(paging::entry_present(bss));

        // Four stack pages, topmost at 0xBFFFF000, all user-writable.
        for i in 1..=USER_STACK_PAGES {
            let va = VirtAddr::new(USER_STACK_TOP - i * PAGE_SIZE as u32);
            let pte = paging::pte_at(pd, va).expect("stack pte");
            assert!(pte & PteFlags::USER.bits() != 0);
            assert!(pte & PteFlags::WRITABLE.bits() != 0);
        }

        // The ABI block at [esp]: argc = 0 and NULLs all the way up.
        let top_frame = entry_frame(
            paging::pte_at(pd, VirtAddr::new(USER_STACK_TOP - PAGE_SIZE as u32)).expect("pte"),
        );
        let off = (loaded.user_esp % PAGE_SIZE as u32) as usize;
        // SAFETY: test arena frame.
        let block = unsafe { core::slice::from_raw_parts(frame_ptr(top_frame).add(off), 140) };
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_images() {
        let _guard = test_arena::lock_for_test();
        let pd = setup();
        assert_eq!(
            load_module_to_user(pd, b"not an elf"),
            Err(KernelError::Elf(ElfError::BadMagic))
        );
        let mut wrong_machine = build_elf(0);
        wrong_machine[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86-64
        assert_eq!(
            load_module_to_user(pd, &wrong_machine),
            Err(KernelError::Elf(ElfError::WrongClass))
        );
        let mut kernel_segment = build_elf(0);
        kernel_segment[60..64].copy_from_slice(&0xC000_0000u32.to_le_bytes());
        assert!(matches!(
            load_module_to_user(pd, &kernel_segment),
            Err(KernelError::Elf(ElfError::BadSegment { .. }))
        ));
        let mut truncated = build_elf(0);
        truncated[68..72].copy_from_slice(&10_000u32.to_le_bytes()); // filesz > image
        assert_eq!(
            load_module_to_user(pd, &truncated),
            Err(KernelError::Elf(ElfError::Truncated))
        );
    }
}
