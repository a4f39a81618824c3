//! Multiboot-2 information parser (read-only collaborator).
//!
//! The core needs three tags: basic memory info (type 4), the loaded
//! modules (type 3, the first module is the initial user ELF), and the
//! framebuffer (type 8, only honored when it is direct RGB). The walk is
//! done once at boot and snapshotted into [`BootInfo`].

use spin::Mutex;

use crate::mm::{frame_ptr, PhysAddr};

/// EAX magic a Multiboot-2 loader hands the kernel.
pub const MULTIBOOT2_MAGIC: u32 = 0x36D7_6289;

const TAG_END: u32 = 0;
const TAG_MODULE: u32 = 3;
const TAG_BASIC_MEMINFO: u32 = 4;
const TAG_FRAMEBUFFER: u32 = 8;

/// Linear-framebuffer geometry from tag 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    /// Only type 1 (direct RGB) enables the framebuffer syscall.
    pub is_rgb: bool,
}

/// Snapshot of the boot information the core consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootInfo {
    /// Conventional memory below 1 MiB, in KiB.
    pub mem_lower_kb: u32,
    /// Memory above 1 MiB, in KiB.
    pub mem_upper_kb: u32,
    /// Physical span of the first loaded module (the initial user ELF).
    pub module: Option<(u32, u32)>,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    /// Total physical memory implied by the basic meminfo tag, bytes.
    pub fn total_memory(&self) -> u64 {
        (self.mem_upper_kb as u64 + 1024) * 1024
    }
}

static BOOT_INFO: Mutex<Option<BootInfo>> = Mutex::new(None);

/// The snapshot captured by [`init`]; `None` before that.
pub fn boot_info() -> Option<BootInfo> {
    *BOOT_INFO.lock()
}

/// Walk the info structure at physical `info_pa` and snapshot it.
///
/// # Safety
///
/// `info_pa` must be the address a Multiboot-2 loader put in EBX, with
/// the structure intact and inside the boot identity map.
pub unsafe fn init(magic: u32, info_pa: u32) -> Option<BootInfo> {
    if magic != MULTIBOOT2_MAGIC {
        log::error!("multiboot: bad magic {:#x}", magic);
        return None;
    }
    let base = frame_ptr(PhysAddr::new(info_pa));
    // SAFETY: the loader wrote total_size first; contract says the
    // structure is mapped.
    let total = unsafe { (base as *const u32).read() } as usize;
    // SAFETY: the structure spans `total` bytes from base.
    let bytes = unsafe { core::slice::from_raw_parts(base, total) };
    let info = parse_bytes(bytes);
    *BOOT_INFO.lock() = Some(info);
    Some(info)
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap_or([0; 4]))
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap_or([0; 8]))
}

/// Tag walk over an in-memory copy of the info structure. Unknown tags
/// are skipped; the walk stops at the end tag or the structure bound.
pub fn parse_bytes(bytes: &[u8]) -> BootInfo {
    let mut info = BootInfo::default();
    if bytes.len() < 8 {
        return info;
    }
    let total = (read_u32(bytes, 0) as usize).min(bytes.len());
    let mut off = 8;
    while off + 8 <= total {
        let typ = read_u32(bytes, off);
        let size = read_u32(bytes, off + 4) as usize;
        if typ == TAG_END || size < 8 || off + size > total {
            break;
        }
        match typ {
            TAG_BASIC_MEMINFO if size >= 16 => {
                info.mem_lower_kb = read_u32(bytes, off + 8);
                info.mem_upper_kb = read_u32(bytes, off + 12);
            }
            TAG_MODULE if size >= 16 => {
                // First module only: it is the initial user image.
                if info.module.is_none() {
                    info.module = Some((read_u32(bytes, off + 8), read_u32(bytes, off + 12)));
                }
            }
            TAG_FRAMEBUFFER if size >= 31 => {
                info.framebuffer = Some(FramebufferInfo {
                    addr: read_u64(bytes, off + 8),
                    pitch: read_u32(bytes, off + 16),
                    width: read_u32(bytes, off + 20),
                    height: read_u32(bytes, off + 24),
                    bpp: bytes[off + 28],
                    is_rgb: bytes[off + 29] == 1,
                });
            }
            _ => {}
        }
        off += (size + 7) & !7;
    }
    info
}

#[cfg(not(target_os = "none"))]
pub fn set_for_tests(info: BootInfo) {
    *BOOT_INFO.lock() = Some(info);
}
