//! System calls.
//!
//! Vector 0x80, in-register convention: eax carries the call number,
//! ebx/ecx/edx the arguments, and the result goes back in the trap
//! frame's eax. Strings cross the boundary through a 512-byte staging
//! buffer, byte by byte; longer strings truncate silently. A user
//! pointer that faults is not recovered from — the page-fault handler
//! terminates the task (policy (b) of the fault-semantics choice).

use crate::arch::x86::multiboot;
use crate::arch::x86::trap::TrapFrame;
use crate::drivers::{console, keyboard};
use crate::mm::{pmm, KERNEL_VA_OFFSET};
use crate::task;

/// Staging buffer size for user string copies.
pub const STAGING_BYTES: usize = 512;

/// Call numbers, matching the user-side library.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// Write a NUL-terminated user string to the console.
    Print = 1,
    Exit = 2,
    Yield = 3,
    GetMemStats = 4,
    ReadKernelMem = 5,
    GetChar = 6,
    KbHit = 7,
    PutChar = 8,
    GetFramebuffer = 9,
    /// write(fd, buf, len); only fd 1 exists.
    Write = 10,
    Fork = 11,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(n: u32) -> Result<Self, ()> {
        Ok(match n {
            1 => Self::Print,
            2 => Self::Exit,
            3 => Self::Yield,
            4 => Self::GetMemStats,
            5 => Self::ReadKernelMem,
            6 => Self::GetChar,
            7 => Self::KbHit,
            8 => Self::PutChar,
            9 => Self::GetFramebuffer,
            10 => Self::Write,
            11 => Self::Fork,
            _ => return Err(()),
        })
    }
}

/// Memory statistics as the user-side struct expects them.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserMemStats {
    pub total_pages: u32,
    pub free_pages: u32,
    pub used_pages: u32,
}

/// Framebuffer geometry as the user-side struct expects it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserFramebuffer {
    pub addr: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
}

/// Entry from the trap dispatcher; decodes, runs, writes eax back.
pub fn dispatch(tf: &mut TrapFrame) {
    let result = match Syscall::try_from(tf.eax) {
        Ok(call) => handle(call, tf),
        Err(()) => {
            log::warn!("syscall: unknown number {}", tf.eax);
            -1
        }
    };
    tf.eax = result as u32;
}

fn handle(call: Syscall, tf: &mut TrapFrame) -> i32 {
    let (arg1, arg2, arg3) = (tf.ebx, tf.ecx, tf.edx);
    match call {
        Syscall::Print => {
            let mut buf = [0u8; STAGING_BYTES];
            let len = copy_user_cstr(arg1, &mut buf);
            console::write_bytes(&buf[..len]) as i32
        }
        Syscall::Exit => {
            task::exit::exit_current(arg1 as i32);
            0
        }
        Syscall::Yield => {
            crate::sched::set_need_resched();
            0
        }
        Syscall::GetMemStats => {
            let stats = pmm::stats();
            let out = UserMemStats {
                total_pages: stats.total,
                free_pages: stats.free,
                used_pages: stats.used,
            };
            match user_ptr::<UserMemStats>(arg1) {
                // SAFETY: the pointer was range-checked; a faulting
                // write is handled by the page-fault policy.
                Some(p) => unsafe {
                    p.write_unaligned(out);
                    0
                },
                None => -1,
            }
        }
        Syscall::ReadKernelMem => {
            if arg1 < KERNEL_VA_OFFSET {
                return -1;
            }
            let Some(dst) = user_ptr::<u32>(arg2) else {
                return -1;
            };
            // SAFETY: arg1 is gated to the kernel range; dst was
            // range-checked as a user pointer.
            unsafe {
                let value = (arg1 as usize as *const u32).read_volatile();
                dst.write_unaligned(value);
            }
            0
        }
        Syscall::GetChar => keyboard::getchar_blocking() as i32,
        Syscall::KbHit => keyboard::has_input() as i32,
        Syscall::PutChar => {
            console::putc(arg1 as u8);
            0
        }
        Syscall::GetFramebuffer => {
            let Some(info) = multiboot::boot_info().and_then(|b| b.framebuffer) else {
                return -1;
            };
            if !info.is_rgb {
                return -1;
            }
            let out = UserFramebuffer {
                addr: info.addr as u32,
                width: info.width,
                height: info.height,
                pitch: info.pitch,
                bpp: info.bpp,
            };
            match user_ptr::<UserFramebuffer>(arg1) {
                // SAFETY: range-checked user pointer, fault policy as
                // above.
                Some(p) => unsafe {
                    p.write_unaligned(out);
                    0
                },
                None => -1,
            }
        }
        Syscall::Write => {
            if arg1 != 1 || arg3 as usize >= STAGING_BYTES {
                return -1;
            }
            let mut buf = [0u8; STAGING_BYTES];
            let len = copy_user_bytes(arg2, &mut buf, arg3 as usize);
            console::write_bytes(&buf[..len]) as i32
        }
        Syscall::Fork => match task::fork::do_fork() {
            Ok(child_pid) => child_pid as i32,
            Err(e) => {
                log::warn!("fork failed: {}", e);
                -1
            }
        },
    }
}

/// Validate a user pointer: non-null, below the kernel split, and the
/// value fits before the boundary.
fn user_ptr<T>(va: u32) -> Option<*mut T> {
    let size = core::mem::size_of::<T>() as u32;
    if va == 0 || va.checked_add(size)? > KERNEL_VA_OFFSET {
        return None;
    }
    user_va_to_ptr(va)
}

/// Bare metal: user addresses are dereferencable through the current
/// CR3. On the host there is no user address space to reach.
#[cfg(target_os = "none")]
fn user_va_to_ptr<T>(va: u32) -> Option<*mut T> {
    Some(va as usize as *mut T)
}

#[cfg(not(target_os = "none"))]
fn user_va_to_ptr<T>(_va: u32) -> Option<*mut T> {
    None
}

/// Copy up to `len` bytes from user space into the staging buffer.
/// Returns the number of bytes copied (clamped to the buffer).
fn copy_user_bytes(src: u32, buf: &mut [u8], len: usize) -> usize {
    let len = len.min(buf.len());
    let Some(p) = user_ptr::<u8>(src) else {
        return 0;
    };
    for (i, slot) in buf[..len].iter_mut().enumerate() {
        // SAFETY: byte reads below the kernel split; a fault terminates
        // the task per the documented policy.
        *slot = unsafe { p.add(i).read_volatile() };
    }
    len
}

/// Copy a NUL-terminated user string; silent truncation at the staging
/// size.
fn copy_user_cstr(src: u32, buf: &mut [u8]) -> usize {
    let Some(p) = user_ptr::<u8>(src) else {
        return 0;
    };
    for i in 0..buf.len() - 1 {
        // SAFETY: as in copy_user_bytes.
        let b = unsafe { p.add(i).read_volatile() };
        if b == 0 {
            return i;
        }
        buf[i] = b;
    }
    buf.len() - 1
}
