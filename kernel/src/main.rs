//! Bare-metal entry point.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod bare {
    use core::panic::PanicInfo;

    use ferrox_kernel::println;

    /// Called by the boot stub after paging is on, with the Multiboot-2
    /// magic and info pointer.
    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, mbi: u32) -> ! {
        println!("ferrox v{}", env!("CARGO_PKG_VERSION"));
        ferrox_kernel::bootstrap::run(magic, mbi)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        ferrox_kernel::arch::x86::halt_forever()
    }
}

// The binary only makes sense on the bare-metal target; give the host a
// stub so `cargo test` can build the workspace.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("ferrox-kernel is a bare-metal image; build for i686-ferrox.json");
}
