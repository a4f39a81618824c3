//! Memory management.
//!
//! Bring-up order matters and is driven by `bootstrap`:
//! early pool → identity window → direct map over the managed range →
//! PMM → DMA region → heap. The submodule docs carry the details.

pub mod addr;
pub mod dma;
pub mod early;
pub mod heap;
pub mod highmem;
pub mod paging;
pub mod pmm;

pub use addr::{
    frame_ptr, kva_ptr, phys_to_virt, virt_to_phys, zero_frame, PhysAddr, VirtAddr,
    DIRECT_MAP_LIMIT, KERNEL_VA_OFFSET, PAGE_SIZE,
};
pub use pmm::{AllocKind, PmmStats};
