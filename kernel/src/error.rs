//! Kernel error types.
//!
//! Each subsystem has its own small enum; `KernelError` is the top-level
//! sum used where paths cross subsystem boundaries. Errors never unwind
//! across trap frames: syscalls translate them to a negative `eax`,
//! kernel-internal failures are logged and absorbed or escalate to task
//! termination / CPU halt.

use core::fmt;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    Vm(VmError),
    Task(TaskError),
    Elf(ElfError),
    /// Physical allocation failed.
    OutOfMemory,
}

/// Virtual-memory layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// PMM could not supply a page table frame.
    OutOfMemory,
    /// The early page-table arena ran dry while populating the kernel
    /// directory. Fatal on the init path.
    EarlyTablesExhausted,
    /// Address not page aligned or outside the expected range.
    BadAddress { addr: u32 },
    /// No mapping present where one was required.
    NotMapped { va: u32 },
    /// DMA region bump cursor ran past the reserved range.
    DmaExhausted,
    /// No free slot in the highmem window.
    HighmemWindowFull,
}

/// Task-core errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Task table is full.
    TooManyTasks,
    /// No current task where one is required.
    NoCurrentTask,
    /// Operation on a task id that is not live.
    NoSuchTask { id: usize },
    /// Kernel stack or page directory allocation failed.
    OutOfMemory,
}

/// ELF32 loader errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    BadMagic,
    /// Not a 32-bit little-endian x86 executable.
    WrongClass,
    /// Header or segment lies outside the module image.
    Truncated,
    /// A PT_LOAD segment maps outside user space.
    BadSegment { vaddr: u32 },
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        KernelError::Vm(e)
    }
}

impl From<TaskError> for KernelError {
    fn from(e: TaskError) -> Self {
        KernelError::Task(e)
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        KernelError::Elf(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Vm(e) => write!(f, "vm: {:?}", e),
            KernelError::Task(e) => write!(f, "task: {:?}", e),
            KernelError::Elf(e) => write!(f, "elf: {:?}", e),
            KernelError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}
