//! Direct Linux boot on x86_64, without BIOS or bootloader.
//!
//! The VMM plays the role firmware and bootloader usually share: it loads
//! the protected-mode half of a bzImage at the 1 MiB mark, assembles the
//! `boot_params` zero page (setup header, command line pointer, e820 map),
//! builds identity page tables, and drops the vCPU straight into the
//! kernel's 64-bit entry point with long mode already enabled.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>
//!
//! # Guest physical layout
//!
//! ```text
//! 0x0000_0500  GDT
//! 0x0000_0520  IDT (empty; the kernel installs its own)
//! 0x0000_7000  boot_params (zero page)
//! 0x0000_8ff0  initial stack top
//! 0x0000_9000  PML4
//! 0x0000_a000  PDPT
//! 0x0000_b000  PD (512 x 2 MiB identity pages)
//! 0x0002_0000  kernel command line
//! 0x0010_0000  kernel image
//! 0x8000_0000  virtio-mmio window (beyond RAM, never backed by a slot)
//! ```

mod bzimage;
mod memory;
mod paging;
mod params;

pub use memory::{BadGuestAddress, GuestMemory};

use crate::kvm::{KvmError, VmFd};
use thiserror::Error;

/// Guest physical addresses fixed by the boot protocol and our layout.
pub mod layout {
    /// Global descriptor table. Long mode still needs a code segment with
    /// the L bit and data segments for the selector registers.
    pub const GDT_START: u64 = 0x500;

    /// Placeholder interrupt descriptor table (limit 0).
    pub const IDT_START: u64 = 0x520;

    /// The `boot_params` zero page the kernel reads via RSI.
    pub const BOOT_PARAMS_START: u64 = 0x7000;

    /// Top of the small stack used until the kernel switches to its own.
    pub const BOOT_STACK_POINTER: u64 = 0x8ff0;

    /// Null-terminated kernel command line; referenced from boot_params
    /// through a 32-bit pointer, so it must stay below 4 GiB.
    pub const CMDLINE_START: u64 = 0x2_0000;

    /// Longest command line we accept, including the terminator.
    pub const CMDLINE_MAX_SIZE: usize = 2048;

    /// Load address of the protected-mode kernel (the 1 MiB mark).
    pub const HIMEM_START: u64 = 0x10_0000;

    /// Guest RAM size, one contiguous region from physical 0. Also the
    /// reach of the identity page tables.
    pub const GUEST_MEM_SIZE: u64 = 1024 * 1024 * 1024;
}

/// Errors raised while preparing the guest for boot.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    GuestAddress(#[from] BadGuestAddress),

    #[error("failed to read kernel: {0}")]
    ReadKernel(#[source] std::io::Error),

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },
}

/// What to boot.
pub struct BootConfig {
    /// Path to the kernel bzImage.
    pub kernel_path: String,
    /// Kernel command line.
    pub cmdline: String,
    /// Guest RAM size in bytes; determines the e820 map.
    pub mem_size: u64,
}

/// Prepare guest memory for the 64-bit boot protocol: load the kernel,
/// populate boot_params and the command line, build the page tables, and
/// register the RAM slot with KVM.
pub fn setup_boot(vm: &VmFd, memory: &GuestMemory, config: &BootConfig) -> Result<(), BootError> {
    let loaded_kernel = bzimage::load_kernel(memory, &config.kernel_path)?;

    params::setup_boot_params(memory, config, &loaded_kernel)?;

    paging::setup_page_tables(memory)?;

    let (host_addr, size) = memory.as_raw_parts();
    unsafe {
        vm.set_user_memory_region(0, 0, size, host_addr)?;
    }

    Ok(())
}

/// Put the vCPU into the state the 64-bit entry point expects: long mode
/// active, identity paging, GDT segments loaded, RIP at the entry point and
/// RSI pointing at boot_params.
pub fn setup_vcpu_regs(vcpu: &crate::kvm::VcpuFd, memory: &GuestMemory) -> Result<(), BootError> {
    paging::setup_cpu_regs(vcpu, memory)
}
