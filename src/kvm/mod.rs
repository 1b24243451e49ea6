//! Safe wrappers around the KVM ioctl surface.
//!
//! The VMM talks to the hypervisor through three file descriptors:
//! `/dev/kvm` for system-level queries, a VM fd for machine-wide state
//! (memory slots, interrupt controllers, IRQ lines), and one vCPU fd per
//! virtual processor. This module owns VM construction; [`vm`] and [`vcpu`]
//! wrap the per-fd operations we use.
//!
//! Execution follows the usual enter/exit cycle: `KVM_RUN` transfers
//! control to the guest, which runs until a trapped event (I/O port access,
//! MMIO to an unmapped address, HLT, shutdown) returns control to us with
//! an exit reason to dispatch on.

mod vcpu;
mod vm;

pub use vcpu::{IoData, IoHandler, MmioHandler, VcpuExit, VcpuFd};
pub use vm::{KvmIrqLine, VmFd};

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors from the hypervisor interface.
#[derive(Error, Debug)]
pub enum KvmError {
    /// `/dev/kvm` could not be opened: KVM missing, module not loaded, or
    /// insufficient permissions.
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to toggle IRQ line: {0}")]
    IrqLine(#[source] kvm_ioctls::Error),
}

/// Open `/dev/kvm` and create a VM with the x86 components every Linux
/// guest needs: a TSS address, the in-kernel interrupt controllers, and
/// the PIT.
///
/// Also snapshots the host's supported CPUID entries; they are applied to
/// each vCPU at creation so the guest sees a coherent feature set.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmFd::new(vm, supported_cpuid)
}
