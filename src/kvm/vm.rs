//! VM-level KVM operations: machine components, memory slots, vCPUs, and
//! the guest IRQ lines.
//!
//! Three x86 components are created up front, before any vCPU:
//!
//! - **TSS address**: Intel VT-x requires a valid task-state-segment
//!   address even though nothing here uses hardware task switching. It
//!   points into the unused hole below 4 GiB.
//! - **IRQ chip**: in-kernel PIC, IOAPIC, and per-vCPU local APIC. Devices
//!   inject interrupts by toggling a GSI level through `KVM_IRQ_LINE`.
//! - **PIT**: the 8254 timer the kernel expects during early boot, with PC
//!   speaker emulation stubbed out.

use super::{KvmError, VcpuFd};
use crate::devices::virtio::IrqLine;
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY};
use std::sync::Arc;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    /// Host-supported CPUID entries, applied to each new vCPU.
    supported_cpuid: CpuId,
}

impl VmFd {
    /// Wrap a raw VM fd and initialize the required machine components.
    pub fn new(vm: kvm_ioctls::VmFd, supported_cpuid: CpuId) -> Result<Self, KvmError> {
        // The address itself need not be backed by memory; KVM only needs
        // it to be valid and unused by the guest.
        vm.set_tss_address(0xfffb_d000)
            .map_err(KvmError::SetTssAddress)?;

        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)?;

        Ok(Self {
            vm,
            supported_cpuid,
        })
    }

    /// Map guest physical `[guest_addr, guest_addr + memory_size)` to host
    /// virtual memory at `userspace_addr`.
    ///
    /// # Safety
    ///
    /// The host mapping must stay valid (not freed, not shrunk) for the
    /// lifetime of the VM, and the slot must not overlap another slot.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create a vCPU and apply the host-supported CPUID entries to it.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;

        // Must happen before the first KVM_RUN.
        vcpu.set_cpuid2(&self.supported_cpuid)
            .map_err(KvmError::SetCpuid)?;

        Ok(VcpuFd::new(vcpu))
    }

    /// Drive a GSI level on the in-kernel interrupt controller.
    pub fn set_irq_line(&self, irq: u32, active: bool) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(irq, active)
            .map_err(KvmError::IrqLine)
    }
}

/// A single guest IRQ line backed by `KVM_IRQ_LINE`.
///
/// Handed to a device so it can assert and deassert its interrupt without
/// owning the VM fd.
pub struct KvmIrqLine {
    vm: Arc<VmFd>,
    irq: u32,
}

impl KvmIrqLine {
    pub fn new(vm: Arc<VmFd>, irq: u32) -> Self {
        Self { vm, irq }
    }
}

impl IrqLine for KvmIrqLine {
    fn set_level(&self, active: bool) -> std::io::Result<()> {
        self.vm
            .set_irq_line(self.irq, active)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
