//! Virtual CPU execution.
//!
//! A vCPU runs guest code until a trapped event hands control back to the
//! VMM. `run_with_io` performs one such enter/exit cycle: port I/O and MMIO
//! exits are serviced inline through the [`IoHandler`] and [`MmioHandler`]
//! traits (their data lives in KVM's shared run structure and must be
//! filled before re-entry), every other reason is surfaced as a
//! [`VcpuExit`] for the dispatch loop to act on.

use super::KvmError;
use kvm_bindings::{kvm_fpu, kvm_msr_entry, kvm_regs, kvm_sregs, Msrs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// MSR indices required for 64-bit Linux boot.
mod msr {
    /// Code segment for the SYSENTER instruction (32-bit syscalls).
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    /// Stack pointer for SYSENTER.
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    /// Instruction pointer for SYSENTER.
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    /// Segment selectors for SYSCALL/SYSRET.
    pub const STAR: u32 = 0xc000_0081;
    /// Long mode SYSCALL target RIP.
    pub const LSTAR: u32 = 0xc000_0082;
    /// Compatibility mode SYSCALL target RIP.
    pub const CSTAR: u32 = 0xc000_0083;
    /// RFLAGS mask applied on SYSCALL.
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    /// SWAPGS target.
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    /// Time stamp counter.
    pub const IA32_TSC: u32 = 0x10;
    /// Miscellaneous feature enables.
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    /// MTRR default memory type.
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;
    /// MISC_ENABLE bit 0: fast string operations.
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

/// x86 IN/OUT instructions move 1, 2, or 4 bytes.
pub const MAX_IO_SIZE: usize = 4;

/// Fixed-size buffer for one port I/O transfer.
#[derive(Debug, Clone, Copy)]
pub struct IoData {
    data: [u8; MAX_IO_SIZE],
    len: u8,
}

impl IoData {
    #[inline]
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len as u8,
        }
    }

    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        if index < self.len as usize {
            self.data[index] = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Why the guest stopped executing.
#[derive(Debug)]
pub enum VcpuExit {
    /// A port I/O or MMIO access, already serviced by the handlers.
    Io,
    /// Guest executed HLT.
    Hlt,
    /// Triple fault or explicit shutdown request.
    Shutdown,
    /// KVM internal error.
    InternalError,
    /// Hardware refused to enter the guest; carries the vendor reason code.
    FailEntry(u64),
    /// System event (reset, S3, ...); carries the event type.
    SystemEvent(u32),
    /// Exit reason this VMM does not handle.
    Unknown(&'static str),
}

/// Services guest port I/O (IN/OUT instructions).
pub trait IoHandler {
    /// Fill `data` with the response to a read of `port`.
    fn io_read(&mut self, port: u16, data: &mut IoData);

    /// Consume a write of `data` to `port`.
    fn io_write(&mut self, port: u16, data: &IoData);
}

/// Services guest MMIO faults (loads/stores that miss every memory slot).
pub trait MmioHandler {
    /// Fill `data` with the response to a read of guest physical `addr`.
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);

    /// Consume a store of `data` at guest physical `addr`.
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    /// Zero the syscall/sysenter MSRs and set sane defaults for the rest,
    /// matching the state a Linux kernel expects at its 64-bit entry point.
    pub fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };

        let entries = [
            msr_entry(msr::IA32_SYSENTER_CS, 0),
            msr_entry(msr::IA32_SYSENTER_ESP, 0),
            msr_entry(msr::IA32_SYSENTER_EIP, 0),
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::LSTAR, 0),
            msr_entry(msr::IA32_TSC, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
            // Default memory type write-back, MTRRs enabled.
            msr_entry(msr::MTRR_DEF_TYPE, (1 << 11) | 6),
        ];

        let msrs = Msrs::from_entries(&entries)
            .map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(22)))?;
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;

        Ok(())
    }

    /// Enter the guest and service one exit.
    ///
    /// Port I/O and MMIO are completed inline against `handler` before this
    /// returns, so the caller just re-enters on `VcpuExit::Io`.
    pub fn run_with_io<H: IoHandler + MmioHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                let mut io_data = IoData::new(data.len());
                handler.io_read(port, &mut io_data);
                let copy_len = io_data.len().min(data.len());
                data[..copy_len].copy_from_slice(&io_data.as_slice()[..copy_len]);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::IoOut(port, data) => {
                let io_data = IoData::from_slice(data);
                handler.io_write(port, &io_data);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::MmioRead(addr, data) => {
                handler.mmio_read(addr, data);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::MmioWrite(addr, data) => {
                handler.mmio_write(addr, data);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),

            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown("IrqWindowOpen")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}
