//! Page tables, descriptor tables, and CPU state for long-mode entry.
//!
//! The 64-bit boot protocol hands the kernel a CPU that is already in long
//! mode: CR0.PE|PG, CR4.PAE, EFER.LME|LMA, CR3 pointing at a page table
//! hierarchy, and GDT segments matching `__BOOT_CS = 0x10` /
//! `__BOOT_DS = 0x18`. We identity-map the first 1 GiB with 2 MiB pages
//! (PML4 -> PDPT -> PD, no PTE level); the kernel replaces these tables
//! early in its own init, so RAM beyond 1 GiB needs no early mapping.

use super::layout;
use super::memory::GuestMemory;
use super::BootError;
use crate::kvm::VcpuFd;
use kvm_bindings::{kvm_fpu, kvm_regs, kvm_segment};

/// Page table hierarchy, one page each.
const PML4_START: u64 = 0x9000;
const PDPT_START: u64 = 0xa000;
const PD_START: u64 = 0xb000;

/// Present + writable, for table entries.
const PAGE_FLAGS_TABLE: u64 = 0x03;
/// Present + writable + page size (2 MiB leaf).
const PAGE_FLAGS_HUGE: u64 = 0x83;

/// CR0.PE: protected mode.
const X86_CR0_PE: u64 = 0x1;
/// CR0.PG: paging.
const X86_CR0_PG: u64 = 0x8000_0000;
/// CR4.PAE: 64-bit page table entries, required for long mode.
const X86_CR4_PAE: u64 = 0x20;
/// EFER.LME: long mode enable.
const EFER_LME: u64 = 0x100;
/// EFER.LMA: long mode active.
const EFER_LMA: u64 = 0x400;

// GDT indices dictated by the boot protocol selectors.
const GDT_CODE: u16 = 2; // selector 0x10, __BOOT_CS
const GDT_DATA: u16 = 3; // selector 0x18, __BOOT_DS
const GDT_TSS: u16 = 4;

/// GDT for 64-bit boot: null, reserved, code (L bit), data, TSS.
///
/// The TSS entry has base 0 and backs nothing real; KVM uses the address
/// from `set_tss_address`, the entry only lets TR hold a valid selector.
const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xfffff),
    gdt_entry(0xc093, 0, 0xfffff),
    gdt_entry(0x808b, 0, 0xfffff),
];

/// Pack a GDT entry from access/granularity flags, base, and limit.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Unpack a GDT entry into the segment descriptor KVM wants.
fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

/// Identity-map the first 1 GiB: PML4[0] -> PDPT[0] -> 512 huge pages.
pub fn setup_page_tables(memory: &GuestMemory) -> Result<(), BootError> {
    memory.write_u64(PML4_START, PDPT_START | PAGE_FLAGS_TABLE)?;
    memory.write_u64(PDPT_START, PD_START | PAGE_FLAGS_TABLE)?;

    for i in 0..512u64 {
        memory.write_u64(PD_START + i * 8, (i << 21) | PAGE_FLAGS_HUGE)?;
    }

    Ok(())
}

fn setup_gdt_idt(memory: &GuestMemory) -> Result<(), BootError> {
    for (i, entry) in GDT_TABLE.iter().enumerate() {
        memory.write_u64(layout::GDT_START + i as u64 * 8, *entry)?;
    }

    // Empty IDT; the kernel installs its own before enabling interrupts.
    memory.write_u64(layout::IDT_START, 0)?;

    Ok(())
}

fn setup_fpu(vcpu: &VcpuFd) -> Result<(), BootError> {
    let fpu = kvm_fpu {
        fcw: 0x37f,    // x87: all exceptions masked
        mxcsr: 0x1f80, // SSE: all exceptions masked, round to nearest
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;
    Ok(())
}

/// Configure all CPU state for entry at `HIMEM_START + 0x200`.
pub fn setup_cpu_regs(vcpu: &VcpuFd, memory: &GuestMemory) -> Result<(), BootError> {
    setup_gdt_idt(memory)?;
    setup_fpu(vcpu)?;

    let code_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
    let data_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);
    let tss_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_TSS as usize], GDT_TSS as u8);

    let mut sregs = vcpu.get_sregs()?;

    sregs.gdt.base = layout::GDT_START;
    sregs.gdt.limit = (std::mem::size_of_val(&GDT_TABLE) - 1) as u16;
    sregs.idt.base = layout::IDT_START;
    sregs.idt.limit = 0;

    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.tr = tss_seg;

    sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
    sregs.cr3 = PML4_START;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.efer |= EFER_LME | EFER_LMA;

    vcpu.set_sregs(&sregs)?;

    // The 64-bit entry point sits 0x200 past the load address; RSI carries
    // the boot_params pointer.
    let regs = kvm_regs {
        rflags: 0x2,
        rip: layout::HIMEM_START + 0x200,
        rsp: layout::BOOT_STACK_POINTER,
        rbp: layout::BOOT_STACK_POINTER,
        rsi: layout::BOOT_PARAMS_START,
        ..Default::default()
    };

    vcpu.set_regs(&regs)?;

    eprintln!(
        "[boot] entering guest: RIP={:#x} RSI={:#x} CR3={:#x}",
        regs.rip, regs.rsi, sregs.cr3
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_tables_identity_map() {
        let memory = GuestMemory::new(0x10000).unwrap();
        setup_page_tables(&memory).unwrap();

        assert_eq!(memory.read_u64(PML4_START).unwrap(), PDPT_START | 0x03);
        assert_eq!(memory.read_u64(PDPT_START).unwrap(), PD_START | 0x03);
        // First and last 2 MiB entries.
        assert_eq!(memory.read_u64(PD_START).unwrap(), 0x83);
        assert_eq!(
            memory.read_u64(PD_START + 511 * 8).unwrap(),
            (511u64 << 21) | 0x83
        );
    }

    #[test]
    fn test_gdt_code_segment_is_long_mode() {
        let seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
        assert_eq!(seg.selector, 0x10);
        assert_eq!(seg.l, 1, "code segment must have the L bit for 64-bit");
        assert_eq!(seg.present, 1);
        assert_eq!(seg.dpl, 0);
    }

    #[test]
    fn test_gdt_data_segment() {
        let seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);
        assert_eq!(seg.selector, 0x18);
        assert_eq!(seg.l, 0);
        assert_eq!(seg.db, 1);
        assert_eq!(seg.present, 1);
    }
}
