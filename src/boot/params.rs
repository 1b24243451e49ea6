//! boot_params (zero page) assembly.
//!
//! The zero page is the 4 KiB structure a bootloader hands the kernel via
//! RSI. We populate the fields a direct-boot VMM owns: the setup header
//! copied from the image (with loader fields overridden), the command line
//! pointer, and the e820 memory map.
//!
//! The e820 map mirrors a legacy PC's view of low memory: the first page
//! and the 640 KiB - 1 MiB hole are reserved, everything else up to the end
//! of guest RAM is usable.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/zero-page.html>

use super::bzimage::{LoadedKernel, SETUP_HEADER_OFFSET};
use super::layout;
use super::memory::GuestMemory;
use super::{BootConfig, BootError};

/// One page.
const BOOT_PARAMS_SIZE: usize = 4096;

/// e820 region types.
#[repr(u32)]
#[derive(Clone, Copy)]
enum E820Type {
    Ram = 1,
    Reserved = 2,
}

/// Byte offsets within boot_params.
mod offsets {
    /// Number of e820 entries (1 byte).
    pub const E820_ENTRIES: usize = 0x1e8;
    /// type_of_loader field of the embedded setup header.
    pub const TYPE_OF_LOADER: usize = 0x210;
    /// loadflags field of the embedded setup header.
    pub const LOADFLAGS: usize = 0x211;
    /// 32-bit pointer to the command line.
    pub const CMD_LINE_PTR: usize = 0x228;
    /// e820 entry array (20 bytes per entry).
    pub const E820_MAP: usize = 0x2d0;
}

/// loadflags bit 0: protected-mode kernel was loaded at 1 MiB.
const LOADED_HIGH: u8 = 0x01;

/// Build boot_params at `layout::BOOT_PARAMS_START` and stage the command
/// line it points to.
pub fn setup_boot_params(
    memory: &GuestMemory,
    config: &BootConfig,
    loaded_kernel: &LoadedKernel,
) -> Result<(), BootError> {
    let mut params = [0u8; BOOT_PARAMS_SIZE];

    // The setup header lands at the same offset it has in the image.
    let header_end = SETUP_HEADER_OFFSET + loaded_kernel.setup_header.len();
    params[SETUP_HEADER_OFFSET..header_end].copy_from_slice(&loaded_kernel.setup_header);

    // Fields a bootloader is responsible for.
    params[offsets::TYPE_OF_LOADER] = 0xff; // undefined loader ID
    params[offsets::LOADFLAGS] |= LOADED_HIGH;
    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4]
        .copy_from_slice(&(layout::CMDLINE_START as u32).to_le_bytes());

    let e820_entries = fill_e820_map(&mut params, config.mem_size);
    params[offsets::E820_ENTRIES] = e820_entries;

    memory.write(layout::BOOT_PARAMS_START, &params)?;

    setup_cmdline(memory, &config.cmdline)?;

    eprintln!(
        "[boot] boot_params at {:#x}, {} e820 entries, cmdline at {:#x}",
        layout::BOOT_PARAMS_START,
        e820_entries,
        layout::CMDLINE_START
    );

    Ok(())
}

fn setup_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }

    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)?;

    eprintln!("[boot] cmdline: {cmdline}");
    Ok(())
}

/// Write the e820 map into the params buffer, returning the entry count.
fn fill_e820_map(params: &mut [u8; BOOT_PARAMS_SIZE], mem_size: u64) -> u8 {
    let entries: [(u64, u64, E820Type); 4] = [
        // Real-mode IVT / BDA page.
        (0x0, 0x1000, E820Type::Reserved),
        // Conventional memory.
        (0x1000, 0x9f000, E820Type::Ram),
        // EBDA, video memory, ROM hole.
        (0xa_0000, 0x6_0000, E820Type::Reserved),
        // Everything above 1 MiB.
        (0x10_0000, mem_size - 0x10_0000, E820Type::Ram),
    ];

    for (i, (base, size, type_)) in entries.iter().enumerate() {
        let at = offsets::E820_MAP + i * 20;
        params[at..at + 8].copy_from_slice(&base.to_le_bytes());
        params[at + 8..at + 16].copy_from_slice(&size.to_le_bytes());
        params[at + 16..at + 20].copy_from_slice(&(*type_ as u32).to_le_bytes());
    }

    entries.len() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_kernel() -> LoadedKernel {
        let mut setup_header = vec![0u8; 0x80];
        setup_header[0] = 2; // setup_sects, lands at 0x1f1
        LoadedKernel { setup_header }
    }

    fn build_params(mem_size: u64) -> (GuestMemory, u64) {
        let memory = GuestMemory::new(layout::CMDLINE_START + 0x1000).unwrap();
        let config = BootConfig {
            kernel_path: String::new(),
            cmdline: "console=ttyS0".into(),
            mem_size,
        };
        setup_boot_params(&memory, &config, &fake_kernel()).unwrap();
        (memory, layout::BOOT_PARAMS_START)
    }

    #[test]
    fn test_loader_fields() {
        let (memory, base) = build_params(1 << 30);
        let mut byte = [0u8];
        memory
            .read(base + offsets::TYPE_OF_LOADER as u64, &mut byte)
            .unwrap();
        assert_eq!(byte[0], 0xff);
        memory
            .read(base + offsets::LOADFLAGS as u64, &mut byte)
            .unwrap();
        assert_eq!(byte[0] & LOADED_HIGH, LOADED_HIGH);
        assert_eq!(
            memory.read_u32(base + offsets::CMD_LINE_PTR as u64).unwrap(),
            layout::CMDLINE_START as u32
        );
    }

    #[test]
    fn test_setup_header_copied_in_place() {
        let (memory, base) = build_params(1 << 30);
        let mut byte = [0u8];
        memory
            .read(base + SETUP_HEADER_OFFSET as u64, &mut byte)
            .unwrap();
        assert_eq!(byte[0], 2);
    }

    #[test]
    fn test_e820_map_shape() {
        let mem_size = 1u64 << 30;
        let (memory, base) = build_params(mem_size);

        let mut count = [0u8];
        memory
            .read(base + offsets::E820_ENTRIES as u64, &mut count)
            .unwrap();
        assert_eq!(count[0], 4);

        let entry = |i: u64| {
            let at = base + offsets::E820_MAP as u64 + i * 20;
            (
                memory.read_u64(at).unwrap(),
                memory.read_u64(at + 8).unwrap(),
                memory.read_u32(at + 16).unwrap(),
            )
        };

        assert_eq!(entry(0), (0x0, 0x1000, 2));
        assert_eq!(entry(1), (0x1000, 0x9f000, 1));
        assert_eq!(entry(2), (0xa_0000, 0x6_0000, 2));
        assert_eq!(entry(3), (0x10_0000, mem_size - 0x10_0000, 1));
    }

    #[test]
    fn test_cmdline_staged_with_terminator() {
        let (memory, _) = build_params(1 << 30);
        let mut buf = vec![0u8; 14];
        memory.read(layout::CMDLINE_START, &mut buf).unwrap();
        assert_eq!(&buf[..13], b"console=ttyS0");
        assert_eq!(buf[13], 0);
    }

    #[test]
    fn test_cmdline_too_long() {
        let memory = GuestMemory::new(layout::CMDLINE_START + 0x1000).unwrap();
        let config = BootConfig {
            kernel_path: String::new(),
            cmdline: "x".repeat(layout::CMDLINE_MAX_SIZE),
            mem_size: 1 << 30,
        };
        assert!(matches!(
            setup_boot_params(&memory, &config, &fake_kernel()),
            Err(BootError::CmdlineTooLong { .. })
        ));
    }
}
