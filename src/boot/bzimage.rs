//! Linux bzImage loading.
//!
//! A bzImage is a boot sector, `setup_sects` 512-byte sectors of real-mode
//! setup code, and then the protected-mode kernel proper. For direct 64-bit
//! boot the real-mode part is never executed: we validate the setup header,
//! copy it into boot_params later, and load only the protected-mode half at
//! the 1 MiB mark.
//!
//! Header fields used here (offsets within the image):
//!
//! - `0x1f1` setup_sects (0 means 4, for ancient kernels)
//! - `0x1fe` boot flag 0xAA55
//! - `0x202` magic "HdrS"
//! - `0x206` boot protocol version, 2.06+ required for 64-bit boot

use super::layout;
use super::memory::GuestMemory;
use super::BootError;
use std::fs::File;
use std::io::Read;

/// "HdrS", little-endian.
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Legacy boot sector signature.
const BOOT_FLAG: u16 = 0xaa55;

/// Minimum boot protocol version with a 64-bit entry point.
const MIN_BOOT_VERSION: u16 = 0x0206;

/// Offset of the setup header within the image (and within boot_params).
pub const SETUP_HEADER_OFFSET: usize = 0x1f1;

/// Length of the setup header slice we preserve for boot_params.
const SETUP_HEADER_LEN: usize = 0x80;

/// A validated, loaded kernel.
pub struct LoadedKernel {
    /// Raw setup header bytes, copied into boot_params verbatim.
    pub setup_header: Vec<u8>,
}

/// Validate `kernel_path` and load its protected-mode half at
/// `layout::HIMEM_START`.
pub fn load_kernel(memory: &GuestMemory, kernel_path: &str) -> Result<LoadedKernel, BootError> {
    let mut file = File::open(kernel_path).map_err(BootError::ReadKernel)?;
    let mut image = Vec::new();
    file.read_to_end(&mut image).map_err(BootError::ReadKernel)?;

    load_image(memory, &image)
}

fn load_image(memory: &GuestMemory, image: &[u8]) -> Result<LoadedKernel, BootError> {
    if image.len() < SETUP_HEADER_OFFSET + SETUP_HEADER_LEN {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let boot_flag = u16::from_le_bytes([image[0x1fe], image[0x1ff]]);
    let magic = u32::from_le_bytes([image[0x202], image[0x203], image[0x204], image[0x205]]);
    if boot_flag != BOOT_FLAG || magic != BOOT_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "bad signature: boot_flag={boot_flag:#x} magic={magic:#x}"
        )));
    }

    let version = u16::from_le_bytes([image[0x206], image[0x207]]);
    if version < MIN_BOOT_VERSION {
        return Err(BootError::InvalidKernel(format!(
            "boot protocol {}.{:02} is too old (need 2.06+)",
            version >> 8,
            version & 0xff
        )));
    }

    let setup_sects = match image[SETUP_HEADER_OFFSET] {
        0 => 4,
        n => n,
    };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= image.len() {
        return Err(BootError::InvalidKernel(
            "setup sectors exceed the image size".into(),
        ));
    }

    let kernel_code = &image[setup_size..];
    memory.write(layout::HIMEM_START, kernel_code)?;

    eprintln!(
        "[boot] protocol {}.{:02}, {setup_sects} setup sectors, {} bytes of kernel at {:#x}",
        version >> 8,
        version & 0xff,
        kernel_code.len(),
        layout::HIMEM_START
    );

    let setup_header = image[SETUP_HEADER_OFFSET..SETUP_HEADER_OFFSET + SETUP_HEADER_LEN].to_vec();
    Ok(LoadedKernel { setup_header })
}
