//! MMIO routing for device emulation.
//!
//! Guest loads and stores that miss every KVM memory slot trap to the VMM
//! as MMIO exits. The bus looks up the device owning the faulting address
//! and forwards the access with a device-relative offset.
//!
//! The block device occupies one 4 KiB window:
//!
//! ```text
//! 0x8000_0000 - 0x8000_0fff  virtio-blk registers + config space
//! ```
//!
//! The window sits above the end of guest RAM (1 GiB), so no slot overlap
//! is possible.

/// Base address of the virtio-blk MMIO window.
pub const VIRTIO_MMIO_BASE: u64 = 0x8000_0000;

/// Size of the virtio-blk MMIO window (4 KiB).
pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;

/// Guest IRQ for the virtio-blk device, routed through the in-kernel
/// interrupt controller.
pub const VIRTIO_BLK_IRQ: u32 = 5;

/// A device that responds to MMIO accesses.
///
/// Offsets are relative to the device's window base. Implementations decide
/// which access widths they honor; dropped accesses must leave `data`
/// untouched on reads.
pub trait MmioDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

struct MmioDeviceEntry {
    base: u64,
    size: u64,
    device: Box<dyn MmioDevice>,
}

/// Routes MMIO exits to registered devices by address range.
pub struct MmioBus {
    devices: Vec<MmioDeviceEntry>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Register a device window. Windows must not overlap.
    pub fn register(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        self.devices.push(MmioDeviceEntry { base, size, device });
        self.devices.sort_by_key(|e| e.base);
    }

    fn find_device<'a>(&'a mut self, addr: u64) -> Option<(&'a mut (dyn MmioDevice + 'a), u64)> {
        for e in self.devices.iter_mut() {
            if addr >= e.base && addr < e.base + e.size {
                return Some((e.device.as_mut(), addr - e.base));
            }
        }
        None
    }

    /// Route an MMIO read. Unmapped addresses read as all-ones, with a
    /// diagnostic.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        match self.find_device(addr) {
            Some((device, offset)) => device.read(offset, data),
            None => {
                eprintln!(
                    "[mmio] unhandled read at {addr:#x} with size {}",
                    data.len()
                );
                data.fill(0xff);
            }
        }
    }

    /// Route an MMIO write. Unmapped addresses are dropped with a
    /// diagnostic.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        match self.find_device(addr) {
            Some((device, offset)) => device.write(offset, data),
            None => {
                eprintln!(
                    "[mmio] unhandled write at {addr:#x} with size {}, data={data:02x?}",
                    data.len()
                );
            }
        }
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}
