//! Virtio block device (virtio-blk) over the MMIO transport.
//!
//! The guest driver submits descriptor chains of two or three descriptors:
//!
//! 1. **Request header** (16 bytes, device-readable):
//!    `{ type: u32, reserved: u32, sector: u64 }` with type 0=IN (read),
//!    1=OUT (write), 4=FLUSH.
//! 2. **Data buffer** (IN: device-writable, OUT: device-readable; absent
//!    for FLUSH).
//! 3. **Status byte** (device-writable): 0=OK, 1=IOERR, 2=UNSUPP.
//!
//! The device bridges these requests to a raw disk image on the host and
//! completes them through the used ring, raising IRQ 5 through the
//! in-kernel interrupt controller.
//!
//! Device state is split in two halves. The *volatile* half ([`DeviceState`]
//! plus the virtqueue) is cleared when the driver writes 0 to STATUS; the
//! *static* half (feature words, queue size limit, disk handle, config
//! space) survives resets.

use crate::boot::{BadGuestAddress, GuestMemory};
use crate::devices::mmio::MmioDevice;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use super::queue::{VirtqDesc, Virtqueue, VIRTQ_DESC_F_INDIRECT};
use super::{
    IrqLine, VirtioError, INT_CONFIG, INT_VRING, MMIO_CONFIG, MMIO_CONFIG_GENERATION,
    MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID, MMIO_DRIVER_FEATURES,
    MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS, MMIO_MAGIC_VALUE,
    MMIO_QUEUE_AVAIL_HIGH, MMIO_QUEUE_AVAIL_LOW, MMIO_QUEUE_DESC_HIGH, MMIO_QUEUE_DESC_LOW,
    MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_READY, MMIO_QUEUE_SEL,
    MMIO_QUEUE_USED_HIGH, MMIO_QUEUE_USED_LOW, MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION,
    STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FAILED, STATUS_FEATURES_OK,
    STATUS_NEEDS_RESET, VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION_MODERN, VIRTIO_VENDOR_ID,
};

/// Virtio device ID for block devices.
const VIRTIO_BLK_DEVICE_ID: u32 = 2;

/// Logical sector size.
const SECTOR_SIZE: u64 = 512;

/// Cache flush command support (feature word 0, bit 9).
const VIRTIO_BLK_F_FLUSH: u32 = 1 << 9;

/// VIRTIO_F_VERSION_1 is feature bit 32, so it is bit 0 of feature word 1.
/// Keeping the feature state as two selector-indexed words avoids ever
/// shifting by 32.
const VIRTIO_F_VERSION_1: u32 = 1 << 0;

// Block request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Block status codes.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Largest ring size we report through QUEUE_NUM_MAX.
pub const QUEUE_SIZE_MAX: u16 = 1024;

/// Size of the device configuration window at offset 0x100. Only `capacity`
/// (the first 8 bytes, LE sector count) is populated; the rest reads zero.
const CONFIG_SIZE: usize = 0x60;

/// Length of the request header descriptor.
const REQ_HEADER_LEN: u32 = 16;

/// Volatile register state, cleared by a driver-initiated reset.
#[derive(Debug, Default)]
struct DeviceState {
    status: u32,
    device_feature_sel: u32,
    driver_feature_sel: u32,
    queue_sel: u32,
    /// Bit 0: used-ring notification pending, bit 1: config change pending.
    interrupt_status: u32,
    /// Driver-acknowledged feature words, indexed by selector.
    negotiated_features: [u32; 2],
}

/// Virtio block device.
pub struct VirtioBlk {
    // Volatile half, zeroed when the driver writes 0 to STATUS.
    state: DeviceState,
    queue: Virtqueue,

    // Static half, fixed at construction.
    /// Offered feature words, indexed by selector.
    device_features: [u32; 2],
    queue_size_max: u16,
    disk: File,
    config: [u8; CONFIG_SIZE],
    memory: GuestMemory,
    irq: Box<dyn IrqLine>,

    /// Completed request counter, for diagnostics only.
    request_count: u64,
}

impl VirtioBlk {
    /// Open `disk_path` read-write and build the device around it. The file
    /// length at startup defines the capacity (in 512-byte sectors, rounded
    /// up); the device never grows or truncates the file.
    pub fn new(
        disk_path: &str,
        memory: GuestMemory,
        irq: Box<dyn IrqLine>,
    ) -> std::io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(disk_path)?;
        let capacity = disk.metadata()?.len().div_ceil(SECTOR_SIZE);

        eprintln!("[virtio-blk] opened disk {disk_path} ({capacity} sectors)");

        let mut config = [0u8; CONFIG_SIZE];
        config[..8].copy_from_slice(&capacity.to_le_bytes());

        Ok(Self {
            state: DeviceState::default(),
            queue: Virtqueue::new(),
            device_features: [VIRTIO_BLK_F_FLUSH, VIRTIO_F_VERSION_1],
            queue_size_max: QUEUE_SIZE_MAX,
            disk,
            config,
            memory,
            irq,
            request_count: 0,
        })
    }

    /// Drain the virtqueue: consume every pending chain, execute it against
    /// the disk, publish the completion, then signal the used-ring interrupt.
    ///
    /// An out-of-range guest address aborts the drain; the caller moves the
    /// device to NEEDS_RESET. Malformed chains only fail their own request.
    fn process_queue(&mut self) -> Result<(), BadGuestAddress> {
        loop {
            let Some(head) = self.queue.pop_avail(&self.memory)? else {
                break;
            };

            let written = match self.queue.walk_chain(&self.memory, head) {
                Ok(descs) => self.execute_chain(&descs)?,
                Err(VirtioError::BadGuestAddress(e)) => return Err(e),
                Err(e) => {
                    eprintln!("[virtio-blk] dropping request at head {head}: {e}");
                    0
                }
            };

            self.queue.push_used(&self.memory, head, written)?;
            self.request_count += 1;
            if self.request_count <= 10 {
                eprintln!(
                    "[virtio-blk] request #{} complete, used len {written}",
                    self.request_count
                );
            }
        }

        self.raise_interrupt(INT_VRING);
        Ok(())
    }

    /// Execute one descriptor chain and write its status byte.
    ///
    /// Returns the used-ring `len`: the number of bytes written into
    /// device-writable buffers (data length for IN, 1 for the status byte
    /// otherwise, 0 when the chain offers no writable status descriptor).
    fn execute_chain(&self, descs: &[VirtqDesc]) -> Result<u32, BadGuestAddress> {
        let status_desc = descs[descs.len() - 1];
        if !status_desc.is_write_only() || status_desc.len == 0 {
            eprintln!("[virtio-blk] chain has no writable status descriptor");
            return Ok(0);
        }

        let (status, written) = match self.execute_request(descs) {
            Ok(written) => (VIRTIO_BLK_S_OK, written),
            Err(VirtioError::BadGuestAddress(e)) => return Err(e),
            Err(VirtioError::DiskIo(e)) => {
                eprintln!("[virtio-blk] disk I/O error: {e}");
                (VIRTIO_BLK_S_IOERR, 1)
            }
            Err(e) => {
                eprintln!("[virtio-blk] request failed: {e}");
                (VIRTIO_BLK_S_UNSUPP, 1)
            }
        };

        self.memory.write_u8(status_desc.addr, status)?;
        Ok(written)
    }

    /// Classify the chain and run the disk operation.
    fn execute_request(&self, descs: &[VirtqDesc]) -> Result<u32, VirtioError> {
        if descs.iter().any(|d| d.flags & VIRTQ_DESC_F_INDIRECT != 0) {
            return Err(VirtioError::IndirectDescriptor);
        }
        if descs.len() < 2 {
            // Header-only chain, nothing to execute.
            return Err(VirtioError::MalformedChain);
        }

        let header = descs[0];
        if header.is_write_only() || header.len < REQ_HEADER_LEN {
            return Err(VirtioError::MalformedChain);
        }
        let req_type = self.memory.read_u32(header.addr)?;
        let sector = self.memory.read_u64(header.addr + 8)?;

        let data = &descs[1..descs.len() - 1];
        match req_type {
            VIRTIO_BLK_T_IN => self.read_into_guest(sector, data),
            VIRTIO_BLK_T_OUT => self.write_from_guest(sector, data),
            VIRTIO_BLK_T_FLUSH => self.flush(data),
            other => Err(VirtioError::UnsupportedRequest(other)),
        }
    }

    /// IN: read from the disk into device-writable guest buffers.
    fn read_into_guest(&self, sector: u64, data: &[VirtqDesc]) -> Result<u32, VirtioError> {
        let mut offset = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(VirtioError::MalformedChain)?;
        let mut written = 0u32;

        for desc in data {
            if !desc.is_write_only() {
                return Err(VirtioError::MalformedChain);
            }

            let mut buf = vec![0u8; desc.len as usize];
            let n = read_up_to(&self.disk, &mut buf, offset)?;
            // A short read at end-of-file is not an error; the unread tail
            // of the guest buffer is left untouched.
            self.memory.write(desc.addr, &buf[..n])?;

            written += desc.len;
            offset += u64::from(desc.len);
        }

        Ok(written)
    }

    /// OUT: write device-readable guest buffers to the disk.
    fn write_from_guest(&self, sector: u64, data: &[VirtqDesc]) -> Result<u32, VirtioError> {
        let mut offset = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(VirtioError::MalformedChain)?;

        for desc in data {
            if desc.is_write_only() {
                return Err(VirtioError::MalformedChain);
            }

            let mut buf = vec![0u8; desc.len as usize];
            self.memory.read(desc.addr, &mut buf)?;
            self.disk.write_all_at(&buf, offset)?;

            offset += u64::from(desc.len);
        }

        Ok(1)
    }

    /// FLUSH: durably flush the disk. The chain carries no data descriptor.
    fn flush(&self, data: &[VirtqDesc]) -> Result<u32, VirtioError> {
        if !data.is_empty() {
            return Err(VirtioError::MalformedChain);
        }
        self.disk.sync_data()?;
        Ok(1)
    }

    /// Latch interrupt bits and assert the line on the idle-to-pending
    /// transition. Re-asserting an already-high line is a no-op in KVM.
    fn raise_interrupt(&mut self, bits: u32) {
        let was_idle = self.state.interrupt_status == 0;
        self.state.interrupt_status |= bits;
        if was_idle {
            if let Err(e) = self.irq.set_level(true) {
                eprintln!("[virtio-blk] failed to assert IRQ: {e}");
            }
        }
    }

    /// Semantic violation: park the device until the driver resets it.
    /// The config interrupt tells the driver to look at STATUS.
    fn enter_needs_reset(&mut self) {
        eprintln!("[virtio-blk] entering NEEDS_RESET, waiting for driver reset");
        self.state.status = STATUS_NEEDS_RESET;
        self.raise_interrupt(INT_CONFIG);
    }

    /// Driver-initiated full reset: clear the volatile half, keep the
    /// static half (features, capacity, disk handle).
    fn reset(&mut self) {
        if self.state.interrupt_status != 0 {
            if let Err(e) = self.irq.set_level(false) {
                eprintln!("[virtio-blk] failed to deassert IRQ: {e}");
            }
        }
        self.state = DeviceState::default();
        self.queue = Virtqueue::new();
        eprintln!("[virtio-blk] device reset");
    }

    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.reset();
            return;
        }

        let newly_set = value & !self.state.status;
        self.state.status |= value;
        eprintln!(
            "[virtio-blk] status: {} ({:#x})",
            status_names(self.state.status),
            self.state.status
        );

        // FEATURES_OK seals negotiation: a driver that did not accept
        // VIRTIO_F_VERSION_1 cannot drive a modern-transport device.
        if newly_set & STATUS_FEATURES_OK != 0
            && self.state.negotiated_features[1] & VIRTIO_F_VERSION_1 == 0
        {
            eprintln!("[virtio-blk] {}", VirtioError::FeatureMismatch);
            self.enter_needs_reset();
        }
    }

    fn read_register(&self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION_MODERN,
            MMIO_DEVICE_ID => VIRTIO_BLK_DEVICE_ID,
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => match self.state.device_feature_sel {
                sel @ (0 | 1) => self.device_features[sel as usize],
                _ => 0,
            },
            MMIO_QUEUE_NUM_MAX => {
                if self.state.queue_sel == 0 {
                    u32::from(self.queue_size_max)
                } else {
                    // The selected queue does not exist.
                    0
                }
            }
            MMIO_QUEUE_READY => u32::from(self.queue.ready),
            MMIO_INTERRUPT_STATUS => self.state.interrupt_status,
            MMIO_STATUS => self.state.status,
            MMIO_CONFIG_GENERATION => 0, // config space is static
            _ => {
                eprintln!("[virtio-blk] unhandled register read at {offset:#x}");
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => {
                self.state.device_feature_sel = value;
            }
            MMIO_DRIVER_FEATURES_SEL => {
                self.state.driver_feature_sel = value;
            }
            MMIO_DRIVER_FEATURES => {
                let sel = self.state.driver_feature_sel;
                if sel > 1 {
                    eprintln!("[virtio-blk] driver features write with bad selector {sel}");
                    return;
                }
                self.state.negotiated_features[sel as usize] = value;
                if value != self.device_features[sel as usize] {
                    eprintln!(
                        "[virtio-blk] degraded features (sel={sel}): offered {:#x}, driver accepted {value:#x}",
                        self.device_features[sel as usize]
                    );
                }
            }
            MMIO_QUEUE_SEL => {
                self.state.queue_sel = value;
            }
            MMIO_QUEUE_NUM => {
                if self.state.queue_sel != 0 {
                    return;
                }
                if value > u32::from(self.queue_size_max) {
                    eprintln!(
                        "[virtio-blk] {}",
                        VirtioError::QueueSizeTooLarge {
                            requested: value,
                            max: u32::from(self.queue_size_max),
                        }
                    );
                    self.enter_needs_reset();
                    return;
                }
                self.queue.size = value as u16;
                eprintln!("[virtio-blk] queue size {value} negotiated");
            }
            MMIO_QUEUE_READY => {
                self.queue.ready = value != 0;
                if self.queue.ready {
                    eprintln!(
                        "[virtio-blk] queue ready: desc={:#x} avail={:#x} used={:#x} size={}",
                        self.queue.desc_addr,
                        self.queue.avail_addr,
                        self.queue.used_addr,
                        self.queue.size
                    );
                }
            }
            MMIO_QUEUE_NOTIFY => {
                if let Err(e) = self.process_queue() {
                    eprintln!("[virtio-blk] queue drain aborted: {e}");
                    self.enter_needs_reset();
                }
            }
            MMIO_INTERRUPT_ACK => {
                self.state.interrupt_status &= !value;
                if self.state.interrupt_status == 0 {
                    if let Err(e) = self.irq.set_level(false) {
                        eprintln!("[virtio-blk] failed to deassert IRQ: {e}");
                    }
                }
            }
            MMIO_STATUS => self.write_status(value),
            MMIO_QUEUE_DESC_LOW => self.queue.set_desc_low(value),
            MMIO_QUEUE_DESC_HIGH => self.queue.set_desc_high(value),
            MMIO_QUEUE_AVAIL_LOW => self.queue.set_avail_low(value),
            MMIO_QUEUE_AVAIL_HIGH => self.queue.set_avail_high(value),
            MMIO_QUEUE_USED_LOW => self.queue.set_used_low(value),
            MMIO_QUEUE_USED_HIGH => self.queue.set_used_high(value),
            _ => {
                eprintln!("[virtio-blk] unhandled register write at {offset:#x} = {value:#x}");
            }
        }
    }

    /// Map an access to the configuration window to `(start, len)` within
    /// the config array, clamped to the window end.
    fn config_access(offset: u64, len: usize) -> Option<(usize, usize)> {
        if !(MMIO_CONFIG..MMIO_CONFIG + CONFIG_SIZE as u64).contains(&offset) {
            return None;
        }
        let start = (offset - MMIO_CONFIG) as usize;
        Some((start, len.min(CONFIG_SIZE - start)))
    }
}

impl MmioDevice for VirtioBlk {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        // The config window honors arbitrary widths, bytewise.
        if let Some((start, n)) = Self::config_access(offset, data.len()) {
            data[..n].copy_from_slice(&self.config[start..start + n]);
            return;
        }

        // Registers only honor aligned 4-byte accesses; anything else is
        // dropped and the data buffer stays untouched.
        if data.len() != 4 || offset % 4 != 0 {
            eprintln!(
                "[virtio-blk] dropping {}-byte read at offset {offset:#x}",
                data.len()
            );
            return;
        }

        data.copy_from_slice(&self.read_register(offset).to_le_bytes());
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some((start, n)) = Self::config_access(offset, data.len()) {
            self.config[start..start + n].copy_from_slice(&data[..n]);
            return;
        }

        if data.len() != 4 || offset % 4 != 0 {
            eprintln!(
                "[virtio-blk] dropping {}-byte write at offset {offset:#x}",
                data.len()
            );
            return;
        }

        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }
}

/// Read as much as possible into `buf` at `offset`, stopping at EOF.
fn read_up_to(disk: &File, buf: &mut [u8], mut offset: u64) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match disk.read_at(&mut buf[total..], offset) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn status_names(status: u32) -> String {
    const BITS: [(u32, &str); 6] = [
        (STATUS_ACKNOWLEDGE, "acknowledge"),
        (STATUS_DRIVER, "driver"),
        (STATUS_DRIVER_OK, "driver_ok"),
        (STATUS_FEATURES_OK, "features_ok"),
        (STATUS_NEEDS_RESET, "needs_reset"),
        (STATUS_FAILED, "failed"),
    ];
    BITS.iter()
        .filter(|(bit, _)| status & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;
    const HEADER_ADDR: u64 = 0x4000;
    const DATA_ADDR: u64 = 0x5000;
    const STATUS_ADDR: u64 = 0x6000;

    #[derive(Clone, Default)]
    struct TestIrq {
        levels: Arc<Mutex<Vec<bool>>>,
    }

    impl IrqLine for TestIrq {
        fn set_level(&self, active: bool) -> std::io::Result<()> {
            self.levels.lock().unwrap().push(active);
            Ok(())
        }
    }

    impl TestIrq {
        fn last(&self) -> Option<bool> {
            self.levels.lock().unwrap().last().copied()
        }
    }

    /// Backing file in the system temp dir, removed on drop.
    struct TestDisk(PathBuf);

    impl Drop for TestDisk {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn temp_disk(contents: &[u8]) -> TestDisk {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "argon-blk-test-{}-{}.img",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, contents).unwrap();
        TestDisk(path)
    }

    fn test_device(disk_contents: &[u8]) -> (VirtioBlk, GuestMemory, TestIrq, TestDisk) {
        let disk = temp_disk(disk_contents);
        let memory = GuestMemory::new(0x10000).unwrap();
        let irq = TestIrq::default();
        let dev = VirtioBlk::new(
            disk.0.to_str().unwrap(),
            memory.clone(),
            Box::new(irq.clone()),
        )
        .unwrap();
        (dev, memory, irq, disk)
    }

    fn write_reg(dev: &mut VirtioBlk, offset: u64, value: u32) {
        dev.write(offset, &value.to_le_bytes());
    }

    fn read_reg(dev: &mut VirtioBlk, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        dev.read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    /// Drive the full driver-side bring-up: status handshake, feature
    /// negotiation, queue configuration.
    fn bring_up(dev: &mut VirtioBlk, queue_size: u32) {
        write_reg(dev, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        write_reg(dev, MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);

        write_reg(dev, MMIO_DEVICE_FEATURES_SEL, 0);
        assert_eq!(read_reg(dev, MMIO_DEVICE_FEATURES), VIRTIO_BLK_F_FLUSH);
        write_reg(dev, MMIO_DEVICE_FEATURES_SEL, 1);
        assert_eq!(read_reg(dev, MMIO_DEVICE_FEATURES), VIRTIO_F_VERSION_1);

        write_reg(dev, MMIO_DRIVER_FEATURES_SEL, 0);
        write_reg(dev, MMIO_DRIVER_FEATURES, VIRTIO_BLK_F_FLUSH);
        write_reg(dev, MMIO_DRIVER_FEATURES_SEL, 1);
        write_reg(dev, MMIO_DRIVER_FEATURES, VIRTIO_F_VERSION_1);

        write_reg(
            dev,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );

        write_reg(dev, MMIO_QUEUE_SEL, 0);
        assert_eq!(
            read_reg(dev, MMIO_QUEUE_NUM_MAX),
            u32::from(QUEUE_SIZE_MAX)
        );
        write_reg(dev, MMIO_QUEUE_NUM, queue_size);
        write_reg(dev, MMIO_QUEUE_DESC_LOW, DESC_TABLE as u32);
        write_reg(dev, MMIO_QUEUE_DESC_HIGH, 0);
        write_reg(dev, MMIO_QUEUE_AVAIL_LOW, AVAIL_RING as u32);
        write_reg(dev, MMIO_QUEUE_AVAIL_HIGH, 0);
        write_reg(dev, MMIO_QUEUE_USED_LOW, USED_RING as u32);
        write_reg(dev, MMIO_QUEUE_USED_HIGH, 0);
        write_reg(dev, MMIO_QUEUE_READY, 1);

        write_reg(
            dev,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK,
        );
    }

    fn write_desc(memory: &GuestMemory, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC_TABLE + u64::from(idx) * VirtqDesc::SIZE;
        memory.write_u64(base, addr).unwrap();
        memory.write_u32(base + 8, len).unwrap();
        memory.write_u16(base + 12, flags).unwrap();
        memory.write_u16(base + 14, next).unwrap();
    }

    /// Publish a chain starting at descriptor `head` into the available ring.
    fn publish(memory: &GuestMemory, head: u16) {
        let avail_idx = memory.read_u16(AVAIL_RING + 2).unwrap();
        memory
            .write_u16(AVAIL_RING + 4 + u64::from(avail_idx % 8) * 2, head)
            .unwrap();
        memory
            .write_u16(AVAIL_RING + 2, avail_idx.wrapping_add(1))
            .unwrap();
    }

    fn write_req_header(memory: &GuestMemory, req_type: u32, sector: u64) {
        memory.write_u32(HEADER_ADDR, req_type).unwrap();
        memory.write_u32(HEADER_ADDR + 4, 0).unwrap();
        memory.write_u64(HEADER_ADDR + 8, sector).unwrap();
    }

    /// Build the canonical 3-descriptor request chain at descriptors 0..2.
    fn enqueue_rw_request(
        memory: &GuestMemory,
        req_type: u32,
        sector: u64,
        data_len: u32,
        data_flags: u16,
    ) {
        write_req_header(memory, req_type, sector);
        write_desc(memory, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(
            memory,
            1,
            DATA_ADDR,
            data_len,
            data_flags | VIRTQ_DESC_F_NEXT,
            2,
        );
        write_desc(memory, 2, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);
        publish(memory, 0);
    }

    fn used_idx(memory: &GuestMemory) -> u16 {
        memory.read_u16(USED_RING + 2).unwrap()
    }

    fn used_elem(memory: &GuestMemory, slot: u64) -> (u32, u32) {
        (
            memory.read_u32(USED_RING + 4 + slot * 8).unwrap(),
            memory.read_u32(USED_RING + 8 + slot * 8).unwrap(),
        )
    }

    #[test]
    fn test_identity_registers() {
        let (mut dev, _memory, _irq, _disk) = test_device(&[0u8; 512]);
        assert_eq!(read_reg(&mut dev, MMIO_MAGIC_VALUE), 0x7472_6976);
        assert_eq!(read_reg(&mut dev, MMIO_VERSION), 2);
        assert_eq!(read_reg(&mut dev, MMIO_DEVICE_ID), 2);
        assert_eq!(read_reg(&mut dev, MMIO_VENDOR_ID), 0);
        assert_eq!(read_reg(&mut dev, MMIO_CONFIG_GENERATION), 0);
    }

    #[test]
    fn test_cold_boot_to_driver_ok() {
        let (mut dev, _memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 256);

        assert_eq!(
            dev.state.status,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK
        );
        assert_eq!(dev.queue.size, 256);
        assert!(dev.queue.ready);
        assert_eq!(dev.state.negotiated_features, [VIRTIO_BLK_F_FLUSH, 1]);
        assert_eq!(read_reg(&mut dev, MMIO_QUEUE_READY), 1);
    }

    #[test]
    fn test_narrow_register_access_is_dropped() {
        let (mut dev, _memory, _irq, _disk) = test_device(&[0u8; 512]);

        let mut data = [0xaa, 0xaa];
        dev.read(MMIO_MAGIC_VALUE, &mut data);
        assert_eq!(data, [0xaa, 0xaa], "short read must leave data unchanged");

        dev.write(MMIO_STATUS, &[STATUS_ACKNOWLEDGE as u8, 0]);
        assert_eq!(dev.state.status, 0, "short write must not change state");

        // Misaligned 4-byte access is dropped too.
        dev.write(MMIO_STATUS + 2, &1u32.to_le_bytes());
        assert_eq!(dev.state.status, 0);
    }

    #[test]
    fn test_config_capacity_bytewise() {
        // 3 sectors worth of data, last one partial: capacity rounds up.
        let (mut dev, _memory, _irq, _disk) = test_device(&[7u8; 512 * 2 + 100]);

        let mut capacity = [0u8; 8];
        dev.read(MMIO_CONFIG, &mut capacity);
        assert_eq!(u64::from_le_bytes(capacity), 3);

        // Single-byte reads through the config window see the same value.
        let mut low = [0u8; 1];
        dev.read(MMIO_CONFIG, &mut low);
        assert_eq!(low[0], 3);
    }

    #[test]
    fn test_read_request() {
        let mut contents = vec![0u8; 1024];
        contents[..4].copy_from_slice(b"boot");
        contents[512..516].copy_from_slice(b"root");
        let (mut dev, memory, irq, _disk) = test_device(&contents);
        bring_up(&mut dev, 8);

        enqueue_rw_request(&memory, VIRTIO_BLK_T_IN, 1, 512, VIRTQ_DESC_F_WRITE);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut data = [0u8; 4];
        memory.read(DATA_ADDR, &mut data).unwrap();
        assert_eq!(&data, b"root");

        let mut status = [0xffu8];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        assert_eq!(used_idx(&memory), 1);
        // Used len reports the bytes written into the data descriptor.
        assert_eq!(used_elem(&memory, 0), (0, 512));

        assert_eq!(dev.state.interrupt_status, INT_VRING);
        assert_eq!(irq.last(), Some(true));
    }

    #[test]
    fn test_short_read_at_eof_is_ok() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0x11u8; 512]);
        bring_up(&mut dev, 8);

        // Guest buffer pre-filled; the device may only overwrite what the
        // disk actually provided.
        memory.write(DATA_ADDR, &[0xee; 1024]).unwrap();
        enqueue_rw_request(&memory, VIRTIO_BLK_T_IN, 0, 1024, VIRTQ_DESC_F_WRITE);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut data = vec![0u8; 1024];
        memory.read(DATA_ADDR, &mut data).unwrap();
        assert!(data[..512].iter().all(|&b| b == 0x11));
        assert!(data[512..].iter().all(|&b| b == 0xee));

        let mut status = [0xffu8];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 4096]);
        bring_up(&mut dev, 8);

        let payload = [0x5a_u8; 512];
        memory.write(DATA_ADDR, &payload).unwrap();
        enqueue_rw_request(&memory, VIRTIO_BLK_T_OUT, 3, 512, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        // OUT publishes only the status byte.
        assert_eq!(used_elem(&memory, 0), (0, 1));

        memory.write(DATA_ADDR, &[0u8; 512]).unwrap();
        enqueue_rw_request(&memory, VIRTIO_BLK_T_IN, 3, 512, VIRTQ_DESC_F_WRITE);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut data = vec![0u8; 512];
        memory.read(DATA_ADDR, &mut data).unwrap();
        assert_eq!(data, payload);
        assert_eq!(used_idx(&memory), 2);
    }

    #[test]
    fn test_flush_request() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);

        write_req_header(&memory, VIRTIO_BLK_T_FLUSH, 0);
        write_desc(&memory, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&memory, 1, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);
        publish(&memory, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut status = [0xffu8];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
        assert_eq!(used_elem(&memory, 0), (0, 1));
    }

    #[test]
    fn test_unsupported_request_type() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);
        let status_before = dev.state.status;

        enqueue_rw_request(&memory, 7, 0, 512, VIRTQ_DESC_F_WRITE);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut status = [0xffu8];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP);

        // The device stays operational.
        assert_eq!(dev.state.status, status_before);
        assert_eq!(used_idx(&memory), 1);
    }

    #[test]
    fn test_malformed_chain_completes_without_status() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);

        // Final descriptor is not device-writable.
        write_req_header(&memory, VIRTIO_BLK_T_IN, 0);
        write_desc(&memory, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&memory, 1, STATUS_ADDR, 1, 0, 0);
        publish(&memory, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        // Used entry published with len 0, device still operational.
        assert_eq!(used_idx(&memory), 1);
        assert_eq!(used_elem(&memory, 0), (0, 0));
        assert_eq!(dev.state.status & STATUS_NEEDS_RESET, 0);
    }

    #[test]
    fn test_descriptor_loop_is_contained() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);

        write_desc(&memory, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, 0);
        publish(&memory, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        assert_eq!(used_idx(&memory), 1);
        assert_eq!(used_elem(&memory, 0), (0, 0));
        assert_eq!(dev.state.status & STATUS_NEEDS_RESET, 0);
    }

    #[test]
    fn test_empty_chain_reports_unsupp() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);
        let status_before = dev.state.status;

        // Lone head descriptor, NEXT clear, zero length: nothing to
        // execute and no byte to carry a verdict.
        write_desc(&memory, 0, HEADER_ADDR, 0, 0, 0);
        publish(&memory, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        assert_eq!(used_idx(&memory), 1);
        assert_eq!(used_elem(&memory, 0), (0, 0));
        assert_eq!(dev.state.status, status_before);

        // If the lone descriptor is device-writable it does carry UNSUPP.
        memory.write_u8(STATUS_ADDR, 0xff).unwrap();
        write_desc(&memory, 0, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);
        publish(&memory, 0);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        let mut status = [0u8];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP);
        assert_eq!(used_elem(&memory, 1), (0, 1));
        assert_eq!(dev.state.status, status_before);
    }

    #[test]
    fn test_oversize_queue_num_needs_reset() {
        let (mut dev, _memory, irq, _disk) = test_device(&[0u8; 512]);

        write_reg(&mut dev, MMIO_QUEUE_SEL, 0);
        write_reg(&mut dev, MMIO_QUEUE_NUM, 4096);

        assert_eq!(dev.state.status, STATUS_NEEDS_RESET);
        assert_eq!(dev.state.interrupt_status & INT_CONFIG, INT_CONFIG);
        assert_eq!(irq.last(), Some(true));
    }

    #[test]
    fn test_feature_mismatch_needs_reset() {
        let (mut dev, _memory, irq, _disk) = test_device(&[0u8; 512]);

        write_reg(&mut dev, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        write_reg(&mut dev, MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        // Driver accepts word 0 but never acknowledges VIRTIO_F_VERSION_1.
        write_reg(&mut dev, MMIO_DRIVER_FEATURES_SEL, 0);
        write_reg(&mut dev, MMIO_DRIVER_FEATURES, VIRTIO_BLK_F_FLUSH);
        write_reg(
            &mut dev,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );

        assert_eq!(dev.state.status, STATUS_NEEDS_RESET);
        assert_eq!(irq.last(), Some(true));
    }

    #[test]
    fn test_bad_ring_address_needs_reset() {
        let (mut dev, _memory, irq, _disk) = test_device(&[0u8; 512]);
        bring_up(&mut dev, 8);

        // Point the available ring outside guest memory, then notify.
        write_reg(&mut dev, MMIO_QUEUE_AVAIL_LOW, 0xffff_0000);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        assert_eq!(dev.state.status, STATUS_NEEDS_RESET);
        assert_eq!(dev.state.interrupt_status & INT_CONFIG, INT_CONFIG);
        assert_eq!(irq.last(), Some(true));
    }

    #[test]
    fn test_interrupt_ack_deasserts_line() {
        let (mut dev, memory, irq, _disk) = test_device(&[0u8; 1024]);
        bring_up(&mut dev, 8);

        enqueue_rw_request(&memory, VIRTIO_BLK_T_IN, 0, 512, VIRTQ_DESC_F_WRITE);
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(irq.last(), Some(true));
        assert_eq!(read_reg(&mut dev, MMIO_INTERRUPT_STATUS), INT_VRING);

        write_reg(&mut dev, MMIO_INTERRUPT_ACK, INT_VRING);
        assert_eq!(read_reg(&mut dev, MMIO_INTERRUPT_STATUS), 0);
        assert_eq!(irq.last(), Some(false));
    }

    #[test]
    fn test_reset_clears_volatile_keeps_static() {
        let (mut dev, _memory, _irq, _disk) = test_device(&[0u8; 2048]);
        bring_up(&mut dev, 256);

        write_reg(&mut dev, MMIO_STATUS, 0);

        assert_eq!(dev.state.status, 0);
        assert_eq!(dev.state.negotiated_features, [0, 0]);
        assert_eq!(dev.state.interrupt_status, 0);
        assert!(!dev.queue.ready);
        assert_eq!(dev.queue.size, 0);
        assert_eq!(dev.queue.desc_addr, 0);

        // Static half survives: offered features and capacity.
        write_reg(&mut dev, MMIO_DEVICE_FEATURES_SEL, 0);
        assert_eq!(read_reg(&mut dev, MMIO_DEVICE_FEATURES), VIRTIO_BLK_F_FLUSH);
        let mut capacity = [0u8; 8];
        dev.read(MMIO_CONFIG, &mut capacity);
        assert_eq!(u64::from_le_bytes(capacity), 4);
    }

    #[test]
    fn test_consumer_cursor_catches_up() {
        let (mut dev, memory, _irq, _disk) = test_device(&[0u8; 4096]);
        bring_up(&mut dev, 8);

        for sector in 0..3 {
            enqueue_rw_request(&memory, VIRTIO_BLK_T_IN, sector, 512, VIRTQ_DESC_F_WRITE);
        }
        write_reg(&mut dev, MMIO_QUEUE_NOTIFY, 0);

        assert_eq!(dev.queue.last_avail_idx, 3);
        assert_eq!(used_idx(&memory), 3);
    }
}
