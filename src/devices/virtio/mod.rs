//! Virtio over MMIO.
//!
//! The device appears to the guest as a bank of 32-bit registers in a 4 KiB
//! MMIO window, discovered via the kernel command line:
//!
//! ```text
//! virtio_mmio.device=0x1000@0x80000000:5
//! ```
//!
//! Requests travel over a split virtqueue: three guest-allocated arrays
//! (descriptor table, available ring, used ring) in guest physical memory.
//! The driver produces descriptor chains into the available ring and kicks
//! `QUEUE_NOTIFY`; the device consumes them, performs the I/O, publishes
//! completions into the used ring, and asserts its interrupt line.
//!
//! We implement the modern transport (MMIO version 2) only, without
//! indirect descriptors or EVENT_IDX.
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod blk;
pub mod queue;

use crate::boot::BadGuestAddress;
use thiserror::Error;

// ============================================================================
// MMIO register offsets (virtio-mmio v2)
// ============================================================================

/// Magic value register - always reads as "virt" (0x74726976).
pub const MMIO_MAGIC_VALUE: u64 = 0x000;
/// Version register - we implement version 2.
pub const MMIO_VERSION: u64 = 0x004;
/// Device type ID register.
pub const MMIO_DEVICE_ID: u64 = 0x008;
/// Vendor ID register.
pub const MMIO_VENDOR_ID: u64 = 0x00c;
/// Device features register (read), word selected by DEVICE_FEATURES_SEL.
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
/// Device features selection register (write).
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
/// Driver features register (write), word selected by DRIVER_FEATURES_SEL.
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;
/// Driver features selection register (write).
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
/// Queue selection register (write).
pub const MMIO_QUEUE_SEL: u64 = 0x030;
/// Maximum queue size register (read).
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;
/// Queue size register (write).
pub const MMIO_QUEUE_NUM: u64 = 0x038;
/// Queue ready register (read/write).
pub const MMIO_QUEUE_READY: u64 = 0x044;
/// Queue notify register (write).
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;
/// Interrupt status register (read).
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;
/// Interrupt acknowledge register (write).
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;
/// Device status register (read/write).
pub const MMIO_STATUS: u64 = 0x070;
/// Queue descriptor table address, low/high halves (write).
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
/// Available ring address, low/high halves (write).
pub const MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
/// Used ring address, low/high halves (write).
pub const MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
/// Configuration generation counter (read).
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;
/// Start of the device-specific configuration space.
pub const MMIO_CONFIG: u64 = 0x100;

/// Magic value "virt" (little-endian).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
/// MMIO transport version we implement (modern).
pub const VIRTIO_MMIO_VERSION_MODERN: u32 = 2;
/// Our vendor ID (arbitrary, not registered).
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

// ============================================================================
// Device status bits (virtio 1.x)
// ============================================================================

/// Guest has found the device.
pub const STATUS_ACKNOWLEDGE: u32 = 1;
/// Guest has matched a driver.
pub const STATUS_DRIVER: u32 = 2;
/// Driver is fully operational.
pub const STATUS_DRIVER_OK: u32 = 4;
/// Feature negotiation is complete.
pub const STATUS_FEATURES_OK: u32 = 8;
/// Device hit an error; the driver must reset it to recover.
pub const STATUS_NEEDS_RESET: u32 = 0x40;
/// Driver has given up on the device.
pub const STATUS_FAILED: u32 = 0x80;

/// Interrupt status: a used-ring buffer was published.
pub const INT_VRING: u32 = 1;
/// Interrupt status: the device configuration changed (or needs reset).
pub const INT_CONFIG: u32 = 2;

/// Errors raised while servicing the virtio device.
///
/// The fault policy lives in the block device: a [`BadGuestAddress`] moves
/// the device to NEEDS_RESET, chain- and request-level errors complete the
/// offending request with a non-OK status byte and leave the device
/// operational.
#[derive(Debug, Error)]
pub enum VirtioError {
    #[error(transparent)]
    BadGuestAddress(#[from] BadGuestAddress),

    #[error("descriptor chain is malformed (loop, bad link, or bad flags)")]
    MalformedChain,

    #[error("unsupported block request type {0}")]
    UnsupportedRequest(u32),

    #[error("indirect descriptors are not supported")]
    IndirectDescriptor,

    #[error("disk I/O failed: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("driver did not accept VIRTIO_F_VERSION_1")]
    FeatureMismatch,

    #[error("queue size {requested} exceeds maximum {max}")]
    QueueSizeTooLarge { requested: u32, max: u32 },
}

/// One guest interrupt line, owned by a device.
///
/// The production implementation drives `KVM_IRQ_LINE` on the VM fd; tests
/// substitute a recorder. Assert and deassert are idempotent from the
/// device's point of view.
pub trait IrqLine {
    fn set_level(&self, active: bool) -> std::io::Result<()>;
}
