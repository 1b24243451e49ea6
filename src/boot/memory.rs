//! Guest physical memory, backed by the vm-memory crate.
//!
//! The guest sees one contiguous RAM region starting at physical address 0.
//! The VMM side accesses it through this wrapper, which validates every
//! guest-physical address before touching the mapping. Device emulation
//! dereferences addresses the guest driver hands us (ring bases, buffer
//! pointers), so an out-of-range address must surface as [`BadGuestAddress`]
//! rather than a wild host pointer.
//!
//! All multi-byte accessors are little-endian, matching both the x86 guest
//! and the virtio wire format. Shared ring structures are read and written
//! field by field through these accessors, never as whole host-native
//! struct copies.

use super::BootError;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// A guest-physical access that falls outside the memory region.
#[derive(Debug, Clone, Copy, Error)]
#[error("guest address {addr:#x} (+{len} bytes) is outside guest memory")]
pub struct BadGuestAddress {
    /// Faulting guest-physical address.
    pub addr: u64,
    /// Size of the attempted access.
    pub len: usize,
}

/// Guest physical memory region.
///
/// Thin wrapper around `GuestMemoryMmap` for our single-region layout.
/// Cloning is cheap (the mapped regions are shared), which lets devices
/// hold their own handle to guest memory.
#[derive(Clone)]
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate an anonymous private mapping of `size` bytes at guest
    /// physical address 0.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions = vec![(GuestAddress(0), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!(
                "failed to map guest memory: {e}"
            )))
        })?;

        Ok(Self { inner, size })
    }

    /// Host virtual address and length of the region, for registering the
    /// KVM memory slot. The pointer is valid only while `self` lives.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), BadGuestAddress> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BadGuestAddress { addr, len }),
        }
    }

    /// Read `buf.len()` bytes starting at guest physical `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), BadGuestAddress> {
        self.check(addr, buf.len())?;
        self.inner
            .read_slice(buf, GuestAddress(addr))
            .map_err(|_| BadGuestAddress {
                addr,
                len: buf.len(),
            })
    }

    /// Write `data` starting at guest physical `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BadGuestAddress> {
        self.check(addr, data.len())?;
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| BadGuestAddress {
                addr,
                len: data.len(),
            })
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, BadGuestAddress> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, BadGuestAddress> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, BadGuestAddress> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), BadGuestAddress> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), BadGuestAddress> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), BadGuestAddress> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), BadGuestAddress> {
        self.write(addr, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(4096).unwrap();
        let (_, size) = mem.as_raw_parts();
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_typed_accessors_little_endian() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u32(100, 0x12345678).unwrap();
        assert_eq!(read_vec(&mem, 100, 4), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(mem.read_u32(100).unwrap(), 0x12345678);

        mem.write_u64(200, 0x123456789abcdef0).unwrap();
        assert_eq!(mem.read_u64(200).unwrap(), 0x123456789abcdef0);

        mem.write_u16(300, 0xbeef).unwrap();
        assert_eq!(mem.read_u16(300).unwrap(), 0xbeef);
    }

    #[test]
    fn test_clone_shares_region() {
        let mem = GuestMemory::new(4096).unwrap();
        let other = mem.clone();
        mem.write(8, &[0xaa]).unwrap();
        assert_eq!(read_vec(&other, 8, 1), vec![0xaa]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        let err = mem.write(99, &[1, 2]).unwrap_err();
        assert_eq!(err.addr, 99);
        assert_eq!(err.len, 2);

        let mut buf = [0u8; 2];
        assert!(mem.read(99, &mut buf).is_err());
        assert!(mem.read_u64(u64::MAX - 4).is_err());
    }
}
