//! Backing block device abstraction for the replication data plane.
//!
//! This crate defines the seam between `rdbd-core`/`rdbd-replicator` and a
//! real local disk. The actual "host block-device shim" (request queue,
//! open/close, ioctl surface) and the "backing-disk submission primitive"
//! are external collaborators by design (see spec §1); this crate only
//! specifies the trait such a collaborator implements, plus an in-memory
//! backend used by tests and the CLI demo mode.
//!
//! # Example
//!
//! ```
//! use rdbd_block_device::{BlockDevice, MemoryBlockDevice};
//!
//! # async fn run() {
//! let mut dev = MemoryBlockDevice::new(1024);
//! let mut buf = [0u8; 512];
//! dev.write_sector(0, &[1; 512]).await.unwrap();
//! dev.read_sector(0, &mut buf).await.unwrap();
//! assert_eq!(buf, [1u8; 512]);
//! # }
//! ```

#![warn(missing_docs)]
#![allow(async_fn_in_trait)]

use std::fmt;

/// Sector size in bytes. DRBD-style devices address storage in 512-byte
/// sectors regardless of the backing device's physical block size.
pub const SECTOR_SIZE: usize = 512;

/// A single 512-byte sector buffer.
pub type Sector = [u8; SECTOR_SIZE];

/// Errors a [`BlockDevice`] implementation may report.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The requested sector range is outside the device.
    #[error("sector {sector} + {count} exceeds device capacity of {capacity} sectors")]
    OutOfRange {
        /// First sector requested.
        sector: u64,
        /// Number of sectors requested.
        count: u64,
        /// Device capacity in sectors.
        capacity: u64,
    },
    /// The backing medium rejected the I/O.
    #[error("backing device I/O error: {0}")]
    Io(String),
}

/// A trait for the local backing store a replicated device writes through
/// to and reads from.
///
/// All addresses are zero-indexed 512-byte sectors, matching the `sector_t`
/// convention used throughout the replication core.
pub trait BlockDevice: Send {
    /// Read `data.len() / SECTOR_SIZE` contiguous sectors starting at
    /// `sector` into `data`.
    async fn read(&mut self, sector: u64, data: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `data.len() / SECTOR_SIZE` contiguous sectors starting at
    /// `sector` from `data`.
    async fn write(&mut self, sector: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Flush any buffered writes, analogous to `WRITE | FLUSH | FUA`.
    async fn flush(&mut self) -> Result<(), DeviceError>;

    /// Report device capacity in sectors.
    fn capacity_sectors(&self) -> u64;

    /// Convenience: read exactly one sector.
    async fn read_sector(&mut self, sector: u64, data: &mut Sector) -> Result<(), DeviceError> {
        self.read(sector, data).await
    }

    /// Convenience: write exactly one sector.
    async fn write_sector(&mut self, sector: u64, data: &Sector) -> Result<(), DeviceError> {
        self.write(sector, data).await
    }
}

/// A `Vec`-backed [`BlockDevice`] used by tests and `rdbd-cli --demo` mode.
///
/// Not intended for production use: it holds the entire device in memory
/// and has no crash-consistency guarantees of its own (those are exactly
/// what the replication core above it provides).
pub struct MemoryBlockDevice {
    sectors: Vec<Sector>,
    write_count: u64,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `capacity_sectors` sectors.
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; capacity_sectors as usize],
            write_count: 0,
        }
    }

    /// Number of successful `write` calls since creation, for test assertions.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    fn check_range(&self, sector: u64, byte_len: usize) -> Result<u64, DeviceError> {
        if byte_len % SECTOR_SIZE != 0 {
            return Err(DeviceError::Io(format!(
                "buffer length {byte_len} is not a sector multiple"
            )));
        }
        let count = (byte_len / SECTOR_SIZE) as u64;
        if sector.saturating_add(count) > self.capacity_sectors() {
            return Err(DeviceError::OutOfRange {
                sector,
                count,
                capacity: self.capacity_sectors(),
            });
        }
        Ok(count)
    }
}

impl BlockDevice for MemoryBlockDevice {
    async fn read(&mut self, sector: u64, data: &mut [u8]) -> Result<(), DeviceError> {
        let count = self.check_range(sector, data.len())?;
        for i in 0..count {
            let src = &self.sectors[(sector + i) as usize];
            let dst = &mut data[(i as usize) * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    async fn write(&mut self, sector: u64, data: &[u8]) -> Result<(), DeviceError> {
        let count = self.check_range(sector, data.len())?;
        for i in 0..count {
            let src = &data[(i as usize) * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            self.sectors[(sector + i) as usize].copy_from_slice(src);
        }
        self.write_count += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.sectors.len() as u64
    }
}

impl fmt::Debug for MemoryBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlockDevice")
            .field("capacity_sectors", &self.capacity_sectors())
            .field("write_count", &self.write_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_sector() {
        let mut dev = MemoryBlockDevice::new(8);
        let data = [7u8; SECTOR_SIZE];
        dev.write_sector(3, &data).await.unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        dev.read_sector(3, &mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(dev.write_count(), 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range() {
        let mut dev = MemoryBlockDevice::new(4);
        let data = [0u8; SECTOR_SIZE];
        let err = dev.write_sector(4, &data).await.unwrap_err();
        assert!(matches!(err, DeviceError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn multi_sector_io() {
        let mut dev = MemoryBlockDevice::new(4);
        let data = [9u8; SECTOR_SIZE * 2];
        dev.write(1, &data).await.unwrap();
        let mut out = vec![0u8; SECTOR_SIZE * 2];
        dev.read(1, &mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
