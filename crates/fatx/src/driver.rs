use core::fmt::Debug;

use crate::{Cluster, FatError, LogicalSector};

/// What a sector holds. Passed to the driver with every request so it can
/// treat system sectors differently (e.g. write them through).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SectorType {
    #[default]
    Unknown,
    Boot,
    Fat,
    /// exFAT allocation bitmap.
    Bitmap,
    Directory,
    Data,
}

/// Raw storage under a volume. All calls are synchronous; the engine never
/// retries a failed request, so any retry policy belongs here.
///
/// `buf` always holds exactly `count` sectors.
pub trait BlockDriver: Debug {
    fn read(
        &mut self,
        sector: LogicalSector,
        count: u32,
        buf: &mut [u8],
        sector_type: SectorType,
    ) -> Result<(), FatError>;

    fn write(
        &mut self,
        sector: LogicalSector,
        count: u32,
        buf: &[u8],
        sector_type: SectorType,
    ) -> Result<(), FatError>;

    /// Reads the boot record (sector 0 of the volume) into `buf`, which is at
    /// least 512 bytes.
    fn boot_read(&mut self, buf: &mut [u8]) -> Result<(), FatError>;

    fn boot_write(&mut self, buf: &[u8]) -> Result<(), FatError>;

    /// Checked before every mutating operation.
    fn write_protected(&self) -> bool {
        false
    }
}

/// Hook into an external redo log. While a transaction is open the engine
/// routes every metadata write here instead of to the driver, and consults
/// the `read_*` overlays when it loads metadata from disk.
pub trait FaultTolerantLog: Debug {
    fn transaction_start(&mut self) -> Result<(), FatError>;

    /// Commits the transaction. On error the engine behaves as if nothing in
    /// the transaction happened.
    fn transaction_end(&mut self) -> Result<(), FatError>;

    /// Discards the open transaction after an engine-side failure.
    fn transaction_fail(&mut self) {}

    /// `bytes` replace the directory sector contents starting at `offset`.
    fn add_dir_log(
        &mut self,
        sector: LogicalSector,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), FatError>;

    fn add_fat_log(&mut self, cluster: Cluster, value: u32) -> Result<(), FatError>;

    fn add_bitmap_log(&mut self, cluster: Cluster, occupied: bool) -> Result<(), FatError>;

    /// Pending FAT value for `cluster`, if the open transaction changed it.
    fn read_fat(&mut self, _cluster: Cluster) -> Option<u32> {
        None
    }

    /// Pending bitmap state for `cluster`, if the open transaction changed it.
    fn read_bitmap(&mut self, _cluster: Cluster) -> Option<bool> {
        None
    }

    /// Applies pending directory changes to a sector just loaded from disk.
    fn read_directory_sector(
        &mut self,
        _sector: LogicalSector,
        _buf: &mut [u8],
    ) -> Result<(), FatError> {
        Ok(())
    }
}
