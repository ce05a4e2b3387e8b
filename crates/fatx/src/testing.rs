//! In-memory disks, images and a recording redo log for unit tests.

use std::sync::{Arc, Mutex, Once};

use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromZeroes};

use crate::{
    AllocationEntry, Attributes, BiosParameterBlock, BlockDriver, Cluster, ExFatBootSector,
    FatError, FatKind, Fat32Extension, FaultTolerantLog, FsInfoSector, LogicalSector, SectorType,
    ShortEntry, ALLOCATION_BITMAP, DIR_ENTRY_SIZE, FAT_ENTRY_START, UPCASE_TABLE,
};

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;
static LOGGER_INIT: Once = Once::new();

/// Routes `log` output to stderr, where the test harness captures it.
pub fn init_logging() {
    LOGGER_INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Debug);
        }
    });
}

/// Sector-addressed disk held in memory.
#[derive(Debug, Clone)]
pub struct RamDisk {
    pub bytes_per_sector: usize,
    pub data: Vec<u8>,
    /// Reads touching this sector fail with `Io`.
    pub fail_read_sector: Option<u64>,
    pub fail_write_sector: Option<u64>,
    pub write_protected: bool,
    pub reads: u64,
    pub writes: u64,
}

impl RamDisk {
    pub fn new(bytes_per_sector: usize, sectors: usize) -> Self {
        Self::from_image(bytes_per_sector, vec![0; bytes_per_sector * sectors])
    }

    pub fn from_image(bytes_per_sector: usize, data: Vec<u8>) -> Self {
        Self {
            bytes_per_sector,
            data,
            fail_read_sector: None,
            fail_write_sector: None,
            write_protected: false,
            reads: 0,
            writes: 0,
        }
    }

    fn range(&self, sector: LogicalSector, count: u32) -> Result<core::ops::Range<usize>, FatError> {
        let start = sector.0 as usize * self.bytes_per_sector;
        let end = start + count as usize * self.bytes_per_sector;
        if end > self.data.len() {
            return Err(FatError::SectorInvalid);
        }
        Ok(start..end)
    }

    fn hits(failing: Option<u64>, sector: LogicalSector, count: u32) -> bool {
        failing.is_some_and(|failing| (sector.0..sector.0 + u64::from(count)).contains(&failing))
    }
}

impl BlockDriver for RamDisk {
    fn read(
        &mut self,
        sector: LogicalSector,
        count: u32,
        buf: &mut [u8],
        _sector_type: SectorType,
    ) -> Result<(), FatError> {
        if Self::hits(self.fail_read_sector, sector, count) {
            return Err(FatError::Io);
        }
        let range = self.range(sector, count)?;
        buf[..range.len()].copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write(
        &mut self,
        sector: LogicalSector,
        count: u32,
        buf: &[u8],
        _sector_type: SectorType,
    ) -> Result<(), FatError> {
        if self.write_protected {
            return Err(FatError::WriteProtect);
        }
        if Self::hits(self.fail_write_sector, sector, count) {
            return Err(FatError::Io);
        }
        let range = self.range(sector, count)?;
        let len = range.len();
        self.data[range].copy_from_slice(&buf[..len]);
        self.writes += 1;
        Ok(())
    }

    fn boot_read(&mut self, buf: &mut [u8]) -> Result<(), FatError> {
        if Self::hits(self.fail_read_sector, LogicalSector(0), 1) {
            return Err(FatError::Io);
        }
        buf[..512].copy_from_slice(&self.data[..512]);
        Ok(())
    }

    fn boot_write(&mut self, buf: &[u8]) -> Result<(), FatError> {
        if self.write_protected {
            return Err(FatError::WriteProtect);
        }
        self.data[..512].copy_from_slice(&buf[..512]);
        Ok(())
    }

    fn write_protected(&self) -> bool {
        self.write_protected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Start,
    End,
    Fail,
    Dir(LogicalSector, usize, Vec<u8>),
    Fat(Cluster, u32),
    Bitmap(Cluster, bool),
}

/// Redo log that only records what it is given. Pending FAT and bitmap
/// values of the open transaction are served back through the overlays.
#[derive(Debug, Default)]
pub struct RecordingLog {
    pub records: Arc<Mutex<Vec<LogRecord>>>,
    pub fail_end: bool,
}

impl RecordingLog {
    fn push(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Records of the open transaction, newest first.
    fn pending(&self) -> Vec<LogRecord> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .rev()
            .take_while(|record| **record != LogRecord::Start)
            .cloned()
            .collect()
    }
}

impl FaultTolerantLog for RecordingLog {
    fn transaction_start(&mut self) -> Result<(), FatError> {
        self.push(LogRecord::Start);
        Ok(())
    }

    fn transaction_end(&mut self) -> Result<(), FatError> {
        if self.fail_end {
            self.push(LogRecord::Fail);
            return Err(FatError::Io);
        }
        self.push(LogRecord::End);
        Ok(())
    }

    fn transaction_fail(&mut self) {
        self.push(LogRecord::Fail);
    }

    fn add_dir_log(
        &mut self,
        sector: LogicalSector,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), FatError> {
        self.push(LogRecord::Dir(sector, offset, bytes.to_vec()));
        Ok(())
    }

    fn add_fat_log(&mut self, cluster: Cluster, value: u32) -> Result<(), FatError> {
        self.push(LogRecord::Fat(cluster, value));
        Ok(())
    }

    fn add_bitmap_log(&mut self, cluster: Cluster, occupied: bool) -> Result<(), FatError> {
        self.push(LogRecord::Bitmap(cluster, occupied));
        Ok(())
    }

    fn read_fat(&mut self, cluster: Cluster) -> Option<u32> {
        self.pending().into_iter().find_map(|record| match record {
            LogRecord::Fat(logged, value) if logged == cluster => Some(value),
            _ => None,
        })
    }

    fn read_bitmap(&mut self, cluster: Cluster) -> Option<bool> {
        self.pending().into_iter().find_map(|record| match record {
            LogRecord::Bitmap(logged, occupied) if logged == cluster => Some(occupied),
            _ => None,
        })
    }

    fn read_directory_sector(
        &mut self,
        sector: LogicalSector,
        buf: &mut [u8],
    ) -> Result<(), FatError> {
        for record in self.pending().into_iter().rev() {
            if let LogRecord::Dir(logged, offset, bytes) = record {
                if logged == sector {
                    buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
            }
        }
        Ok(())
    }
}

/// Builds freshly formatted volumes. Every image has 512-byte sectors and
/// an empty root directory.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    kind: FatKind,
}

impl ImageBuilder {
    /// 1.44 MB floppy layout: 2847 clusters, 224 root entries.
    pub const fn fat12() -> Self {
        Self {
            kind: FatKind::Fat12,
        }
    }

    /// 4 MiB, one sector per cluster, 512 root entries.
    pub const fn fat16() -> Self {
        Self {
            kind: FatKind::Fat16,
        }
    }

    /// Just over the FAT32 cluster threshold. The root is cluster 2.
    pub const fn fat32() -> Self {
        Self {
            kind: FatKind::Fat32,
        }
    }

    /// 1024 clusters of 4 KiB: bitmap in cluster 2, up-case table in 3, root
    /// in 4.
    pub const fn exfat() -> Self {
        Self {
            kind: FatKind::ExFat,
        }
    }

    pub fn build(self) -> TestImage {
        init_logging();
        match self.kind {
            FatKind::ExFat => build_exfat(),
            kind => build_legacy(kind),
        }
    }
}

const BYTES_PER_SECTOR: usize = 512;

fn build_legacy(kind: FatKind) -> TestImage {
    // (total sectors, reserved, sectors per FAT, root entries)
    let (total_sectors, reserved, sectors_per_fat, root_entries) = match kind {
        FatKind::Fat12 => (2880_u32, 1_u16, 9_u32, 224_u16),
        FatKind::Fat16 => (8192, 1, 32, 512),
        _ => (66600, 32, 520, 0),
    };
    let fat_count = 2_u32;

    let mut bpb = BiosParameterBlock::new_zeroed();
    bpb.jmp_boot = [0xEB, 0x3C, 0x90];
    bpb.oem_name = *b"FATXTEST";
    bpb.bytes_per_sector = U16::new(BYTES_PER_SECTOR as u16);
    bpb.sectors_per_cluster = 1;
    bpb.reserved_sectors = U16::new(reserved);
    bpb.fat_count = fat_count as u8;
    bpb.root_dir_entries = U16::new(root_entries);
    bpb.media_descriptor = 0xF8;
    bpb.sectors_per_track = U16::new(32);
    bpb.head_count = U16::new(2);
    if kind == FatKind::Fat32 {
        bpb.total_sectors_large = U32::new(total_sectors);
    } else {
        bpb.total_sectors = U16::new(total_sectors as u16);
        bpb.sectors_per_fat = U16::new(sectors_per_fat as u16);
    }

    let mut data = vec![0; total_sectors as usize * BYTES_PER_SECTOR];
    data[..bpb.as_bytes().len()].copy_from_slice(bpb.as_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;

    let root_sectors = u32::from(root_entries) * DIR_ENTRY_SIZE as u32 / BYTES_PER_SECTOR as u32;
    let root_start = u32::from(reserved) + fat_count * sectors_per_fat;
    let data_start = root_start + root_sectors;
    let total_clusters = total_sectors - data_start;

    let mut image = TestImage {
        data,
        kind,
        sectors_per_cluster: 1,
        fat_start: u32::from(reserved),
        sectors_per_fat,
        fat_count,
        root_start,
        data_start,
        root_cluster: Cluster::NONE,
        bitmap_cluster: 0,
        upcase_cluster: 0,
        total_clusters,
        write_protected: false,
    };

    let (media, end) = match kind {
        FatKind::Fat12 => (0xFF8, 0xFFF),
        FatKind::Fat16 => (0xFFF8, 0xFFFF),
        _ => (0x0FFF_FFF8, 0x0FFF_FFFF),
    };
    image.set_fat(0, media);
    image.set_fat(1, end);

    if kind == FatKind::Fat32 {
        let mut extension = Fat32Extension::new_zeroed();
        extension.sectors_per_fat = U32::new(sectors_per_fat);
        extension.root_cluster = U32::new(FAT_ENTRY_START);
        extension.fs_info_sector = U16::new(1);
        extension.backup_boot_sector = U16::new(6);
        extension.boot_signature = 0x29;
        extension.volume_label = *b"NO NAME    ";
        extension.fs_type = *b"FAT32   ";
        let start = core::mem::size_of::<BiosParameterBlock>();
        image.data[start..start + extension.as_bytes().len()].copy_from_slice(extension.as_bytes());

        let mut info = FsInfoSector::new_zeroed();
        info.lead_signature = U32::new(FsInfoSector::LEAD_SIGNATURE);
        info.struct_signature = U32::new(FsInfoSector::STRUCT_SIGNATURE);
        info.free_count = U32::new(u32::MAX);
        info.next_free = U32::new(u32::MAX);
        info.trail_signature = U32::new(0xAA55_0000);
        image.data[BYTES_PER_SECTOR..2 * BYTES_PER_SECTOR].copy_from_slice(info.as_bytes());

        image.root_cluster = Cluster::FIRST;
        image.set_fat(FAT_ENTRY_START, end);
    }
    image
}

fn build_exfat() -> TestImage {
    const FAT_OFFSET: u32 = 32;
    const FAT_LENGTH: u32 = 16;
    const HEAP_OFFSET: u32 = 64;
    const CLUSTERS: u32 = 1024;
    const SECTORS_PER_CLUSTER_SHIFT: u8 = 3;

    let sectors_per_cluster = 1 << SECTORS_PER_CLUSTER_SHIFT;
    let total_sectors = HEAP_OFFSET + CLUSTERS * sectors_per_cluster;

    let mut boot = ExFatBootSector::new_zeroed();
    boot.jmp_boot = [0xEB, 0x76, 0x90];
    boot.fs_name = ExFatBootSector::FS_NAME;
    boot.volume_length = U64::new(u64::from(total_sectors));
    boot.fat_offset = U32::new(FAT_OFFSET);
    boot.fat_length = U32::new(FAT_LENGTH);
    boot.cluster_heap_offset = U32::new(HEAP_OFFSET);
    boot.cluster_count = U32::new(CLUSTERS);
    boot.root_cluster = U32::new(4);
    boot.volume_serial_number = U32::new(0x1234_5678);
    boot.file_system_revision = U16::new(0x0100);
    boot.bytes_per_sector_shift = 9;
    boot.sectors_per_cluster_shift = SECTORS_PER_CLUSTER_SHIFT;
    boot.number_of_fats = 1;
    boot.drive_select = 0x80;

    let mut data = vec![0; total_sectors as usize * BYTES_PER_SECTOR];
    data[..boot.as_bytes().len()].copy_from_slice(boot.as_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;

    let mut image = TestImage {
        data,
        kind: FatKind::ExFat,
        sectors_per_cluster,
        fat_start: FAT_OFFSET,
        sectors_per_fat: FAT_LENGTH,
        fat_count: 1,
        root_start: HEAP_OFFSET + 2 * sectors_per_cluster,
        data_start: HEAP_OFFSET,
        root_cluster: Cluster(4),
        bitmap_cluster: 2,
        upcase_cluster: 3,
        total_clusters: CLUSTERS,
        write_protected: false,
    };

    image.set_fat(0, 0xFFFF_FFF8);
    image.set_fat(1, 0xFFFF_FFFF);
    for cluster in 2..=4 {
        image.set_fat(cluster, 0xFFFF_FFFF);
        image.set_bitmap(cluster, true);
    }

    let mut bitmap = AllocationEntry::new_zeroed();
    bitmap.entry_type = ALLOCATION_BITMAP;
    bitmap.first_cluster = U32::new(image.bitmap_cluster);
    bitmap.data_length = U64::new(u64::from(CLUSTERS.div_ceil(8)));
    image.write_slot(0, bitmap.as_bytes());

    let mut upcase = AllocationEntry::new_zeroed();
    upcase.entry_type = UPCASE_TABLE;
    upcase.first_cluster = U32::new(image.upcase_cluster);
    upcase.data_length = U64::new(128);
    image.write_slot(1, upcase.as_bytes());
    image
}

/// A formatted volume as raw bytes, plus where its structures are.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub data: Vec<u8>,
    pub kind: FatKind,
    pub sectors_per_cluster: u32,
    fat_start: u32,
    sectors_per_fat: u32,
    fat_count: u32,
    /// First sector of the fixed root, or of the root cluster.
    root_start: u32,
    data_start: u32,
    /// `Cluster::NONE` for FAT12/16.
    pub root_cluster: Cluster,
    /// exFAT only.
    pub bitmap_cluster: u32,
    pub upcase_cluster: u32,
    pub total_clusters: u32,
    pub write_protected: bool,
}

impl TestImage {
    pub const fn bytes_per_cluster(&self) -> usize {
        self.sectors_per_cluster as usize * BYTES_PER_SECTOR
    }

    /// Sets a FAT slot in every FAT copy. FAT32 values are stored as given,
    /// reserved bits included.
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..self.fat_count {
            let base = (self.fat_start + copy * self.sectors_per_fat) as usize * BYTES_PER_SECTOR;
            match self.kind {
                FatKind::Fat12 => {
                    let offset = base + cluster as usize * 3 / 2;
                    let value = (value & 0x0FFF) as u16;
                    let old = u16::from_le_bytes([self.data[offset], self.data[offset + 1]]);
                    let new = if cluster & 1 == 1 {
                        (old & 0x000F) | (value << 4)
                    } else {
                        (old & 0xF000) | value
                    };
                    self.data[offset..offset + 2].copy_from_slice(&new.to_le_bytes());
                }
                FatKind::Fat16 => {
                    let offset = base + cluster as usize * 2;
                    self.data[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
                }
                FatKind::Fat32 | FatKind::ExFat => {
                    let offset = base + cluster as usize * 4;
                    self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    /// Links `clusters` into one chain ending in end-of-chain.
    pub fn set_chain(&mut self, clusters: &[u32]) {
        let end = self.kind.last();
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, end);
        }
    }

    pub fn fat_value(&self, cluster: u32) -> u32 {
        let base = self.fat_start as usize * BYTES_PER_SECTOR;
        match self.kind {
            FatKind::Fat12 => {
                let offset = base + cluster as usize * 3 / 2;
                let pair = u16::from_le_bytes([self.data[offset], self.data[offset + 1]]);
                u32::from(if cluster & 1 == 1 { pair >> 4 } else { pair & 0x0FFF })
            }
            FatKind::Fat16 => {
                let offset = base + cluster as usize * 2;
                u32::from(u16::from_le_bytes([self.data[offset], self.data[offset + 1]]))
            }
            FatKind::Fat32 | FatKind::ExFat => {
                let offset = base + cluster as usize * 4;
                u32::from_le_bytes([
                    self.data[offset],
                    self.data[offset + 1],
                    self.data[offset + 2],
                    self.data[offset + 3],
                ])
            }
        }
    }

    /// exFAT only.
    pub fn set_bitmap(&mut self, cluster: u32, occupied: bool) {
        let index = (cluster - FAT_ENTRY_START) as usize;
        let offset = self.cluster_offset(self.bitmap_cluster) + index / 8;
        let mask = 1 << (index % 8);
        if occupied {
            self.data[offset] |= mask;
        } else {
            self.data[offset] &= !mask;
        }
    }

    pub fn bitmap_bit(&self, cluster: u32) -> bool {
        let index = (cluster - FAT_ENTRY_START) as usize;
        let offset = self.cluster_offset(self.bitmap_cluster) + index / 8;
        self.data[offset] & (1 << (index % 8)) != 0
    }

    /// FAT32 only: overwrites the FSInfo free count and next-free hint.
    pub fn set_fs_info(&mut self, free: u32, next: u32) {
        let base = BYTES_PER_SECTOR;
        let free_at = base + FsInfoSector::FREE_COUNT_OFFSET;
        let next_at = base + FsInfoSector::NEXT_FREE_OFFSET;
        self.data[free_at..free_at + 4].copy_from_slice(&free.to_le_bytes());
        self.data[next_at..next_at + 4].copy_from_slice(&next.to_le_bytes());
    }

    /// Byte offset of the first sector of `cluster`.
    pub const fn cluster_offset(&self, cluster: u32) -> usize {
        (self.data_start + (cluster - FAT_ENTRY_START) * self.sectors_per_cluster) as usize
            * BYTES_PER_SECTOR
    }

    /// Byte offset of root slot `index`. On FAT32 and exFAT only the first
    /// root cluster is addressable this way.
    pub const fn root_slot_offset(&self, index: u32) -> usize {
        self.root_start as usize * BYTES_PER_SECTOR + index as usize * DIR_ENTRY_SIZE
    }

    pub fn write_slot(&mut self, index: u32, raw: &[u8]) {
        let offset = self.root_slot_offset(index);
        self.data[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&raw[..DIR_ENTRY_SIZE]);
    }

    /// Writes slot `index` of the directory starting at `cluster`, within
    /// that first cluster.
    pub fn write_dir_slot(&mut self, cluster: u32, index: u32, raw: &[u8]) {
        let offset = self.cluster_offset(cluster) + index as usize * DIR_ENTRY_SIZE;
        self.data[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&raw[..DIR_ENTRY_SIZE]);
    }

    pub fn slot(&self, offset: usize) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&self.data[offset..offset + DIR_ENTRY_SIZE]);
        raw
    }

    pub fn disk(&self) -> RamDisk {
        let mut disk = RamDisk::from_image(BYTES_PER_SECTOR, self.data.clone());
        disk.write_protected = self.write_protected;
        disk
    }
}

/// Raw legacy short entry. `name` is the padded 11-byte 8.3 form.
pub fn short_entry(
    name: &[u8; 11],
    attributes: Attributes,
    cluster: u32,
    size: u32,
) -> [u8; DIR_ENTRY_SIZE] {
    let mut entry = ShortEntry::new_zeroed();
    entry.name = *name;
    entry.attributes = attributes.bits();
    entry.cluster_high = U16::new((cluster >> 16) as u16);
    entry.cluster_low = U16::new(cluster as u16);
    entry.file_size = U32::new(size);
    entry.modified_date = U16::new(0x5A21);
    let mut raw = [0; DIR_ENTRY_SIZE];
    raw.copy_from_slice(entry.as_bytes());
    raw
}

/// Writes a legacy sub-directory's `.` and `..` entries into its first
/// cluster.
pub fn write_dot_entries(image: &mut TestImage, cluster: u32, parent: u32) {
    image.write_dir_slot(cluster, 0, &short_entry(b".          ", Attributes::DIRECTORY, cluster, 0));
    image.write_dir_slot(cluster, 1, &short_entry(b"..         ", Attributes::DIRECTORY, parent, 0));
}
