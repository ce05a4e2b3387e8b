use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::{Cluster, FatError, FatKind, LogicalSector, DIR_ENTRY_SIZE, FAT_ENTRY_START};

/// The BIOS parameter block is the first part of the boot sector.
///
/// See <https://en.wikipedia.org/wiki/BIOS_parameter_block>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct BiosParameterBlock {
    pub jmp_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: U16<LittleEndian>,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: U16<LittleEndian>,
    pub fat_count: u8,
    pub root_dir_entries: U16<LittleEndian>,
    pub total_sectors: U16<LittleEndian>,
    pub media_descriptor: u8,
    pub sectors_per_fat: U16<LittleEndian>,
    pub sectors_per_track: U16<LittleEndian>,
    pub head_count: U16<LittleEndian>,
    pub hidden_sectors: U32<LittleEndian>,
    pub total_sectors_large: U32<LittleEndian>,
}

/// FAT32 extended boot record, directly after the [`BiosParameterBlock`].
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct Fat32Extension {
    pub sectors_per_fat: U32<LittleEndian>,
    pub ext_flags: U16<LittleEndian>,
    pub fs_version: U16<LittleEndian>,
    pub root_cluster: U32<LittleEndian>,
    pub fs_info_sector: U16<LittleEndian>,
    pub backup_boot_sector: U16<LittleEndian>,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: U32<LittleEndian>,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// exFAT main boot sector. The BIOS parameter block area is zeroed on exFAT,
/// which is how the two are told apart.
///
/// See <https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification#31-main-and-backup-boot-sector-sub-regions>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct ExFatBootSector {
    pub jmp_boot: [u8; 3],
    pub fs_name: [u8; 8],
    pub must_be_zero: [u8; 53],
    pub partition_offset: U64<LittleEndian>,
    pub volume_length: U64<LittleEndian>,
    pub fat_offset: U32<LittleEndian>,
    pub fat_length: U32<LittleEndian>,
    pub cluster_heap_offset: U32<LittleEndian>,
    pub cluster_count: U32<LittleEndian>,
    pub root_cluster: U32<LittleEndian>,
    pub volume_serial_number: U32<LittleEndian>,
    pub file_system_revision: U16<LittleEndian>,
    pub volume_flags: U16<LittleEndian>,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub reserved: [u8; 7],
}

impl ExFatBootSector {
    pub const FS_NAME: [u8; 8] = *b"EXFAT   ";
}

/// FAT32 file system information sector: a hint of the free cluster count
/// and where to start looking for free clusters.
///
/// See <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system#FS_Information_Sector>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct FsInfoSector {
    pub lead_signature: U32<LittleEndian>,
    pub reserved: [u8; 480],
    pub struct_signature: U32<LittleEndian>,
    pub free_count: U32<LittleEndian>,
    pub next_free: U32<LittleEndian>,
    pub reserved2: [u8; 12],
    pub trail_signature: U32<LittleEndian>,
}

impl FsInfoSector {
    pub const LEAD_SIGNATURE: u32 = 0x4161_5252;
    pub const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    pub const FREE_COUNT_OFFSET: usize = 488;
    pub const NEXT_FREE_OFFSET: usize = 492;

    pub fn signatures_valid(&self) -> bool {
        self.lead_signature.get() == Self::LEAD_SIGNATURE
            && self.struct_signature.get() == Self::STRUCT_SIGNATURE
    }
}

/// Layout of a mounted volume, derived from its boot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub kind: FatKind,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    /// Also the first sector of the first FAT.
    pub reserved_sectors: u32,
    pub number_of_fats: u32,
    pub sectors_per_fat: u32,
    pub total_sectors: u64,
    pub hidden_sectors: u64,
    /// First sector of the root directory. For FAT32 and exFAT this is the
    /// first sector of the root cluster.
    pub root_sector_start: LogicalSector,
    /// Size of the fixed FAT12/16 root area. Zero on FAT32 and exFAT.
    pub root_sectors: u32,
    /// Number of slots in the root directory. For FAT32 and exFAT this is
    /// filled in at mount by walking the root chain.
    pub root_directory_entries: u32,
    pub root_cluster: Cluster,
    pub data_sector_start: LogicalSector,
    pub total_clusters: u32,
    /// FAT32 FSInfo sector, or zero.
    pub fs_info_sector: u32,
}

impl Geometry {
    /// Parses a boot sector. Only the fields needed to find the FATs, the
    /// root directory and the data region are validated.
    pub fn from_boot_sector(boot: &[u8]) -> Result<Self, FatError> {
        let bpb = BiosParameterBlock::read_from_prefix(boot).ok_or(FatError::MediaInvalid)?;
        if bpb.bytes_per_sector.get() == 0 {
            return Self::from_exfat_boot_sector(boot);
        }

        let bytes_per_sector = u32::from(bpb.bytes_per_sector.get());
        let sectors_per_cluster = u32::from(bpb.sectors_per_cluster);
        if !bytes_per_sector.is_power_of_two()
            || !(512..=4096).contains(&bytes_per_sector)
            || sectors_per_cluster == 0
            || bpb.reserved_sectors.get() == 0
            || bpb.fat_count == 0
        {
            log::error!("invalid BIOS parameter block: {bpb:x?}");
            return Err(FatError::MediaInvalid);
        }

        let extension = boot
            .get(core::mem::size_of::<BiosParameterBlock>()..)
            .and_then(Fat32Extension::read_from_prefix)
            .ok_or(FatError::MediaInvalid)?;

        let sectors_per_fat = match bpb.sectors_per_fat.get() {
            0 => extension.sectors_per_fat.get(),
            sectors => u32::from(sectors),
        };
        let total_sectors = match bpb.total_sectors.get() {
            0 => u64::from(bpb.total_sectors_large.get()),
            sectors => u64::from(sectors),
        };
        if sectors_per_fat == 0 || total_sectors == 0 {
            return Err(FatError::MediaInvalid);
        }

        let reserved_sectors = u32::from(bpb.reserved_sectors.get());
        let number_of_fats = u32::from(bpb.fat_count);
        let root_directory_entries = u32::from(bpb.root_dir_entries.get());
        let root_sector_start =
            u64::from(reserved_sectors) + u64::from(number_of_fats) * u64::from(sectors_per_fat);
        let root_sectors = (root_directory_entries * DIR_ENTRY_SIZE as u32)
            .div_ceil(bytes_per_sector);
        let data_sector_start = root_sector_start + u64::from(root_sectors);
        if data_sector_start >= total_sectors {
            return Err(FatError::MediaInvalid);
        }
        let total_clusters =
            ((total_sectors - data_sector_start) / u64::from(sectors_per_cluster)) as u32;

        let kind = FatKind::from_cluster_count(total_clusters);
        let mut geometry = Self {
            kind,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            number_of_fats,
            sectors_per_fat,
            total_sectors,
            hidden_sectors: u64::from(bpb.hidden_sectors.get()),
            root_sector_start: LogicalSector(root_sector_start),
            root_sectors,
            root_directory_entries,
            root_cluster: Cluster::NONE,
            data_sector_start: LogicalSector(data_sector_start),
            total_clusters,
            fs_info_sector: 0,
        };

        if kind == FatKind::Fat32 {
            let root_cluster = Cluster(extension.root_cluster.get());
            if root_cluster.0 < FAT_ENTRY_START {
                return Err(FatError::MediaInvalid);
            }
            geometry.root_cluster = root_cluster;
            geometry.root_sector_start = geometry.cluster_sector(root_cluster);
            geometry.fs_info_sector = u32::from(extension.fs_info_sector.get());
        } else if root_directory_entries == 0 {
            return Err(FatError::MediaInvalid);
        }

        geometry.validate_fat_size()?;
        Ok(geometry)
    }

    fn from_exfat_boot_sector(boot: &[u8]) -> Result<Self, FatError> {
        let sector = ExFatBootSector::read_from_prefix(boot).ok_or(FatError::MediaInvalid)?;
        if sector.fs_name != ExFatBootSector::FS_NAME
            || sector.must_be_zero.iter().any(|&byte| byte != 0)
            || !(9..=12).contains(&sector.bytes_per_sector_shift)
            || sector.sectors_per_cluster_shift > 25 - sector.bytes_per_sector_shift
            || sector.number_of_fats == 0
        {
            log::error!("invalid exFAT boot sector");
            return Err(FatError::MediaInvalid);
        }

        let root_cluster = Cluster(sector.root_cluster.get());
        let total_clusters = sector.cluster_count.get();
        if root_cluster.0 < FAT_ENTRY_START || root_cluster.0 >= total_clusters + FAT_ENTRY_START
        {
            return Err(FatError::MediaInvalid);
        }

        let mut geometry = Self {
            kind: FatKind::ExFat,
            bytes_per_sector: 1 << sector.bytes_per_sector_shift,
            sectors_per_cluster: 1 << sector.sectors_per_cluster_shift,
            reserved_sectors: sector.fat_offset.get(),
            number_of_fats: u32::from(sector.number_of_fats),
            sectors_per_fat: sector.fat_length.get(),
            total_sectors: sector.volume_length.get(),
            hidden_sectors: sector.partition_offset.get(),
            root_sector_start: LogicalSector(0),
            root_sectors: 0,
            root_directory_entries: 0,
            root_cluster,
            data_sector_start: LogicalSector(u64::from(sector.cluster_heap_offset.get())),
            total_clusters,
            fs_info_sector: 0,
        };
        geometry.root_sector_start = geometry.cluster_sector(root_cluster);
        geometry.validate_fat_size()?;
        Ok(geometry)
    }

    fn validate_fat_size(&self) -> Result<(), FatError> {
        let fat_bytes = u64::from(self.sectors_per_fat) * u64::from(self.bytes_per_sector);
        let needed = (u64::from(self.total_clusters) + u64::from(FAT_ENTRY_START))
            * u64::from(self.kind.fat_half_bytes_per_entry())
            / 2;
        let data_end = self.data_sector_start.0
            + u64::from(self.total_clusters) * u64::from(self.sectors_per_cluster);
        if fat_bytes < needed || data_end > self.total_sectors {
            log::error!("FAT of {fat_bytes} bytes cannot describe {} clusters", self.total_clusters);
            return Err(FatError::MediaInvalid);
        }
        Ok(())
    }

    pub const fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    pub const fn entries_per_sector(&self) -> u32 {
        self.bytes_per_sector / DIR_ENTRY_SIZE as u32
    }

    /// One past the highest valid cluster index.
    pub const fn cluster_limit(&self) -> u32 {
        self.total_clusters + FAT_ENTRY_START
    }

    pub const fn is_valid_cluster(&self, cluster: Cluster) -> bool {
        cluster.0 >= FAT_ENTRY_START && cluster.0 < self.cluster_limit()
    }

    /// First sector of `cluster`. The caller guarantees the cluster is valid.
    pub const fn cluster_sector(&self, cluster: Cluster) -> LogicalSector {
        LogicalSector(
            self.data_sector_start.0
                + (cluster.0 - FAT_ENTRY_START) as u64 * self.sectors_per_cluster as u64,
        )
    }

    /// Location of `cluster`'s FAT slot in the first FAT: sector and byte
    /// offset within it. FAT12 slots may continue into the next sector.
    pub const fn fat_entry_position(&self, cluster: Cluster) -> (LogicalSector, usize) {
        let byte = match self.kind {
            FatKind::Fat12 => cluster.0 as u64 + cluster.0 as u64 / 2,
            FatKind::Fat16 => cluster.0 as u64 * 2,
            FatKind::Fat32 | FatKind::ExFat => cluster.0 as u64 * 4,
        };
        let sector = self.reserved_sectors as u64 + byte / self.bytes_per_sector as u64;
        (
            LogicalSector(sector),
            (byte % self.bytes_per_sector as u64) as usize,
        )
    }

    /// Sectors of the first FAT.
    pub const fn fat_sectors(&self) -> core::ops::Range<u64> {
        self.reserved_sectors as u64..self.reserved_sectors as u64 + self.sectors_per_fat as u64
    }
}
