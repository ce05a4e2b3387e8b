use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::bitmap::BitmapCache;
use crate::directory::SlotCursor;
use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    upcase_unit, Attributes, BlockDriver, Cluster, ContiguousRun, Decoded, DecodedSlot,
    Directory, DirectoryEntry, EntryLocation, FatEntry, FatError, LogicalSector, Timestamps,
    UpdateLevel, DIR_ENTRY_SIZE, END_OF_DIRECTORY, MAX_NAME_UNITS,
};

pub const ALLOCATION_BITMAP: u8 = 0x81;
pub const UPCASE_TABLE: u8 = 0x82;
pub const VOLUME_LABEL: u8 = 0x83;
pub const FILE: u8 = 0x85;
pub const STREAM_EXTENSION: u8 = 0xC0;
pub const FILE_NAME: u8 = 0xC1;

/// Set on every entry in use.
pub const TYPE_IN_USE: u8 = 0x80;
/// Clear for primary entries, set for secondaries.
pub const TYPE_CATEGORY: u8 = 0x40;
/// Clear for critical entries, set for benign ones.
pub const TYPE_IMPORTANCE: u8 = 0x20;

/// UTF-16 units held by one file name entry.
pub const NAME_UNITS_PER_ENTRY: usize = 15;

/// Largest directory exFAT allows.
pub const MAX_DIRECTORY_SIZE: u64 = 256 * 1024 * 1024;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    /// `GeneralSecondaryFlags` of a secondary entry.
    pub struct SecondaryFlags: u8 {
        const ALLOCATION_POSSIBLE = 0x01;
        /// The allocation is contiguous and its FAT entries are unused.
        const NO_FAT_CHAIN = 0x02;
    }
}

/// See <https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification#74-file-directory-entry>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct FileEntry {
    pub entry_type: u8,
    pub secondary_count: u8,
    pub set_checksum: U16<LittleEndian>,
    pub attributes: U16<LittleEndian>,
    pub reserved1: [u8; 2],
    /// Time in the low half, date in the high half.
    pub create_timestamp: U32<LittleEndian>,
    pub modify_timestamp: U32<LittleEndian>,
    pub access_timestamp: U32<LittleEndian>,
    pub create_10ms: u8,
    pub modify_10ms: u8,
    pub create_utc_offset: u8,
    pub modify_utc_offset: u8,
    pub access_utc_offset: u8,
    pub reserved2: [u8; 7],
}

/// See <https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification#76-stream-extension-directory-entry>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct StreamExtensionEntry {
    pub entry_type: u8,
    pub flags: u8,
    pub reserved1: u8,
    pub name_length: u8,
    pub name_hash: U16<LittleEndian>,
    pub reserved2: [u8; 2],
    pub valid_data_length: U64<LittleEndian>,
    pub reserved3: [u8; 4],
    pub first_cluster: U32<LittleEndian>,
    pub data_length: U64<LittleEndian>,
}

/// See <https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification#77-file-name-directory-entry>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct FileNameEntry {
    pub entry_type: u8,
    pub flags: u8,
    pub name: [U16<LittleEndian>; NAME_UNITS_PER_ENTRY],
}

/// Any entry that owns a cluster allocation: the allocation bitmap, the
/// up-case table, and vendor allocation secondaries.
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct AllocationEntry {
    pub entry_type: u8,
    pub flags: u8,
    pub custom: [u8; 18],
    pub first_cluster: U32<LittleEndian>,
    pub data_length: U64<LittleEndian>,
}

/// Where the allocation bitmap and up-case table live. Found in the root
/// directory at mount.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExFatLayout {
    pub bitmap_cluster: Cluster,
    pub bitmap_length: u64,
    pub upcase_cluster: Cluster,
    pub upcase_length: u64,
}

fn checksum_add(checksum: u16, raw: &[u8; DIR_ENTRY_SIZE], primary: bool) -> u16 {
    raw.iter()
        .enumerate()
        .filter(|&(i, _)| !primary || (i != 2 && i != 3))
        .fold(checksum, |sum, (_, &byte)| {
            sum.rotate_right(1).wrapping_add(u16::from(byte))
        })
}

/// `SetChecksum` of an entry set. The checksum field of the primary entry
/// (bytes 2 and 3) is skipped.
pub fn entry_set_checksum(entries: &[[u8; DIR_ENTRY_SIZE]]) -> u16 {
    entries
        .iter()
        .enumerate()
        .fold(0, |sum, (i, raw)| checksum_add(sum, raw, i == 0))
}

/// `NameHash` of the up-cased name.
pub fn name_hash(name: &str) -> u16 {
    name.encode_utf16().map(upcase_unit).fold(0, |hash, unit| {
        let [low, high] = unit.to_le_bytes();
        let hash = hash.rotate_right(1).wrapping_add(u16::from(low));
        hash.rotate_right(1).wrapping_add(u16::from(high))
    })
}

/// Checks a file name and returns its UTF-16 units.
pub fn validate_name(name: &str) -> Result<Vec<u16>, FatError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_NAME_UNITS || name == "." || name == ".." {
        return Err(FatError::InvalidName);
    }
    let invalid = |unit: u16| {
        unit < 0x20
            || matches!(
                u8::try_from(unit),
                Ok(b'"' | b'*' | b'/' | b':' | b'<' | b'>' | b'?' | b'\\' | b'|')
            )
    };
    if units.iter().any(|&unit| invalid(unit)) {
        return Err(FatError::InvalidName);
    }
    Ok(units)
}

const fn split_timestamp(timestamp: u32) -> (u16, u16) {
    (timestamp as u16, (timestamp >> 16) as u16)
}

fn join_timestamp(time: u16, date: u16) -> U32<LittleEndian> {
    U32::new((u32::from(date) << 16) | u32::from(time))
}

/// Reads a secondary entry. Running off the end of the directory means the
/// set is truncated.
fn read_secondary<D: BlockDriver>(
    vol: &mut Volume<D>,
    cursor: &mut SlotCursor,
    index: u32,
) -> Result<([u8; DIR_ENTRY_SIZE], LogicalSector, usize), FatError> {
    vol.read_slot(cursor, index).map_err(|err| match err {
        FatError::NoMoreEntries => FatError::FileCorrupt,
        err => err,
    })
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ExFatFormat;

impl FilesystemFormat for ExFatFormat {
    fn decode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
        hash: Option<u16>,
    ) -> Result<DecodedSlot, FatError> {
        let (raw, sector, byte_offset) = vol.read_slot(cursor, index)?;
        let single = |kind| DecodedSlot {
            next: index + 1,
            kind,
        };
        let entry_type = raw[0];
        if entry_type == END_OF_DIRECTORY {
            return Ok(single(Decoded::EndOfDirectory));
        }
        if entry_type & TYPE_IN_USE == 0 {
            return Ok(single(Decoded::Free));
        }
        match entry_type {
            FILE => {}
            ALLOCATION_BITMAP | UPCASE_TABLE | VOLUME_LABEL => return Ok(single(Decoded::Skip)),
            _ if entry_type & (TYPE_CATEGORY | TYPE_IMPORTANCE) == 0 => {
                log::error!("unknown critical primary entry {entry_type:#04x} at slot {index}");
                return Err(FatError::MediaInvalid);
            }
            _ => return Ok(single(Decoded::Skip)),
        }

        let file = FileEntry::read_from(&raw[..]).ok_or(FatError::FileCorrupt)?;
        let secondary_count = file.secondary_count;
        if secondary_count < 2 {
            return Err(FatError::FileCorrupt);
        }
        let next = index + 1 + u32::from(secondary_count);
        let mut checksum = checksum_add(0, &raw, true);

        let (raw, ..) = read_secondary(vol, cursor, index + 1)?;
        if raw[0] != STREAM_EXTENSION {
            return Err(FatError::FileCorrupt);
        }
        let stream = StreamExtensionEntry::read_from(&raw[..]).ok_or(FatError::FileCorrupt)?;
        if stream.name_length == 0 {
            return Err(FatError::FileCorrupt);
        }
        if hash.is_some_and(|hash| hash != stream.name_hash.get()) {
            return Ok(DecodedSlot {
                next,
                kind: Decoded::Skip,
            });
        }
        checksum = checksum_add(checksum, &raw, false);

        let attributes = Attributes::from_bits_retain(file.attributes.get() as u8);
        let cluster = Cluster(stream.first_cluster.get());
        let file_size = stream.valid_data_length.get();
        let available_size = stream.data_length.get();
        if (available_size == 0) != cluster.is_none() {
            return Err(FatError::FileCorrupt);
        }
        if attributes.contains(Attributes::DIRECTORY) {
            if available_size != file_size {
                return Err(FatError::FileCorrupt);
            }
            if available_size > MAX_DIRECTORY_SIZE {
                return Err(FatError::NoMoreSpace);
            }
        }

        let mut remaining = usize::from(stream.name_length);
        let mut units = Vec::with_capacity(remaining);
        for secondary in 2..=u32::from(secondary_count) {
            let (raw, ..) = read_secondary(vol, cursor, index + secondary)?;
            checksum = checksum_add(checksum, &raw, false);
            match raw[0] {
                FILE_NAME => {
                    let name = FileNameEntry::read_from(&raw[..]).ok_or(FatError::FileCorrupt)?;
                    let take = remaining.min(NAME_UNITS_PER_ENTRY);
                    units.extend(name.name[..take].iter().map(|unit| unit.get()));
                    remaining -= take;
                }
                entry_type if entry_type & TYPE_IN_USE == 0 => return Err(FatError::FileCorrupt),
                entry_type if entry_type & TYPE_IMPORTANCE == 0 => {
                    log::warn!("unknown critical secondary {entry_type:#04x} in slot {index}");
                    return Err(FatError::FileCorrupt);
                }
                _ => {}
            }
        }
        if remaining != 0 || checksum != file.set_checksum.get() {
            return Err(FatError::FileCorrupt);
        }

        let (created_time, created_date) = split_timestamp(file.create_timestamp.get());
        let (modified_time, modified_date) = split_timestamp(file.modify_timestamp.get());
        let (accessed_time, accessed_date) = split_timestamp(file.access_timestamp.get());
        let entry = DirectoryEntry {
            name: String::from_utf16_lossy(&units),
            short_name: String::new(),
            long_name_present: false,
            attributes,
            nt_reserved: 0,
            cluster,
            file_size,
            available_size,
            times: Timestamps {
                created_time,
                created_date,
                created_10ms: file.create_10ms,
                modified_time,
                modified_date,
                modified_10ms: file.modify_10ms,
                accessed_time,
                accessed_date,
                created_utc_offset: file.create_utc_offset,
                modified_utc_offset: file.modify_utc_offset,
                accessed_utc_offset: file.access_utc_offset,
            },
            secondary_count,
            checksum,
            name_length: stream.name_length,
            name_hash: stream.name_hash.get(),
            no_fat_chain: stream.flags & SecondaryFlags::NO_FAT_CHAIN.bits() != 0
                || cluster.is_none(),
            location: Some(EntryLocation {
                region: cursor.region,
                index,
                slots: u32::from(secondary_count) + 1,
                sector,
                byte_offset,
            }),
        };
        Ok(DecodedSlot {
            next,
            kind: Decoded::Used(entry),
        })
    }

    fn encode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        entry: &DirectoryEntry,
        level: UpdateLevel,
    ) -> Result<(), FatError> {
        let location = entry.location.ok_or(FatError::InvalidState)?;
        let mut cursor = SlotCursor::new(location.region);
        let primary = vol.read_slot(&mut cursor, location.index)?;

        let units = if level >= UpdateLevel::Name {
            validate_name(&entry.name)?
        } else {
            Vec::new()
        };
        let secondaries = if level == UpdateLevel::Full {
            1 + units.len().div_ceil(NAME_UNITS_PER_ENTRY)
        } else {
            if primary.0[0] != FILE {
                return Err(FatError::FileCorrupt);
            }
            usize::from(primary.0[1])
        };
        if secondaries + 1 > location.slots as usize {
            return Err(FatError::InvalidState);
        }

        let mut set = Vec::with_capacity(secondaries + 1);
        set.push(primary);
        for secondary in 1..=secondaries as u32 {
            set.push(read_secondary(vol, &mut cursor, location.index + secondary)?);
        }

        if level == UpdateLevel::Delete {
            let bytes_per_cluster = u64::from(vol.geometry.bytes_per_cluster());
            for (position, (raw, sector, offset)) in set.iter_mut().enumerate() {
                let entry_type = raw[0];
                if position > 0
                    && entry_type & TYPE_IN_USE != 0
                    && entry_type != STREAM_EXTENSION
                    && entry_type != FILE_NAME
                {
                    // Vendor allocations die with the set.
                    let allocation =
                        AllocationEntry::read_from(&raw[..]).ok_or(FatError::FileCorrupt)?;
                    let flags = SecondaryFlags::from_bits_retain(allocation.flags);
                    let first = Cluster(allocation.first_cluster.get());
                    let length = allocation.data_length.get();
                    if flags.contains(SecondaryFlags::ALLOCATION_POSSIBLE)
                        && !first.is_none()
                        && length != 0
                    {
                        let run = flags.contains(SecondaryFlags::NO_FAT_CHAIN).then(|| {
                            ContiguousRun {
                                first,
                                count: length.div_ceil(bytes_per_cluster) as u32,
                            }
                        });
                        vol.release_cluster_chain(first, run)?;
                    }
                }
                raw[0] &= !TYPE_IN_USE;
                vol.write_slot(*sector, *offset, raw)?;
            }
            return Ok(());
        }

        if level == UpdateLevel::Full {
            set[0].0 = [0; DIR_ENTRY_SIZE];
            set[0].0[0] = FILE;
            set[0].0[1] = secondaries as u8;
            set[1].0 = [0; DIR_ENTRY_SIZE];
            set[1].0[0] = STREAM_EXTENSION;
            for (raw, ..) in &mut set[2..] {
                *raw = [0; DIR_ENTRY_SIZE];
                raw[0] = FILE_NAME;
            }
        }

        let mut file = FileEntry::read_from(&set[0].0[..]).ok_or(FatError::FileCorrupt)?;
        file.attributes = U16::new(u16::from(entry.attributes.bits()));
        let times = &entry.times;
        file.create_timestamp = join_timestamp(times.created_time, times.created_date);
        file.modify_timestamp = join_timestamp(times.modified_time, times.modified_date);
        file.access_timestamp = join_timestamp(times.accessed_time, times.accessed_date);
        file.create_10ms = times.created_10ms;
        file.modify_10ms = times.modified_10ms;
        file.create_utc_offset = times.created_utc_offset;
        file.modify_utc_offset = times.modified_utc_offset;
        file.access_utc_offset = times.accessed_utc_offset;
        set[0].0.copy_from_slice(file.as_bytes());

        if level >= UpdateLevel::Stream {
            let mut stream =
                StreamExtensionEntry::read_from(&set[1].0[..]).ok_or(FatError::FileCorrupt)?;
            let mut flags = SecondaryFlags::ALLOCATION_POSSIBLE;
            if entry.no_fat_chain && !entry.cluster.is_none() {
                flags |= SecondaryFlags::NO_FAT_CHAIN;
            }
            stream.flags = flags.bits();
            stream.valid_data_length = U64::new(entry.file_size);
            stream.first_cluster = U32::new(entry.cluster.0);
            stream.data_length = U64::new(entry.available_size);
            if level >= UpdateLevel::Name {
                stream.name_length = units.len() as u8;
                stream.name_hash = U16::new(name_hash(&entry.name));
            }
            set[1].0.copy_from_slice(stream.as_bytes());
        }

        if level >= UpdateLevel::Name {
            let mut chunks = units.chunks(NAME_UNITS_PER_ENTRY);
            for (raw, ..) in set[2..].iter_mut().filter(|(raw, ..)| raw[0] == FILE_NAME) {
                let mut name = FileNameEntry::new_zeroed();
                name.entry_type = FILE_NAME;
                for (slot, &unit) in name.name.iter_mut().zip(chunks.next().unwrap_or(&[])) {
                    *slot = U16::new(unit);
                }
                raw.copy_from_slice(name.as_bytes());
            }
            if chunks.next().is_some() {
                return Err(FatError::InvalidState);
            }
        }

        let raw_set: Vec<[u8; DIR_ENTRY_SIZE]> = set.iter().map(|(raw, ..)| *raw).collect();
        let checksum = entry_set_checksum(&raw_set);
        set[0].0[2..4].copy_from_slice(&checksum.to_le_bytes());

        for (raw, sector, offset) in &set {
            vol.write_slot(*sector, *offset, raw)?;
        }

        if level == UpdateLevel::Full {
            // A shorter name leaves reserved slots past the new set.
            let end = location.index + location.slots;
            for index in location.index + set.len() as u32..end {
                let (mut raw, sector, offset) = vol.read_slot(&mut cursor, index)?;
                if raw[0] & TYPE_IN_USE != 0 {
                    raw[0] &= !TYPE_IN_USE;
                    vol.write_slot(sector, offset, &raw)?;
                }
            }
        }
        Ok(())
    }

    fn chain_next<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<FatEntry, FatError> {
        match run {
            Some(run) => Ok(run.next(cluster)),
            None => Ok(vol.geometry.kind.classify(vol.fat_read(cluster)?)),
        }
    }

    fn cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
    ) -> Result<bool, FatError> {
        vol.bitmap_state(cluster)
    }

    fn set_cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        occupied: bool,
    ) -> Result<(), FatError> {
        vol.bitmap_set(cluster, occupied)
    }

    fn find_free_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        start: Cluster,
    ) -> Result<Cluster, FatError> {
        vol.free_cluster_find(start)
    }

    fn slots_for_name(&self, name: &str) -> Result<u32, FatError> {
        let units = validate_name(name)?;
        Ok(2 + units.len().div_ceil(NAME_UNITS_PER_ENTRY) as u32)
    }

    fn first_slot(&self, _directory: &Directory) -> u32 {
        0
    }

    fn allocate_new_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        directory: &mut Directory,
    ) -> Result<Cluster, FatError> {
        let last = vol.geometry.kind.last();
        let Directory::Sub(entry) = directory else {
            let (_, tail) = vol.walk_chain(vol.geometry.root_cluster, None)?;
            let cluster = vol.allocate_cluster()?;
            vol.fat_write(cluster, last)?;
            vol.fat_write(tail, cluster.0)?;
            return Ok(cluster);
        };

        let bytes_per_cluster = u64::from(vol.geometry.bytes_per_cluster());
        if entry.cluster.is_none() {
            let cluster = vol.allocate_cluster()?;
            entry.cluster = cluster;
            entry.no_fat_chain = true;
            entry.available_size = bytes_per_cluster;
            entry.file_size = bytes_per_cluster;
            return Ok(cluster);
        }

        if entry.no_fat_chain {
            let count = entry.available_size.div_ceil(bytes_per_cluster) as u32;
            let candidate = entry.cluster + count;
            if vol.available_clusters > 0
                && vol.geometry.is_valid_cluster(candidate)
                && !vol.bitmap_state(candidate)?
            {
                vol.claim_cluster(candidate)?;
                entry.available_size += bytes_per_cluster;
                entry.file_size += bytes_per_cluster;
                return Ok(candidate);
            }

            // The run can't grow in place: give its clusters real FAT links.
            for offset in 0..count {
                let cluster = entry.cluster + offset;
                let next = if offset + 1 == count { last } else { cluster.0 + 1 };
                vol.fat_write(cluster, next)?;
            }
            entry.no_fat_chain = false;
        }

        let (_, tail) = vol.walk_chain(entry.cluster, None)?;
        let cluster = vol.allocate_cluster()?;
        vol.fat_write(cluster, last)?;
        vol.fat_write(tail, cluster.0)?;
        entry.available_size += bytes_per_cluster;
        entry.file_size += bytes_per_cluster;
        Ok(cluster)
    }

    fn free_slot<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<(), FatError> {
        let (mut raw, sector, offset) = vol.read_slot(cursor, index)?;
        raw[0] &= !TYPE_IN_USE;
        vol.write_slot(sector, offset, &raw)
    }
}

impl<D: BlockDriver> Volume<D> {
    /// Finds the allocation bitmap and up-case table entries in the root
    /// directory and sets up the bitmap cache.
    pub(crate) fn locate_exfat_system_entries(&mut self) -> Result<(), FatError> {
        let region = self.root_region();
        let total = self.directory_entry_count(region)?;
        let mut cursor = SlotCursor::new(region);
        let mut bitmap = None;
        let mut upcase = None;
        for index in 0..total {
            let (raw, ..) = self.read_slot(&mut cursor, index)?;
            match raw[0] {
                END_OF_DIRECTORY => break,
                // TexFAT volumes carry a second bitmap; the first one is ours.
                ALLOCATION_BITMAP if bitmap.is_none() => {
                    bitmap = AllocationEntry::read_from(&raw[..]);
                }
                UPCASE_TABLE => upcase = AllocationEntry::read_from(&raw[..]),
                _ => {}
            }
            if bitmap.is_some() && upcase.is_some() {
                break;
            }
        }

        let Some(bitmap) = bitmap else {
            log::error!("exFAT root directory has no allocation bitmap");
            return Err(FatError::MediaInvalid);
        };
        let bitmap_cluster = Cluster(bitmap.first_cluster.get());
        let bitmap_length = bitmap.data_length.get();
        let total_clusters = self.geometry.total_clusters;
        if !self.geometry.is_valid_cluster(bitmap_cluster)
            || bitmap_length * 8 < u64::from(total_clusters)
        {
            log::error!("allocation bitmap of {bitmap_length} bytes at cluster {bitmap_cluster:?} is unusable");
            return Err(FatError::MediaInvalid);
        }
        let (upcase_cluster, upcase_length) = upcase.map_or((Cluster::NONE, 0), |upcase| {
            (
                Cluster(upcase.first_cluster.get()),
                upcase.data_length.get(),
            )
        });

        self.exfat = Some(ExFatLayout {
            bitmap_cluster,
            bitmap_length,
            upcase_cluster,
            upcase_length,
        });
        self.bitmap = Some(BitmapCache::new(
            self.geometry.cluster_sector(bitmap_cluster),
            total_clusters,
            self.config.bitmap_window_bytes,
            self.geometry.bytes_per_sector,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ImageBuilder;
    use crate::MediaConfig;

    use proptest::prelude::*;

    fn exfat_volume() -> Volume<crate::testing::RamDisk> {
        let image = ImageBuilder::exfat().build();
        Volume::mount(image.disk(), MediaConfig::default()).unwrap()
    }

    /// Reserves slots in the root for `entry` and writes it in full.
    fn place(vol: &mut Volume<crate::testing::RamDisk>, entry: &mut DirectoryEntry) {
        let mut root = Directory::Root;
        vol.free_search(&mut root, entry).unwrap();
        ExFatFormat
            .encode_entry(vol, entry, UpdateLevel::Full)
            .unwrap();
    }

    fn decode_at(vol: &mut Volume<crate::testing::RamDisk>, entry: &DirectoryEntry) -> Result<DecodedSlot, FatError> {
        let location = entry.location.unwrap();
        let mut cursor = SlotCursor::new(location.region);
        ExFatFormat.decode_entry(vol, &mut cursor, location.index, None)
    }

    fn decoded(slot: DecodedSlot) -> DirectoryEntry {
        match slot.kind {
            Decoded::Used(entry) => entry,
            kind => panic!("expected an entry, got {kind:?}"),
        }
    }

    #[test]
    fn system_entries_located() {
        let image = ImageBuilder::exfat().build();
        let vol = Volume::mount(image.disk(), MediaConfig::default()).unwrap();
        let layout = vol.exfat.unwrap();
        assert_eq!(layout.bitmap_cluster, Cluster(image.bitmap_cluster));
        assert_eq!(layout.upcase_cluster, Cluster(image.upcase_cluster));
        // Bitmap, up-case table and root directory.
        assert_eq!(vol.available_clusters, image.total_clusters - 3);
    }

    #[test]
    fn missing_bitmap_is_invalid_media() {
        let mut image = ImageBuilder::exfat().build();
        let offset = image.root_slot_offset(0);
        image.data[offset] = 0;
        assert_eq!(
            Volume::mount(image.disk(), MediaConfig::default()).map(|_| ()),
            Err(FatError::MediaInvalid)
        );
    }

    #[test]
    fn six_unit_name_round_trip() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("Tëst_1", Attributes::ARCHIVE);
        entry.cluster = Cluster(40);
        entry.file_size = 1000;
        entry.available_size = 4096;
        entry.times.modified_date = 0x5A21;
        entry.times.modified_time = 0x6C20;
        place(&mut vol, &mut entry);

        let found = decoded(decode_at(&mut vol, &entry).unwrap());
        assert_eq!(found.name, "Tëst_1");
        assert_eq!(found.name_length, 6);
        assert_eq!(found.secondary_count, 2);
        assert_eq!(found.name_hash, name_hash("TËST_1"));
        assert_eq!(found.cluster, Cluster(40));
        assert_eq!(found.file_size, 1000);
        assert_eq!(found.available_size, 4096);
        assert!(!found.no_fat_chain);
        assert_eq!(found.times, entry.times);
    }

    #[test]
    fn long_names_span_several_entries() {
        let mut vol = exfat_volume();
        let name = "a rather long file name that needs four name entries";
        let mut entry = DirectoryEntry::new(name, Attributes::ARCHIVE);
        place(&mut vol, &mut entry);
        assert_eq!(entry.location.unwrap().slots, 2 + 4);
        let found = decoded(decode_at(&mut vol, &entry).unwrap());
        assert_eq!(found.name, name);
        assert_eq!(found.secondary_count, 5);
        // An empty file has no cluster and is marked NoFatChain.
        assert!(found.no_fat_chain);
    }

    #[test]
    fn hash_mismatch_skips_the_set() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("skipme", Attributes::ARCHIVE);
        place(&mut vol, &mut entry);
        let location = entry.location.unwrap();
        let mut cursor = SlotCursor::new(location.region);
        let slot = ExFatFormat
            .decode_entry(&mut vol, &mut cursor, location.index, Some(name_hash("skipme") ^ 1))
            .unwrap();
        assert_eq!(slot.kind, Decoded::Skip);
        assert_eq!(slot.next, location.index + 3);
    }

    #[test]
    fn shorter_name_frees_trailing_slots() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new(
            "a rather long file name that needs four name entries",
            Attributes::ARCHIVE,
        );
        place(&mut vol, &mut entry);
        let location = entry.location.unwrap();
        assert_eq!(location.slots, 6);

        entry.name = String::from("short.txt");
        ExFatFormat
            .encode_entry(&mut vol, &entry, UpdateLevel::Full)
            .unwrap();
        let slot = decode_at(&mut vol, &entry).unwrap();
        assert_eq!(slot.next, location.index + 3);
        assert_eq!(decoded(slot).name, "short.txt");

        let mut cursor = SlotCursor::new(location.region);
        for index in location.index + 3..location.index + 6 {
            let (raw, ..) = vol.read_slot(&mut cursor, index).unwrap();
            assert_eq!(raw[0], FILE_NAME & !TYPE_IN_USE, "slot {index}");
        }
        assert_eq!(vol.entries(&Directory::Root).unwrap().len(), 1);
    }

    #[test]
    fn stream_update_keeps_the_checksum_valid() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("grow.bin", Attributes::ARCHIVE);
        place(&mut vol, &mut entry);
        entry.cluster = Cluster(100);
        entry.no_fat_chain = true;
        entry.file_size = 10_000;
        entry.available_size = 12_288;
        ExFatFormat
            .encode_entry(&mut vol, &entry, UpdateLevel::Stream)
            .unwrap();
        let found = decoded(decode_at(&mut vol, &entry).unwrap());
        assert_eq!(found.cluster, Cluster(100));
        assert!(found.no_fat_chain);
        assert_eq!(found.file_size, 10_000);
        assert_eq!(found.name, "grow.bin");
    }

    #[test]
    fn decode_rejections() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("bad", Attributes::DIRECTORY);
        entry.cluster = Cluster(50);
        entry.file_size = 4096;
        entry.available_size = 8192;
        place(&mut vol, &mut entry);
        // Directory whose valid length differs from its allocation.
        assert_eq!(decode_at(&mut vol, &entry), Err(FatError::FileCorrupt));

        entry.available_size = 4096;
        entry.cluster = Cluster::NONE;
        ExFatFormat
            .encode_entry(&mut vol, &entry, UpdateLevel::Stream)
            .unwrap();
        // Allocation without a cluster.
        assert_eq!(decode_at(&mut vol, &entry), Err(FatError::FileCorrupt));

        entry.cluster = Cluster(50);
        entry.available_size = 512 * 1024 * 1024;
        entry.file_size = entry.available_size;
        ExFatFormat
            .encode_entry(&mut vol, &entry, UpdateLevel::Stream)
            .unwrap();
        assert_eq!(decode_at(&mut vol, &entry), Err(FatError::NoMoreSpace));
    }

    #[test]
    fn unknown_critical_primary_is_invalid_media() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("x", Attributes::ARCHIVE);
        place(&mut vol, &mut entry);
        let location = entry.location.unwrap();
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw[0] = 0x86;
        vol.write_slot(location.sector, location.byte_offset, &raw)
            .unwrap();
        assert_eq!(decode_at(&mut vol, &entry), Err(FatError::MediaInvalid));

        // Benign primaries are skipped.
        raw[0] = 0xA0;
        vol.write_slot(location.sector, location.byte_offset, &raw)
            .unwrap();
        assert_eq!(decode_at(&mut vol, &entry).unwrap().kind, Decoded::Skip);
    }

    #[test]
    fn delete_releases_vendor_allocations() {
        let mut vol = exfat_volume();
        let mut entry = DirectoryEntry::new("vendor", Attributes::ARCHIVE);
        place(&mut vol, &mut entry);
        let location = entry.location.unwrap();

        // Turn the name entry into a benign vendor allocation secondary
        // owning clusters 200 and 201, contiguous.
        vol.claim_cluster(Cluster(200)).unwrap();
        vol.claim_cluster(Cluster(201)).unwrap();
        let before = vol.available_clusters;
        let mut allocation = AllocationEntry::new_zeroed();
        allocation.entry_type = 0xE1;
        allocation.flags = (SecondaryFlags::ALLOCATION_POSSIBLE | SecondaryFlags::NO_FAT_CHAIN).bits();
        allocation.first_cluster = U32::new(200);
        allocation.data_length = U64::new(2 * u64::from(vol.geometry.bytes_per_cluster()));
        let mut cursor = SlotCursor::new(location.region);
        let (_, sector, offset) = vol.read_slot(&mut cursor, location.index + 2).unwrap();
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw.copy_from_slice(allocation.as_bytes());
        vol.write_slot(sector, offset, &raw).unwrap();

        ExFatFormat
            .encode_entry(&mut vol, &entry, UpdateLevel::Delete)
            .unwrap();
        assert_eq!(vol.available_clusters, before + 2);
        assert!(!vol.bitmap_state(Cluster(200)).unwrap());
        assert!(!vol.bitmap_state(Cluster(201)).unwrap());
        assert_eq!(decode_at(&mut vol, &entry).unwrap().kind, Decoded::Free);
    }

    #[test]
    fn invalid_names() {
        assert_eq!(validate_name(""), Err(FatError::InvalidName));
        assert_eq!(validate_name("a:b"), Err(FatError::InvalidName));
        assert_eq!(validate_name(".."), Err(FatError::InvalidName));
        assert_eq!(validate_name(&"x".repeat(256)), Err(FatError::InvalidName));
        assert_eq!(ExFatFormat.slots_for_name("abc"), Ok(3));
        assert_eq!(ExFatFormat.slots_for_name(&"x".repeat(255)), Ok(19));
    }

    #[test]
    fn grow_no_fat_chain_directory_in_place() {
        let mut vol = exfat_volume();
        let bpc = u64::from(vol.geometry.bytes_per_cluster());
        let mut entry = DirectoryEntry::new("sub", Attributes::DIRECTORY);
        let first = vol.allocate_cluster().unwrap();
        entry.cluster = first;
        entry.no_fat_chain = true;
        entry.available_size = bpc;
        entry.file_size = bpc;
        let mut directory = Directory::Sub(entry);

        let cluster = ExFatFormat
            .allocate_new_cluster(&mut vol, &mut directory)
            .unwrap();
        assert_eq!(cluster, first + 1);
        let Directory::Sub(entry) = &directory else {
            unreachable!()
        };
        assert!(entry.no_fat_chain);
        assert_eq!(entry.available_size, 2 * bpc);
    }

    #[test]
    fn blocked_no_fat_chain_directory_converts_to_fat_chain() {
        let mut vol = exfat_volume();
        let bpc = u64::from(vol.geometry.bytes_per_cluster());
        let first = Cluster(300);
        vol.claim_cluster(first).unwrap();
        vol.claim_cluster(first + 1).unwrap();
        // Something else sits right after the run.
        vol.claim_cluster(first + 2).unwrap();

        let mut entry = DirectoryEntry::new("sub", Attributes::DIRECTORY);
        entry.cluster = first;
        entry.no_fat_chain = true;
        entry.available_size = 2 * bpc;
        entry.file_size = 2 * bpc;
        let mut directory = Directory::Sub(entry);

        let cluster = ExFatFormat
            .allocate_new_cluster(&mut vol, &mut directory)
            .unwrap();
        assert_ne!(cluster, first + 2);
        let Directory::Sub(entry) = &directory else {
            unreachable!()
        };
        assert!(!entry.no_fat_chain);
        assert_eq!(entry.available_size, 3 * bpc);
        assert_eq!(vol.fat_read(first).unwrap(), first.0 + 1);
        assert_eq!(vol.fat_read(first + 1).unwrap(), cluster.0);
        assert_eq!(vol.fat_read(cluster).unwrap(), 0xFFFF_FFFF);
    }

    proptest! {
        #[test]
        fn checksum_detects_any_single_byte_change(
            set in prop::collection::vec(prop::array::uniform32(any::<u8>()), 3..6),
            entry in 0..6_usize,
            byte in 0..DIR_ENTRY_SIZE,
            delta in 1..=255_u8,
        ) {
            let entry = entry % set.len();
            prop_assume!(entry != 0 || (byte != 2 && byte != 3));
            let mut changed = set.clone();
            changed[entry][byte] = changed[entry][byte].wrapping_add(delta);
            prop_assert_ne!(entry_set_checksum(&set), entry_set_checksum(&changed));
        }

        #[test]
        fn checksum_ignores_its_own_field(
            mut set in prop::collection::vec(prop::array::uniform32(any::<u8>()), 3..6),
            stored in any::<u16>(),
        ) {
            let before = entry_set_checksum(&set);
            set[0][2..4].copy_from_slice(&stored.to_le_bytes());
            prop_assert_eq!(before, entry_set_checksum(&set));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24, .. ProptestConfig::default()
        })]

        #[test]
        fn encode_decode_round_trip(
            name in "[A-Za-z0-9 _.-]{1,60}",
            attributes in prop::sample::select(vec![Attributes::ARCHIVE, Attributes::READ_ONLY | Attributes::HIDDEN, Attributes::SYSTEM]),
            cluster in 10_u32..1000,
            size in 1_u64..1_000_000,
            bad_checksum in any::<u16>(),
        ) {
            prop_assume!(name != "." && name != "..");
            let mut vol = exfat_volume();
            let mut entry = DirectoryEntry::new(&name, attributes);
            entry.cluster = Cluster(cluster);
            entry.file_size = size;
            entry.available_size = size.next_multiple_of(4096);
            place(&mut vol, &mut entry);

            let found = decoded(decode_at(&mut vol, &entry).unwrap());
            prop_assert_eq!(&found.name, &name);
            prop_assert_eq!(found.attributes, attributes);
            prop_assert_eq!(found.cluster, Cluster(cluster));
            prop_assert_eq!(found.file_size, size);

            // A stored checksum that disagrees is rejected.
            let location = entry.location.unwrap();
            prop_assume!(bad_checksum != found.checksum);
            let mut cursor = SlotCursor::new(location.region);
            let (mut raw, sector, offset) = vol.read_slot(&mut cursor, location.index).unwrap();
            raw[2..4].copy_from_slice(&bad_checksum.to_le_bytes());
            vol.write_slot(sector, offset, &raw).unwrap();
            prop_assert_eq!(decode_at(&mut vol, &entry), Err(FatError::FileCorrupt));
        }
    }
}
