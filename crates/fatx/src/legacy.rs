use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::directory::SlotCursor;
use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    names_equal, Attributes, BlockDriver, Cluster, ContiguousRun, Decoded, DecodedSlot,
    Directory, DirectoryEntry, EntryLocation, FatEntry, FatError, FatKind, LogicalSector,
    Timestamps, UpdateLevel, DIR_ENTRY_SIZE, END_OF_DIRECTORY, FAT_ENTRY_START, MAX_NAME_UNITS,
};

/// First byte of a deleted slot.
pub const DELETED: u8 = 0xE5;
/// Stored in place of a leading 0xE5 in an 8.3 name.
pub const KANJI_ESCAPE: u8 = 0x05;
/// Written instead of a leading 0xE5 by short-name generation.
pub const LEADING_E5_REPLACEMENT: u8 = 0x8F;

/// Set in the ordinal of the first physical long-name slot, which holds the
/// last piece of the name.
pub const LAST_LONG_ENTRY: u8 = 0x40;
const ORDINAL_MASK: u8 = 0x1F;

/// Name units carried by one long-name slot.
pub const LONG_NAME_UNITS_PER_SLOT: usize = 13;

/// NT case bits in `nt_reserved`.
pub const LOWERCASE_BASE: u8 = 0x08;
pub const LOWERCASE_EXTENSION: u8 = 0x10;

const BASE_LEN: usize = 8;
const SHORT_NAME_LEN: usize = 11;

/// See <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system#Directory_entry>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct ShortEntry {
    /// Base name and extension, space padded.
    pub name: [u8; SHORT_NAME_LEN],
    pub attributes: u8,
    pub nt_reserved: u8,
    pub created_10ms: u8,
    pub created_time: U16<LittleEndian>,
    pub created_date: U16<LittleEndian>,
    pub accessed_date: U16<LittleEndian>,
    /// FAT32 only.
    pub cluster_high: U16<LittleEndian>,
    pub modified_time: U16<LittleEndian>,
    pub modified_date: U16<LittleEndian>,
    pub cluster_low: U16<LittleEndian>,
    pub file_size: U32<LittleEndian>,
}

/// See <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system#VFAT_long_file_names>
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct LongNameSlot {
    pub ordinal: u8,
    pub name1: [U16<LittleEndian>; 5],
    /// Always `Attributes::LONG_NAME`.
    pub attributes: u8,
    pub kind: u8,
    pub checksum: u8,
    pub name2: [U16<LittleEndian>; 6],
    /// Always zero.
    pub first_cluster: U16<LittleEndian>,
    pub name3: [U16<LittleEndian>; 2],
}

impl LongNameSlot {
    /// The 13 name units in order.
    fn units(&self) -> impl Iterator<Item = u16> + '_ {
        self.name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter())
            .map(|unit| unit.get())
    }

    fn units_mut(&mut self) -> impl Iterator<Item = &mut U16<LittleEndian>> + '_ {
        self.name1
            .iter_mut()
            .chain(self.name2.iter_mut())
            .chain(self.name3.iter_mut())
    }
}

fn is_long_name_slot(raw: &[u8; DIR_ENTRY_SIZE]) -> bool {
    raw[11] & 0x3F == Attributes::LONG_NAME.bits()
}

/// Checksum of an 8.3 name, stored in each of its long-name slots.
pub fn short_name_checksum(name: &[u8; SHORT_NAME_LEN]) -> u8 {
    name.iter()
        .fold(0_u8, |sum, &byte| sum.rotate_right(1).wrapping_add(byte))
}

/// Number of slots needed to store `name`: 1 if it fits an 8.3 entry as is,
/// otherwise the long-name slots plus the short entry.
pub fn legacy_slots_for_name(name: &str) -> Result<u32, FatError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let length = units.len();
    if length == 0 || length > MAX_NAME_UNITS || units.starts_with(&[0x2E, 0x2E]) {
        return Err(FatError::InvalidName);
    }

    let mut long = false;
    let mut dot = 0;
    for (i, &unit) in units.iter().enumerate() {
        if unit > 0xFF || unit == u16::from(DELETED) {
            long = true;
            continue;
        }
        match unit as u8 {
            0x80..=0xFF | b'A'..=b'Z' | b'0'..=b'9' => {}
            b'~' | b'-' | b'_' | b'}' | b'{' | b'(' | b')' | b'`' | b'\'' | b'!' | b'#'
            | b'$' | b'&' | b'@' | b'^' | b'%' => {}
            b'a'..=b'z' | b' ' | b'+' | b',' | b';' | b'=' | b'[' | b']' => long = true,
            b'.' => {
                if i == 0 || dot != 0 {
                    long = true;
                } else {
                    dot = i;
                }
            }
            _ => return Err(FatError::InvalidName),
        }
    }

    if dot != 0 && length - dot > 4 {
        long = true;
    }
    if length <= 12 && !long {
        return Ok(if dot >= 9 || length - dot >= 9 { 2 } else { 1 });
    }
    Ok(long_name_slots(length) + 1)
}

const fn long_name_slots(units: usize) -> u32 {
    units.div_ceil(LONG_NAME_UNITS_PER_SLOT) as u32
}

/// Byte used for a name unit in an 8.3 name.
fn short_byte(unit: u16) -> u8 {
    match u8::try_from(unit) {
        Ok(b'+' | b',' | b';' | b'=' | b'[' | b']') | Err(_) => b'_',
        Ok(byte) => byte,
    }
}

fn finish_short_name(short: &mut [u8; SHORT_NAME_LEN]) {
    short.make_ascii_uppercase();
    if short[0] == DELETED {
        short[0] = LEADING_E5_REPLACEMENT;
    }
}

/// Builds the 8.3 name stored next to long name `name`. The first eight
/// non-space characters before the last dot become the base and the first
/// three after it the extension. If that doesn't spell out `name` exactly,
/// the base is cut to three characters and followed by `~` and the low 16
/// bits of `entry_index` in hex.
pub fn generate_short_name(name: &str, entry_index: u32) -> [u8; SHORT_NAME_LEN] {
    let units: Vec<u16> = name.encode_utf16().collect();
    let last_dot = units
        .iter()
        .rposition(|&unit| unit == u16::from(b'.'))
        .filter(|&position| position != 0);

    let mut short = [b' '; SHORT_NAME_LEN];
    let base_units = &units[..last_dot.unwrap_or(units.len())];
    let mut base_len = 0;
    for &unit in base_units {
        if base_len == BASE_LEN {
            break;
        }
        if unit != u16::from(b' ') && unit != u16::from(b'.') {
            short[base_len] = short_byte(unit);
            base_len += 1;
        }
    }
    let extension = last_dot.map_or(&[][..], |dot| &units[dot + 1..]);
    for (slot, &unit) in short[BASE_LEN..].iter_mut().zip(extension) {
        *slot = short_byte(unit);
    }

    let mut candidate: Vec<u16> = short[..base_len].iter().map(|&b| u16::from(b)).collect();
    let extension_len = extension.len().min(3);
    if extension_len > 0 {
        candidate.push(u16::from(b'.'));
        candidate.extend(short[BASE_LEN..BASE_LEN + extension_len].iter().map(|&b| u16::from(b)));
    }
    if candidate != units {
        let tail = entry_index % 0x10000;
        let position = base_len.min(3);
        short[position] = b'~';
        for (digit, slot) in short[position + 1..position + 5].iter_mut().enumerate() {
            let nibble = (tail >> (12 - 4 * digit)) & 0xF;
            *slot = b"0123456789ABCDEF"[nibble as usize];
        }
    }

    finish_short_name(&mut short);
    short
}

/// Splits `NAME.EXT` into the space-padded on-disk form, uppercased.
pub fn parse_short_name(name: &str) -> [u8; SHORT_NAME_LEN] {
    let mut short = [b' '; SHORT_NAME_LEN];
    if name == "." || name == ".." {
        short[..name.len()].copy_from_slice(name.as_bytes());
        return short;
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    let dot = units.iter().rposition(|&unit| unit == u16::from(b'.'));
    let (base, extension) = match dot {
        Some(dot) => (&units[..dot], &units[dot + 1..]),
        None => (&units[..], &[][..]),
    };
    for (slot, &unit) in short[..BASE_LEN].iter_mut().zip(base) {
        *slot = short_byte(unit);
    }
    for (slot, &unit) in short[BASE_LEN..].iter_mut().zip(extension) {
        *slot = short_byte(unit);
    }
    finish_short_name(&mut short);
    short
}

/// Renders an on-disk 8.3 name as `NAME.EXT`, applying the NT lowercase
/// bits in `nt_reserved`.
pub fn format_short_name(raw: &[u8; SHORT_NAME_LEN], nt_reserved: u8) -> String {
    let mut bytes = *raw;
    if bytes[0] == KANJI_ESCAPE {
        bytes[0] = DELETED;
    }
    let trim = |part: &[u8]| part.len() - part.iter().rev().take_while(|&&b| b == b' ').count();
    let base_len = trim(&bytes[..BASE_LEN]);
    let extension_len = trim(&bytes[BASE_LEN..]);
    if nt_reserved & LOWERCASE_BASE != 0 {
        bytes[..BASE_LEN].make_ascii_lowercase();
    }
    if nt_reserved & LOWERCASE_EXTENSION != 0 {
        bytes[BASE_LEN..].make_ascii_lowercase();
    }

    let mut name: String = bytes[..base_len].iter().map(|&b| char::from(b)).collect();
    if extension_len > 0 {
        name.push('.');
        name.extend(
            bytes[BASE_LEN..BASE_LEN + extension_len]
                .iter()
                .map(|&b| char::from(b)),
        );
    }
    name
}

/// Reads a slot that has to exist for the current group to be complete.
fn read_group_slot<D: BlockDriver>(
    vol: &mut Volume<D>,
    cursor: &mut SlotCursor,
    index: u32,
) -> Result<([u8; DIR_ENTRY_SIZE], LogicalSector, usize), FatError> {
    vol.read_slot(cursor, index).map_err(|err| match err {
        FatError::NoMoreEntries => FatError::FileCorrupt,
        err => err,
    })
}

fn short_entry(kind: FatKind, raw: &[u8; DIR_ENTRY_SIZE]) -> Result<DirectoryEntry, FatError> {
    let short = ShortEntry::read_from(&raw[..]).ok_or(FatError::FileCorrupt)?;
    let mut cluster = u32::from(short.cluster_low.get());
    if kind == FatKind::Fat32 {
        cluster |= u32::from(short.cluster_high.get()) << 16;
    }
    let name = format_short_name(&short.name, short.nt_reserved);
    Ok(DirectoryEntry {
        short_name: format_short_name(&short.name, 0),
        name,
        long_name_present: false,
        attributes: Attributes::from_bits_retain(short.attributes),
        nt_reserved: short.nt_reserved,
        cluster: Cluster(cluster),
        file_size: u64::from(short.file_size.get()),
        available_size: 0,
        times: Timestamps {
            created_time: short.created_time.get(),
            created_date: short.created_date.get(),
            created_10ms: short.created_10ms,
            modified_time: short.modified_time.get(),
            modified_date: short.modified_date.get(),
            accessed_date: short.accessed_date.get(),
            ..Timestamps::default()
        },
        ..DirectoryEntry::default()
    })
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct LegacyFormat;

impl FilesystemFormat for LegacyFormat {
    fn decode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
        _hash: Option<u16>,
    ) -> Result<DecodedSlot, FatError> {
        let (raw, sector, byte_offset) = vol.read_slot(cursor, index)?;
        let free = DecodedSlot {
            next: index + 1,
            kind: Decoded::Free,
        };
        let region = cursor.region;
        let location = |slots| EntryLocation {
            region,
            index,
            slots,
            sector,
            byte_offset,
        };
        match raw[0] {
            END_OF_DIRECTORY => {
                return Ok(DecodedSlot {
                    next: index + 1,
                    kind: Decoded::EndOfDirectory,
                })
            }
            DELETED => return Ok(free),
            _ => {}
        }

        let kind = vol.geometry.kind;
        if !is_long_name_slot(&raw) {
            let mut entry = short_entry(kind, &raw)?;
            entry.location = Some(location(1));
            return Ok(DecodedSlot {
                next: index + 1,
                kind: Decoded::Used(entry),
            });
        }

        // A long-name slot without the last-entry bit lost its head.
        if raw[0] & LAST_LONG_ENTRY == 0 {
            return Ok(free);
        }
        let count = u32::from(raw[0] & ORDINAL_MASK);
        if count == 0 {
            return Err(FatError::FileCorrupt);
        }
        let checksum = raw[13];
        let mut units = vec![0_u16; count as usize * LONG_NAME_UNITS_PER_SLOT];

        for position in 0..count {
            let slot_raw = if position == 0 {
                raw
            } else {
                read_group_slot(vol, cursor, index + position)?.0
            };
            let ordinal = count - position;
            let expected = if position == 0 {
                ordinal as u8 | LAST_LONG_ENTRY
            } else {
                ordinal as u8
            };
            if !is_long_name_slot(&slot_raw) || slot_raw[0] != expected || slot_raw[13] != checksum
            {
                return Ok(free);
            }
            let slot = LongNameSlot::read_from(&slot_raw[..]).ok_or(FatError::FileCorrupt)?;
            let start = (ordinal as usize - 1) * LONG_NAME_UNITS_PER_SLOT;
            for (target, unit) in units[start..].iter_mut().zip(slot.units()) {
                *target = unit;
            }
        }

        let (short_raw, ..) = read_group_slot(vol, cursor, index + count)?;
        if matches!(short_raw[0], END_OF_DIRECTORY | DELETED) || is_long_name_slot(&short_raw) {
            return Ok(free);
        }
        let mut entry = short_entry(kind, &short_raw)?;
        entry.location = Some(location(count + 1));
        let next = index + count + 1;

        let mut short_name = [0; SHORT_NAME_LEN];
        short_name.copy_from_slice(&short_raw[..SHORT_NAME_LEN]);
        if short_name_checksum(&short_name) != checksum {
            log::warn!(
                "long name at slot {index} does not match short name {:?}, using the short name",
                entry.short_name
            );
            return Ok(DecodedSlot {
                next,
                kind: Decoded::Used(entry),
            });
        }

        let length = units.iter().position(|&unit| unit == 0).unwrap_or(units.len());
        entry.name = String::from_utf16_lossy(&units[..length]);
        entry.long_name_present = true;
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

        if level == UpdateLevel::Delete {
            for index in location.index..location.index + location.slots {
                self.free_slot(vol, &mut cursor, index)?;
            }
            return Ok(());
        }
        let file_size = u32::try_from(entry.file_size).map_err(|_| FatError::NoMoreSpace)?;

        let mut nt_reserved = entry.nt_reserved;
        let (short, long_units) = if entry.is_dot_entry() {
            (parse_short_name(&entry.name), None)
        } else if location.slots == 1
            && !entry.short_name.is_empty()
            && names_equal(&entry.name, &entry.short_name)
        {
            (parse_short_name(&entry.short_name), None)
        } else if self.slots_for_name(&entry.name)? == 1 {
            nt_reserved &= !(LOWERCASE_BASE | LOWERCASE_EXTENSION);
            (parse_short_name(&entry.name), None)
        } else {
            nt_reserved &= !(LOWERCASE_BASE | LOWERCASE_EXTENSION);
            let short = if entry.short_name.is_empty() {
                generate_short_name(&entry.name, location.index)
            } else {
                parse_short_name(&entry.short_name)
            };
            (short, Some(entry.name.encode_utf16().collect::<Vec<u16>>()))
        };

        let long_slots = long_units
            .as_ref()
            .map_or(0, |units| long_name_slots(units.len()));
        let needed = long_slots + 1;
        if needed > location.slots {
            return Err(FatError::InvalidState);
        }

        // Slots the group no longer needs are the leading ones; the short
        // entry stays last.
        let start = location.index + location.slots - needed;
        for index in location.index..start {
            self.free_slot(vol, &mut cursor, index)?;
        }

        if let Some(units) = &long_units {
            let checksum = short_name_checksum(&short);
            for position in 0..long_slots {
                let ordinal = long_slots - position;
                let mut slot = LongNameSlot::new_zeroed();
                slot.ordinal = if position == 0 {
                    ordinal as u8 | LAST_LONG_ENTRY
                } else {
                    ordinal as u8
                };
                slot.attributes = Attributes::LONG_NAME.bits();
                slot.checksum = checksum;
                let first = (ordinal as usize - 1) * LONG_NAME_UNITS_PER_SLOT;
                for (offset, target) in slot.units_mut().enumerate() {
                    let unit = match (first + offset).cmp(&units.len()) {
                        core::cmp::Ordering::Less => units[first + offset],
                        core::cmp::Ordering::Equal => 0,
                        core::cmp::Ordering::Greater => 0xFFFF,
                    };
                    *target = U16::new(unit);
                }
                let (sector, offset) = vol.slot_position(&mut cursor, start + position)?;
                let mut raw = [0; DIR_ENTRY_SIZE];
                raw.copy_from_slice(slot.as_bytes());
                vol.write_slot(sector, offset, &raw)?;
            }
        }

        let cluster = entry.cluster.0;
        let times = &entry.times;
        let record = ShortEntry {
            name: short,
            attributes: entry.attributes.bits(),
            nt_reserved,
            created_10ms: times.created_10ms,
            created_time: U16::new(times.created_time),
            created_date: U16::new(times.created_date),
            accessed_date: U16::new(times.accessed_date),
            cluster_high: U16::new(if vol.geometry.kind == FatKind::Fat32 {
                (cluster >> 16) as u16
            } else {
                0
            }),
            modified_time: U16::new(times.modified_time),
            modified_date: U16::new(times.modified_date),
            cluster_low: U16::new(cluster as u16),
            file_size: U32::new(file_size),
        };
        let (sector, offset) = vol.slot_position(&mut cursor, start + long_slots)?;
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw.copy_from_slice(record.as_bytes());
        vol.write_slot(sector, offset, &raw)
    }

    fn chain_next<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        _run: Option<ContiguousRun>,
    ) -> Result<FatEntry, FatError> {
        Ok(vol.geometry.kind.classify(vol.fat_read(cluster)?))
    }

    fn cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
    ) -> Result<bool, FatError> {
        Ok(vol.fat_read(cluster)? != 0)
    }

    fn set_cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        occupied: bool,
    ) -> Result<(), FatError> {
        let value = if occupied {
            vol.geometry.kind.last()
        } else {
            0
        };
        vol.fat_write(cluster, value)
    }

    fn find_free_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        start: Cluster,
    ) -> Result<Cluster, FatError> {
        let limit = vol.geometry.cluster_limit();
        let start = if vol.geometry.is_valid_cluster(start) {
            start.0
        } else {
            FAT_ENTRY_START
        };
        for cluster in (start..limit).chain(FAT_ENTRY_START..start) {
            if vol.fat_read(Cluster(cluster))? == 0 {
                return Ok(Cluster(cluster));
            }
        }
        Err(FatError::NotFound)
    }

    fn slots_for_name(&self, name: &str) -> Result<u32, FatError> {
        legacy_slots_for_name(name)
    }

    fn first_slot(&self, directory: &Directory) -> u32 {
        match directory {
            Directory::Sub(entry) if !entry.cluster.is_none() => 2,
            _ => 0,
        }
    }

    fn allocate_new_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        directory: &mut Directory,
    ) -> Result<Cluster, FatError> {
        let first = match directory {
            Directory::Root if !vol.geometry.kind.has_root_cluster() => {
                return Err(FatError::NoMoreSpace)
            }
            Directory::Root => vol.geometry.root_cluster,
            Directory::Sub(entry) if entry.cluster.is_none() => {
                let cluster = vol.allocate_cluster()?;
                entry.cluster = cluster;
                return Ok(cluster);
            }
            Directory::Sub(entry) => entry.cluster,
        };
        let (_, tail) = vol.walk_chain(first, None)?;
        let cluster = vol.allocate_cluster()?;
        vol.fat_write(tail, cluster.0)?;
        Ok(cluster)
    }

    fn free_slot<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<(), FatError> {
        let (mut raw, sector, offset) = vol.read_slot(cursor, index)?;
        raw[0] = DELETED;
        vol.write_slot(sector, offset, &raw)
    }
}
