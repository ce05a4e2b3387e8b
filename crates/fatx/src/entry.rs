use alloc::string::String;
use bitflags::bitflags;

use crate::{Cluster, LogicalSector, Region};

/// Every directory slot, legacy or exFAT, is 32 bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// First byte of the slot that ends a directory, in both formats.
pub const END_OF_DIRECTORY: u8 = 0x00;

/// Longest name either format can store, in UTF-16 units.
pub const MAX_NAME_UNITS: usize = 255;

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    /// Shared by both formats. exFAT widens the field to 16 bits but only
    /// defines these.
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        /// Legacy volume label. Never set on a regular entry.
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;

        /// Marker combination used by legacy long-name slots.
        const LONG_NAME = Self::READ_ONLY.bits()
            | Self::HIDDEN.bits()
            | Self::SYSTEM.bits()
            | Self::VOLUME_ID.bits();
    }
}

/// Packed DOS dates and times as stored on disk. Legacy entries only use the
/// created, modified and accessed-date fields; exFAT uses all of them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub created_time: u16,
    pub created_date: u16,
    /// 10 ms increments past `created_time`, 0..=199.
    pub created_10ms: u8,
    pub modified_time: u16,
    pub modified_date: u16,
    pub modified_10ms: u8,
    pub accessed_time: u16,
    pub accessed_date: u16,
    pub created_utc_offset: u8,
    pub modified_utc_offset: u8,
    pub accessed_utc_offset: u8,
}

/// Where a decoded entry's slots live.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    /// Directory the entry belongs to.
    pub region: Region,
    /// Index of the first slot of the group. For a legacy entry with a long
    /// name this is the first long-name slot; for exFAT, the file entry.
    pub index: u32,
    /// Number of slots in the group.
    pub slots: u32,
    /// Sector and offset of the first slot.
    pub sector: LogicalSector,
    pub byte_offset: usize,
}

/// A decoded directory entry, in the format-neutral shape both codecs
/// produce and consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Long name if there is one, otherwise the formatted 8.3 name.
    pub name: String,
    /// Legacy only: the 8.3 name (`NAME.EXT`) stored next to a long name.
    /// When set on an entry being written it overrides generation.
    pub short_name: String,
    pub long_name_present: bool,
    pub attributes: Attributes,
    /// Legacy NT case bits.
    pub nt_reserved: u8,
    pub cluster: Cluster,
    /// exFAT: valid data length.
    pub file_size: u64,
    /// exFAT: allocated data length. Equal to `file_size` for directories.
    pub available_size: u64,
    pub times: Timestamps,
    pub secondary_count: u8,
    pub checksum: u16,
    pub name_length: u8,
    pub name_hash: u16,
    /// exFAT: clusters are contiguous and the FAT is not used for them.
    pub no_fat_chain: bool,
    pub location: Option<EntryLocation>,
}

impl DirectoryEntry {
    pub fn new(name: &str, attributes: Attributes) -> Self {
        Self {
            name: String::from(name),
            attributes,
            ..Self::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// `.` or `..` in a legacy sub-directory.
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Result of decoding the slot(s) at one directory index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSlot {
    /// Index of the slot following everything this decode consumed.
    pub next: u32,
    pub kind: Decoded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Used(DirectoryEntry),
    /// A deleted or never-used slot.
    Free,
    /// The end-of-directory marker. Everything after it is free.
    EndOfDirectory,
    /// Something in use that is not a file entry (exFAT system entries), or
    /// a file group skipped because its name hash did not match.
    Skip,
}

/// How much of an entry group an encode rewrites. Each non-delete level also
/// writes the fields of every lower level. Legacy entries are always written
/// in full.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateLevel {
    /// Clear the in-use marker only.
    Delete,
    /// Attributes and timestamps.
    File,
    /// Allocation: first cluster, sizes, NoFatChain.
    Stream,
    /// Name length, hash and name slots.
    Name,
    /// Everything, including the entry types and the secondary count.
    Full,
}

/// Simple case folding used for name comparison and the exFAT name hash.
/// Covers what a single `char::to_uppercase` step maps inside the BMP.
pub fn upcase_unit(unit: u16) -> u16 {
    if (u16::from(b'a')..=u16::from(b'z')).contains(&unit) {
        return unit - 0x20;
    }
    if unit < 0x80 {
        return unit;
    }
    let Some(ch) = char::from_u32(u32::from(unit)) else {
        return unit;
    };
    let mut upper = ch.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(single), None) => u16::try_from(u32::from(single)).unwrap_or(unit),
        _ => unit,
    }
}

/// Case-insensitive name comparison over UTF-16 units.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.encode_utf16()
        .map(upcase_unit)
        .eq(b.encode_utf16().map(upcase_unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_case_insensitively() {
        assert!(names_equal("readme.txt", "README.TXT"));
        assert!(names_equal("Über", "üBER"));
        assert!(!names_equal("README.TX", "README.TXT"));
        assert!(!names_equal(".", ".."));
    }

    #[test]
    fn upcase_units() {
        assert_eq!(upcase_unit(u16::from(b'a')), u16::from(b'A'));
        assert_eq!(upcase_unit(u16::from(b'z')), u16::from(b'Z'));
        assert_eq!(upcase_unit(u16::from(b'{')), u16::from(b'{'));
        assert_eq!(upcase_unit(u16::from(b'5')), u16::from(b'5'));
        assert_eq!(upcase_unit(0x00E9), 0x00C9);
        assert_eq!(upcase_unit(0xD800), 0xD800);
    }

    #[test]
    fn update_levels_are_ordered() {
        assert!(UpdateLevel::Delete < UpdateLevel::File);
        assert!(UpdateLevel::File < UpdateLevel::Stream);
        assert!(UpdateLevel::Stream < UpdateLevel::Name);
        assert!(UpdateLevel::Name < UpdateLevel::Full);
    }

    #[test]
    fn long_name_attribute_mask() {
        assert_eq!(Attributes::LONG_NAME.bits(), 0x0F);
        assert!(!Attributes::LONG_NAME.contains(Attributes::DIRECTORY));
    }
}
