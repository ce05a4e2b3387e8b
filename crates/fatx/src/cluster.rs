use core::ops::Add;

/// Index of the first cluster of the data region. Clusters 0 and 1 only exist
/// as FAT slots holding the media descriptor and dirty flags.
pub const FAT_ENTRY_START: u32 = 2;

/// A cluster index as stored in directory entries and the FAT.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cluster(pub u32);

impl Cluster {
    /// Used in directory entries that own no data.
    pub const NONE: Self = Self(0);
    pub const FIRST: Self = Self(FAT_ENTRY_START);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Zero-based position in the data region (and in the exFAT bitmap).
    pub const fn data_index(self) -> u32 {
        self.0 - FAT_ENTRY_START
    }
}

impl From<u32> for Cluster {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Cluster> for u32 {
    fn from(value: Cluster) -> Self {
        value.0
    }
}

impl Add<u32> for Cluster {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// A sector number relative to the start of the volume.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalSector(pub u64);

impl LogicalSector {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl From<u64> for LogicalSector {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogicalSector> for u64 {
    fn from(value: LogicalSector) -> Self {
        value.0
    }
}

impl Add<u64> for LogicalSector {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// On-disk flavor of the volume, decided once at mount.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

impl FatKind {
    /// Volumes with fewer clusters than this are FAT12.
    pub const FAT12_CLUSTER_LIMIT: u32 = 4086;
    /// Volumes with fewer clusters than this (and at least the FAT12 limit)
    /// are FAT16.
    pub const FAT16_CLUSTER_LIMIT: u32 = 65525;

    /// Picks the FAT width from the number of data clusters.
    pub const fn from_cluster_count(total_clusters: u32) -> Self {
        if total_clusters < Self::FAT12_CLUSTER_LIMIT {
            Self::Fat12
        } else if total_clusters < Self::FAT16_CLUSTER_LIMIT {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    /// Values at or above this end a chain. FAT12 values are widened to the
    /// FAT16 range when read, so they share FAT16's threshold.
    pub const fn reserved(self) -> u32 {
        match self {
            Self::Fat12 | Self::Fat16 => 0xFFF0,
            Self::Fat32 => 0x0FFF_FFF0,
            Self::ExFat => 0xFFFF_FFF8,
        }
    }

    pub const fn bad(self) -> u32 {
        match self {
            Self::Fat12 | Self::Fat16 => 0xFFF7,
            Self::Fat32 => 0x0FFF_FFF7,
            Self::ExFat => 0xFFFF_FFF7,
        }
    }

    /// End-of-chain value written by the engine.
    pub const fn last(self) -> u32 {
        match self {
            Self::Fat12 | Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
            Self::ExFat => 0xFFFF_FFFF,
        }
    }

    pub const fn is_exfat(self) -> bool {
        matches!(self, Self::ExFat)
    }

    /// Whether the root directory lives in a cluster chain rather than a
    /// fixed area after the FATs.
    pub const fn has_root_cluster(self) -> bool {
        matches!(self, Self::Fat32 | Self::ExFat)
    }

    /// Bytes of FAT needed per cluster, times two (FAT12 entries are 1.5
    /// bytes).
    pub const fn fat_half_bytes_per_entry(self) -> u32 {
        match self {
            Self::Fat12 => 3,
            Self::Fat16 => 4,
            Self::Fat32 | Self::ExFat => 8,
        }
    }

    /// Interprets a raw FAT value.
    pub const fn classify(self, value: u32) -> FatEntry {
        if value == 0 {
            FatEntry::Free
        } else if value == self.bad() {
            FatEntry::Bad
        } else if value >= self.reserved() {
            FatEntry::EndOfChain
        } else {
            FatEntry::Next(Cluster(value))
        }
    }
}

/// What a FAT slot says about its cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(Cluster),
    Bad,
    EndOfChain,
}

/// A NoFatChain allocation: `count` clusters starting at `first`, linked by
/// arithmetic succession instead of FAT entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContiguousRun {
    pub first: Cluster,
    pub count: u32,
}

impl ContiguousRun {
    /// Successor of `cluster` within the run, or end of chain past the last
    /// cluster (or for anything outside the run).
    pub const fn next(&self, cluster: Cluster) -> FatEntry {
        let position = cluster.0.wrapping_sub(self.first.0);
        if position.saturating_add(1) >= self.count {
            FatEntry::EndOfChain
        } else {
            FatEntry::Next(Cluster(cluster.0 + 1))
        }
    }
}
