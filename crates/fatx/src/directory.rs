use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    BlockDriver, Cluster, ContiguousRun, DirectoryEntry, FatEntry, FatError, LogicalSector,
    SectorType, DIR_ENTRY_SIZE,
};

/// A directory to search or grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directory {
    Root,
    /// A sub-directory, identified by its own entry in the parent.
    Sub(DirectoryEntry),
}

impl Directory {
    /// The directory an entry describes. A cluster of zero is how legacy
    /// `..` entries point at the root.
    pub fn of(entry: DirectoryEntry) -> Self {
        if entry.cluster.is_none() {
            Self::Root
        } else {
            Self::Sub(entry)
        }
    }
}

/// Where a directory's slots are stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Region {
    /// The fixed FAT12/16 root area.
    FixedRoot { start: LogicalSector, entries: u32 },
    /// A cluster chain. `contiguous` holds the cluster count of an exFAT
    /// NoFatChain allocation, whose clusters follow each other without FAT
    /// links.
    Chain {
        first: Cluster,
        contiguous: Option<u32>,
    },
}

impl Region {
    pub const fn run(&self) -> Option<ContiguousRun> {
        match *self {
            Self::Chain {
                first,
                contiguous: Some(count),
            } => Some(ContiguousRun { first, count }),
            _ => None,
        }
    }
}

/// Remembers the last cluster visited in a directory so that sequential slot
/// access doesn't re-walk the chain from the start.
#[derive(Debug, Copy, Clone)]
pub(crate) struct SlotCursor {
    pub(crate) region: Region,
    cluster_index: u32,
    cluster: Cluster,
}

impl SlotCursor {
    pub(crate) const fn new(region: Region) -> Self {
        let cluster = match region {
            Region::FixedRoot { .. } => Cluster::NONE,
            Region::Chain { first, .. } => first,
        };
        Self {
            region,
            cluster_index: 0,
            cluster,
        }
    }
}

impl<D: BlockDriver> Volume<D> {
    pub(crate) fn root_region(&self) -> Region {
        if self.geometry.kind.has_root_cluster() {
            Region::Chain {
                first: self.geometry.root_cluster,
                contiguous: None,
            }
        } else {
            Region::FixedRoot {
                start: self.geometry.root_sector_start,
                entries: self.geometry.root_directory_entries,
            }
        }
    }

    pub(crate) fn region_of(&self, directory: &Directory) -> Region {
        match directory {
            Directory::Sub(entry) if !entry.cluster.is_none() => {
                let contiguous = (self.geometry.kind.is_exfat() && entry.no_fat_chain).then(|| {
                    entry
                        .available_size
                        .div_ceil(u64::from(self.geometry.bytes_per_cluster()))
                        as u32
                });
                Region::Chain {
                    first: entry.cluster,
                    contiguous,
                }
            }
            _ => self.root_region(),
        }
    }

    pub(crate) fn slots_per_cluster(&self) -> u32 {
        self.geometry.bytes_per_cluster() / DIR_ENTRY_SIZE as u32
    }

    /// Sector and byte offset of slot `index`. `NoMoreEntries` past the end
    /// of the directory.
    pub(crate) fn slot_position(
        &mut self,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<(LogicalSector, usize), FatError> {
        let entries_per_sector = self.geometry.entries_per_sector();
        let offset = (index % entries_per_sector) as usize * DIR_ENTRY_SIZE;

        let (first, run) = match cursor.region {
            Region::FixedRoot { start, entries } => {
                if index >= entries {
                    return Err(FatError::NoMoreEntries);
                }
                return Ok((start + u64::from(index / entries_per_sector), offset));
            }
            Region::Chain { first, .. } => (first, cursor.region.run()),
        };

        let slots_per_cluster = self.slots_per_cluster();
        let target = index / slots_per_cluster;
        if target < cursor.cluster_index || cursor.cluster.is_none() {
            cursor.cluster_index = 0;
            cursor.cluster = first;
        }

        let format = self.format;
        while cursor.cluster_index < target {
            match format.chain_next(self, cursor.cluster, run)? {
                FatEntry::Next(next) if self.geometry.is_valid_cluster(next) => {
                    cursor.cluster = next;
                    cursor.cluster_index += 1;
                }
                FatEntry::EndOfChain => return Err(FatError::NoMoreEntries),
                _ => return Err(FatError::FileCorrupt),
            }
        }

        if !self.geometry.is_valid_cluster(cursor.cluster) {
            return Err(FatError::FileCorrupt);
        }
        let sector_in_cluster = (index % slots_per_cluster) / entries_per_sector;
        Ok((
            self.geometry.cluster_sector(cursor.cluster) + u64::from(sector_in_cluster),
            offset,
        ))
    }

    /// Raw bytes of slot `index`, with where they came from.
    pub(crate) fn read_slot(
        &mut self,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<([u8; DIR_ENTRY_SIZE], LogicalSector, usize), FatError> {
        let (sector, offset) = self.slot_position(cursor, index)?;
        let position = self.read_sector(sector, SectorType::Directory)?;
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&self.sectors.buffer(position)[offset..offset + DIR_ENTRY_SIZE]);
        self.stats.directory_entry_reads += 1;
        Ok((raw, sector, offset))
    }

    pub(crate) fn write_slot(
        &mut self,
        sector: LogicalSector,
        offset: usize,
        raw: &[u8; DIR_ENTRY_SIZE],
    ) -> Result<(), FatError> {
        self.stats.directory_entry_writes += 1;
        self.write_sector_bytes(sector, offset, raw, SectorType::Directory)
    }

    /// Number of slots in the directory. Chains are walked once and the
    /// result cached until the next structural change.
    pub(crate) fn directory_entry_count(&mut self, region: Region) -> Result<u32, FatError> {
        match region {
            Region::FixedRoot { entries, .. } => Ok(entries),
            Region::Chain {
                contiguous: Some(count),
                ..
            } => Ok(count * self.slots_per_cluster()),
            Region::Chain { first, .. } => {
                if let Some((cached, count)) = self.search_cache.directory_size {
                    if cached == region {
                        return Ok(count);
                    }
                }
                let (clusters, _) = self.walk_chain(first, None)?;
                let count = clusters * self.slots_per_cluster();
                self.search_cache.directory_size = Some((region, count));
                Ok(count)
            }
        }
    }
}
