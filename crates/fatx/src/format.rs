use crate::directory::SlotCursor;
use crate::exfat::ExFatFormat;
use crate::legacy::LegacyFormat;
use crate::volume::Volume;
use crate::{
    BlockDriver, Cluster, ContiguousRun, DecodedSlot, Directory, DirectoryEntry, FatEntry,
    FatError, UpdateLevel,
};

/// Everything that differs between FAT12/16/32 and exFAT, from the point of
/// view of the directory and allocation code.
pub(crate) trait FilesystemFormat {
    /// Decodes the entry group starting at slot `index`. On exFAT, `hash`
    /// lets a name lookup skip groups without decoding their names.
    fn decode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
        hash: Option<u16>,
    ) -> Result<DecodedSlot, FatError>;

    /// Writes `entry` back to the slots recorded in its location.
    fn encode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        entry: &DirectoryEntry,
        level: UpdateLevel,
    ) -> Result<(), FatError>;

    /// Successor of `cluster`. `run` is set when the chain is a NoFatChain
    /// allocation.
    fn chain_next<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<FatEntry, FatError>;

    /// Whether `cluster` is allocated.
    fn cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
    ) -> Result<bool, FatError>;

    /// Legacy volumes record allocation in the FAT itself, so marking a
    /// cluster occupied there makes it a one-cluster chain.
    fn set_cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        occupied: bool,
    ) -> Result<(), FatError>;

    /// First free cluster at or after `start`, wrapping around once.
    /// `NotFound` if the volume is full.
    fn find_free_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        start: Cluster,
    ) -> Result<Cluster, FatError>;

    /// Number of directory slots an entry named `name` occupies.
    fn slots_for_name(&self, name: &str) -> Result<u32, FatError>;

    /// First slot of `directory` that may hold a regular entry.
    fn first_slot(&self, directory: &Directory) -> u32;

    /// Extends `directory` by one cluster and returns it. The entry inside
    /// `directory` is updated in memory; the caller writes it back.
    fn allocate_new_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        directory: &mut Directory,
    ) -> Result<Cluster, FatError>;

    /// Marks one slot free without touching its neighbours.
    fn free_slot<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<(), FatError>;
}

/// The format picked at mount.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Format {
    Legacy,
    ExFat,
}

macro_rules! dispatch {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            Self::Legacy => LegacyFormat.$method($($arg),*),
            Self::ExFat => ExFatFormat.$method($($arg),*),
        }
    };
}

impl FilesystemFormat for Format {
    fn decode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
        hash: Option<u16>,
    ) -> Result<DecodedSlot, FatError> {
        dispatch!(self, decode_entry(vol, cursor, index, hash))
    }

    fn encode_entry<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        entry: &DirectoryEntry,
        level: UpdateLevel,
    ) -> Result<(), FatError> {
        dispatch!(self, encode_entry(vol, entry, level))
    }

    fn chain_next<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<FatEntry, FatError> {
        dispatch!(self, chain_next(vol, cluster, run))
    }

    fn cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
    ) -> Result<bool, FatError> {
        dispatch!(self, cluster_state(vol, cluster))
    }

    fn set_cluster_state<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cluster: Cluster,
        occupied: bool,
    ) -> Result<(), FatError> {
        dispatch!(self, set_cluster_state(vol, cluster, occupied))
    }

    fn find_free_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        start: Cluster,
    ) -> Result<Cluster, FatError> {
        dispatch!(self, find_free_cluster(vol, start))
    }

    fn slots_for_name(&self, name: &str) -> Result<u32, FatError> {
        dispatch!(self, slots_for_name(name))
    }

    fn first_slot(&self, directory: &Directory) -> u32 {
        dispatch!(self, first_slot(directory))
    }

    fn allocate_new_cluster<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        directory: &mut Directory,
    ) -> Result<Cluster, FatError> {
        dispatch!(self, allocate_new_cluster(vol, directory))
    }

    fn free_slot<D: BlockDriver>(
        &self,
        vol: &mut Volume<D>,
        cursor: &mut SlotCursor,
        index: u32,
    ) -> Result<(), FatError> {
        dispatch!(self, free_slot(vol, cursor, index))
    }
}
