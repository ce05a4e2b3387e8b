use crate::Cluster;

pub const FAT_CACHE_ENTRIES: usize = 16;
pub const FAT_CACHE_DEPTH: usize = 4;
const FAT_CACHE_HASH_MASK: u32 = (FAT_CACHE_ENTRIES / FAT_CACHE_DEPTH - 1) as u32;

/// Number of bits in the changed-FAT-sector map.
pub const FAT_MAP_BITS: u32 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FatCacheEntry {
    /// Zero marks an empty slot; cluster 0 is never cached.
    pub cluster: Cluster,
    pub value: u32,
    pub dirty: bool,
}

/// Small set-associative write-back cache of FAT values. Sets are selected by
/// the low bits of the cluster number and kept most-recently-used first.
#[derive(Debug, Clone)]
pub struct FatCache {
    entries: [FatCacheEntry; FAT_CACHE_ENTRIES],
}

impl FatCache {
    pub fn new() -> Self {
        Self {
            entries: [FatCacheEntry::default(); FAT_CACHE_ENTRIES],
        }
    }

    fn set_start(cluster: Cluster) -> usize {
        (cluster.0 & FAT_CACHE_HASH_MASK) as usize * FAT_CACHE_DEPTH
    }

    fn promote(&mut self, cluster: Cluster) -> Option<usize> {
        let start = Self::set_start(cluster);
        let position = self.entries[start..start + FAT_CACHE_DEPTH]
            .iter()
            .position(|entry| entry.cluster == cluster && !cluster.is_none())?;
        self.entries[start..=start + position].rotate_right(1);
        Some(start)
    }

    /// Cached value of `cluster`, pending or clean.
    pub fn get(&mut self, cluster: Cluster) -> Option<u32> {
        let position = self.promote(cluster)?;
        Some(self.entries[position].value)
    }

    /// Updates a cached value in place. Returns `false` on a miss.
    pub fn update(&mut self, cluster: Cluster, value: u32, dirty: bool) -> bool {
        let Some(position) = self.promote(cluster) else {
            return false;
        };
        let entry = &mut self.entries[position];
        entry.value = value;
        entry.dirty |= dirty;
        true
    }

    /// Whether inserting `cluster` would push out a dirty entry.
    pub fn victim_is_dirty(&self, cluster: Cluster) -> bool {
        let start = Self::set_start(cluster);
        self.entries[start + FAT_CACHE_DEPTH - 1].dirty
    }

    /// Inserts `cluster` at the front of its set, dropping the LRU entry. The
    /// caller flushes first if [`Self::victim_is_dirty`].
    pub fn insert(&mut self, cluster: Cluster, value: u32, dirty: bool) {
        let start = Self::set_start(cluster);
        let set = &mut self.entries[start..start + FAT_CACHE_DEPTH];
        debug_assert!(!set[FAT_CACHE_DEPTH - 1].dirty, "evicting dirty FAT entry");
        set.rotate_right(1);
        set[0] = FatCacheEntry {
            cluster,
            value,
            dirty,
        };
    }

    /// Pending writes, sorted by cluster so that entries sharing a FAT
    /// sector come out together.
    pub fn dirty_entries(&self) -> ([FatCacheEntry; FAT_CACHE_ENTRIES], usize) {
        let mut dirty = [FatCacheEntry::default(); FAT_CACHE_ENTRIES];
        let mut count = 0;
        for entry in self.entries.iter().filter(|entry| entry.dirty) {
            dirty[count] = *entry;
            count += 1;
        }
        dirty[..count].sort_unstable_by_key(|entry| entry.cluster);
        (dirty, count)
    }

    pub fn has_dirty(&self) -> bool {
        self.entries.iter().any(|entry| entry.dirty)
    }

    pub fn clear_dirty(&mut self) {
        for entry in &mut self.entries {
            entry.dirty = false;
        }
    }

    /// Forgets everything, including pending writes.
    pub fn invalidate(&mut self) {
        self.entries = [FatCacheEntry::default(); FAT_CACHE_ENTRIES];
    }
}

/// Records which parts of the first FAT changed since the last mirror
/// update. Each bit covers `sectors_per_bit` consecutive FAT sectors.
#[derive(Debug, Clone)]
pub struct FatSectorMap {
    bits: [u8; (FAT_MAP_BITS / 8) as usize],
    sectors_per_bit: u32,
}

impl FatSectorMap {
    pub fn new(sectors_per_fat: u32) -> Self {
        Self {
            bits: [0; (FAT_MAP_BITS / 8) as usize],
            sectors_per_bit: sectors_per_fat.div_ceil(FAT_MAP_BITS).max(1),
        }
    }

    /// `relative_sector` is the sector's offset from the start of the FAT.
    pub fn mark(&mut self, relative_sector: u32) {
        let bit = (relative_sector / self.sectors_per_bit).min(FAT_MAP_BITS - 1);
        self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&byte| byte == 0)
    }

    /// Ranges of FAT-relative sectors that changed, clipped to
    /// `sectors_per_fat`.
    pub fn changed_ranges(
        &self,
        sectors_per_fat: u32,
    ) -> impl Iterator<Item = core::ops::Range<u32>> + '_ {
        (0..FAT_MAP_BITS)
            .filter(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
            .map(move |bit| {
                let start = bit * self.sectors_per_bit;
                start.min(sectors_per_fat)..(start + self.sectors_per_bit).min(sectors_per_fat)
            })
            .filter(|range| !range.is_empty())
    }

    pub fn clear(&mut self) {
        self.bits = [0; (FAT_MAP_BITS / 8) as usize];
    }
}
