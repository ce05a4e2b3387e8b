use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use zerocopy::FromBytes;

use crate::bitmap::BitmapCache;
use crate::exfat::ExFatLayout;
use crate::format::{FilesystemFormat, Format};
use crate::search::SearchCache;
use crate::{
    BlockDriver, Cluster, ContiguousRun, FatCache, FatEntry, FatError, FatKind, FatSectorMap,
    FaultTolerantLog, FsInfoSector, Geometry, LogicalSector, MediaConfig, MediaStatistics,
    SectorCache, SectorType, DIR_ENTRY_SIZE, FAT_ENTRY_START,
};

/// Bytes handed to `boot_read`.
const BOOT_RECORD_SIZE: usize = 512;

/// All state of one mounted volume. Lives behind the media lock; nothing in
/// here is synchronized on its own.
#[derive(Debug)]
pub(crate) struct Volume<D: BlockDriver> {
    pub(crate) driver: D,
    pub(crate) geometry: Geometry,
    pub(crate) format: Format,
    pub(crate) config: MediaConfig,
    pub(crate) sectors: SectorCache,
    pub(crate) fat: FatCache,
    pub(crate) fat_map: FatSectorMap,
    /// exFAT only.
    pub(crate) bitmap: Option<BitmapCache>,
    pub(crate) exfat: Option<ExFatLayout>,
    pub(crate) search_cache: SearchCache,
    pub(crate) stats: MediaStatistics,
    pub(crate) available_clusters: u32,
    /// Where the next free-cluster search starts.
    pub(crate) cluster_search_start: Cluster,
    /// Free count and next-free hint as last seen in the FSInfo sector, if
    /// it has valid signatures.
    fs_info: Option<(u32, u32)>,
    /// One sector, used to copy FAT sectors to the mirror FATs.
    scratch: Vec<u8>,
    pub(crate) ft: Option<Box<dyn FaultTolerantLog + Send>>,
    /// Set while a fault-tolerant transaction is open.
    pub(crate) ft_active: bool,
}

impl<D: BlockDriver> Volume<D> {
    pub(crate) fn mount(mut driver: D, config: MediaConfig) -> Result<Self, FatError> {
        let mut boot = vec![0; BOOT_RECORD_SIZE];
        driver.boot_read(&mut boot).map_err(|err| {
            log::error!("failed to read boot record: {err}");
            FatError::BootError
        })?;
        let geometry = Geometry::from_boot_sector(&boot)?;
        log::debug!(
            "mounting {:?} volume: {} clusters of {} bytes, data at sector {}",
            geometry.kind,
            geometry.total_clusters,
            geometry.bytes_per_cluster(),
            geometry.data_sector_start.0
        );

        let bytes_per_sector = geometry.bytes_per_sector as usize;
        let mut volume = Self {
            driver,
            geometry,
            format: if geometry.kind.is_exfat() {
                Format::ExFat
            } else {
                Format::Legacy
            },
            config,
            sectors: SectorCache::new(config.sector_cache_size, bytes_per_sector),
            fat: FatCache::new(),
            fat_map: FatSectorMap::new(geometry.sectors_per_fat),
            bitmap: None,
            exfat: None,
            search_cache: SearchCache::default(),
            stats: MediaStatistics::default(),
            available_clusters: 0,
            cluster_search_start: Cluster::FIRST,
            fs_info: None,
            scratch: vec![0; bytes_per_sector],
            ft: None,
            ft_active: false,
        };

        if geometry.kind.has_root_cluster() {
            let (clusters, _) = volume.walk_chain(geometry.root_cluster, None)?;
            volume.geometry.root_directory_entries =
                clusters * geometry.bytes_per_cluster() / DIR_ENTRY_SIZE as u32;
        }
        if geometry.kind.is_exfat() {
            volume.locate_exfat_system_entries()?;
        }
        volume.load_free_count()?;
        log::debug!(
            "{} of {} clusters available",
            volume.available_clusters,
            geometry.total_clusters
        );
        Ok(volume)
    }

    fn load_free_count(&mut self) -> Result<(), FatError> {
        let total = self.geometry.total_clusters;
        if self.geometry.kind == FatKind::Fat32 && self.geometry.fs_info_sector != 0 {
            let sector = LogicalSector(u64::from(self.geometry.fs_info_sector));
            let position = self.read_sector(sector, SectorType::Boot)?;
            if let Some(info) = FsInfoSector::read_from_prefix(self.sectors.buffer(position)) {
                if info.signatures_valid() {
                    let free = info.free_count.get();
                    let next = info.next_free.get();
                    self.fs_info = Some((free, next));
                    if free <= total && self.geometry.is_valid_cluster(Cluster(next)) {
                        self.available_clusters = free;
                        self.cluster_search_start = Cluster(next);
                        return Ok(());
                    }
                    log::warn!("ignoring FSInfo free count {free:#x}, next free {next:#x}");
                } else {
                    log::warn!("FSInfo sector {} has bad signatures", sector.0);
                }
            }
        }

        let used = if self.geometry.kind.is_exfat() {
            self.bitmap_count_used()?
        } else {
            let mut used = 0;
            for cluster in FAT_ENTRY_START..self.geometry.cluster_limit() {
                if self.read_raw_fat(Cluster(cluster))? != 0 {
                    used += 1;
                }
            }
            used
        };
        self.available_clusters = total.saturating_sub(used);
        Ok(())
    }

    pub(crate) fn read_sector(
        &mut self,
        sector: LogicalSector,
        sector_type: SectorType,
    ) -> Result<usize, FatError> {
        let (position, loaded) = self.sectors.read(
            &mut self.driver,
            &mut self.stats,
            sector,
            sector_type,
            self.geometry.total_sectors,
        )?;
        if loaded && self.ft_active && sector_type == SectorType::Directory {
            if let Some(ft) = self.ft.as_mut() {
                ft.read_directory_sector(sector, self.sectors.buffer_mut(position))?;
            }
        }
        Ok(position)
    }

    /// Replaces part of a sector. While a transaction is open the change is
    /// logged instead of being left dirty in the cache.
    pub(crate) fn write_sector_bytes(
        &mut self,
        sector: LogicalSector,
        offset: usize,
        bytes: &[u8],
        sector_type: SectorType,
    ) -> Result<(), FatError> {
        let position = self.read_sector(sector, sector_type)?;
        if self.ft_active {
            if let Some(ft) = self.ft.as_mut() {
                ft.add_dir_log(sector, offset, bytes)?;
            }
        }
        self.sectors.buffer_mut(position)[offset..offset + bytes.len()].copy_from_slice(bytes);
        if !self.ft_active {
            self.sectors.mark_dirty(position);
        }
        self.stats.logical_sector_writes += 1;
        Ok(())
    }

    pub(crate) fn write_full_sector(
        &mut self,
        sector: LogicalSector,
        data: &[u8],
        sector_type: SectorType,
    ) -> Result<(), FatError> {
        if self.ft_active {
            return self.write_sector_bytes(sector, 0, data, sector_type);
        }
        self.sectors.write(
            &mut self.driver,
            &mut self.stats,
            sector,
            data,
            sector_type,
            self.geometry.total_sectors,
        )
    }

    /// Reads the FAT value of `cluster` through the FAT cache.
    pub(crate) fn fat_read(&mut self, cluster: Cluster) -> Result<u32, FatError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FatError::FatReadError);
        }
        self.stats.fat_entry_reads += 1;
        if let Some(value) = self.fat.get(cluster) {
            self.stats.fat_entry_cache_hits += 1;
            return Ok(value);
        }
        self.stats.fat_entry_cache_misses += 1;

        let pending = if self.ft_active {
            self.ft.as_mut().and_then(|ft| ft.read_fat(cluster))
        } else {
            None
        };
        let value = match pending {
            Some(value) => value,
            None => self.read_raw_fat(cluster)?,
        };
        if self.fat.victim_is_dirty(cluster) {
            self.fat_flush()?;
        }
        self.fat.insert(cluster, value, false);
        Ok(value)
    }

    /// Sets the FAT value of `cluster`. The write reaches the FAT sector on
    /// the next [`Self::fat_flush`], or goes to the log inside a transaction.
    pub(crate) fn fat_write(&mut self, cluster: Cluster, value: u32) -> Result<(), FatError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FatError::FatReadError);
        }
        self.stats.fat_entry_writes += 1;
        let dirty = if self.ft_active {
            if let Some(ft) = self.ft.as_mut() {
                ft.add_fat_log(cluster, value)?;
            }
            false
        } else {
            true
        };
        if !self.fat.update(cluster, value, dirty) {
            if self.fat.victim_is_dirty(cluster) {
                self.fat_flush()?;
            }
            self.fat.insert(cluster, value, dirty);
        }
        Ok(())
    }

    /// Position in the first FAT of byte `offset` past `sector`, which may be
    /// the first byte of the following sector.
    fn fat_byte_position(&self, sector: LogicalSector, offset: usize) -> (LogicalSector, usize) {
        let bytes_per_sector = self.geometry.bytes_per_sector as usize;
        if offset >= bytes_per_sector {
            (sector + 1, offset - bytes_per_sector)
        } else {
            (sector, offset)
        }
    }

    fn fat_bytes<const N: usize>(
        &mut self,
        sector: LogicalSector,
        offset: usize,
    ) -> Result<[u8; N], FatError> {
        let mut bytes = [0; N];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let (sector, offset) = self.fat_byte_position(sector, offset + i);
            let position = self.read_sector(sector, SectorType::Fat)?;
            *byte = self.sectors.buffer(position)[offset];
        }
        Ok(bytes)
    }

    fn patch_fat_bytes(
        &mut self,
        sector: LogicalSector,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), FatError> {
        let first_fat = u64::from(self.geometry.reserved_sectors);
        for (i, &byte) in bytes.iter().enumerate() {
            let (sector, offset) = self.fat_byte_position(sector, offset + i);
            let position = self.read_sector(sector, SectorType::Fat)?;
            self.sectors.buffer_mut(position)[offset] = byte;
            self.sectors.mark_dirty(position);
            self.fat_map.mark((sector.0 - first_fat) as u32);
        }
        Ok(())
    }

    /// Reads a FAT value straight from the first FAT, bypassing the FAT
    /// cache. FAT12 values at or above 0xFF0 are widened to the FAT16 range.
    pub(crate) fn read_raw_fat(&mut self, cluster: Cluster) -> Result<u32, FatError> {
        let (sector, offset) = self.geometry.fat_entry_position(cluster);
        let value = match self.geometry.kind {
            FatKind::Fat12 => {
                let pair = u16::from_le_bytes(self.fat_bytes::<2>(sector, offset)?);
                let value = u32::from(if cluster.0 & 1 == 1 {
                    pair >> 4
                } else {
                    pair & 0x0FFF
                });
                if value >= 0x0FF0 {
                    value | 0xF000
                } else {
                    value
                }
            }
            FatKind::Fat16 => u32::from(u16::from_le_bytes(self.fat_bytes::<2>(sector, offset)?)),
            FatKind::Fat32 => u32::from_le_bytes(self.fat_bytes::<4>(sector, offset)?) & 0x0FFF_FFFF,
            FatKind::ExFat => u32::from_le_bytes(self.fat_bytes::<4>(sector, offset)?),
        };
        Ok(value)
    }

    fn patch_raw_fat(&mut self, cluster: Cluster, value: u32) -> Result<(), FatError> {
        let (sector, offset) = self.geometry.fat_entry_position(cluster);
        match self.geometry.kind {
            FatKind::Fat12 => {
                let value = (value & 0x0FFF) as u16;
                let [low, high] = self.fat_bytes::<2>(sector, offset)?;
                let bytes = if cluster.0 & 1 == 1 {
                    [(low & 0x0F) | ((value & 0x0F) << 4) as u8, (value >> 4) as u8]
                } else {
                    [value as u8, (high & 0xF0) | (value >> 8) as u8]
                };
                self.patch_fat_bytes(sector, offset, &bytes)
            }
            FatKind::Fat16 => self.patch_fat_bytes(sector, offset, &(value as u16).to_le_bytes()),
            FatKind::Fat32 => {
                // The top four bits are reserved and must be preserved.
                let old = u32::from_le_bytes(self.fat_bytes::<4>(sector, offset)?);
                let value = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                self.patch_fat_bytes(sector, offset, &value.to_le_bytes())
            }
            FatKind::ExFat => self.patch_fat_bytes(sector, offset, &value.to_le_bytes()),
        }
    }

    /// Writes every pending FAT value into the first FAT and sends the
    /// touched FAT sectors to the driver.
    pub(crate) fn fat_flush(&mut self) -> Result<(), FatError> {
        if !self.fat.has_dirty() {
            return Ok(());
        }
        let (dirty, count) = self.fat.dirty_entries();
        for entry in &dirty[..count] {
            self.patch_raw_fat(entry.cluster, entry.value)?;
        }
        self.fat.clear_dirty();
        self.stats.fat_cache_flushes += 1;
        self.sectors
            .flush(&mut self.driver, &mut self.stats, self.geometry.fat_sectors())?;
        log::debug!("flushed {count} FAT entries");
        Ok(())
    }

    /// Copies the FAT sectors changed since the last call to every other FAT.
    fn fat_mirror(&mut self) -> Result<(), FatError> {
        if self.geometry.kind.is_exfat() || self.geometry.number_of_fats < 2 {
            self.fat_map.clear();
            return Ok(());
        }
        let sectors_per_fat = self.geometry.sectors_per_fat;
        let first_fat = u64::from(self.geometry.reserved_sectors);
        let ranges: Vec<_> = self.fat_map.changed_ranges(sectors_per_fat).collect();
        for relative in ranges.into_iter().flatten() {
            let position =
                self.read_sector(LogicalSector(first_fat + u64::from(relative)), SectorType::Fat)?;
            self.scratch.copy_from_slice(self.sectors.buffer(position));
            for copy in 1..self.geometry.number_of_fats {
                let target = first_fat
                    + u64::from(copy) * u64::from(sectors_per_fat)
                    + u64::from(relative);
                self.sectors.write(
                    &mut self.driver,
                    &mut self.stats,
                    LogicalSector(target),
                    &self.scratch,
                    SectorType::Fat,
                    self.geometry.total_sectors,
                )?;
            }
        }
        self.fat_map.clear();
        Ok(())
    }

    fn fs_info_update(&mut self) -> Result<(), FatError> {
        let Some((free, next)) = self.fs_info else {
            return Ok(());
        };
        let current = (self.available_clusters, self.cluster_search_start.0);
        if current == (free, next) {
            return Ok(());
        }
        let sector = LogicalSector(u64::from(self.geometry.fs_info_sector));
        self.write_sector_bytes(
            sector,
            FsInfoSector::FREE_COUNT_OFFSET,
            &current.0.to_le_bytes(),
            SectorType::Boot,
        )?;
        self.write_sector_bytes(
            sector,
            FsInfoSector::NEXT_FREE_OFFSET,
            &current.1.to_le_bytes(),
            SectorType::Boot,
        )?;
        self.fs_info = Some(current);
        Ok(())
    }

    /// Writes everything pending, in dependency order: FAT entries, the
    /// bitmap window, the mirror FATs and FSInfo, then all remaining dirty
    /// sectors.
    pub(crate) fn flush(&mut self) -> Result<(), FatError> {
        self.fat_flush()?;
        self.bitmap_flush()?;
        if !self.ft_active {
            self.fat_mirror()?;
            self.fs_info_update()?;
        }
        self.sectors.flush_all(&mut self.driver, &mut self.stats)
    }

    /// Drops every cache without writing anything back.
    pub(crate) fn invalidate_caches(&mut self) {
        self.fat.invalidate();
        self.fat_map.clear();
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.invalidate();
        }
        self.sectors.invalidate_all();
        self.search_cache.clear();
    }

    /// Walks a chain to its end. Returns the number of clusters and the last
    /// one. Cycles and links out of range are `FileCorrupt`.
    pub(crate) fn walk_chain(
        &mut self,
        first: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<(u32, Cluster), FatError> {
        if !self.geometry.is_valid_cluster(first) {
            return Err(FatError::FileCorrupt);
        }
        let format = self.format;
        let mut cluster = first;
        let mut count = 1;
        loop {
            match format.chain_next(self, cluster, run)? {
                FatEntry::EndOfChain => return Ok((count, cluster)),
                FatEntry::Next(next) if self.geometry.is_valid_cluster(next) => {
                    count += 1;
                    if count > self.geometry.total_clusters {
                        log::error!("cluster chain starting at {} loops", first.0);
                        return Err(FatError::FileCorrupt);
                    }
                    cluster = next;
                }
                _ => return Err(FatError::FileCorrupt),
            }
        }
    }

    /// Marks `cluster` allocated and accounts for it.
    pub(crate) fn claim_cluster(&mut self, cluster: Cluster) -> Result<(), FatError> {
        let format = self.format;
        format.set_cluster_state(self, cluster, true)?;
        self.available_clusters = self.available_clusters.saturating_sub(1);
        let next = cluster + 1;
        self.cluster_search_start = if self.geometry.is_valid_cluster(next) {
            next
        } else {
            Cluster::FIRST
        };
        Ok(())
    }

    /// Finds and claims a free cluster. On legacy volumes the cluster becomes
    /// a one-cluster chain; on exFAT only its bitmap bit is set.
    pub(crate) fn allocate_cluster(&mut self) -> Result<Cluster, FatError> {
        if self.available_clusters == 0 {
            return Err(FatError::NoMoreSpace);
        }
        let format = self.format;
        let cluster = match format.find_free_cluster(self, self.cluster_search_start) {
            Ok(cluster) => cluster,
            Err(FatError::NotFound) => return Err(FatError::NoMoreSpace),
            Err(err) => return Err(err),
        };
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FatError::FileCorrupt);
        }
        self.claim_cluster(cluster)?;
        Ok(cluster)
    }

    /// Frees a chain (or a contiguous run) starting at `first`. Stops at the
    /// end of the chain or at the first cluster that is already free, and
    /// returns the number of clusters released. A chain that loops is
    /// `FileCorrupt` and nothing is freed.
    pub(crate) fn release_cluster_chain(
        &mut self,
        first: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<u32, FatError> {
        let format = self.format;
        let exfat = self.geometry.kind.is_exfat();
        let length = self.releasable_length(first, run)?;
        let mut cluster = first;
        for _ in 0..length {
            let next = format.chain_next(self, cluster, run)?;
            format.set_cluster_state(self, cluster, false)?;
            if exfat && run.is_none() {
                self.fat_write(cluster, 0)?;
            }
            self.available_clusters =
                (self.available_clusters + 1).min(self.geometry.total_clusters);
            if cluster < self.cluster_search_start {
                self.cluster_search_start = cluster;
            }
            match next {
                FatEntry::Next(next) => cluster = next,
                _ => break,
            }
        }
        self.search_cache.clear();
        Ok(length)
    }

    /// Number of clusters `release_cluster_chain` would free, found without
    /// touching anything.
    fn releasable_length(
        &mut self,
        first: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<u32, FatError> {
        let format = self.format;
        let mut cluster = first;
        let mut length = 0;
        while self.geometry.is_valid_cluster(cluster) {
            if length >= self.geometry.total_clusters {
                log::error!("cluster chain starting at {} loops", first.0);
                return Err(FatError::FileCorrupt);
            }
            let next = format.chain_next(self, cluster, run)?;
            if next == FatEntry::Free && run.is_none() {
                break;
            }
            length += 1;
            match next {
                FatEntry::Next(next) => cluster = next,
                _ => break,
            }
        }
        Ok(length)
    }

    /// Runs a mutating operation. Without fault tolerance this is the
    /// operation followed by a flush. With it, the operation and its flush
    /// run inside a log transaction, and every cache is dropped afterwards
    /// since everything written now lives in the log. Either way, a failed
    /// operation leaves nothing dirty behind for a later flush to commit.
    pub(crate) fn run<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, FatError>,
    ) -> Result<T, FatError> {
        if self.driver.write_protected() {
            return Err(FatError::WriteProtect);
        }
        let snapshot = (
            self.available_clusters,
            self.cluster_search_start,
            self.geometry.root_directory_entries,
        );

        let logged = self.ft.is_some();
        if let Some(ft) = self.ft.as_mut() {
            ft.transaction_start()?;
            self.ft_active = true;
        }

        let outcome = op(self).and_then(|value| {
            self.flush()?;
            Ok(value)
        });
        self.ft_active = false;
        let outcome = match (outcome, self.ft.as_mut()) {
            (Ok(value), Some(ft)) => ft.transaction_end().map(|()| value),
            (Err(err), Some(ft)) => {
                ft.transaction_fail();
                Err(err)
            }
            (outcome, None) => outcome,
        };

        if logged || outcome.is_err() {
            self.invalidate_caches();
        }
        if let Err(err) = &outcome {
            log::error!("operation aborted: {err}");
            (
                self.available_clusters,
                self.cluster_search_start,
                self.geometry.root_directory_entries,
            ) = snapshot;
        }
        outcome
    }
}
