use alloc::vec;
use cluster_bitmap::ClusterBitmap;

use crate::volume::Volume;
use crate::{BlockDriver, Cluster, FatError, LogicalSector, SectorType, FAT_ENTRY_START};

/// Window onto the exFAT allocation bitmap. Holds a fixed number of whole
/// bitmap sectors; bits past the end of the bitmap read as zero and are
/// never written.
#[derive(Debug)]
pub(crate) struct BitmapCache {
    start: LogicalSector,
    /// Sectors occupied by the on-disk bitmap.
    sectors: u32,
    window: ClusterBitmap<alloc::vec::Vec<u8>>,
    window_sectors: u32,
    /// Bitmap-relative sector at which the loaded window starts.
    window_first: Option<u32>,
    dirty: bool,
}

impl BitmapCache {
    pub(crate) fn new(
        start: LogicalSector,
        total_clusters: u32,
        window_bytes: usize,
        bytes_per_sector: u32,
    ) -> Self {
        let bits_per_sector = bytes_per_sector * u8::BITS;
        let window_sectors = (window_bytes as u32).div_ceil(bytes_per_sector).max(1);
        Self {
            start,
            sectors: total_clusters.div_ceil(bits_per_sector),
            window: ClusterBitmap::new(vec![0; (window_sectors * bytes_per_sector) as usize]),
            window_sectors,
            window_first: None,
            dirty: false,
        }
    }

    fn bits(&self) -> usize {
        self.window.len()
    }

    pub(crate) fn invalidate(&mut self) {
        self.window_first = None;
        self.dirty = false;
    }
}

impl<D: BlockDriver> Volume<D> {
    fn bitmap_cache(&self) -> Result<&BitmapCache, FatError> {
        self.bitmap.as_ref().ok_or(FatError::InvalidState)
    }

    /// Makes sure the window covering `cluster` is loaded, writing the
    /// current one back first if it changed. Returns the cluster's bit
    /// within the window.
    pub(crate) fn bitmap_prepare(&mut self, cluster: Cluster) -> Result<usize, FatError> {
        if !self.geometry.is_valid_cluster(cluster) {
            return Err(FatError::FatReadError);
        }
        let bytes_per_sector = self.geometry.bytes_per_sector;
        let bits_per_sector = bytes_per_sector * u8::BITS;
        let index = cluster.data_index();
        let cache = self.bitmap_cache()?;
        let window_sectors = cache.window_sectors;
        let relative = index / bits_per_sector;
        let window_first = relative - relative % window_sectors;
        let bit = (index - window_first * bits_per_sector) as usize;
        if cache.window_first == Some(window_first) {
            return Ok(bit);
        }

        self.bitmap_flush()?;
        for offset in 0..window_sectors {
            let relative = window_first + offset;
            let range = (offset * bytes_per_sector) as usize
                ..((offset + 1) * bytes_per_sector) as usize;
            let cache = self.bitmap_cache()?;
            if relative >= cache.sectors {
                if let Some(cache) = self.bitmap.as_mut() {
                    cache.window.as_bytes_mut()[range].fill(0);
                }
                continue;
            }
            let sector = cache.start + u64::from(relative);
            let position = self.read_sector(sector, SectorType::Bitmap)?;
            if let Some(cache) = self.bitmap.as_mut() {
                cache.window.as_bytes_mut()[range].copy_from_slice(self.sectors.buffer(position));
            }
        }
        if let Some(cache) = self.bitmap.as_mut() {
            cache.window_first = Some(window_first);
        }
        Ok(bit)
    }

    /// Writes a changed window back through the sector cache.
    pub(crate) fn bitmap_flush(&mut self) -> Result<(), FatError> {
        let Self {
            bitmap,
            sectors,
            driver,
            stats,
            geometry,
            ..
        } = self;
        let Some(cache) = bitmap.as_mut() else {
            return Ok(());
        };
        let Some(window_first) = cache.window_first else {
            return Ok(());
        };
        if !cache.dirty {
            return Ok(());
        }
        let bytes_per_sector = geometry.bytes_per_sector as usize;
        for offset in 0..cache.window_sectors {
            let relative = window_first + offset;
            if relative >= cache.sectors {
                break;
            }
            let start = offset as usize * bytes_per_sector;
            sectors.write(
                driver,
                stats,
                cache.start + u64::from(relative),
                &cache.window.as_bytes()[start..start + bytes_per_sector],
                SectorType::Bitmap,
                geometry.total_sectors,
            )?;
        }
        cache.dirty = false;
        Ok(())
    }

    /// Whether the bitmap marks `cluster` occupied.
    pub(crate) fn bitmap_state(&mut self, cluster: Cluster) -> Result<bool, FatError> {
        if self.ft_active {
            if let Some(state) = self.ft.as_mut().and_then(|ft| ft.read_bitmap(cluster)) {
                return Ok(state);
            }
        }
        let bit = self.bitmap_prepare(cluster)?;
        let cache = self.bitmap_cache()?;
        Ok(cache.window.is_used(bit) == Some(true))
    }

    pub(crate) fn bitmap_set(&mut self, cluster: Cluster, occupied: bool) -> Result<(), FatError> {
        if self.ft_active {
            if let Some(ft) = self.ft.as_mut() {
                ft.add_bitmap_log(cluster, occupied)?;
            }
        }
        let bit = self.bitmap_prepare(cluster)?;
        let ft_active = self.ft_active;
        let cache = self.bitmap.as_mut().ok_or(FatError::InvalidState)?;
        cache.window.set(bit, occupied);
        if !ft_active {
            cache.dirty = true;
        }
        Ok(())
    }

    /// Circular scan for a clear bit, starting at `start` and wrapping once.
    /// `NotFound` after a full revolution.
    pub(crate) fn free_cluster_find(&mut self, start: Cluster) -> Result<Cluster, FatError> {
        let total = self.geometry.total_clusters as usize;
        let start_index = if self.geometry.is_valid_cluster(start) {
            start.data_index() as usize
        } else {
            0
        };
        let window_bits = self.bitmap_cache()?.bits();

        // Two passes: [start, total) then [0, start).
        for (from, to) in [(start_index, total), (0, start_index)] {
            let mut index = from;
            while index < to {
                let base = index - index % window_bits;
                let bit = self.bitmap_prepare(Cluster(index as u32 + FAT_ENTRY_START))?;
                let limit = (base + window_bits).min(to);
                let found = self.bitmap_cache()?.window.find_unused_in(bit..limit - base);
                let Some(found) = found else {
                    index = limit;
                    continue;
                };
                let candidate = Cluster((base + found) as u32 + FAT_ENTRY_START);
                if self.ft_active
                    && self.ft.as_mut().and_then(|ft| ft.read_bitmap(candidate)) == Some(true)
                {
                    index = base + found + 1;
                    continue;
                }
                return Ok(candidate);
            }
        }
        Err(FatError::NotFound)
    }

    /// Number of occupied clusters, counted window by window.
    pub(crate) fn bitmap_count_used(&mut self) -> Result<u32, FatError> {
        let total = self.geometry.total_clusters as usize;
        let window_bits = self.bitmap_cache()?.bits();
        let mut used = 0;
        for base in (0..total).step_by(window_bits) {
            self.bitmap_prepare(Cluster(base as u32 + FAT_ENTRY_START))?;
            let cache = self.bitmap_cache()?;
            let bits = window_bits.min(total - base);
            used += cache.window.count_used_in(0..bits);
        }
        Ok(used as u32)
    }
}
