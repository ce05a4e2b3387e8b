use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::{BlockDriver, FatError, LogicalSector, MediaStatistics, SectorType};

/// Number of ways in each set of a hashed cache.
pub const SECTOR_CACHE_DEPTH: usize = 4;

/// Caches with at least this many entries (and a power-of-two size) use the
/// hashed index.
pub const SECTOR_CACHE_HASH_ENABLE: usize = 16;

pub const MAX_SECTOR_CACHE: usize = 256;

#[derive(Debug)]
struct CachedSector {
    sector: Option<LogicalSector>,
    dirty: bool,
    sector_type: SectorType,
    buffer: Vec<u8>,
}

/// Write-back cache of whole logical sectors.
///
/// Entries are grouped into sets. A hashed cache has sets of
/// [`SECTOR_CACHE_DEPTH`] entries selected by the low bits of the sector
/// number; a small cache is a single set, which makes it a plain LRU list.
/// Within a set, entries are kept in most-recently-used-first order, so the
/// eviction victim is always the last entry of the set.
#[derive(Debug)]
pub struct SectorCache {
    entries: Vec<CachedSector>,
    /// Reads land here first, so a failed read leaves the cache untouched.
    scratch: Vec<u8>,
    bytes_per_sector: usize,
    ways: usize,
    hash_mask: u64,
    dirty_count: usize,
}

impl SectorCache {
    /// Allocates all sector buffers up front. `num_sectors` is clamped to
    /// `1..=MAX_SECTOR_CACHE`.
    pub fn new(num_sectors: usize, bytes_per_sector: usize) -> Self {
        let num_sectors = num_sectors.clamp(1, MAX_SECTOR_CACHE);
        let hashed = num_sectors >= SECTOR_CACHE_HASH_ENABLE && num_sectors.is_power_of_two();
        let (ways, hash_mask) = if hashed {
            (
                SECTOR_CACHE_DEPTH,
                (num_sectors / SECTOR_CACHE_DEPTH - 1) as u64,
            )
        } else {
            (num_sectors, 0)
        };

        let entries = (0..num_sectors)
            .map(|_| CachedSector {
                sector: None,
                dirty: false,
                sector_type: SectorType::Unknown,
                buffer: vec![0; bytes_per_sector],
            })
            .collect();

        Self {
            entries,
            scratch: vec![0; bytes_per_sector],
            bytes_per_sector,
            ways,
            hash_mask,
            dirty_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_hashed(&self) -> bool {
        self.ways != self.entries.len()
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bytes_per_sector
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    fn set_range(&self, sector: LogicalSector) -> Range<usize> {
        let set = (sector.0 & self.hash_mask) as usize;
        let start = set * self.ways;
        start..start + self.ways
    }

    /// Finds `sector` and promotes it to most-recently-used. Returns the
    /// entry's new position.
    fn lookup(&mut self, sector: LogicalSector) -> Option<usize> {
        let range = self.set_range(sector);
        let position = self.entries[range.clone()]
            .iter()
            .position(|entry| entry.sector == Some(sector))?;
        self.entries[range.start..=range.start + position].rotate_right(1);
        Some(range.start)
    }

    pub fn contains(&self, sector: LogicalSector) -> bool {
        self.entries[self.set_range(sector)]
            .iter()
            .any(|entry| entry.sector == Some(sector))
    }

    pub fn is_dirty(&self, sector: LogicalSector) -> bool {
        self.entries[self.set_range(sector)]
            .iter()
            .any(|entry| entry.sector == Some(sector) && entry.dirty)
    }

    /// Writes back the least-recently-used entry of the set `sector` maps to
    /// if it is dirty, and moves it to the front of the set. Returns its
    /// position. On a write-back failure the victim stays valid and dirty.
    fn evict<D: BlockDriver>(
        &mut self,
        driver: &mut D,
        stats: &mut MediaStatistics,
        sector: LogicalSector,
    ) -> Result<usize, FatError> {
        let range = self.set_range(sector);
        let victim = &mut self.entries[range.end - 1];
        if victim.dirty {
            if let Some(victim_sector) = victim.sector {
                stats.driver_write_requests += 1;
                driver
                    .write(victim_sector, 1, &victim.buffer, victim.sector_type)
                    .map_err(|err| {
                        log::error!("write-back of sector {} failed: {err}", victim_sector.0);
                        err
                    })?;
            }
            victim.dirty = false;
            self.dirty_count -= 1;
        }
        self.entries[range.clone()].rotate_right(1);
        Ok(range.start)
    }

    /// Returns the position of the cached copy of `sector`, reading it from
    /// the driver on a miss. The second value is `true` when the sector was
    /// just loaded.
    pub fn read<D: BlockDriver>(
        &mut self,
        driver: &mut D,
        stats: &mut MediaStatistics,
        sector: LogicalSector,
        sector_type: SectorType,
        total_sectors: u64,
    ) -> Result<(usize, bool), FatError> {
        stats.logical_sector_reads += 1;
        if let Some(position) = self.lookup(sector) {
            stats.logical_sector_cache_hits += 1;
            return Ok((position, false));
        }
        stats.logical_sector_cache_misses += 1;

        if sector.0 >= total_sectors {
            return Err(FatError::SectorInvalid);
        }

        stats.driver_read_requests += 1;
        driver.read(sector, 1, &mut self.scratch, sector_type)?;

        let position = self.evict(driver, stats, sector)?;
        let entry = &mut self.entries[position];
        core::mem::swap(&mut entry.buffer, &mut self.scratch);
        entry.sector = Some(sector);
        entry.sector_type = sector_type;
        entry.dirty = false;
        Ok((position, true))
    }

    /// Replaces the contents of `sector` and marks it dirty without touching
    /// the driver (other than for evicting a dirty victim).
    pub fn write<D: BlockDriver>(
        &mut self,
        driver: &mut D,
        stats: &mut MediaStatistics,
        sector: LogicalSector,
        data: &[u8],
        sector_type: SectorType,
        total_sectors: u64,
    ) -> Result<(), FatError> {
        if data.len() != self.bytes_per_sector {
            return Err(FatError::BufferError);
        }
        if sector.0 >= total_sectors {
            return Err(FatError::SectorInvalid);
        }
        stats.logical_sector_writes += 1;

        let position = match self.lookup(sector) {
            Some(position) => position,
            None => {
                let position = self.evict(driver, stats, sector)?;
                let entry = &mut self.entries[position];
                entry.sector = Some(sector);
                entry.sector_type = sector_type;
                position
            }
        };
        self.entries[position].buffer.copy_from_slice(data);
        self.mark_dirty(position);
        Ok(())
    }

    pub(crate) fn buffer(&self, position: usize) -> &[u8] {
        &self.entries[position].buffer
    }

    pub(crate) fn buffer_mut(&mut self, position: usize) -> &mut [u8] {
        &mut self.entries[position].buffer
    }

    pub(crate) fn mark_dirty(&mut self, position: usize) {
        let entry = &mut self.entries[position];
        if !entry.dirty {
            entry.dirty = true;
            self.dirty_count += 1;
        }
    }

    /// Writes back every dirty entry whose sector falls in `range`.
    pub fn flush<D: BlockDriver>(
        &mut self,
        driver: &mut D,
        stats: &mut MediaStatistics,
        range: Range<u64>,
    ) -> Result<(), FatError> {
        if self.dirty_count == 0 {
            return Ok(());
        }
        for entry in &mut self.entries {
            let Some(sector) = entry.sector else {
                continue;
            };
            if !entry.dirty || !range.contains(&sector.0) {
                continue;
            }
            stats.driver_write_requests += 1;
            driver.write(sector, 1, &entry.buffer, entry.sector_type)?;
            entry.dirty = false;
            self.dirty_count -= 1;
        }
        Ok(())
    }

    /// Writes back everything that is dirty.
    pub fn flush_all<D: BlockDriver>(
        &mut self,
        driver: &mut D,
        stats: &mut MediaStatistics,
    ) -> Result<(), FatError> {
        self.flush(driver, stats, 0..u64::MAX)
    }

    /// Drops entries in `range` without writing them back.
    pub fn invalidate(&mut self, range: Range<u64>) {
        for set_start in (0..self.entries.len()).step_by(self.ways) {
            let set = &mut self.entries[set_start..set_start + self.ways];
            let mut position = 0;
            let mut remaining = set.len();
            while position < remaining {
                let entry = &mut set[position];
                match entry.sector {
                    Some(sector) if range.contains(&sector.0) => {
                        if entry.dirty {
                            self.dirty_count -= 1;
                        }
                        entry.sector = None;
                        entry.dirty = false;
                        // Invalid entries go to the back of the set so they
                        // are reused first.
                        set[position..].rotate_left(1);
                        remaining -= 1;
                    }
                    _ => position += 1,
                }
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.invalidate(0..u64::MAX);
    }
}
