use alloc::vec;

use crate::directory::SlotCursor;
use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    BlockDriver, Cluster, Directory, DirectoryEntry, EntryLocation, FatError, Region, SectorType,
    UpdateLevel, DELETED, DIR_ENTRY_SIZE, END_OF_DIRECTORY, MAX_DIRECTORY_SIZE, TYPE_IN_USE,
};

impl<D: BlockDriver> Volume<D> {
    /// Reserves enough consecutive free slots in `directory` for `entry`
    /// and records them in `entry.location`. Grows the directory by a
    /// cluster at a time until a run fits. Nothing is written for the entry
    /// itself; the caller encodes it afterwards.
    pub(crate) fn free_search(
        &mut self,
        directory: &mut Directory,
        entry: &mut DirectoryEntry,
    ) -> Result<(), FatError> {
        self.stats.directory_free_searches += 1;
        let format = self.format;
        let dot = entry.is_dot_entry();
        let needed = if dot {
            1
        } else {
            format.slots_for_name(&entry.name)?
        };
        let exfat = self.geometry.kind.is_exfat();

        loop {
            let region = self.region_of(directory);
            let total = self.directory_entry_count(region)?;
            let mut cursor = SlotCursor::new(region);
            let mut index = if dot { 0 } else { format.first_slot(directory) };
            let mut run_start = index;
            let mut run_length = 0;
            let mut past_end = false;

            while index < total {
                let free = past_end || {
                    let (raw, ..) = self.read_slot(&mut cursor, index)?;
                    if raw[0] == END_OF_DIRECTORY {
                        past_end = true;
                        true
                    } else if exfat {
                        raw[0] & TYPE_IN_USE == 0
                    } else {
                        raw[0] == DELETED
                    }
                };
                index += 1;
                if !free {
                    run_start = index;
                    run_length = 0;
                    continue;
                }
                run_length += 1;
                if run_length == needed {
                    return self.reserve_slots(region, run_start, needed, entry);
                }
            }

            let cluster = self.grow_directory(directory)?;
            log::debug!("grew directory by cluster {} to fit {needed} slots", cluster.0);
        }
    }

    fn reserve_slots(
        &mut self,
        region: Region,
        start: u32,
        slots: u32,
        entry: &mut DirectoryEntry,
    ) -> Result<(), FatError> {
        let mut cursor = SlotCursor::new(region);
        let legacy_group = !self.geometry.kind.is_exfat() && slots > 1;
        if legacy_group {
            // Until the short entry lands, the end marker must not sit in
            // the middle of the group.
            for index in start..start + slots {
                let (mut raw, sector, offset) = self.read_slot(&mut cursor, index)?;
                if raw[0] == END_OF_DIRECTORY {
                    raw[0] = DELETED;
                    self.write_slot(sector, offset, &raw)?;
                }
            }
        }
        let (sector, byte_offset) = self.slot_position(&mut cursor, start)?;
        entry.location = Some(EntryLocation {
            region,
            index: start,
            slots,
            sector,
            byte_offset,
        });
        entry.long_name_present = legacy_group;
        Ok(())
    }

    /// Adds one zeroed cluster to `directory`. The directory's own entry is
    /// rewritten when its allocation is recorded there.
    pub(crate) fn grow_directory(&mut self, directory: &mut Directory) -> Result<Cluster, FatError> {
        if self.available_clusters == 0 {
            return Err(FatError::NoMoreSpace);
        }
        let exfat = self.geometry.kind.is_exfat();
        let bytes_per_cluster = self.geometry.bytes_per_cluster();
        let had_cluster = match directory {
            Directory::Sub(entry) => {
                if exfat && entry.available_size + u64::from(bytes_per_cluster) > MAX_DIRECTORY_SIZE
                {
                    return Err(FatError::NoMoreSpace);
                }
                !entry.cluster.is_none()
            }
            Directory::Root => true,
        };

        let format = self.format;
        let cluster = format.allocate_new_cluster(self, directory)?;
        let zeros = vec![0; self.geometry.bytes_per_sector as usize];
        let first = self.geometry.cluster_sector(cluster);
        for offset in 0..self.geometry.sectors_per_cluster {
            self.write_full_sector(first + u64::from(offset), &zeros, SectorType::Directory)?;
        }

        match directory {
            Directory::Root => {
                self.geometry.root_directory_entries += bytes_per_cluster / DIR_ENTRY_SIZE as u32;
            }
            Directory::Sub(entry) if exfat => {
                format.encode_entry(self, entry, UpdateLevel::Stream)?;
            }
            Directory::Sub(entry) if !had_cluster => {
                format.encode_entry(self, entry, UpdateLevel::Full)?;
            }
            Directory::Sub(_) => {}
        }
        self.search_cache.clear();
        Ok(cluster)
    }
}
