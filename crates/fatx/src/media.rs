use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    BlockDriver, CheckFlags, CheckReport, Cluster, ContiguousRun, DecodedSlot, Directory,
    DirectoryEntry, FatError, FaultTolerantLog, Geometry, MediaStatistics, UpdateLevel,
};

/// Tunables for one mounted media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    /// Logical sectors held in the sector cache. Clamped to `1..=256`.
    pub sector_cache_size: usize,
    /// Bytes of the exFAT allocation bitmap kept in memory at once.
    pub bitmap_window_bytes: usize,
    /// Remember the last path lookup.
    pub search_cache: bool,
    /// Deepest directory nesting the consistency checker descends into.
    pub max_directory_nesting: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sector_cache_size: 256,
            bitmap_window_bytes: 512,
            search_cache: true,
            max_directory_nesting: 20,
        }
    }
}

/// A mounted FAT12/16/32 or exFAT volume.
///
/// Every operation takes the media lock for its whole duration. Operations
/// that change the media check write protection first and flush before the
/// lock is released, inside a log transaction when fault tolerance is on.
#[derive(Debug)]
pub struct Media<D: BlockDriver> {
    volume: Mutex<Volume<D>>,
}

impl<D: BlockDriver> Media<D> {
    /// Reads the boot record through `driver` and mounts the volume it
    /// describes.
    pub fn open(driver: D, config: MediaConfig) -> Result<Self, FatError> {
        let volume = Volume::mount(driver, config)?;
        Ok(Self {
            volume: Mutex::new(volume),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.volume.lock().geometry
    }

    pub fn available_clusters(&self) -> u32 {
        self.volume.lock().available_clusters
    }

    pub fn statistics(&self) -> MediaStatistics {
        self.volume.lock().stats
    }

    /// Routes every later write through `log`. Anything already cached is
    /// flushed to the driver first.
    pub fn enable_fault_tolerance(
        &self,
        log: Box<dyn FaultTolerantLog + Send>,
    ) -> Result<(), FatError> {
        let mut volume = self.volume.lock();
        volume.flush()?;
        volume.ft = Some(log);
        log::debug!("fault tolerance enabled");
        Ok(())
    }

    /// Detaches and returns the log, if one was attached.
    pub fn disable_fault_tolerance(&self) -> Option<Box<dyn FaultTolerantLog + Send>> {
        self.volume.lock().ft.take()
    }

    /// Resolves `path` starting at `start`. Returns the entry and the
    /// directory holding it.
    pub fn search(
        &self,
        path: &str,
        start: &Directory,
    ) -> Result<(DirectoryEntry, Directory), FatError> {
        self.volume.lock().search(path, start)
    }

    pub fn read_entry(&self, directory: &Directory, index: u32) -> Result<DecodedSlot, FatError> {
        self.volume.lock().read_entry(directory, index)
    }

    pub fn entries(&self, directory: &Directory) -> Result<Vec<DirectoryEntry>, FatError> {
        self.volume.lock().entries(directory)
    }

    /// Rewrites the parts of a located entry selected by `level`.
    pub fn write_entry(&self, entry: &DirectoryEntry, level: UpdateLevel) -> Result<(), FatError> {
        if entry.location.is_none() {
            return Err(FatError::InvalidState);
        }
        self.volume.lock().run(|volume| {
            let format = volume.format;
            format.encode_entry(volume, entry, level)?;
            volume.search_cache.refresh(entry);
            Ok(())
        })
    }

    /// Reserves slots for `entry` in `directory`, growing the directory if
    /// needed. `entry.location` points at the reserved slots afterwards.
    pub fn free_search(
        &self,
        directory: &mut Directory,
        entry: &mut DirectoryEntry,
    ) -> Result<(), FatError> {
        self.volume
            .lock()
            .run(|volume| volume.free_search(directory, entry))
    }

    /// Adds `entry` to `directory` under its name.
    pub fn create_entry(
        &self,
        directory: &mut Directory,
        entry: &mut DirectoryEntry,
    ) -> Result<(), FatError> {
        self.volume.lock().run(|volume| {
            match volume.find_in_directory(directory, &entry.name) {
                Ok(_) => return Err(FatError::AlreadyCreated),
                Err(FatError::NotFound) => {}
                Err(err) => return Err(err),
            }
            volume.free_search(directory, entry)?;
            let format = volume.format;
            format.encode_entry(volume, entry, UpdateLevel::Full)?;
            volume.search_cache.clear();
            Ok(())
        })
    }

    /// Marks `entry` deleted and frees its clusters. Returns the number of
    /// clusters released.
    pub fn delete_entry(&self, entry: &DirectoryEntry) -> Result<u32, FatError> {
        if entry.location.is_none() {
            return Err(FatError::InvalidState);
        }
        self.volume.lock().run(|volume| {
            let format = volume.format;
            format.encode_entry(volume, entry, UpdateLevel::Delete)?;
            let released = if entry.cluster.is_none() {
                0
            } else {
                let bytes_per_cluster = u64::from(volume.geometry.bytes_per_cluster());
                let run = entry.no_fat_chain.then(|| ContiguousRun {
                    first: entry.cluster,
                    count: entry.available_size.div_ceil(bytes_per_cluster) as u32,
                });
                volume.release_cluster_chain(entry.cluster, run)?
            };
            volume.search_cache.clear();
            log::debug!("deleted {:?}, released {released} clusters", entry.name);
            Ok(released)
        })
    }

    /// Grows `directory` by one zeroed cluster.
    pub fn allocate_directory_cluster(&self, directory: &mut Directory) -> Result<Cluster, FatError> {
        self.volume
            .lock()
            .run(|volume| volume.grow_directory(directory))
    }

    /// Runs the consistency checker, repairing the error classes in
    /// `repair`. An empty `repair` never writes.
    pub fn check(&self, repair: CheckFlags) -> Result<CheckReport, FatError> {
        let mut volume = self.volume.lock();
        if repair.is_empty() {
            volume.check(repair)
        } else {
            volume.run(|volume| volume.check(repair))
        }
    }

    pub fn flush(&self) -> Result<(), FatError> {
        self.volume.lock().flush()
    }

    /// Drops every cached sector, FAT entry and bitmap window without
    /// writing anything back.
    pub fn invalidate(&self) {
        self.volume.lock().invalidate_caches();
    }

    /// Flushes and hands the driver back.
    pub fn close(self) -> Result<D, FatError> {
        let mut volume = self.volume.into_inner();
        volume.flush()?;
        Ok(volume.driver)
    }
}
