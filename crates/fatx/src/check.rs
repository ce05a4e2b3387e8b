use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use cluster_bitmap::ClusterBitmap;

use crate::directory::SlotCursor;
use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    Attributes, BlockDriver, Cluster, ContiguousRun, Decoded, DirectoryEntry, FatEntry, FatError,
    Region, UpdateLevel, FAT_ENTRY_START,
};

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    /// Classes of inconsistency. The checker reports the ones it found with
    /// these, and callers pass them in to say which ones may be repaired.
    pub struct CheckFlags: u32 {
        /// Cross-linked, cyclic or broken cluster chains.
        const FAT_CHAIN_ERROR = 0x01;
        /// Entries left without any valid cluster.
        const DIRECTORY_ERROR = 0x02;
        /// Clusters allocated but reachable from no entry.
        const LOST_CLUSTER_ERROR = 0x04;
        /// Recorded size and allocation disagree.
        const FILE_SIZE_ERROR = 0x08;
    }
}

/// Outcome of one pass of the checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub errors: CheckFlags,
    pub repaired: CheckFlags,
    /// Chains running into a cluster another chain already owns.
    pub cross_links: u32,
    /// Chains that loop, leave the volume, or run into a free or bad cluster.
    pub broken_chains: u32,
    pub size_mismatches: u32,
    pub lost_clusters: u32,
    pub directory_errors: u32,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChainFault {
    CrossLink,
    Broken,
}

/// How far a chain could be followed before something went wrong.
#[derive(Debug, Copy, Clone, Default)]
struct ChainWalk {
    valid: u32,
    last: Cluster,
    fault: Option<ChainFault>,
}

/// A directory still being scanned.
#[derive(Debug, Copy, Clone)]
struct Frame {
    cursor: SlotCursor,
    index: u32,
    total: u32,
}

struct Checker {
    /// One bit per data cluster, set once some chain has claimed it.
    claimed: ClusterBitmap<Vec<u8>>,
    repair: CheckFlags,
    report: CheckReport,
}

impl Checker {
    fn flag(&mut self, error: CheckFlags) {
        self.report.errors |= error;
    }

    fn may_repair(&mut self, error: CheckFlags) -> bool {
        if self.repair.intersects(error) {
            self.report.repaired |= error & self.repair;
            true
        } else {
            false
        }
    }
}

impl<D: BlockDriver> Volume<D> {
    /// Walks every directory from the root, follows every chain, and
    /// compares what it finds with the allocation state on disk. Repairs
    /// only the error classes named in `repair`.
    pub(crate) fn check(&mut self, repair: CheckFlags) -> Result<CheckReport, FatError> {
        if !repair.is_empty() && self.driver.write_protected() {
            return Err(FatError::WriteProtect);
        }
        self.flush()?;
        self.invalidate_caches();

        let total = self.geometry.total_clusters as usize;
        let mut checker = Checker {
            claimed: ClusterBitmap::with_len(vec![0; total.div_ceil(8)], total),
            repair,
            report: CheckReport::default(),
        };

        if let Some(layout) = self.exfat {
            self.claim_system_chain(&mut checker, layout.bitmap_cluster, layout.bitmap_length)?;
            if !layout.upcase_cluster.is_none() {
                self.claim_system_chain(&mut checker, layout.upcase_cluster, layout.upcase_length)?;
            }
        }
        if self.geometry.kind.has_root_cluster() {
            self.check_root_chain(&mut checker)?;
        }
        self.check_directories(&mut checker)?;
        self.check_lost_clusters(&mut checker)?;

        let report = checker.report;
        if !report.repaired.is_empty() {
            self.search_cache.clear();
            self.flush()?;
        }
        if report.is_clean() {
            log::debug!("media check found no errors");
        } else {
            log::warn!("media check: {report:?}");
        }
        Ok(report)
    }

    /// Follows a chain, claiming each cluster, until it ends or something
    /// is wrong with it.
    fn check_chain(
        &mut self,
        checker: &mut Checker,
        first: Cluster,
        run: Option<ContiguousRun>,
    ) -> Result<ChainWalk, FatError> {
        let format = self.format;
        let mut walk = ChainWalk::default();
        let mut cluster = first;
        loop {
            if !self.geometry.is_valid_cluster(cluster) {
                walk.fault = Some(ChainFault::Broken);
                break;
            }
            if !checker.claimed.mark_used(cluster.data_index() as usize) {
                // Meeting our own cluster again means a loop.
                walk.fault = Some(if self.chain_contains(first, run, walk.valid, cluster)? {
                    ChainFault::Broken
                } else {
                    ChainFault::CrossLink
                });
                break;
            }
            walk.valid += 1;
            walk.last = cluster;
            match format.chain_next(self, cluster, run)? {
                FatEntry::EndOfChain => break,
                FatEntry::Next(next) => cluster = next,
                FatEntry::Free | FatEntry::Bad => {
                    walk.fault = Some(ChainFault::Broken);
                    break;
                }
            }
        }
        Ok(walk)
    }

    /// Whether `target` is among the first `steps` clusters of a chain that
    /// is known to be intact that far.
    fn chain_contains(
        &mut self,
        first: Cluster,
        run: Option<ContiguousRun>,
        steps: u32,
        target: Cluster,
    ) -> Result<bool, FatError> {
        let format = self.format;
        let mut cluster = first;
        for _ in 0..steps {
            if cluster == target {
                return Ok(true);
            }
            match format.chain_next(self, cluster, run)? {
                FatEntry::Next(next) => cluster = next,
                _ => break,
            }
        }
        Ok(false)
    }

    fn note_chain_fault(&self, checker: &mut Checker, fault: ChainFault, name: &str) {
        match fault {
            ChainFault::CrossLink => checker.report.cross_links += 1,
            ChainFault::Broken => checker.report.broken_chains += 1,
        }
        checker.flag(CheckFlags::FAT_CHAIN_ERROR);
        log::warn!("{fault:?} in the cluster chain of {name:?}");
    }

    /// exFAT bitmap and up-case table. They are usually contiguous with
    /// nothing in the FAT.
    fn claim_system_chain(
        &mut self,
        checker: &mut Checker,
        first: Cluster,
        length: u64,
    ) -> Result<(), FatError> {
        if !self.geometry.is_valid_cluster(first) {
            log::warn!("system structure at invalid cluster {}", first.0);
            return Ok(());
        }
        let clusters = length
            .div_ceil(u64::from(self.geometry.bytes_per_cluster()))
            .max(1) as u32;
        let run = (self.fat_read(first)? == 0).then_some(ContiguousRun {
            first,
            count: clusters,
        });
        let walk = self.check_chain(checker, first, run)?;
        if let Some(fault) = walk.fault {
            log::warn!("{fault:?} in system chain at cluster {}", first.0);
        }
        Ok(())
    }

    /// A broken root chain can only be truncated; if that isn't allowed the
    /// check cannot go on.
    fn check_root_chain(&mut self, checker: &mut Checker) -> Result<(), FatError> {
        let root = self.geometry.root_cluster;
        let walk = self.check_chain(checker, root, None)?;
        let Some(fault) = walk.fault else {
            return Ok(());
        };
        self.note_chain_fault(checker, fault, "/");
        if walk.valid == 0 || !checker.may_repair(CheckFlags::FAT_CHAIN_ERROR) {
            log::error!("root directory chain is broken and may not be repaired");
            return Err(FatError::ErrorNotFixed);
        }
        self.fat_write(walk.last, self.geometry.kind.last())?;
        self.geometry.root_directory_entries = walk.valid * self.slots_per_cluster();
        Ok(())
    }

    fn check_directories(&mut self, checker: &mut Checker) -> Result<(), FatError> {
        let format = self.format;
        let legacy = !self.geometry.kind.is_exfat();
        let max_depth = self.config.max_directory_nesting;
        let mut stack = Vec::with_capacity(max_depth + 1);
        stack.push(Frame {
            cursor: SlotCursor::new(self.root_region()),
            index: 0,
            total: self.geometry.root_directory_entries,
        });

        while let Some(&Frame {
            mut cursor,
            index,
            total,
        }) = stack.last()
        {
            if index >= total {
                stack.pop();
                continue;
            }
            let decoded = match format.decode_entry(self, &mut cursor, index, None) {
                Ok(decoded) => Some(decoded),
                Err(FatError::FileCorrupt) => {
                    checker.report.directory_errors += 1;
                    checker.flag(CheckFlags::DIRECTORY_ERROR);
                    log::warn!("corrupt directory entry at slot {index}");
                    None
                }
                Err(err) => return Err(err),
            };
            let (next, kind) = match decoded {
                Some(decoded) => (decoded.next, decoded.kind),
                None => (index + 1, Decoded::Skip),
            };
            if let Some(frame) = stack.last_mut() {
                frame.cursor = cursor;
                frame.index = if kind == Decoded::EndOfDirectory {
                    total
                } else {
                    next
                };
            }

            let Decoded::Used(entry) = kind else {
                continue;
            };
            if entry.is_dot_entry()
                || (legacy
                    && entry.attributes.contains(Attributes::VOLUME_ID)
                    && !entry.is_directory())
            {
                continue;
            }
            if let Some(child) = self.check_entry(checker, entry)? {
                if stack.len() > max_depth {
                    log::error!("directories nest deeper than {max_depth} levels");
                    return Err(FatError::NotEnoughMemory);
                }
                stack.push(child);
            }
        }
        Ok(())
    }

    /// Checks one entry's chain and size. Returns the frame to scan next if
    /// the entry is a usable directory.
    fn check_entry(
        &mut self,
        checker: &mut Checker,
        mut entry: DirectoryEntry,
    ) -> Result<Option<Frame>, FatError> {
        let format = self.format;
        let exfat = self.geometry.kind.is_exfat();
        let bytes_per_cluster = u64::from(self.geometry.bytes_per_cluster());
        let run = (exfat && entry.no_fat_chain && !entry.cluster.is_none()).then(|| {
            ContiguousRun {
                first: entry.cluster,
                count: entry.available_size.div_ceil(bytes_per_cluster) as u32,
            }
        });

        let walk = if entry.cluster.is_none() {
            ChainWalk::default()
        } else {
            self.check_chain(checker, entry.cluster, run)?
        };
        if let Some(fault) = walk.fault {
            self.note_chain_fault(checker, fault, &entry.name);
            if walk.valid > 0
                && run.is_none()
                && checker.may_repair(CheckFlags::FAT_CHAIN_ERROR)
            {
                self.fat_write(walk.last, self.geometry.kind.last())?;
            }
        }

        let allocation = u64::from(walk.valid) * bytes_per_cluster;
        let recorded = if exfat {
            entry.available_size.max(entry.file_size)
        } else {
            entry.file_size
        };
        if walk.valid == 0 && (recorded > 0 || entry.is_directory()) {
            checker.report.directory_errors += 1;
            checker.flag(CheckFlags::DIRECTORY_ERROR);
            log::warn!("{:?} has no valid clusters left", entry.name);
            if checker.may_repair(CheckFlags::DIRECTORY_ERROR) {
                format.encode_entry(self, &entry, UpdateLevel::Delete)?;
            }
            return Ok(None);
        }

        if recorded > allocation {
            checker.report.size_mismatches += 1;
            checker.flag(CheckFlags::FILE_SIZE_ERROR);
            log::warn!(
                "{:?} records {recorded} bytes in {allocation} bytes of clusters",
                entry.name
            );
            entry.file_size = entry.file_size.min(allocation);
            if exfat {
                entry.available_size = allocation;
            }
            if checker.may_repair(CheckFlags::FAT_CHAIN_ERROR | CheckFlags::FILE_SIZE_ERROR) {
                let level = if exfat {
                    UpdateLevel::Stream
                } else {
                    UpdateLevel::Full
                };
                format.encode_entry(self, &entry, level)?;
            }
        } else if !entry.is_directory() {
            let used = if exfat {
                entry.available_size
            } else {
                entry.file_size
            };
            if allocation - used > bytes_per_cluster {
                checker.report.size_mismatches += 1;
                checker.flag(CheckFlags::FILE_SIZE_ERROR);
                log::warn!(
                    "{:?} holds {allocation} bytes of clusters for {used} bytes",
                    entry.name
                );
            }
        }

        if !entry.is_directory() {
            return Ok(None);
        }
        let region = Region::Chain {
            first: entry.cluster,
            contiguous: run.map(|_| walk.valid),
        };
        Ok(Some(Frame {
            cursor: SlotCursor::new(region),
            index: if exfat { 0 } else { 2 },
            total: walk.valid * self.slots_per_cluster(),
        }))
    }

    /// Anything allocated on disk that no chain claimed is lost.
    fn check_lost_clusters(&mut self, checker: &mut Checker) -> Result<(), FatError> {
        let kind = self.geometry.kind;
        let total = self.geometry.total_clusters;
        for cluster in FAT_ENTRY_START..self.geometry.cluster_limit() {
            let cluster = Cluster(cluster);
            if checker.claimed.is_used(cluster.data_index() as usize) == Some(true) {
                continue;
            }
            let allocated = if kind.is_exfat() {
                self.bitmap_state(cluster)?
            } else {
                let value = self.fat_read(cluster)?;
                value != 0 && value != kind.bad()
            };
            if !allocated {
                continue;
            }

            checker.report.lost_clusters += 1;
            checker.flag(CheckFlags::LOST_CLUSTER_ERROR);
            if !checker.may_repair(CheckFlags::LOST_CLUSTER_ERROR) {
                continue;
            }
            if kind.is_exfat() {
                self.bitmap_set(cluster, false)?;
            }
            if self.fat_read(cluster)? != 0 {
                self.fat_write(cluster, 0)?;
            }
            self.available_clusters = (self.available_clusters + 1).min(total);
        }
        if checker.report.lost_clusters > 0 {
            log::warn!("{} lost clusters", checker.report.lost_clusters);
        }
        Ok(())
    }
}
