use alloc::string::String;
use alloc::vec::Vec;

use crate::directory::SlotCursor;
use crate::exfat::name_hash;
use crate::format::FilesystemFormat;
use crate::volume::Volume;
use crate::{
    names_equal, Attributes, BlockDriver, Decoded, DecodedSlot, Directory, DirectoryEntry,
    FatError, Region,
};

/// Result of the last successful path search.
#[derive(Debug, Clone)]
struct LastFound {
    start: Region,
    path: String,
    parent: Directory,
    entry: DirectoryEntry,
}

/// Per-volume memo of directory lookups. Cleared whenever a directory
/// changes shape, so a hit always matches what a fresh walk would find.
#[derive(Debug, Default)]
pub(crate) struct SearchCache {
    last_found: Option<LastFound>,
    /// Slot count of the most recently sized chained directory.
    pub(crate) directory_size: Option<(Region, u32)>,
}

impl SearchCache {
    pub(crate) fn clear(&mut self) {
        self.last_found = None;
        self.directory_size = None;
    }

    /// Keeps a cached result in step with an entry that was just rewritten
    /// in place.
    pub(crate) fn refresh(&mut self, entry: &DirectoryEntry) {
        if let Some(found) = self.last_found.as_mut() {
            if found.entry.location.is_some() && found.entry.location == entry.location {
                found.entry = entry.clone();
            }
        }
    }
}

fn is_separator(ch: char) -> bool {
    ch == '/' || ch == '\\'
}

impl<D: BlockDriver> Volume<D> {
    /// Resolves `path` starting at `start`, or at the root if the path
    /// begins with a separator. Returns the entry and the directory that
    /// holds it.
    pub(crate) fn search(
        &mut self,
        path: &str,
        start: &Directory,
    ) -> Result<(DirectoryEntry, Directory), FatError> {
        self.stats.directory_searches += 1;
        let start = if path.starts_with(is_separator) {
            Directory::Root
        } else {
            start.clone()
        };
        let components: Vec<&str> = path
            .split(is_separator)
            .filter(|component| !component.is_empty())
            .collect();
        let Some((last, parents)) = components.split_last() else {
            return Err(FatError::InvalidPath);
        };

        let start_region = self.region_of(&start);
        if self.config.search_cache {
            if let Some(found) = &self.search_cache.last_found {
                if found.start == start_region && found.path == path {
                    self.stats.directory_search_cache_hits += 1;
                    return Ok((found.entry.clone(), found.parent.clone()));
                }
            }
        }

        let mut directory = start;
        for component in parents {
            let entry = self.find_in_directory(&directory, component)?;
            if !entry.is_directory() {
                return Err(FatError::NotDirectory);
            }
            directory = Directory::of(entry);
        }
        let entry = self.find_in_directory(&directory, last)?;

        if self.config.search_cache {
            self.search_cache.last_found = Some(LastFound {
                start: start_region,
                path: String::from(path),
                parent: directory.clone(),
                entry: entry.clone(),
            });
        }
        Ok((entry, directory))
    }

    /// Looks up one name in one directory. Names match case-insensitively,
    /// against the long name or the 8.3 name.
    pub(crate) fn find_in_directory(
        &mut self,
        directory: &Directory,
        name: &str,
    ) -> Result<DirectoryEntry, FatError> {
        let region = self.region_of(directory);
        let total = self.directory_entry_count(region)?;
        let hash = self.geometry.kind.is_exfat().then(|| name_hash(name));
        let dot = name == "." || name == "..";
        let format = self.format;
        let mut cursor = SlotCursor::new(region);

        let mut index = 0;
        while index < total {
            let slot = format.decode_entry(self, &mut cursor, index, hash)?;
            index = slot.next;
            let entry = match slot.kind {
                Decoded::EndOfDirectory => break,
                Decoded::Used(entry) => entry,
                Decoded::Free | Decoded::Skip => continue,
            };
            if entry.attributes.contains(Attributes::VOLUME_ID)
                && !entry.attributes.contains(Attributes::DIRECTORY)
            {
                continue;
            }
            if entry.is_dot_entry() != dot {
                continue;
            }
            if names_equal(&entry.name, name)
                || (!entry.short_name.is_empty() && names_equal(&entry.short_name, name))
            {
                return Ok(entry);
            }
        }
        Err(FatError::NotFound)
    }

    /// Decodes whatever is at slot `index` of `directory`.
    pub(crate) fn read_entry(
        &mut self,
        directory: &Directory,
        index: u32,
    ) -> Result<DecodedSlot, FatError> {
        let region = self.region_of(directory);
        let mut cursor = SlotCursor::new(region);
        let format = self.format;
        format.decode_entry(self, &mut cursor, index, None)
    }

    /// Every entry in `directory`, in slot order, up to the end marker.
    pub(crate) fn entries(&mut self, directory: &Directory) -> Result<Vec<DirectoryEntry>, FatError> {
        let region = self.region_of(directory);
        let total = self.directory_entry_count(region)?;
        let format = self.format;
        let mut cursor = SlotCursor::new(region);
        let mut entries = Vec::new();
        let mut index = 0;
        while index < total {
            let slot = format.decode_entry(self, &mut cursor, index, None)?;
            index = slot.next;
            match slot.kind {
                Decoded::EndOfDirectory => break,
                Decoded::Used(entry) => entries.push(entry),
                Decoded::Free | Decoded::Skip => {}
            }
        }
        Ok(entries)
    }
}
