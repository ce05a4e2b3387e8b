/// Running counters for one mounted media. Purely informational; nothing in
/// the engine reads them back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStatistics {
    pub logical_sector_reads: u64,
    pub logical_sector_writes: u64,
    pub logical_sector_cache_hits: u64,
    pub logical_sector_cache_misses: u64,
    pub fat_entry_reads: u64,
    pub fat_entry_writes: u64,
    pub fat_entry_cache_hits: u64,
    pub fat_entry_cache_misses: u64,
    pub fat_cache_flushes: u64,
    pub driver_read_requests: u64,
    pub driver_write_requests: u64,
    pub directory_entry_reads: u64,
    pub directory_entry_writes: u64,
    pub directory_searches: u64,
    pub directory_search_cache_hits: u64,
    pub directory_free_searches: u64,
}
