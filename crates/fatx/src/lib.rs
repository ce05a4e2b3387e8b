//! Core of an embedded FAT12/16/32 and exFAT engine: sector, FAT and
//! allocation-bitmap caches, the directory entry codecs, directory search and
//! growth, and the media consistency checker. File data streaming, formatting
//! and the redo log itself live outside this crate.
//!
//! # Resources
//!
//! - <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system>
//! - <https://academy.cba.mit.edu/classes/networking_communications/SD/FAT.pdf>
//! - <https://wiki.osdev.org/FAT>
//! - <https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification>

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_hasher,
    clippy::implicit_return,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::redundant_pub_crate,
    clippy::suboptimal_flops,
    clippy::wildcard_imports
)]

extern crate alloc;

mod bitmap;
mod boot;
mod check;
mod cluster;
mod directory;
mod driver;
mod entry;
mod error;
mod exfat;
mod fat_cache;
mod format;
mod free_search;
mod legacy;
mod media;
mod search;
mod sector_cache;
mod statistics;
mod volume;

#[cfg(test)]
mod testing;

pub use boot::*;
pub use check::*;
pub use cluster::*;
pub use directory::*;
pub use driver::*;
pub use entry::*;
pub use error::*;
pub use exfat::*;
pub use fat_cache::*;
pub use legacy::*;
pub use media::*;
pub use sector_cache::*;
pub use statistics::*;
