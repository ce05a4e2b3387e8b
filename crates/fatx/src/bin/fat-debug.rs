use std::fs::File;
use std::os::unix::prelude::FileExt;

use fatx::{
    BlockDriver, CheckFlags, Directory, FatError, LogicalSector, Media, MediaConfig, SectorType,
};

/// Read-only disk image. Sector size comes from the boot record.
#[derive(Debug)]
struct ImageFile {
    file: File,
    bytes_per_sector: u64,
}

impl ImageFile {
    fn open(path: &str) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let mut boot = [0; 512];
        file.read_exact_at(&mut boot, 0)?;
        let bytes_per_sector = if &boot[3..11] == b"EXFAT   " {
            1 << boot[108]
        } else {
            u64::from(u16::from_le_bytes([boot[11], boot[12]]))
        };
        Ok(Self {
            file,
            bytes_per_sector,
        })
    }
}

impl BlockDriver for ImageFile {
    fn read(
        &mut self,
        sector: LogicalSector,
        count: u32,
        buf: &mut [u8],
        _sector_type: SectorType,
    ) -> Result<(), FatError> {
        let len = (u64::from(count) * self.bytes_per_sector) as usize;
        self.file
            .read_exact_at(&mut buf[..len], sector.0 * self.bytes_per_sector)
            .map_err(|_| FatError::Io)
    }

    fn write(
        &mut self,
        _sector: LogicalSector,
        _count: u32,
        _buf: &[u8],
        _sector_type: SectorType,
    ) -> Result<(), FatError> {
        Err(FatError::WriteProtect)
    }

    fn boot_read(&mut self, buf: &mut [u8]) -> Result<(), FatError> {
        self.file
            .read_exact_at(&mut buf[..512], 0)
            .map_err(|_| FatError::Io)
    }

    fn boot_write(&mut self, _buf: &[u8]) -> Result<(), FatError> {
        Err(FatError::WriteProtect)
    }

    fn write_protected(&self) -> bool {
        true
    }
}

fn main() {
    // Get command line arguments, including a FAT disk file
    let args: Vec<String> = std::env::args().collect();
    let disk_file = match &args[..] {
        [_, disk_file] => disk_file,
        _ => {
            eprintln!("Usage: {} <disk_file>", args[0]);
            std::process::exit(1);
        }
    };

    println!("Reading FAT disk file: {disk_file}");
    let image = ImageFile::open(disk_file).expect("failed to open disk file");
    let media = Media::open(image, MediaConfig::default()).expect("failed to mount disk file");

    println!("{:#X?}", media.geometry());
    println!("Available clusters: {}", media.available_clusters());

    let root = media
        .entries(&Directory::Root)
        .expect("failed to read root directory");
    for entry in &root {
        let kind = if entry.is_directory() { "<DIR>" } else { "" };
        println!(
            "{:>5} {:>10} cluster {:<8} {}",
            kind, entry.file_size, entry.cluster.0, entry.name
        );
    }

    match media.check(CheckFlags::empty()) {
        Ok(report) if report.is_clean() => println!("No errors found"),
        Ok(report) => println!("{report:#?}"),
        Err(err) => eprintln!("Check failed: {err}"),
    }
    println!("{:#?}", media.statistics());
}
