use core::fmt;

/// Every failure the engine reports. Driver and fault-tolerant log
/// implementations return these too, and the engine passes them through
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatError {
    /// The boot record could not be read.
    BootError,
    /// The boot record or a critical directory entry describes something we
    /// can't mount.
    MediaInvalid,
    /// A FAT walk produced an impossible result, like a chain that runs longer
    /// than the volume.
    FatReadError,
    NotFound,
    NotAFile,
    /// On-disk structure violates an invariant: bad checksum, cluster out of
    /// range, broken group, size mismatch.
    FileCorrupt,
    /// No free cluster, or a directory would exceed the format maximum.
    NoMoreSpace,
    AlreadyCreated,
    InvalidName,
    InvalidPath,
    NotDirectory,
    NoMoreEntries,
    BufferError,
    WriteProtect,
    /// Logical sector past the end of the volume.
    SectorInvalid,
    /// Driver-level I/O failure.
    Io,
    NotEnoughMemory,
    /// The consistency checker found an error it was not allowed to repair
    /// and cannot continue without repairing.
    ErrorNotFixed,
    InvalidState,
}

impl FatError {
    /// The classic numeric status for this error.
    pub const fn code(self) -> u8 {
        match self {
            Self::BootError => 0x01,
            Self::MediaInvalid => 0x02,
            Self::FatReadError => 0x03,
            Self::NotFound => 0x04,
            Self::NotAFile => 0x05,
            Self::FileCorrupt => 0x08,
            Self::NoMoreSpace => 0x0A,
            Self::AlreadyCreated => 0x0B,
            Self::InvalidName => 0x0C,
            Self::InvalidPath => 0x0D,
            Self::NotDirectory => 0x0E,
            Self::NoMoreEntries => 0x0F,
            Self::BufferError => 0x21,
            Self::WriteProtect => 0x23,
            Self::SectorInvalid => 0x89,
            Self::Io => 0x90,
            Self::NotEnoughMemory => 0x91,
            Self::ErrorNotFixed => 0x93,
            Self::InvalidState => 0x97,
        }
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Self::BootError => "boot sector could not be read",
            Self::MediaInvalid => "media is not a valid FAT or exFAT volume",
            Self::FatReadError => "FAT chain could not be followed",
            Self::NotFound => "not found",
            Self::NotAFile => "not a file",
            Self::FileCorrupt => "on-disk structure is corrupt",
            Self::NoMoreSpace => "no more space",
            Self::AlreadyCreated => "entry already exists",
            Self::InvalidName => "invalid name",
            Self::InvalidPath => "invalid path",
            Self::NotDirectory => "not a directory",
            Self::NoMoreEntries => "no more directory entries",
            Self::BufferError => "buffer too small",
            Self::WriteProtect => "media is write protected",
            Self::SectorInvalid => "logical sector out of range",
            Self::Io => "driver I/O error",
            Self::NotEnoughMemory => "not enough memory",
            Self::ErrorNotFixed => "media error not fixed",
            Self::InvalidState => "invalid state",
        };
        write!(f, "{description} (status {:#04x})", self.code())
    }
}
