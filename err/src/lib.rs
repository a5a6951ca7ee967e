//! Error kinds shared by every crate in the workspace (§7).

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Mount found an illegal sector-head marker.
    #[error("not formatted: sector {sector_id} has an illegal head marker")]
    NotFormatted { sector_id: u16 },
    /// A public operation other than Mount/Format/CheckIfFormatted was invoked
    /// before a successful Mount.
    #[error("file system is not mounted")]
    NotMounted,
    /// Name lookup failed where the operation requires existence.
    #[error("file not found")]
    FileNotFound,
    /// Destination exists where uniqueness is required.
    #[error("path already exists")]
    PathAlreadyExists,
    /// Destructive operation attempted while a file is still open.
    #[error("file is in use")]
    FileInUse,
    /// A write needed a cluster but compaction could not free one.
    #[error("disk is full")]
    DiskFull,
    /// Position is beyond `file_size` on Write or Truncate.
    #[error("write past end of file")]
    WritePastEnd,
    /// Filename too long, or an unknown open mode.
    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(&'static str),
    /// The block driver reported a failure.
    #[error("block driver I/O error: {0}")]
    Io(String),
}

pub type Result<T> = core::result::Result<T, Error>;
