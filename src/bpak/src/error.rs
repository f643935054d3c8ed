use std::io;

use thiserror::Error;

/// Every error this crate can return, grouped the way the on-disk format
/// groups its own failure modes (integrity, capacity, I/O, transport,
/// policy). `code()` maps each variant to a small stable negative integer
/// for callers bridging to non-Rust BPAK tooling that expects an errno-like
/// space.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported header version")]
    BadVersion,
    #[error("metadata or part table is corrupt")]
    CorruptTable,
    #[error("unsupported hash kind")]
    BadHashKind,

    #[error("out of space")]
    OutOfSpace,
    #[error("buffer too small")]
    BufferTooSmall,

    #[error("duplicate part id")]
    DuplicateId,
    #[error("part or metadata entry not found")]
    NotFound,

    #[error("read error: {0}")]
    ReadError(#[source] io::Error),
    #[error("write error: {0}")]
    WriteError(#[source] io::Error),
    #[error("seek error: {0}")]
    SeekError(#[source] io::Error),

    #[error("unsupported transport algorithm")]
    UnsupportedAlgorithm,
    #[error("origin archive missing required part")]
    MissingOrigin,
    #[error("transport stream truncated")]
    Truncated,
    #[error("transport stream produced more bytes than expected")]
    Overrun,
    #[error("size mismatch")]
    SizeError,

    #[error("operation not supported")]
    NotSupported,
    #[error("operation failed")]
    Failed,
}

impl Error {
    /// A stable negative numeric code, for interop with tooling that expects
    /// the original C library's flat `-errno`-style error space.
    pub fn code(&self) -> i32 {
        match self {
            Error::BadMagic => -1,
            Error::BadVersion => -2,
            Error::CorruptTable => -3,
            Error::BadHashKind => -4,
            Error::OutOfSpace => -5,
            Error::BufferTooSmall => -6,
            Error::DuplicateId => -7,
            Error::NotFound => -8,
            Error::ReadError(_) => -9,
            Error::WriteError(_) => -10,
            Error::SeekError(_) => -11,
            Error::UnsupportedAlgorithm => -12,
            Error::MissingOrigin => -13,
            Error::Truncated => -14,
            Error::Overrun => -15,
            Error::SizeError => -16,
            Error::NotSupported => -17,
            Error::Failed => -18,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::ReadError(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
