use std::io;
use thiserror::Error;

/// The primary error type for all operations in this crate.
///
/// Recoverable data loss (fewer records found in a section than the channel
/// groups declare) is deliberately *not* an error: counts are trimmed and the
/// event is logged. Everything here aborts the run as a whole.
#[derive(Error, Debug)]
pub enum SortError {
    /// The identification block does not start with the MDF magic string.
    #[error("not an MDF file: identification magic mismatch")]
    InvalidMagic,

    /// The numeric version in the identification block is outside 300..=411.
    #[error("unsupported MDF version {version}")]
    UnsupportedVersion { version: u16 },

    /// Two different parents resolved the same file address into two blocks.
    #[error("duplicate block at address {addr:#x}")]
    DuplicateAddress { addr: u64 },

    /// A tag/version combination has no schema entry.
    #[error("no schema entry for block tag '{tag}'")]
    UnknownTag { tag: String },

    /// A non-zero record identifier that no channel group registered.
    #[error("record id {id} at section offset {offset:#x} is not registered to any channel group")]
    UnknownRecordId { id: u64, offset: u64 },

    /// Structural corruption that is not worth its own variant.
    #[error("corrupt structure: {0}")]
    Corrupt(String),

    /// Caller error: bad flag combination for the given file.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SortError>;
