use std::io;

use thiserror::Error;

use crate::memory::GuestMemoryError;

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file does not start with the trace magic; it is not a GPU trace at all.
    #[error("invalid trace magic 0x{0:08x}")]
    InvalidMagic(u32),

    /// The file is a GPU trace, but written by an incompatible format revision.
    #[error("unsupported trace version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt trace: {0}")]
    Corrupt(&'static str),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("guest memory read failed: {0}")]
    GuestMemory(#[from] GuestMemoryError),

    #[error("block index {index} out of range (trace has {len} blocks)")]
    BlockOutOfRange { index: u32, len: usize },

    #[error("memory block index {index} out of range (trace has {len} memory blocks)")]
    MemoryBlockOutOfRange { index: u32, len: usize },
}
