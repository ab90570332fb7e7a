//! GPU command trace capture and file format.
//!
//! A trace records the command stream executed by the emulated GPU as a tree of blocks, each
//! holding packets (one per executed command) together with the guest memory regions every
//! packet read or wrote. Memory contents are deduplicated and stored once in a blob at the end
//! of the file, so a replayer can restore exactly the memory state each packet observed.
//!
//! Capture goes through [`TraceWriter`]; finished traces are read with [`TraceFile`] or
//! [`TraceTables::load`].

mod config;
mod crc64;
mod error;
mod file;
mod format;
mod io;
mod memory;
mod tables;
mod writer;

pub use crate::config::{
    ConfigError, TraceWriterConfig, DEFAULT_MAX_REGION_SIZE, DEFAULT_STAGING_SUFFIX,
};
pub use crate::crc64::{crc64, crc64_update};
pub use crate::error::{Result, TraceError};
pub use crate::file::TraceFile;
pub use crate::format::{
    AccessMode, Block, MemoryBlock, MemoryRef, Packet, TableLocation, Tag, TraceHeader,
    BLOCK_ROW_SIZE, DATA_WORD_SIZE, MEMORY_BLOCK_ROW_SIZE, MEMORY_REF_ROW_SIZE, PACKET_ROW_SIZE,
    TAG_LEN, TRACE_HEADER_SIZE, TRACE_MAGIC, TRACE_VERSION,
};
pub use crate::memory::{GuestMemory, GuestMemoryError, VecGuestMemory};
pub use crate::tables::{Siblings, TraceTables, DEFAULT_COPY_CHUNK_SIZE};
pub use crate::writer::{trace_file_name, BlockId, BlockScope, TraceWriter, WriterState};
