//! Read access to a finalized trace.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, TraceError};
use crate::format::MemoryBlock;
use crate::io::ReadLeExt;
use crate::tables::TraceTables;

/// An open trace: tables are loaded eagerly, memory contents are read from the blob on demand.
pub struct TraceFile {
    tables: TraceTables,
    blob_offset: u64,
    blob_len: u64,
    file: BufReader<File>,
}

impl TraceFile {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let (tables, blob_offset) = TraceTables::read_from(&mut file)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        if blob_offset > file_len {
            return Err(TraceError::Corrupt("blob offset past end of file"));
        }

        Ok(Self {
            tables,
            blob_offset,
            blob_len: file_len - blob_offset,
            file,
        })
    }

    pub fn tables(&self) -> &TraceTables {
        &self.tables
    }

    pub fn into_tables(self) -> TraceTables {
        self.tables
    }

    /// Absolute file offset of the memory blob.
    pub fn blob_offset(&self) -> u64 {
        self.blob_offset
    }

    pub fn blob_len(&self) -> u64 {
        self.blob_len
    }

    /// Whether the bytes of `block` are present in the blob. A trace written without its staging
    /// blob still has every memory block row, but none of the contents.
    pub fn has_contents(&self, block: &MemoryBlock) -> bool {
        block
            .blob_offset
            .checked_add(u64::from(block.size))
            .is_some_and(|end| end <= self.blob_len)
    }

    /// Reads the captured bytes of memory block `index`.
    pub fn read_memory_block(&mut self, index: u32) -> Result<Vec<u8>> {
        let block = *self.tables.memory_block(index)?;
        if !self.has_contents(&block) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("memory block {index} is not present in the trace blob"),
            )
            .into());
        }

        self.file
            .seek(SeekFrom::Start(self.blob_offset + block.blob_offset))?;
        self.file.read_exact_vec(block.size as usize)
    }

    /// Table consistency plus blob bounds for every memory block.
    pub fn validate(&self) -> Result<()> {
        self.tables.validate()?;
        if self
            .tables
            .memory_blocks
            .iter()
            .any(|block| !self.has_contents(block))
        {
            return Err(TraceError::Corrupt("memory block extends past the blob"));
        }
        Ok(())
    }
}
