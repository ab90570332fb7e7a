//! On-disk layout of a GPU trace.
//!
//! All integers are little-endian and every row has a fixed size with no padding:
//!
//! ```text
//! header        76 bytes
//! MemoryBlocks  count * 24
//! MemoryRefs    count * 24
//! DataWords     count * 4
//! Packets       count * 20
//! Blocks        count * 32
//! blob          raw bytes of every memory block, in creation order
//! ```
//!
//! Table order on disk is irrelevant to readers; every table is located through the header.
//! Any change to a row or header layout must bump [`TRACE_VERSION`].

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

use crate::error::{Result, TraceError};
use crate::io::{ReadLeExt, WriteLeExt};

/// `"GPUD"` read as a big-endian `u32`; the bytes on disk are `DUPG`.
pub const TRACE_MAGIC: u32 = 0x4750_5544;
pub const TRACE_VERSION: u32 = 1;

pub const TAG_LEN: usize = 16;

pub const TRACE_HEADER_SIZE: u64 = 76;
pub const BLOCK_ROW_SIZE: u64 = 32;
pub const PACKET_ROW_SIZE: u64 = 20;
pub const MEMORY_REF_ROW_SIZE: u64 = 24;
pub const MEMORY_BLOCK_ROW_SIZE: u64 = 24;
pub const DATA_WORD_SIZE: u64 = 4;

/// Short NUL-terminated label: at most 15 bytes of text plus the terminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag([u8; TAG_LEN]);

impl Tag {
    /// Builds a tag from `s`, truncating at a character boundary to fit 15 bytes.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(TAG_LEN - 1);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut raw = [0u8; TAG_LEN];
        raw[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self(raw)
    }

    pub fn from_raw(raw: [u8; TAG_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> &[u8; TAG_LEN] {
        &self.0
    }

    /// Text up to the first NUL. Tags read from foreign files may not be UTF-8.
    pub fn as_str(&self) -> Cow<'_, str> {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(TAG_LEN);
        String::from_utf8_lossy(&self.0[..len])
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:?})", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Memory is restored to this content just before the packet executes.
    Read,
    /// Memory holds this content after the packet executed.
    Write,
}

impl AccessMode {
    pub fn as_u32(self) -> u32 {
        match self {
            AccessMode::Read => 0,
            AccessMode::Write => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(AccessMode::Read),
            1 => Some(AccessMode::Write),
            _ => None,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        })
    }
}

/// Named span of the capture. `first_sub_block..first_sub_block + num_sub_blocks` is the
/// pre-order subtree below this block; `first_packet..first_packet + num_packets` covers every
/// packet recorded while it was open, including those of nested blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub tag: Tag,
    pub first_sub_block: u32,
    pub num_sub_blocks: u32,
    pub first_packet: u32,
    pub num_packets: u32,
}

impl Block {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_bytes(self.tag.as_raw())?;
        w.write_u32_le(self.first_sub_block)?;
        w.write_u32_le(self.num_sub_blocks)?;
        w.write_u32_le(self.first_packet)?;
        w.write_u32_le(self.num_packets)?;
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Self {
            tag: Tag::from_raw(r.read_array()?),
            first_sub_block: r.read_u32_le()?,
            num_sub_blocks: r.read_u32_le()?,
            first_packet: r.read_u32_le()?,
            num_packets: r.read_u32_le()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Raw command header word, as seen by the command processor.
    pub opcode: u32,
    pub first_data_word: u32,
    pub num_data_words: u32,
    pub first_memory_ref: u32,
    pub num_memory_refs: u32,
}

impl Packet {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.opcode)?;
        w.write_u32_le(self.first_data_word)?;
        w.write_u32_le(self.num_data_words)?;
        w.write_u32_le(self.first_memory_ref)?;
        w.write_u32_le(self.num_memory_refs)?;
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Self {
            opcode: r.read_u32_le()?,
            first_data_word: r.read_u32_le()?,
            num_data_words: r.read_u32_le()?,
            first_memory_ref: r.read_u32_le()?,
            num_memory_refs: r.read_u32_le()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRef {
    pub block_index: u32,
    pub mode: AccessMode,
    /// Diagnostic label only (e.g. "IndexBuffer", "PixelShader").
    pub tag: Tag,
}

impl MemoryRef {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.block_index)?;
        w.write_u32_le(self.mode.as_u32())?;
        w.write_bytes(self.tag.as_raw())?;
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let block_index = r.read_u32_le()?;
        let mode = AccessMode::from_u32(r.read_u32_le()?)
            .ok_or(TraceError::Corrupt("unknown memory access mode"))?;
        Ok(Self {
            block_index,
            mode,
            tag: Tag::from_raw(r.read_array()?),
        })
    }
}

/// One stored copy of a distinct `(address, size, content)` region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub crc: u64,
    /// Offset of the content relative to the start of the blob.
    pub blob_offset: u64,
    pub address: u32,
    pub size: u32,
}

impl MemoryBlock {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.crc)?;
        w.write_u64_le(self.blob_offset)?;
        w.write_u32_le(self.address)?;
        w.write_u32_le(self.size)?;
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Self {
            crc: r.read_u64_le()?,
            blob_offset: r.read_u64_le()?,
            address: r.read_u32_le()?,
            size: r.read_u32_le()?,
        })
    }
}

/// Row count and absolute file offset of one table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableLocation {
    pub count: u32,
    pub offset: u64,
}

impl TableLocation {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.count)?;
        w.write_u64_le(self.offset)
    }

    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Self {
            count: r.read_u32_le()?,
            offset: r.read_u64_le()?,
        })
    }
}

/// File header. Written zeroed when the file is opened and rewritten once all offsets are known,
/// so a crash mid-save leaves a file that fails the magic check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceHeader {
    pub magic: u32,
    pub version: u32,
    pub blocks: TableLocation,
    pub packets: TableLocation,
    pub memory_refs: TableLocation,
    pub memory_blocks: TableLocation,
    pub data_words: TableLocation,
    pub blob_offset: u64,
}

impl TraceHeader {
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.magic)?;
        w.write_u32_le(self.version)?;
        self.blocks.encode(w)?;
        self.packets.encode(w)?;
        self.memory_refs.encode(w)?;
        self.memory_blocks.encode(w)?;
        self.data_words.encode(w)?;
        w.write_u64_le(self.blob_offset)
    }

    /// Decodes and validates magic and version before touching any other field.
    pub fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let magic = r.read_u32_le()?;
        if magic != TRACE_MAGIC {
            return Err(TraceError::InvalidMagic(magic));
        }
        let version = r.read_u32_le()?;
        if version != TRACE_VERSION {
            return Err(TraceError::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            blocks: TableLocation::decode(r)?,
            packets: TableLocation::decode(r)?,
            memory_refs: TableLocation::decode(r)?,
            memory_blocks: TableLocation::decode(r)?,
            data_words: TableLocation::decode(r)?,
            blob_offset: r.read_u64_le()?,
        })
    }
}
