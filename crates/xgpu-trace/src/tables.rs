use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, TraceError};
use crate::format::{
    Block, MemoryBlock, MemoryRef, Packet, TableLocation, TraceHeader, BLOCK_ROW_SIZE,
    DATA_WORD_SIZE, MEMORY_BLOCK_ROW_SIZE, MEMORY_REF_ROW_SIZE, PACKET_ROW_SIZE, TRACE_MAGIC,
    TRACE_VERSION,
};
use crate::io::{try_with_capacity, ReadLeExt, WriteLeExt};

pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * 1024;

/// The five append-only tables of a trace. A row's position is its identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceTables {
    pub blocks: Vec<Block>,
    pub packets: Vec<Packet>,
    pub memory_refs: Vec<MemoryRef>,
    pub memory_blocks: Vec<MemoryBlock>,
    /// Packet payload words, already converted from guest (big-endian) order.
    pub data_words: Vec<u32>,
}

impl TraceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.packets.is_empty()
            && self.memory_refs.is_empty()
            && self.memory_blocks.is_empty()
            && self.data_words.is_empty()
    }

    /// Writes the trace to `path`, appending the raw memory blob read from `blob_path`.
    ///
    /// A blob that cannot be opened is not fatal: the trace is still written, with the blob
    /// offset pointing at the end of the file, so every memory region reads as absent.
    pub fn save(&self, path: &Path, blob_path: &Path) -> Result<TraceHeader> {
        self.save_with_chunk_size(path, Some(blob_path), DEFAULT_COPY_CHUNK_SIZE)
    }

    /// Like [`save`](Self::save); `None` writes the trace with an empty blob.
    pub fn save_with_chunk_size(
        &self,
        path: &Path,
        blob_path: Option<&Path>,
        chunk_size: usize,
    ) -> Result<TraceHeader> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        let mut blob = match blob_path.map(|p| (p, File::open(p))) {
            Some((_, Ok(file))) => Some(BufReader::new(file)),
            Some((blob_path, Err(err))) => {
                warn!(
                    blob = %blob_path.display(),
                    "memory blob unavailable, trace will have no memory contents: {err}"
                );
                None
            }
            None => None,
        };

        let header = self.write_to(
            &mut out,
            blob.as_mut().map(|b| b as &mut dyn Read),
            chunk_size,
        )?;
        out.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        Ok(header)
    }

    /// Serializes the tables followed by `blob` into `w`, starting at offset 0.
    ///
    /// The header is written twice: zeroed up front, then with every table location once the
    /// tables and blob are in place. On return `w` is positioned at the end of the trace.
    pub fn write_to<W: Write + Seek>(
        &self,
        w: &mut W,
        blob: Option<&mut dyn Read>,
        chunk_size: usize,
    ) -> Result<TraceHeader> {
        w.seek(SeekFrom::Start(0))?;
        TraceHeader::default().encode(w)?;

        let mut header = TraceHeader::default();

        header.memory_blocks = write_table(w, &self.memory_blocks, |w, row| row.encode(w))?;
        debug!(count = header.memory_blocks.count, "saved memory blocks");

        header.memory_refs = write_table(w, &self.memory_refs, |w, row| row.encode(w))?;
        debug!(count = header.memory_refs.count, "saved memory references");

        header.data_words = write_table(w, &self.data_words, |w, word| w.write_u32_le(*word))?;
        debug!(count = header.data_words.count, "saved data words");

        header.packets = write_table(w, &self.packets, |w, row| row.encode(w))?;
        debug!(count = header.packets.count, "saved packets");

        header.blocks = write_table(w, &self.blocks, |w, row| row.encode(w))?;
        debug!(count = header.blocks.count, "saved blocks");

        header.blob_offset = w.stream_position()?;
        let copied = match blob {
            Some(blob) => copy_chunked(blob, w, chunk_size)?,
            None => 0,
        };
        debug!(bytes = copied, offset = header.blob_offset, "saved memory blob");

        header.magic = TRACE_MAGIC;
        header.version = TRACE_VERSION;
        w.seek(SeekFrom::Start(0))?;
        header.encode(w)?;
        w.seek(SeekFrom::End(0))?;
        w.flush()?;

        Ok(header)
    }

    /// Loads the tables of the trace at `path` and returns them with the absolute file offset
    /// of the memory blob. Blob bytes are never read here.
    pub fn load(path: &Path) -> Result<(Self, u64)> {
        let file = File::open(path)?;
        Self::read_from(&mut BufReader::new(file))
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<(Self, u64)> {
        // Table locations come from the file; validate them against its real length before
        // allocating anything.
        let file_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        let header = TraceHeader::decode(r)?;

        let blocks = read_table(r, header.blocks, BLOCK_ROW_SIZE, file_len, Block::decode)?;
        debug!(count = blocks.len(), "loaded blocks");

        let packets = read_table(r, header.packets, PACKET_ROW_SIZE, file_len, Packet::decode)?;
        debug!(count = packets.len(), "loaded packets");

        let data_words = read_table(r, header.data_words, DATA_WORD_SIZE, file_len, |r| {
            r.read_u32_le()
        })?;
        debug!(count = data_words.len(), "loaded data words");

        let memory_refs = read_table(
            r,
            header.memory_refs,
            MEMORY_REF_ROW_SIZE,
            file_len,
            MemoryRef::decode,
        )?;
        debug!(count = memory_refs.len(), "loaded memory refs");

        let memory_blocks = read_table(
            r,
            header.memory_blocks,
            MEMORY_BLOCK_ROW_SIZE,
            file_len,
            MemoryBlock::decode,
        )?;
        debug!(count = memory_blocks.len(), "loaded memory blocks");

        let tables = Self {
            blocks,
            packets,
            memory_refs,
            memory_blocks,
            data_words,
        };
        Ok((tables, header.blob_offset))
    }

    /// Checks every cross-table range and index, plus the nesting and attribution invariants
    /// the writer maintains.
    pub fn validate(&self) -> Result<()> {
        // Open subtrees, as exclusive end indices into `blocks`.
        let mut open: Vec<u32> = Vec::new();
        for (index, block) in self.blocks.iter().enumerate() {
            let index = index as u32;
            if block.num_sub_blocks != 0 && block.first_sub_block != index + 1 {
                return Err(TraceError::Corrupt("sub-blocks do not follow their parent"));
            }
            let end = range_end(block.first_sub_block, block.num_sub_blocks)
                .ok_or(TraceError::Corrupt("sub-block range overflows"))?;
            if end as usize > self.blocks.len() {
                return Err(TraceError::Corrupt("sub-block range out of bounds"));
            }
            check_range(
                block.first_packet,
                block.num_packets,
                self.packets.len(),
                "block packet range out of bounds",
            )?;

            while open.last().is_some_and(|&parent_end| parent_end <= index) {
                open.pop();
            }
            if let Some(&parent_end) = open.last() {
                if end.max(index + 1) > parent_end {
                    return Err(TraceError::Corrupt("sub-block escapes its parent"));
                }
            }
            open.push(end.max(index + 1));
        }

        let mut next_word = 0u32;
        let mut next_ref = 0u32;
        for packet in &self.packets {
            check_range(
                packet.first_data_word,
                packet.num_data_words,
                self.data_words.len(),
                "packet data words out of bounds",
            )?;
            check_range(
                packet.first_memory_ref,
                packet.num_memory_refs,
                self.memory_refs.len(),
                "packet memory refs out of bounds",
            )?;
            if packet.first_data_word < next_word {
                return Err(TraceError::Corrupt("packet data word ranges overlap"));
            }
            if packet.first_memory_ref < next_ref {
                return Err(TraceError::Corrupt("packet memory ref ranges overlap"));
            }
            next_word = packet.first_data_word + packet.num_data_words;
            next_ref = packet.first_memory_ref + packet.num_memory_refs;
        }

        if self
            .memory_refs
            .iter()
            .any(|r| r.block_index as usize >= self.memory_blocks.len())
        {
            return Err(TraceError::Corrupt("memory ref points past memory blocks"));
        }

        Ok(())
    }

    pub fn block(&self, index: u32) -> Result<&Block> {
        self.blocks
            .get(index as usize)
            .ok_or(TraceError::BlockOutOfRange {
                index,
                len: self.blocks.len(),
            })
    }

    pub fn memory_block(&self, index: u32) -> Result<&MemoryBlock> {
        self.memory_blocks
            .get(index as usize)
            .ok_or(TraceError::MemoryBlockOutOfRange {
                index,
                len: self.memory_blocks.len(),
            })
    }

    /// Top-level blocks, in capture order.
    pub fn root_blocks(&self) -> Siblings<'_> {
        Siblings {
            blocks: &self.blocks,
            next: 0,
            end: self.blocks.len() as u32,
        }
    }

    /// Direct children of `index`. The stored sub-block range is the whole pre-order subtree,
    /// so each child's own subtree is skipped to reach the next sibling.
    pub fn child_blocks(&self, index: u32) -> Result<Siblings<'_>> {
        let block = self.block(index)?;
        let end = range_end(block.first_sub_block, block.num_sub_blocks)
            .ok_or(TraceError::Corrupt("sub-block range overflows"))?;
        Ok(Siblings {
            blocks: &self.blocks,
            next: block.first_sub_block,
            end: end.min(self.blocks.len() as u32),
        })
    }

    /// Every packet recorded while block `index` was open, nested blocks included.
    pub fn block_packets(&self, index: u32) -> Result<&[Packet]> {
        let block = self.block(index)?;
        range_slice(
            &self.packets,
            block.first_packet,
            block.num_packets,
            "block packet range out of bounds",
        )
    }

    pub fn packet_words(&self, packet: &Packet) -> Result<&[u32]> {
        range_slice(
            &self.data_words,
            packet.first_data_word,
            packet.num_data_words,
            "packet data words out of bounds",
        )
    }

    pub fn packet_memory_refs(&self, packet: &Packet) -> Result<&[MemoryRef]> {
        range_slice(
            &self.memory_refs,
            packet.first_memory_ref,
            packet.num_memory_refs,
            "packet memory refs out of bounds",
        )
    }
}

/// Iterator over sibling block indices.
#[derive(Clone, Debug)]
pub struct Siblings<'a> {
    blocks: &'a [Block],
    next: u32,
    end: u32,
}

impl Iterator for Siblings<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        let block = self.blocks.get(current as usize)?;
        self.next = current
            .saturating_add(1)
            .saturating_add(block.num_sub_blocks);
        Some(current)
    }
}

fn range_end(first: u32, count: u32) -> Option<u32> {
    first.checked_add(count)
}

fn check_range(first: u32, count: u32, len: usize, what: &'static str) -> Result<()> {
    match range_end(first, count) {
        Some(end) if end as usize <= len => Ok(()),
        _ => Err(TraceError::Corrupt(what)),
    }
}

fn range_slice<'a, T>(items: &'a [T], first: u32, count: u32, what: &'static str) -> Result<&'a [T]> {
    check_range(first, count, items.len(), what)?;
    Ok(&items[first as usize..(first + count) as usize])
}

fn write_table<W, T, F>(w: &mut W, rows: &[T], mut encode: F) -> Result<TableLocation>
where
    W: Write + Seek,
    F: FnMut(&mut W, &T) -> Result<()>,
{
    let offset = w.stream_position()?;
    let count = u32::try_from(rows.len())
        .map_err(|_| TraceError::Corrupt("table has more than u32::MAX rows"))?;
    for row in rows {
        encode(w, row)?;
    }
    Ok(TableLocation { count, offset })
}

fn read_table<R, T, F>(
    r: &mut R,
    location: TableLocation,
    row_size: u64,
    file_len: u64,
    mut decode: F,
) -> Result<Vec<T>>
where
    R: Read + Seek,
    F: FnMut(&mut Cursor<Vec<u8>>) -> Result<T>,
{
    let byte_len = u64::from(location.count) * row_size;
    let end = location
        .offset
        .checked_add(byte_len)
        .ok_or(TraceError::Corrupt("table location overflows"))?;
    if end > file_len {
        return Err(TraceError::Corrupt("table extends past end of file"));
    }

    let byte_len =
        usize::try_from(byte_len).map_err(|_| TraceError::Corrupt("table too large"))?;
    r.seek(SeekFrom::Start(location.offset))?;
    let mut cursor = Cursor::new(r.read_exact_vec(byte_len)?);

    let mut rows = try_with_capacity(location.count as usize)?;
    for _ in 0..location.count {
        rows.push(decode(&mut cursor)?);
    }
    Ok(rows)
}

fn copy_chunked<W: Write + ?Sized>(
    src: &mut dyn Read,
    dst: &mut W,
    chunk_size: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}
