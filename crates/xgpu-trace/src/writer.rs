//! Incremental capture writer.
//!
//! The command processor drives a [`TraceWriter`] from its own thread: blocks open and close
//! around command buffers, every executed command becomes a packet, and every guest memory
//! region a command reads or writes is attached to the most recent packet. Memory contents are
//! deduplicated by `(address, size, crc64)` and staged in a side file next to the output, which
//! is folded into the trace by [`TraceWriter::finalize`].
//!
//! Misuse is ignored rather than reported: closing a block that is not the innermost one,
//! memory accesses before the first packet, and any call after finalize are no-ops.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, error, info, trace, warn};

use crate::config::TraceWriterConfig;
use crate::crc64::crc64;
use crate::error::{Result, TraceError};
use crate::format::{AccessMode, Block, MemoryBlock, MemoryRef, Packet, Tag};
use crate::io::ReadLeExt;
use crate::memory::GuestMemory;
use crate::tables::TraceTables;

/// Index of a block row, as returned by [`TraceWriter::begin_block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Returned by `begin_block` once the writer is finalized; closing it is a no-op.
    pub const NONE: BlockId = BlockId(u32::MAX);

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where memory contents are appended while capturing.
trait StagingFile: Read + Write + Seek {}

impl<T: Read + Write + Seek> StagingFile for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing recorded yet.
    Idle,
    Recording,
    /// Trace written (or the attempt failed); every further call is a no-op.
    Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct MemoryKey {
    crc: u64,
    address: u32,
    size: u32,
}

pub struct TraceWriter<M> {
    target_path: PathBuf,
    staging_path: PathBuf,
    /// `None` once finalized, or if the staging file could not be created.
    staging: Option<Box<dyn StagingFile>>,
    /// Whether `staging_path` was created by this writer and must be removed.
    staging_created: bool,
    /// Next blob offset. Keeps advancing without a staging file so rows stay consistent.
    staging_len: u64,
    memory: M,
    config: TraceWriterConfig,
    state: WriterState,
    tables: TraceTables,
    block_stack: Vec<u32>,
    /// Every stored copy per key; more than one only after a checksum collision.
    memory_map: HashMap<MemoryKey, Vec<u32>>,
    scratch: Vec<u8>,
}

/// File name used for automatically named traces, e.g. `trace_[2023_11_14 22_13_20].gpu`.
pub fn trace_file_name(now: OffsetDateTime) -> String {
    format!(
        "trace_[{:04}_{:02}_{:02} {:02}_{:02}_{:02}].gpu",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

impl<M> TraceWriter<M> {
    pub fn create(path: impl Into<PathBuf>, memory: M) -> Result<Self> {
        Self::with_config(path, memory, TraceWriterConfig::default())
    }

    /// Opens the staging file `<path><staging_suffix>`. The output file itself is only created
    /// by [`finalize`](Self::finalize).
    ///
    /// Failing to create the staging file does not prevent capture: every table is still
    /// recorded, and the finalized trace has no memory contents.
    pub fn with_config(
        path: impl Into<PathBuf>,
        memory: M,
        config: TraceWriterConfig,
    ) -> Result<Self> {
        let target_path = path.into();
        let mut staging_name = target_path.clone().into_os_string();
        staging_name.push(&config.staging_suffix);
        let staging_path = PathBuf::from(staging_name);

        let staging = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)
        {
            Ok(file) => Some(Box::new(file) as Box<dyn StagingFile>),
            Err(err) => {
                warn!(
                    staging = %staging_path.display(),
                    "cannot create staging file, memory contents will not be captured: {err}"
                );
                None
            }
        };
        let staging_created = staging.is_some();

        debug!(
            target = %target_path.display(),
            staging = %staging_path.display(),
            "GPU trace capture started"
        );

        Ok(Self {
            target_path,
            staging_path,
            staging,
            staging_created,
            staging_len: 0,
            memory,
            config,
            state: WriterState::Idle,
            tables: TraceTables::new(),
            block_stack: Vec::new(),
            memory_map: HashMap::new(),
            scratch: Vec::new(),
        })
    }

    /// Creates a writer for a timestamped trace file inside `dir`.
    pub fn create_in_dir(dir: &Path, memory: M, config: TraceWriterConfig) -> Result<Self> {
        let name = trace_file_name(OffsetDateTime::now_utc());
        Self::with_config(dir.join(name), memory, config)
    }

    pub fn path(&self) -> &Path {
        &self.target_path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn tables(&self) -> &TraceTables {
        &self.tables
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Number of blocks currently open.
    pub fn depth(&self) -> usize {
        self.block_stack.len()
    }

    fn is_finalized(&self) -> bool {
        self.state == WriterState::Finalized
    }

    fn mark_recording(&mut self) {
        if self.state == WriterState::Idle {
            self.state = WriterState::Recording;
        }
    }

    pub fn begin_block(&mut self, tag: &str) -> BlockId {
        if self.is_finalized() {
            return BlockId::NONE;
        }
        self.mark_recording();

        let block_id = self.tables.blocks.len() as u32;
        self.tables.blocks.push(Block {
            tag: Tag::new(tag),
            // The next block created, if any, is this block's first child.
            first_sub_block: block_id + 1,
            num_sub_blocks: 0,
            first_packet: self.tables.packets.len() as u32,
            num_packets: 0,
        });
        self.block_stack.push(block_id);

        debug!(block = block_id, tag, "GPU trace block started");
        BlockId(block_id)
    }

    /// Closes `id` if it is the innermost open block; anything else is ignored.
    pub fn end_block(&mut self, id: BlockId) {
        if self.block_stack.last() != Some(&id.0) {
            trace!(block = id.0, "ignoring end of block that is not innermost");
            return;
        }
        self.close_innermost_block();
    }

    /// Begins a block that ends when the returned guard is dropped.
    pub fn scoped_block(&mut self, tag: &str) -> BlockScope<'_, M> {
        let id = self.begin_block(tag);
        BlockScope { writer: self, id }
    }

    fn close_innermost_block(&mut self) {
        let Some(block_id) = self.block_stack.pop() else {
            return;
        };
        let num_blocks = self.tables.blocks.len() as u32;
        let num_packets = self.tables.packets.len() as u32;
        let block = &mut self.tables.blocks[block_id as usize];
        block.num_packets = num_packets - block.first_packet;
        block.num_sub_blocks = num_blocks - block.first_sub_block;

        debug!(
            block = block_id,
            sub_blocks = block.num_sub_blocks,
            packets = block.num_packets,
            "GPU trace block finished"
        );
    }

    /// Records one command. `payload` holds the command's data words as loaded from guest
    /// memory (big-endian byte order); they are stored as numeric values.
    pub fn packet(&mut self, opcode: u32, payload: &[u32]) {
        if self.is_finalized() {
            return;
        }
        self.mark_recording();

        let first_data_word = self.tables.data_words.len() as u32;
        self.tables
            .data_words
            .extend(payload.iter().map(|&word| u32::from_be(word)));

        self.tables.packets.push(Packet {
            opcode,
            first_data_word,
            num_data_words: payload.len() as u32,
            first_memory_ref: self.tables.memory_refs.len() as u32,
            num_memory_refs: 0,
        });

        trace!(
            opcode = format_args!("0x{opcode:08X}"),
            words = payload.len(),
            "GPU trace packet"
        );
    }

    /// Closes any blocks still open, writes the trace and removes the staging file.
    ///
    /// The writer is finalized even when writing fails; the capture cannot be retried.
    pub fn finalize(&mut self) -> Result<()> {
        if self.is_finalized() {
            return Ok(());
        }

        while !self.block_stack.is_empty() {
            self.close_innermost_block();
        }
        self.state = WriterState::Finalized;

        drop(self.staging.take());

        let blob_path = self.staging_created.then_some(self.staging_path.as_path());
        let result = self.tables.save_with_chunk_size(
            &self.target_path,
            blob_path,
            self.config.copy_chunk_size,
        );
        self.remove_staging_file();

        match result {
            Ok(header) => {
                info!(
                    path = %self.target_path.display(),
                    blocks = header.blocks.count,
                    packets = header.packets.count,
                    memory_refs = header.memory_refs.count,
                    memory_blocks = header.memory_blocks.count,
                    blob_bytes = self.staging_len,
                    "GPU trace written"
                );
                Ok(())
            }
            Err(err) => {
                error!(path = %self.target_path.display(), "failed to write GPU trace: {err}");
                Err(err)
            }
        }
    }

    /// Discards the capture without producing a trace. Equivalent to dropping the writer.
    pub fn abandon(self) {}

    fn remove_staging_file(&self) {
        if !self.staging_created {
            return;
        }
        if let Err(err) = fs::remove_file(&self.staging_path) {
            warn!(
                staging = %self.staging_path.display(),
                "failed to remove staging file: {err}"
            );
        }
    }
}

impl<M: GuestMemory> TraceWriter<M> {
    /// Registers guest memory read by the most recent packet; the region is restored to this
    /// content before the packet is replayed.
    pub fn memory_access_read(&mut self, address: u32, size: u32, tag: &str) -> Result<()> {
        self.memory_access(address, size, tag, AccessMode::Read)
    }

    /// Registers guest memory written by the most recent packet; the region holds this content
    /// after the packet executed.
    pub fn memory_access_write(&mut self, address: u32, size: u32, tag: &str) -> Result<()> {
        self.memory_access(address, size, tag, AccessMode::Write)
    }

    /// Returns an error only if the region could not be read, buffered or staged; in that case
    /// nothing is recorded and the writer stays usable.
    fn memory_access(
        &mut self,
        address: u32,
        size: u32,
        tag: &str,
        mode: AccessMode,
    ) -> Result<()> {
        if self.is_finalized() || address == 0 || size == 0 {
            return Ok(());
        }
        let Some(packet_index) = self.tables.packets.len().checked_sub(1) else {
            trace!(address, size, "memory access before first packet ignored");
            return Ok(());
        };

        let block_index = self.map_memory_block(address, size)?;

        let ref_index = self.tables.memory_refs.len() as u32;
        self.tables.memory_refs.push(MemoryRef {
            block_index,
            mode,
            tag: Tag::new(tag),
        });

        let packet = &mut self.tables.packets[packet_index];
        debug_assert_eq!(packet.first_memory_ref + packet.num_memory_refs, ref_index);
        packet.num_memory_refs += 1;
        Ok(())
    }

    /// Returns the memory block holding the current content of `address..address + size`,
    /// staging a new copy only if this exact region and content has not been seen.
    fn map_memory_block(&mut self, address: u32, size: u32) -> Result<u32> {
        let len = size as usize;
        if size > self.config.max_region_size {
            return Err(TraceError::OutOfMemory { len });
        }
        self.scratch.clear();
        self.scratch
            .try_reserve_exact(len)
            .map_err(|_| TraceError::OutOfMemory { len })?;
        self.scratch.resize(len, 0);
        self.memory.read(address, &mut self.scratch)?;

        let crc = crc64(&self.scratch);
        let key = MemoryKey { crc, address, size };

        let candidates = self.memory_map.get(&key).cloned().unwrap_or_default();
        if let Some(&first) = candidates.first() {
            if !self.config.verify_on_hash_hit {
                trace!(index = first, address, size, "memory block reused");
                return Ok(first);
            }
            for index in candidates {
                if self.staged_content_matches(index)? {
                    trace!(index, address, size, "memory block reused");
                    return Ok(index);
                }
            }
            warn!(
                address = format_args!("0x{address:08X}"),
                size,
                crc = format_args!("0x{crc:016X}"),
                "checksum collision, storing a separate copy"
            );
        }

        let blob_offset = self.staging_len;
        if let Some(staging) = self.staging.as_mut() {
            if let Err(err) = staging.write_all(&self.scratch) {
                warn!(address, size, "failed to stage memory block: {err}");
                // A partial write may have extended the file; append after whatever landed.
                self.staging_len = staging.seek(SeekFrom::End(0)).unwrap_or(blob_offset);
                return Err(err.into());
            }
        }
        self.staging_len += u64::from(size);

        let index = self.tables.memory_blocks.len() as u32;
        self.tables.memory_blocks.push(MemoryBlock {
            crc,
            blob_offset,
            address,
            size,
        });
        self.memory_map.entry(key).or_default().push(index);

        debug!(
            index,
            address = format_args!("0x{address:08X}"),
            size,
            crc = format_args!("0x{crc:016X}"),
            "new GPU trace memory block"
        );
        Ok(index)
    }

    fn staged_content_matches(&mut self, index: u32) -> Result<bool> {
        let block = self.tables.memory_blocks[index as usize];
        // Nothing to compare against; the checksum is all there is.
        let Some(staging) = self.staging.as_mut() else {
            return Ok(true);
        };

        staging.seek(SeekFrom::Start(block.blob_offset))?;
        let staged = staging.read_exact_vec(block.size as usize);
        staging.seek(SeekFrom::Start(self.staging_len))?;

        Ok(staged? == self.scratch)
    }
}

impl<M> Drop for TraceWriter<M> {
    fn drop(&mut self) {
        if self.is_finalized() {
            return;
        }
        drop(self.staging.take());
        self.remove_staging_file();
        info!(
            path = %self.target_path.display(),
            packets = self.tables.packets.len(),
            "GPU trace capture abandoned"
        );
    }
}

/// Guard returned by [`TraceWriter::scoped_block`]; ends its block on drop and otherwise
/// behaves like the writer.
pub struct BlockScope<'a, M> {
    writer: &'a mut TraceWriter<M>,
    id: BlockId,
}

impl<M> BlockScope<'_, M> {
    pub fn id(&self) -> BlockId {
        self.id
    }
}

impl<M> Deref for BlockScope<'_, M> {
    type Target = TraceWriter<M>;

    fn deref(&self) -> &TraceWriter<M> {
        self.writer
    }
}

impl<M> DerefMut for BlockScope<'_, M> {
    fn deref_mut(&mut self) -> &mut TraceWriter<M> {
        self.writer
    }
}

impl<M> Drop for BlockScope<'_, M> {
    fn drop(&mut self) {
        self.writer.end_block(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc64::crc64;
    use crate::file::TraceFile;
    use crate::memory::VecGuestMemory;
    use std::cell::Cell;
    use std::io::{self, Cursor};
    use std::rc::Rc;
    use tempfile::tempdir;

    /// In-memory staging file that refuses to grow past a shared capacity.
    struct FullDisk {
        data: Cursor<Vec<u8>>,
        capacity: Rc<Cell<u64>>,
    }

    impl Read for FullDisk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity.get().saturating_sub(self.data.position());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(usize::try_from(room).unwrap_or(usize::MAX));
            self.data.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    fn memory() -> VecGuestMemory {
        let mem = VecGuestMemory::new(0x4000);
        mem.fill(0x1000, 64, 0x11).unwrap();
        mem.fill(0x2000, 256, 0x22).unwrap();
        mem
    }

    #[test]
    fn frame_with_nested_draw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.gpu");
        let mem = memory();
        let mut w = TraceWriter::create(&path, &mem).unwrap();
        assert_eq!(w.state(), WriterState::Idle);

        let frame = w.begin_block("Frame");
        assert_eq!(frame, BlockId(0));
        assert_eq!(w.state(), WriterState::Recording);
        w.packet(0xAAAA, &[1, 2, 3]);
        w.memory_access_write(0x1000, 64, "fb").unwrap();
        let draw = w.begin_block("Draw");
        assert_eq!(draw, BlockId(1));
        w.packet(0xBBBB, &[]);
        w.memory_access_read(0x1000, 64, "fb").unwrap();
        w.end_block(draw);
        w.end_block(frame);

        let t = w.tables();
        assert_eq!(t.blocks.len(), 2);
        assert_eq!((t.blocks[0].num_sub_blocks, t.blocks[0].num_packets), (1, 2));
        assert_eq!((t.blocks[1].num_sub_blocks, t.blocks[1].num_packets), (0, 1));
        assert_eq!(t.packets.len(), 2);
        assert_eq!(t.memory_blocks.len(), 1);
        assert_eq!(t.memory_refs.len(), 2);
        assert!(t.memory_refs.iter().all(|r| r.block_index == 0));
        assert_eq!(t.memory_refs[0].mode, AccessMode::Write);
        assert_eq!(t.memory_refs[1].mode, AccessMode::Read);

        w.finalize().unwrap();
        assert_eq!(w.state(), WriterState::Finalized);
        assert!(path.exists());
        assert!(!w.staging_path().exists());
    }

    #[test]
    fn payload_words_are_stored_as_guest_values() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        // A word as it sits in guest memory: big-endian bytes, loaded natively.
        let raw = u32::from_ne_bytes(0xC001_2D00u32.to_be_bytes());
        w.packet(0x1, &[raw]);
        assert_eq!(w.tables().data_words, vec![0xC001_2D00]);
    }

    #[test]
    fn changed_content_at_same_region_is_stored_again() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        w.packet(0x1, &[]);
        w.memory_access_read(0x2000, 256, "tex").unwrap();
        mem.fill(0x2000, 1, 0xFF).unwrap();
        w.memory_access_read(0x2000, 256, "tex").unwrap();

        let t = w.tables();
        assert_eq!(t.memory_blocks.len(), 2);
        assert_eq!(t.memory_blocks[1].blob_offset, 256);
        assert_ne!(t.memory_blocks[0].crc, t.memory_blocks[1].crc);
        assert_eq!(
            (t.memory_refs[0].block_index, t.memory_refs[1].block_index),
            (0, 1)
        );
    }

    #[test]
    fn same_content_at_different_address_or_size_is_distinct() {
        let dir = tempdir().unwrap();
        let mem = VecGuestMemory::new(0x1000);
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        // All zero: identical checksums.
        w.packet(0x1, &[]);
        w.memory_access_read(0x100, 16, "a").unwrap();
        w.memory_access_read(0x200, 16, "b").unwrap();
        w.memory_access_read(0x100, 32, "c").unwrap();
        assert_eq!(w.tables().memory_blocks.len(), 3);
    }

    #[test]
    fn ignored_accesses_record_nothing() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        // No packet yet.
        w.memory_access_read(0x1000, 64, "early").unwrap();
        w.packet(0x1, &[]);
        w.memory_access_read(0, 64, "null").unwrap();
        w.memory_access_write(0x1000, 0, "empty").unwrap();

        let t = w.tables();
        assert!(t.memory_refs.is_empty());
        assert!(t.memory_blocks.is_empty());
        assert_eq!(t.packets[0].num_memory_refs, 0);
    }

    #[test]
    fn failed_guest_read_records_nothing() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        w.packet(0x1, &[]);
        let err = w.memory_access_read(0x3FF0, 0x100, "oob").unwrap_err();
        assert!(matches!(err, crate::TraceError::GuestMemory(_)));
        w.memory_access_read(0x1000, 64, "ok").unwrap();

        let t = w.tables();
        assert_eq!(t.memory_refs.len(), 1);
        assert_eq!(t.packets[0].num_memory_refs, 1);
    }

    #[test]
    fn mismatched_end_block_is_ignored() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        w.end_block(BlockId(0));
        let outer = w.begin_block("outer");
        let inner = w.begin_block("inner");
        w.end_block(outer);
        assert_eq!(w.depth(), 2);
        w.end_block(inner);
        w.end_block(inner);
        assert_eq!(w.depth(), 1);
        w.end_block(outer);
        assert_eq!(w.depth(), 0);
    }

    #[test]
    fn finalize_closes_open_blocks() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        w.begin_block("A");
        w.packet(0x1, &[]);
        w.begin_block("B");
        w.packet(0x2, &[]);
        w.finalize().unwrap();

        let t = w.tables();
        assert_eq!((t.blocks[0].num_sub_blocks, t.blocks[0].num_packets), (1, 2));
        assert_eq!((t.blocks[1].num_sub_blocks, t.blocks[1].num_packets), (0, 1));
    }

    #[test]
    fn calls_after_finalize_are_ignored() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        let block = w.begin_block("A");
        w.packet(0x1, &[]);
        w.finalize().unwrap();
        let before = w.tables().clone();

        assert_eq!(w.begin_block("late"), BlockId::NONE);
        w.end_block(block);
        w.packet(0x2, &[7]);
        w.memory_access_read(0x1000, 64, "late").unwrap();
        w.finalize().unwrap();

        assert_eq!(w.tables(), &before);
    }

    #[test]
    fn dropping_without_finalize_leaves_no_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.gpu");
        let mem = memory();
        let mut w = TraceWriter::create(&path, &mem).unwrap();
        let staging = w.staging_path().to_path_buf();
        assert!(staging.exists());

        w.packet(0x1, &[]);
        w.memory_access_read(0x1000, 64, "x").unwrap();
        drop(w);

        assert!(!staging.exists());
        assert!(!path.exists());
    }

    #[test]
    fn scoped_blocks_close_in_reverse_order() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        {
            let mut frame = w.scoped_block("Frame");
            frame.packet(0x1, &[]);
            {
                let mut draw = frame.scoped_block("Draw");
                draw.packet(0x2, &[]);
                assert_eq!(draw.depth(), 2);
            }
            assert_eq!(frame.depth(), 1);
        }
        assert_eq!(w.depth(), 0);
        assert_eq!(w.tables().blocks[0].num_sub_blocks, 1);
        assert_eq!(w.tables().blocks[0].num_packets, 2);
    }

    #[test]
    fn verify_on_hash_hit_separates_checksum_collisions() {
        // For this CRC, `m ++ crc(m).to_le_bytes()` checksums to zero, as does all-zero input.
        let m = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut colliding = m.to_vec();
        colliding.extend_from_slice(&crc64(&m).to_le_bytes());
        assert_eq!(crc64(&colliding), crc64(&[0u8; 16]));

        for (verify, expected_blocks) in [(false, 1), (true, 2)] {
            let dir = tempdir().unwrap();
            let mem = VecGuestMemory::new(0x1000);
            let config = TraceWriterConfig {
                verify_on_hash_hit: verify,
                ..TraceWriterConfig::default()
            };
            let mut w = TraceWriter::with_config(dir.path().join("t.gpu"), &mem, config).unwrap();

            w.packet(0x1, &[]);
            w.memory_access_read(0x100, 16, "zero").unwrap();
            mem.write(0x100, &colliding).unwrap();
            w.memory_access_read(0x100, 16, "data").unwrap();
            // Matches the second copy.
            w.memory_access_read(0x100, 16, "data").unwrap();

            assert_eq!(w.tables().memory_blocks.len(), expected_blocks);
            assert_eq!(w.tables().memory_refs.len(), 3);
        }
    }

    #[test]
    fn verify_on_hash_hit_reuses_every_colliding_copy() {
        let m = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut colliding = m.to_vec();
        colliding.extend_from_slice(&crc64(&m).to_le_bytes());

        let dir = tempdir().unwrap();
        let mem = VecGuestMemory::new(0x1000);
        let config = TraceWriterConfig {
            verify_on_hash_hit: true,
            ..TraceWriterConfig::default()
        };
        let mut w = TraceWriter::with_config(dir.path().join("t.gpu"), &mem, config).unwrap();

        w.packet(0x1, &[]);
        for content in [&[0u8; 16][..], &colliding, &[0u8; 16], &colliding] {
            mem.write(0x100, content).unwrap();
            w.memory_access_read(0x100, 16, "flip").unwrap();
        }

        let t = w.tables();
        assert_eq!(t.memory_blocks.len(), 2);
        let indices: Vec<u32> = t.memory_refs.iter().map(|r| r.block_index).collect();
        assert_eq!(indices, vec![0, 1, 0, 1]);
    }

    #[test]
    fn capture_continues_without_staging_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.gpu");
        let mem = memory();
        // The staging path lives under a directory that does not exist.
        let config = TraceWriterConfig {
            staging_suffix: "/staging".to_string(),
            ..TraceWriterConfig::default()
        };
        let mut w = TraceWriter::with_config(&path, &mem, config).unwrap();
        assert!(!w.staging_path().exists());

        w.begin_block("Frame");
        w.packet(0x1, &[]);
        w.memory_access_read(0x1000, 64, "a").unwrap();
        w.memory_access_read(0x2000, 256, "b").unwrap();
        w.memory_access_read(0x1000, 64, "a").unwrap();
        w.finalize().unwrap();

        let mut trace = TraceFile::open(&path).unwrap();
        let t = trace.tables().clone();
        t.validate().unwrap();
        assert_eq!(t.memory_refs.len(), 3);
        assert_eq!(t.memory_blocks.len(), 2);
        assert_eq!(t.memory_blocks[1].blob_offset, 64);
        assert_eq!(trace.blob_len(), 0);
        assert!(t.memory_blocks.iter().all(|b| !trace.has_contents(b)));
        assert!(trace.read_memory_block(0).is_err());
    }

    #[test]
    fn oversized_access_is_rejected_before_allocating() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        w.packet(0x1, &[]);
        let err = w.memory_access_read(0x1000, u32::MAX, "huge").unwrap_err();
        assert!(matches!(
            err,
            TraceError::OutOfMemory { len } if len == u32::MAX as usize
        ));
        assert!(w.tables().memory_refs.is_empty());
        assert!(w.tables().memory_blocks.is_empty());

        w.memory_access_read(0x1000, 64, "ok").unwrap();
        assert_eq!(w.tables().packets[0].num_memory_refs, 1);
    }

    #[test]
    fn failed_staging_write_records_nothing_and_resyncs_offset() {
        let dir = tempdir().unwrap();
        let mem = VecGuestMemory::new(0x1000);
        mem.fill(0x100, 16, 0x01).unwrap();
        mem.fill(0x200, 16, 0x02).unwrap();
        let mut w = TraceWriter::create(dir.path().join("t.gpu"), &mem).unwrap();

        // Room for the first region plus three bytes of the second.
        let capacity = Rc::new(Cell::new(16 + 3));
        w.staging = Some(Box::new(FullDisk {
            data: Cursor::new(Vec::new()),
            capacity: capacity.clone(),
        }));

        w.packet(0x1, &[]);
        w.memory_access_read(0x100, 16, "a").unwrap();
        let err = w.memory_access_read(0x200, 16, "b").unwrap_err();
        assert!(matches!(err, TraceError::Io(_)));

        let t = w.tables();
        assert_eq!(t.memory_blocks.len(), 1);
        assert_eq!(t.memory_refs.len(), 1);
        assert_eq!(t.packets[0].num_memory_refs, 1);

        capacity.set(u64::MAX);
        w.memory_access_read(0x200, 16, "b").unwrap();
        let t = w.tables();
        assert_eq!(t.memory_blocks.len(), 2);
        assert_eq!(t.memory_blocks[1].blob_offset, 19);
        assert_eq!(t.packets[0].num_memory_refs, 2);
    }

    #[test]
    fn timestamped_file_name() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(trace_file_name(now), "trace_[2023_11_14 22_13_20].gpu");
    }

    #[test]
    fn create_in_dir_uses_timestamped_name() {
        let dir = tempdir().unwrap();
        let mem = memory();
        let w = TraceWriter::create_in_dir(dir.path(), &mem, TraceWriterConfig::default()).unwrap();
        let name = w.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("trace_[") && name.ends_with("].gpu"), "{name}");
        assert!(w.staging_path().to_string_lossy().ends_with(".gpu.mem"));
    }
}
