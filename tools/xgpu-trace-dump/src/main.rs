use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use xgpu_trace::{TraceFile, TraceTables};

#[derive(Parser, Debug)]
#[command(
    name = "xgpu-trace-dump",
    about = "Inspect GPU command traces: summary, block tree, memory blocks and consistency checks."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print table sizes and blob length
    Info {
        trace: PathBuf,

        /// Emit JSON instead of text
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },

    /// Print the block tree
    Tree {
        trace: PathBuf,

        /// Also list every packet directly recorded in each block
        #[arg(long, action = clap::ArgAction::SetTrue)]
        packets: bool,

        /// Stop descending below this depth (roots are depth 0)
        #[arg(long, value_name = "N")]
        max_depth: Option<usize>,
    },

    /// List memory blocks, or extract the contents of one
    Memory {
        trace: PathBuf,

        /// Index of the memory block to extract
        #[arg(long, value_name = "INDEX", requires = "out")]
        extract: Option<u32>,

        /// Output path for --extract
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Check table ranges, block nesting and blob bounds
    Validate { trace: PathBuf },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceSummary {
    path: String,
    blocks: usize,
    root_blocks: usize,
    packets: usize,
    data_words: usize,
    memory_refs: usize,
    memory_blocks: usize,
    memory_bytes: u64,
    blob_offset: u64,
    blob_bytes: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Info { trace, json } => info(&trace, json),
        Command::Tree {
            trace,
            packets,
            max_depth,
        } => tree(&trace, packets, max_depth),
        Command::Memory {
            trace,
            extract,
            out,
        } => memory(&trace, extract, out.as_deref()),
        Command::Validate { trace } => validate(&trace),
    }
}

fn open(path: &Path) -> anyhow::Result<TraceFile> {
    let trace =
        TraceFile::open(path).with_context(|| format!("open trace {}", path.display()))?;
    debug!(
        path = %path.display(),
        blocks = trace.tables().blocks.len(),
        packets = trace.tables().packets.len(),
        "trace loaded"
    );
    Ok(trace)
}

fn info(path: &Path, json: bool) -> anyhow::Result<()> {
    let trace = open(path)?;
    let tables = trace.tables();
    let summary = TraceSummary {
        path: path.display().to_string(),
        blocks: tables.blocks.len(),
        root_blocks: tables.root_blocks().count(),
        packets: tables.packets.len(),
        data_words: tables.data_words.len(),
        memory_refs: tables.memory_refs.len(),
        memory_blocks: tables.memory_blocks.len(),
        memory_bytes: tables
            .memory_blocks
            .iter()
            .map(|block| u64::from(block.size))
            .sum(),
        blob_offset: trace.blob_offset(),
        blob_bytes: trace.blob_len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("trace:         {}", summary.path);
    println!(
        "blocks:        {} ({} top-level)",
        summary.blocks, summary.root_blocks
    );
    println!("packets:       {}", summary.packets);
    println!("data words:    {}", summary.data_words);
    println!("memory refs:   {}", summary.memory_refs);
    println!(
        "memory blocks: {} ({} bytes)",
        summary.memory_blocks, summary.memory_bytes
    );
    println!(
        "blob:          {} bytes at offset {}",
        summary.blob_bytes, summary.blob_offset
    );
    Ok(())
}

fn tree(path: &Path, packets: bool, max_depth: Option<usize>) -> anyhow::Result<()> {
    let trace = open(path)?;
    let tables = trace.tables();
    // The walk below trusts the block ranges.
    tables
        .validate()
        .with_context(|| format!("{} failed validation", path.display()))?;
    for root in tables.root_blocks() {
        print_block(tables, root, 0, packets, max_depth)?;
    }
    Ok(())
}

fn print_block(
    tables: &TraceTables,
    index: u32,
    depth: usize,
    packets: bool,
    max_depth: Option<usize>,
) -> anyhow::Result<()> {
    let block = tables.block(index)?;
    let indent = "  ".repeat(depth);
    println!(
        "{indent}[{index}] {} ({} packets, {} sub-blocks)",
        block.tag, block.num_packets, block.num_sub_blocks
    );
    if max_depth.is_some_and(|max| depth >= max) {
        return Ok(());
    }

    // Packets owned by a child are printed under that child.
    let mut next_packet = block.first_packet;
    let children: Vec<u32> = tables.child_blocks(index)?.collect();
    for child in children {
        let child_block = tables.block(child)?;
        if packets {
            print_packets(tables, next_packet, child_block.first_packet, depth + 1)?;
        }
        next_packet = child_block
            .first_packet
            .saturating_add(child_block.num_packets);
        print_block(tables, child, depth + 1, packets, max_depth)?;
    }
    if packets {
        print_packets(
            tables,
            next_packet,
            block.first_packet.saturating_add(block.num_packets),
            depth + 1,
        )?;
    }
    Ok(())
}

fn print_packets(tables: &TraceTables, first: u32, end: u32, depth: usize) -> anyhow::Result<()> {
    let indent = "  ".repeat(depth);
    for index in first..end {
        let Some(packet) = tables.packets.get(index as usize) else {
            bail!("packet {index} out of range");
        };
        let words = tables.packet_words(packet)?;
        print!(
            "{indent}packet {index}: opcode=0x{:08X} words={}",
            packet.opcode,
            words.len()
        );
        for memory_ref in tables.packet_memory_refs(packet)? {
            let block = tables.memory_block(memory_ref.block_index)?;
            print!(
                " {}:{}@0x{:08X}+{}",
                memory_ref.mode, memory_ref.tag, block.address, block.size
            );
        }
        println!();
    }
    Ok(())
}

fn memory(path: &Path, extract: Option<u32>, out: Option<&Path>) -> anyhow::Result<()> {
    let mut trace = open(path)?;

    if let Some(index) = extract {
        let Some(out) = out else {
            bail!("--extract requires --out");
        };
        let bytes = trace
            .read_memory_block(index)
            .with_context(|| format!("read memory block {index}"))?;
        fs::write(out, &bytes).with_context(|| format!("write {}", out.display()))?;
        println!("wrote {} bytes to {}", bytes.len(), out.display());
        return Ok(());
    }

    let tables = trace.tables();
    let mut refs = vec![0usize; tables.memory_blocks.len()];
    for memory_ref in &tables.memory_refs {
        if let Some(count) = refs.get_mut(memory_ref.block_index as usize) {
            *count += 1;
        }
    }
    for (index, block) in tables.memory_blocks.iter().enumerate() {
        let absent = if trace.has_contents(block) {
            ""
        } else {
            " (absent)"
        };
        println!(
            "[{index}] address=0x{:08X} size={} crc=0x{:016X} blob_offset={} refs={}{absent}",
            block.address, block.size, block.crc, block.blob_offset, refs[index]
        );
    }
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let trace = open(path)?;
    trace
        .validate()
        .with_context(|| format!("{} failed validation", path.display()))?;
    println!("{}: ok", path.display());
    Ok(())
}
