use std::fs;
use std::path::PathBuf;
use std::process;

use blockstore::primitives::chunked::{chunk_size_for, extend_file_size};
use blockstore::storage::{EngineOptions, StorageEngine};
use blockstore::{Result, StoreError};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "blockstore-inspect",
    version,
    about = "Inspect block store files"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "BLOCKSTORE_CONFIG",
        help = "Engine options file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show file length, block count and chunk geometry
    Info {
        #[arg(value_name = "STORE")]
        path: PathBuf,
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    /// Hex dump one block
    Dump {
        #[arg(value_name = "STORE")]
        path: PathBuf,
        #[arg(long, value_name = "INDEX")]
        block: u64,
    },
}

#[derive(Serialize)]
struct StoreInfo {
    path: PathBuf,
    file_size: u64,
    block_size: usize,
    blocks: u64,
    file_size_increment: u64,
    chunk_size: u64,
    chunks: u64,
    next_growth: u64,
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn cmd_info(options: &EngineOptions, path: PathBuf, json: bool) -> Result<()> {
    let file_size = fs::metadata(&path)?.len();
    let chunk_size = chunk_size_for(
        file_size,
        options.file_size_increment,
        options.mmap_max_chunk_size,
    );
    let info = StoreInfo {
        file_size,
        block_size: options.block_size,
        blocks: file_size / options.block_size as u64,
        file_size_increment: options.file_size_increment,
        chunk_size,
        chunks: file_size.div_ceil(chunk_size),
        next_growth: extend_file_size(
            file_size,
            file_size + 1,
            options.file_size_increment,
            chunk_size,
        ),
        path,
    };
    if json {
        let rendered = serde_json::to_string_pretty(&info)
            .map_err(|err| StoreError::Config(err.to_string()))?;
        println!("{rendered}");
        return Ok(());
    }
    println!("{}", info.path.display());
    print_field("File Size", format_bytes(info.file_size));
    print_field("Block Size", format!("{} bytes", info.block_size));
    print_field("Blocks", info.blocks);
    print_field("Growth Increment", format_bytes(info.file_size_increment));
    print_field("Chunk Size", format_bytes(info.chunk_size));
    print_field("Chunks", info.chunks);
    print_field("Next Growth", format_bytes(info.next_growth));
    Ok(())
}

/// Byte offset of block `index`, if the whole block lies inside the file.
fn block_offset(index: u64, block_size: u64, file_size: u64) -> Result<u64> {
    let end = index
        .checked_add(1)
        .and_then(|n| n.checked_mul(block_size))
        .ok_or(StoreError::Invalid("block index out of range"))?;
    if end > file_size {
        return Err(StoreError::Invalid("block lies beyond the end of the file"));
    }
    Ok(end - block_size)
}

fn cmd_dump(options: EngineOptions, path: PathBuf, index: u64) -> Result<()> {
    let file_size = fs::metadata(&path)?.len();
    let base = block_offset(index, options.block_size as u64, file_size)?;
    // Plain I/O and no flusher: inspection must not grow or rewrite the file.
    let engine = StorageEngine::start(EngineOptions {
        enable_mmap: false,
        flush_interval_ms: None,
        cache_blocks: Some(1),
        ..options
    })?;
    let store = engine.open_store("inspect", &path)?;
    let block = store.get_block(index)?;
    for (row, line) in block.read().chunks(16).enumerate() {
        let printable: String = line
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect();
        println!("{:012x}  {:<32}  {}", base + row as u64 * 16, hex::encode(line), printable);
    }
    drop(block);
    store.close()?;
    engine.shutdown()
}

fn run(cli: Cli) -> Result<()> {
    let options = EngineOptions::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Info { path, json } => cmd_info(&options, path, json),
        Command::Dump { path, block } => cmd_dump(options, path, block),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
