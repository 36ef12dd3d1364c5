//! Inspect command implementation.

use super::{format_size, open_store};
use chunkdb_core::{ChunkPointer, Cluster, Config, CoreResult};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store size in bytes.
    pub store_size: u64,
    /// Number of chunks tiling the store.
    pub chunk_count: usize,
    /// Number of free chunks.
    pub free_chunks: usize,
    /// Bytes covered by free chunks, headers included.
    pub free_bytes: u64,
    /// Footprint of the largest free chunk.
    pub largest_free: u64,
    /// Chunks linked to a next chunk.
    pub linked_chunks: usize,
    /// Application root reference, if set.
    pub root: Option<u64>,
    /// Per-chunk details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkInfo>>,
}

/// Layout of a single chunk.
#[derive(Debug, Serialize)]
pub struct ChunkInfo {
    /// Chunk address.
    pub ptr: u64,
    /// Bytes covered, header included.
    pub footprint: u64,
    /// Body capacity.
    pub capacity: u64,
    /// Bytes in use.
    pub size: u64,
    /// Next link, if any.
    pub next: Option<u64>,
    /// Whether the chunk is on the free list.
    pub free: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_chunks: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = open_store(path, Config::default())?;
    let mut result = collect(&cluster, show_chunks)?;
    result.path = path.display().to_string();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Gathers layout statistics from an open cluster.
pub fn collect(cluster: &Cluster, show_chunks: bool) -> CoreResult<InspectResult> {
    let memory = cluster.memory();
    let mut result = InspectResult {
        path: String::new(),
        store_size: cluster.store().size()?,
        chunk_count: 0,
        free_chunks: 0,
        free_bytes: 0,
        largest_free: 0,
        linked_chunks: 0,
        root: cluster.root_reference()?.ptr.map(ChunkPointer::get),
        chunks: show_chunks.then(Vec::new),
    };

    for chunk in cluster.physical_chunks() {
        let chunk = chunk?;
        let free = memory.is_free(chunk.ptr());
        result.chunk_count += 1;
        if free {
            result.free_chunks += 1;
            result.free_bytes += chunk.footprint();
            result.largest_free = result.largest_free.max(chunk.footprint());
        }
        if chunk.has_next() {
            result.linked_chunks += 1;
        }
        if let Some(chunks) = &mut result.chunks {
            chunks.push(ChunkInfo {
                ptr: chunk.ptr().get(),
                footprint: chunk.footprint(),
                capacity: chunk.capacity(),
                size: chunk.size(),
                next: chunk.next_ptr().map(ChunkPointer::get),
                free,
            });
        }
    }

    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("chunkdb Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Store size:    {}", format_size(result.store_size));
    println!("  Chunks:        {}", result.chunk_count);
    println!("  Linked chunks: {}", result.linked_chunks);
    match result.root {
        Some(root) => println!("  Root:          @{root}"),
        None => println!("  Root:          (none)"),
    }
    println!();
    println!("Free space:");
    println!("  Free chunks:   {}", result.free_chunks);
    println!("  Free bytes:    {}", format_size(result.free_bytes));
    println!("  Largest free:  {}", format_size(result.largest_free));

    if let Some(chunks) = &result.chunks {
        println!();
        println!("Chunks:");
        for chunk in chunks {
            let next = chunk
                .next
                .map_or_else(String::new, |next| format!(" -> @{next}"));
            println!(
                "  @{:<8} {:>8} bytes  {}/{}{}{}",
                chunk.ptr,
                chunk.footprint,
                chunk.size,
                chunk.capacity,
                next,
                if chunk.free { "  free" } else { "" }
            );
        }
    }
}
