//! CLI command implementations.

pub mod defragment;
pub mod dump;
pub mod inspect;
pub mod verify;

use chunkdb_core::{Cluster, Config};
use chunkdb_storage::FileBackend;
use std::path::Path;

/// Opens an existing store file without creating one.
pub fn open_store(path: &Path, config: Config) -> Result<Cluster, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    let store = FileBackend::open(path)?;
    Ok(Cluster::open(store, config)?)
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
