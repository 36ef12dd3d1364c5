//! Verify command implementation.

use super::open_store;
use chunkdb_core::{
    ChunkPointer, Cluster, Config, DefragmentManager, MemoryManager, WalkControl,
};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Chunks visited while walking the store.
    pub chunks_checked: usize,
    /// Live chains validated.
    pub chains_checked: usize,
    /// Chunks neither reachable nor free.
    pub unreferenced: Vec<ChunkPointer>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.unreferenced.is_empty() && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let cluster = open_store(path, Config::default())?;
    let result = check(&cluster);

    println!("  Chunks checked: {}", result.chunks_checked);
    println!("  Chains checked: {}", result.chains_checked);
    println!("  Unreferenced:   {}", result.unreferenced.len());
    for ptr in result.unreferenced.iter().take(10) {
        println!("    - {ptr}");
    }
    if !result.errors.is_empty() {
        println!("  Errors:");
        for err in result.errors.iter().take(10) {
            println!("    - {err}");
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks tiling, free list entries, live chains and reachability.
pub fn check(cluster: &Cluster) -> VerifyResult {
    let mut result = VerifyResult::default();

    let mut tiled = HashSet::new();
    for chunk in cluster.physical_chunks() {
        match chunk {
            Ok(chunk) => {
                result.chunks_checked += 1;
                tiled.insert(chunk.ptr());
            }
            Err(err) => {
                result.errors.push(format!("store does not tile: {err}"));
                return result;
            }
        }
    }

    for ptr in cluster.memory().free_list().iter() {
        if !tiled.contains(&ptr) {
            result
                .errors
                .push(format!("free list entry {ptr} is not a chunk boundary"));
        }
    }

    let mut heads = HashSet::new();
    let walked = cluster.walker().walk(cluster, &mut |slot| {
        if let Some(target) = slot.reference.ptr {
            heads.insert(target);
        }
        Ok(WalkControl::Continue)
    });
    if let Err(err) = walked {
        result.errors.push(format!("graph walk failed: {err}"));
        return result;
    }

    let mut heads: Vec<_> = heads.into_iter().collect();
    heads.sort();
    for head in heads {
        result.chains_checked += 1;
        let checked = cluster
            .chunk(head)
            .and_then(|chunk| MemoryManager::validate_chain(cluster, &chunk));
        if let Err(err) = checked {
            result.errors.push(format!("chain {head}: {err}"));
        }
    }

    match DefragmentManager::new(cluster).find_free_chunks() {
        Ok(garbage) => result.unreferenced = garbage,
        Err(err) => result.errors.push(format!("reachability scan failed: {err}")),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdb_core::{AllocateTicket, NodeValue, Reference};

    #[test]
    fn clean_store_passes() {
        let cluster = Cluster::in_memory().unwrap();
        let leaf = cluster.write_value(&NodeValue::blob(vec![2; 40])).unwrap();
        let top = cluster
            .write_value(&NodeValue::node(vec![Reference::to(leaf)], Vec::new()))
            .unwrap();
        cluster.set_root_reference(Reference::to(top)).unwrap();

        let result = check(&cluster);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.chains_checked, 2);
        assert_eq!(result.chunks_checked, 3);
    }

    #[test]
    fn orphan_fails() {
        let cluster = Cluster::in_memory().unwrap();
        let orphan = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
        let result = check(&cluster);
        assert!(!result.is_ok());
        assert_eq!(result.unreferenced, vec![orphan.ptr()]);
    }
}
