//! Defragment command implementation.

use super::{format_size, open_store};
use chunkdb_core::{Cluster, Config, CoreResult, DefragmentManager, WalkControl};
use std::collections::HashSet;
use std::path::Path;

/// What a compaction would work on.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DefragmentPlan {
    /// Store size in bytes.
    pub store_size: u64,
    /// Live chains with more than one link.
    pub fragmented_chains: usize,
    /// Free chunks.
    pub free_chunks: usize,
    /// Bytes covered by free chunks.
    pub free_bytes: u64,
    /// Chunks neither reachable nor free.
    pub unreferenced: usize,
}

/// Runs the defragment command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Defragmenting store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let cluster = open_store(path, Config::default())?;
    let plan = analyze(&cluster)?;

    println!("Analysis:");
    println!("  Store size:        {}", format_size(plan.store_size));
    println!("  Fragmented chains: {}", plan.fragmented_chains);
    println!("  Free chunks:       {}", plan.free_chunks);
    println!("  Free bytes:        {}", format_size(plan.free_bytes));
    println!("  Unreferenced:      {}", plan.unreferenced);
    println!();

    if dry_run {
        println!("Dry run complete. Run without --dry-run to apply changes.");
        return Ok(());
    }

    let report = cluster.defragment()?;
    cluster.flush()?;
    cluster.store().sync()?;

    println!("Result:");
    println!("  Orphans reclaimed: {}", report.orphans_reclaimed);
    println!("  Rounds:            {}", report.rounds);
    println!("  Chains merged:     {}", report.chains_merged);
    println!("  Free coalesced:    {}", report.free_chunks_coalesced);
    println!("  Chunks relocated:  {}", report.chunks_relocated);
    println!("  Size before: {}", format_size(report.size_before));
    println!("  Size after:  {}", format_size(report.size_after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(report.size_before.saturating_sub(report.size_after)),
        if report.size_before > 0 {
            (report.size_before.saturating_sub(report.size_after) as f64
                / report.size_before as f64)
                * 100.0
        } else {
            0.0
        }
    );
    Ok(())
}

/// Measures fragmentation without changing the store.
pub fn analyze(cluster: &Cluster) -> CoreResult<DefragmentPlan> {
    let mut plan = DefragmentPlan {
        store_size: cluster.store().size()?,
        ..DefragmentPlan::default()
    };

    let memory = cluster.memory();
    for chunk in cluster.physical_chunks() {
        let chunk = chunk?;
        if memory.is_free(chunk.ptr()) {
            plan.free_chunks += 1;
            plan.free_bytes += chunk.footprint();
        }
    }

    let mut heads = HashSet::new();
    cluster.walker().walk(cluster, &mut |slot| {
        if let Some(target) = slot.reference.ptr {
            heads.insert(target);
        }
        Ok(WalkControl::Continue)
    })?;
    for head in heads {
        if cluster.chunk(head)?.chain_length(cluster, Some(2))? > 1 {
            plan.fragmented_chains += 1;
        }
    }

    plan.unreferenced = DefragmentManager::new(cluster).find_free_chunks()?.len();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdb_core::{AllocateTicket, NodeValue, Reference};
    use std::sync::Arc;

    #[test]
    fn analyze_reports_without_changing() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
        let spacer = cluster.alloc(&AllocateTicket::bytes(1)).unwrap();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(&NodeValue::blob(vec![4; 40]).encode()).unwrap();
        io.close().unwrap();
        cluster.set_root_reference(Reference::to(head.ptr())).unwrap();
        cluster.memory().free(&cluster, &[Arc::clone(&spacer)]).unwrap();
        let size = cluster.store().size().unwrap();

        let plan = analyze(&cluster).unwrap();
        assert_eq!(plan.store_size, size);
        assert_eq!(plan.fragmented_chains, 1);
        assert_eq!(plan.free_chunks, 1);
        assert_eq!(plan.free_bytes, spacer.footprint());
        assert_eq!(plan.unreferenced, 0);
        assert_eq!(cluster.store().size().unwrap(), size);
        assert_eq!(analyze(&cluster).unwrap(), plan);
    }
}
