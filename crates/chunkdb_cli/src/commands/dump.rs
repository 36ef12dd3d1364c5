//! Dump command implementation.

use super::open_store;
use chunkdb_core::{Cluster, Config, CoreResult, WalkControl};
use serde::Serialize;
use std::path::Path;

/// One live reference slot.
#[derive(Debug, Serialize)]
pub struct SlotEntry {
    /// Chain holding the slot.
    pub owner: u64,
    /// Slot index in the owner's value.
    pub slot: usize,
    /// Referenced chain head.
    pub target: u64,
    /// Offset into the referenced chain.
    pub offset: u64,
    /// Value kind of the target.
    pub kind: String,
    /// Links in the target chain.
    pub links: usize,
    /// Bytes stored in the target chain.
    pub size: u64,
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = open_store(path, Config::default())?;
    let entries = collect(&cluster, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Live references in {}", path.display());
            println!();
            for entry in &entries {
                println!(
                    "@{}[{}] -> @{}+{}  {}  {} bytes in {} link(s)",
                    entry.owner,
                    entry.slot,
                    entry.target,
                    entry.offset,
                    entry.kind,
                    entry.size,
                    entry.links
                );
            }
            println!();
            println!("{} slot(s) shown", entries.len());
        }
    }

    Ok(())
}

/// Lists live slots in walk order, stopping after `limit` entries.
pub fn collect(cluster: &Cluster, limit: Option<usize>) -> CoreResult<Vec<SlotEntry>> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    if limit == 0 {
        return Ok(entries);
    }

    cluster.walker().walk(cluster, &mut |slot| {
        let Some(target) = slot.reference.ptr else {
            return Ok(WalkControl::Continue);
        };
        let head = cluster.chunk(target)?;
        entries.push(SlotEntry {
            owner: slot.owner.get(),
            slot: slot.slot_index,
            target: target.get(),
            offset: slot.reference.offset,
            kind: format!("{:?}", cluster.value_kind(target)?).to_lowercase(),
            links: head.chain_length(cluster, None)?,
            size: head.chain_size(cluster)?,
        });
        Ok(if entries.len() >= limit {
            WalkControl::Stop
        } else {
            WalkControl::Continue
        })
    })?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdb_core::{NodeValue, Reference, FIRST_CHUNK};

    fn populated() -> Cluster {
        let cluster = Cluster::in_memory().unwrap();
        let a = cluster.write_value(&NodeValue::blob(b"alpha".to_vec())).unwrap();
        let b = cluster.write_value(&NodeValue::blob(b"beta".to_vec())).unwrap();
        let top = cluster
            .write_value(&NodeValue::node(
                vec![Reference::to(a), Reference::to(b)],
                Vec::new(),
            ))
            .unwrap();
        cluster.set_root_reference(Reference::to(top)).unwrap();
        cluster
    }

    #[test]
    fn lists_every_slot() {
        let cluster = populated();
        let entries = collect(&cluster, None).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].owner, FIRST_CHUNK);
        assert_eq!(entries[0].kind, "node");
        assert!(entries[1..].iter().all(|e| e.kind == "blob" && e.links == 1));
        assert_eq!(entries[1].size, NodeValue::blob(b"alpha".to_vec()).encoded_len() as u64);
    }

    #[test]
    fn limit_stops_the_walk() {
        let cluster = populated();
        assert_eq!(collect(&cluster, Some(2)).unwrap().len(), 2);
        assert!(collect(&cluster, Some(0)).unwrap().is_empty());
    }
}
