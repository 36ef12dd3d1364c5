//! Benchmark utilities.

use chunkdb_core::{AllocateTicket, ChunkPointer, Cluster, NodeValue, Reference};
use rand::Rng;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Builds a cluster holding `count` blobs where every other blob has grown
/// into a second link and the rest have been freed.
pub fn fragmented_cluster(count: usize, payload_size: usize) -> Cluster {
    let cluster = Cluster::in_memory().unwrap();
    let filler = cluster.alloc(&AllocateTicket::bytes(256)).unwrap().ptr();
    let blobs: Vec<ChunkPointer> = (0..count)
        .map(|_| {
            cluster
                .write_value(&NodeValue::blob(random_data(payload_size)))
                .unwrap()
        })
        .collect();

    let kept: Vec<_> = blobs.iter().copied().step_by(2).collect();
    for ptr in &kept {
        let mut io = cluster.io(*ptr).unwrap();
        io.read_all().unwrap();
        io.write_all(&random_data(payload_size / 2 + 1)).unwrap();
        io.close().unwrap();
    }

    let mut dropped: Vec<_> = blobs.iter().copied().skip(1).step_by(2).collect();
    dropped.push(filler);
    cluster.memory().free_chains(&cluster, &dropped).unwrap();

    let refs = kept.into_iter().map(Reference::to).collect();
    let top = cluster
        .write_value(&NodeValue::node(refs, Vec::new()))
        .unwrap();
    cluster.set_root_reference(Reference::to(top)).unwrap();
    cluster
}
