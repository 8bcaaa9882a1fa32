use commonware_blockcache::{
    backend::memory::Memory,
    cache::{BlockCache, Config},
};
use criterion::criterion_main;
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::num::NonZeroUsize;

mod read_hits;

criterion_main!(split::benches, read_hits::benches);

/// The name of the file every benchmark reads.
const FILE: &str = "bench.pak";

/// A "prod sized" block.
const BLOCK_SIZE: usize = 64 * 1024;

/// Create a cache of `blocks` blocks in front of a memory backend holding `file_size` random
/// bytes.
fn get_cache(blocks: usize, file_size: usize) -> BlockCache<Memory> {
    let mut rng = StdRng::seed_from_u64(0);
    let mut data = vec![0u8; file_size];
    rng.fill_bytes(&mut data);

    let backend = Memory::default();
    backend.insert(FILE, data);
    let cfg = Config {
        block_size: NonZeroUsize::new(BLOCK_SIZE).unwrap(),
        cache_size: blocks * BLOCK_SIZE,
        only_epilog_writes: false,
        statistics_window: NonZeroUsize::new(128).unwrap(),
    };
    BlockCache::init(&mut Registry::default(), backend, cfg).unwrap()
}
