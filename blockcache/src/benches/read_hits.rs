use super::{get_cache, BLOCK_SIZE, FILE};
use commonware_blockcache::cache::Request;
use criterion::{criterion_group, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, Instant};

/// The number of blocks in the cache.
const BLOCKS: usize = 128;

/// The number of reads per iteration.
const READS: usize = 10_000;

/// Read small unaligned ranges from a working set that fits in the cache.
fn bench_read_hits(c: &mut Criterion) {
    for working_set in [BLOCKS / 2, BLOCKS * 2] {
        let label = format!("{}/blocks={BLOCKS} working_set={working_set}", module_path!());
        c.bench_function(&label, |b| {
            b.iter_custom(move |iters| {
                let file_size = working_set * BLOCK_SIZE;
                let mut cache = get_cache(BLOCKS, file_size);
                let mut rng = StdRng::seed_from_u64(0);

                let mut duration = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    for _ in 0..READS {
                        let offset = rng.gen_range(0..file_size - 512);
                        let mut receiver = cache.prepare(Request::new(FILE, offset as u64, 512));
                        loop {
                            if let Some(response) = receiver.try_recv().unwrap() {
                                response.result.unwrap();
                                break;
                            }
                            cache.execute();
                        }
                    }
                    duration += start.elapsed();
                }
                duration
            });
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_read_hits
}
