use criterion::{criterion_group, criterion_main, Criterion};
use portpick_core::{
    generate_with_strategy, BatchId, MemoryStore, PortRange, PortRecord, SelectionStrategy,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn mk_store(used: usize) -> MemoryStore {
    let batch = BatchId::new();
    let records = (0..used)
        .filter_map(|index| u16::try_from(1_024 + index * 7).ok())
        .map(|port| PortRecord::new(port, batch.clone(), None))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|err| panic!("benchmark fixture record invalid: {err}"));
    MemoryStore::with_records(records)
        .unwrap_or_else(|err| panic!("benchmark fixture ports collide: {err}"))
}

fn bench_strategy(c: &mut Criterion, name: &str, strategy: SelectionStrategy) {
    let store = mk_store(5_000);
    let range = PortRange::full();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    c.bench_function(name, |b| {
        b.iter(|| {
            let batch = generate_with_strategy(&store, range, 16, strategy, &mut rng);
            if let Err(err) = batch {
                panic!("{name} generation failed: {err}");
            }
        });
    });
}

fn bench_shuffle(c: &mut Criterion) {
    bench_strategy(c, "shuffle_16_of_full_range_5000_used", SelectionStrategy::Shuffle);
}

fn bench_reservoir(c: &mut Criterion) {
    bench_strategy(c, "reservoir_16_of_full_range_5000_used", SelectionStrategy::Reservoir);
}

criterion_group!(allocator_benches, bench_shuffle, bench_reservoir);
criterion_main!(allocator_benches);
