use std::collections::BTreeSet;

use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{BatchId, LedgerError, PortRange, PortStore, ProposedBatch};

/// Spans above this size are sampled without materializing the candidate pool
/// when the request is small relative to the span.
pub const RESERVOIR_THRESHOLD: usize = 16_384;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Partial Fisher-Yates over the materialized pool.
    Shuffle,
    /// Reservoir sampling over the filtered range, then a shuffle of the reservoir.
    Reservoir,
}

impl SelectionStrategy {
    #[must_use]
    pub fn for_request(range: PortRange, count: usize) -> Self {
        if range.len() > RESERVOIR_THRESHOLD && count.saturating_mul(8) < range.len() {
            Self::Reservoir
        } else {
            Self::Shuffle
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shuffle => "shuffle",
            Self::Reservoir => "reservoir",
        }
    }
}

/// Propose `count` distinct unused ports from `range`, picking the selection
/// strategy from the request shape.
///
/// # Errors
/// See [`generate_with_strategy`].
pub fn generate<S, R>(
    store: &S,
    range: PortRange,
    count: usize,
    rng: &mut R,
) -> Result<ProposedBatch, LedgerError>
where
    S: PortStore + ?Sized,
    R: Rng + ?Sized,
{
    generate_with_strategy(store, range, count, SelectionStrategy::for_request(range, count), rng)
}

/// Propose `count` distinct ports from `range` that no live record holds.
///
/// The store is read once for a point-in-time snapshot and never written.
/// A zero count returns an empty batch without reading the store.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for an invalid range,
/// [`LedgerError::InsufficientRange`] when fewer than `count` ports are free,
/// and propagates store read failures.
pub fn generate_with_strategy<S, R>(
    store: &S,
    range: PortRange,
    count: usize,
    strategy: SelectionStrategy,
    rng: &mut R,
) -> Result<ProposedBatch, LedgerError>
where
    S: PortStore + ?Sized,
    R: Rng + ?Sized,
{
    range.validate()?;
    if count == 0 {
        return Ok(ProposedBatch::empty(range));
    }

    let used = store
        .list_all()?
        .into_iter()
        .map(|record| record.port)
        .filter(|port| range.contains(*port))
        .collect::<BTreeSet<_>>();

    let available = range.len() - used.len();
    if available < count {
        return Err(LedgerError::InsufficientRange { requested: count, available });
    }

    tracing::debug!(
        range = %range,
        requested = count,
        available,
        strategy = strategy.as_str(),
        "selecting ports from candidate pool"
    );

    let ports = match strategy {
        SelectionStrategy::Shuffle => shuffle_select(range, &used, count, rng),
        SelectionStrategy::Reservoir => reservoir_select(range, &used, count, rng),
    };

    Ok(ProposedBatch { batch_id: BatchId::new(), range, ports })
}

fn shuffle_select<R: Rng + ?Sized>(
    range: PortRange,
    used: &BTreeSet<u16>,
    count: usize,
    rng: &mut R,
) -> Vec<u16> {
    let mut pool = range.iter().filter(|port| !used.contains(port)).collect::<Vec<_>>();
    let (selected, _) = pool.partial_shuffle(rng, count);
    selected.to_vec()
}

fn reservoir_select<R: Rng + ?Sized>(
    range: PortRange,
    used: &BTreeSet<u16>,
    count: usize,
    rng: &mut R,
) -> Vec<u16> {
    let mut selected =
        range.iter().filter(|port| !used.contains(port)).choose_multiple(rng, count);
    // Reservoir slots are filled in scan order; shuffle to make every ordering equally likely.
    selected.shuffle(rng);
    selected
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::{MemoryStore, PortRecord};

    fn store_with_ports(ports: &[u16]) -> MemoryStore {
        let batch = BatchId::new();
        let records = ports
            .iter()
            .map(|port| PortRecord::new(*port, batch.clone(), None))
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_else(|err| panic!("fixture record should be valid: {err}"));
        MemoryStore::with_records(records)
            .unwrap_or_else(|err| panic!("fixture ports should be unique: {err}"))
    }

    fn range(min: i64, max: i64) -> PortRange {
        PortRange::new(min, max).unwrap_or_else(|err| panic!("fixture range invalid: {err}"))
    }

    // Test IDs: TALLOC-001
    #[test]
    fn scenario_a_returns_permutation_of_free_ports() -> Result<(), LedgerError> {
        let store = store_with_ports(&[2, 4]);
        let mut rng = StdRng::seed_from_u64(7);

        let batch = generate(&store, range(1, 5), 3, &mut rng)?;
        let mut ports = batch.ports.clone();
        ports.sort_unstable();
        assert_eq!(ports, vec![1, 3, 5]);
        Ok(())
    }

    // Test IDs: TALLOC-002
    #[test]
    fn scenario_b_reports_requested_and_available() {
        let store = store_with_ports(&[2, 4]);
        let mut rng = StdRng::seed_from_u64(7);

        let result = generate(&store, range(1, 5), 4, &mut rng);
        assert_eq!(result, Err(LedgerError::InsufficientRange { requested: 4, available: 3 }));
    }

    // Test IDs: TALLOC-003
    #[test]
    fn full_range_request_returns_every_port_once() -> Result<(), LedgerError> {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(11);
        let span = range(100, 163);

        let batch = generate(&store, span, span.len(), &mut rng)?;
        let mut ports = batch.ports.clone();
        ports.sort_unstable();
        assert_eq!(ports, span.iter().collect::<Vec<_>>());

        let overflow = generate(&store, span, span.len() + 1, &mut rng);
        assert_eq!(
            overflow,
            Err(LedgerError::InsufficientRange { requested: 65, available: 64 })
        );
        Ok(())
    }

    // Test IDs: TALLOC-004
    #[test]
    fn zero_count_skips_store_read() -> Result<(), LedgerError> {
        let store = store_with_ports(&[10]);
        let mut rng = StdRng::seed_from_u64(1);

        let batch = generate(&store, range(1, 20), 0, &mut rng)?;
        assert!(batch.is_empty());
        assert_eq!(store.list_calls(), 0);

        let _ = generate(&store, range(1, 20), 1, &mut rng)?;
        assert_eq!(store.list_calls(), 1);
        Ok(())
    }

    #[test]
    fn used_ports_outside_range_do_not_shrink_pool() -> Result<(), LedgerError> {
        let store = store_with_ports(&[1, 2, 3, 500]);
        let mut rng = StdRng::seed_from_u64(3);

        let batch = generate(&store, range(10, 12), 3, &mut rng)?;
        assert_eq!(batch.len(), 3);
        Ok(())
    }

    #[test]
    fn seeded_generation_is_deterministic() -> Result<(), LedgerError> {
        let store = store_with_ports(&[3000, 3001]);
        let span = range(3000, 3999);

        let a = generate(&store, span, 25, &mut StdRng::seed_from_u64(42))?;
        let b = generate(&store, span, 25, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(a.ports, b.ports);
        assert_ne!(a.batch_id, b.batch_id);
        Ok(())
    }

    #[test]
    fn strategy_prefers_reservoir_for_small_requests_on_wide_spans() {
        assert_eq!(
            SelectionStrategy::for_request(PortRange::full(), 10),
            SelectionStrategy::Reservoir
        );
        assert_eq!(
            SelectionStrategy::for_request(PortRange::full(), 60_000),
            SelectionStrategy::Shuffle
        );
        assert_eq!(
            SelectionStrategy::for_request(range(1, 1_000), 1),
            SelectionStrategy::Shuffle
        );
    }

    fn first_position_counts(strategy: SelectionStrategy, seed: u64) -> BTreeMap<u16, usize> {
        let store = store_with_ports(&[3]);
        let span = range(1, 6);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counts = BTreeMap::new();
        for _ in 0..10_000 {
            let batch = generate_with_strategy(&store, span, 2, strategy, &mut rng)
                .unwrap_or_else(|err| panic!("generation should succeed: {err}"));
            *counts.entry(batch.ports[0]).or_insert(0_usize) += 1;
        }
        counts
    }

    // Test IDs: TALLOC-005
    #[test]
    fn both_strategies_pick_first_port_uniformly() {
        for strategy in [SelectionStrategy::Shuffle, SelectionStrategy::Reservoir] {
            let counts = first_position_counts(strategy, 2024);
            assert_eq!(counts.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4, 5, 6]);
            // 10_000 draws over 5 candidates: expect 2_000 each.
            for (port, hits) in counts {
                assert!(
                    (1_700..=2_300).contains(&hits),
                    "{} picked port {port} {hits} times",
                    strategy.as_str()
                );
            }
        }
    }

    // Test IDs: TALLOC-006
    #[test]
    fn both_strategies_produce_every_ordered_pair_uniformly() {
        let store = MemoryStore::new();
        let span = range(1, 4);
        for strategy in [SelectionStrategy::Shuffle, SelectionStrategy::Reservoir] {
            let mut rng = StdRng::seed_from_u64(77);
            let mut counts = BTreeMap::new();
            for _ in 0..24_000 {
                let batch = generate_with_strategy(&store, span, 2, strategy, &mut rng)
                    .unwrap_or_else(|err| panic!("generation should succeed: {err}"));
                *counts.entry((batch.ports[0], batch.ports[1])).or_insert(0_usize) += 1;
            }

            // 4 * 3 ordered pairs over 24_000 draws: expect 2_000 each.
            assert_eq!(counts.len(), 12, "{} missed an ordered pair", strategy.as_str());
            for ((first, second), hits) in counts {
                assert_ne!(first, second);
                assert!(
                    (1_700..=2_300).contains(&hits),
                    "{} produced ({first}, {second}) {hits} times",
                    strategy.as_str()
                );
            }
        }
    }

    #[test]
    fn reservoir_on_wide_span_skips_used_ports_inside_the_span() -> Result<(), LedgerError> {
        let used = (1_000..1_200).collect::<Vec<u16>>();
        let store = store_with_ports(&used);
        let span = range(900, 30_000);
        assert_eq!(SelectionStrategy::for_request(span, 50), SelectionStrategy::Reservoir);

        for seed in 0..200 {
            let batch = generate(&store, span, 50, &mut StdRng::seed_from_u64(seed))?;
            let distinct = batch.ports.iter().copied().collect::<BTreeSet<_>>();
            assert_eq!(distinct.len(), 50);
            assert!(batch.ports.iter().all(|port| span.contains(*port)));
            assert!(batch.ports.iter().all(|port| !(1_000..1_200).contains(port)));
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn property_generated_ports_are_in_range_unique_and_unused(
            strategy in prop_oneof![
                Just(SelectionStrategy::Shuffle),
                Just(SelectionStrategy::Reservoir),
            ],
            min in 1_u16..2_000,
            width in 0_u16..300,
            used in proptest::collection::btree_set(1_u16..2_400, 0..80),
            count in 0_usize..120,
            seed in any::<u64>(),
        ) {
            let max = min.saturating_add(width);
            let span = range(i64::from(min), i64::from(max));
            let store = store_with_ports(&used.iter().copied().collect::<Vec<_>>());
            let mut rng = StdRng::seed_from_u64(seed);
            let available = span.iter().filter(|port| !used.contains(port)).count();

            match generate_with_strategy(&store, span, count, strategy, &mut rng) {
                Ok(batch) => {
                    prop_assert!(count <= available);
                    prop_assert_eq!(batch.ports.len(), count);
                    let distinct = batch.ports.iter().copied().collect::<BTreeSet<_>>();
                    prop_assert_eq!(distinct.len(), count);
                    for port in &batch.ports {
                        prop_assert!(span.contains(*port));
                        prop_assert!(!used.contains(port));
                    }
                }
                Err(err) => {
                    prop_assert_eq!(
                        err,
                        LedgerError::InsufficientRange { requested: count, available }
                    );
                }
            }
        }
    }
}
