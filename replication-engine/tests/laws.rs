//! Randomized checks of the version partial order and clock monotonicity.

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replication_engine::message::Content;
use replication_engine::order::{LamportOrder, Order, VectorOrder};
use replication_engine::version::{HybridTimestamp, NodeId, Version, VersionOrder};

const ROUNDS: usize = 2_000;

fn random_version(rng: &mut StdRng) -> Version {
    let entries: Vec<(NodeId, u64)> = (0..rng.gen_range(0..4))
        .map(|_| (rng.gen_range(0..4), rng.gen_range(0..4)))
        .collect();
    Version::from_entries(entries)
}

#[test]
fn comparison_is_antisymmetric_and_reflexive() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..ROUNDS {
        let a = random_version(&mut rng);
        let b = random_version(&mut rng);
        assert_eq!(a.compare(&b), b.compare(&a).reverse(), "{a} vs {b}");
        assert_eq!(a.compare(&a), VersionOrder::Tie);
    }
}

#[test]
fn increment_moves_strictly_forward() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..ROUNDS {
        let base = random_version(&mut rng);
        let node = rng.gen_range(0..4);
        let next = base.incremented(node, 0);
        assert_eq!(base.compare(&next), VersionOrder::Before, "{base} -> {next}");
        assert!(next.satisfies(&base));
        assert!(!base.satisfies(&next));
    }
}

#[test]
fn merge_is_an_upper_bound() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..ROUNDS {
        let a = random_version(&mut rng);
        let b = random_version(&mut rng);
        let merged = a.merge(&b);
        assert!(merged.satisfies(&a), "{merged} should cover {a}");
        assert!(merged.satisfies(&b), "{merged} should cover {b}");
        assert_eq!(merged.compare(&b.merge(&a)), VersionOrder::Tie);
    }
}

#[test]
fn comparison_is_transitive() {
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..ROUNDS {
        let a = random_version(&mut rng);
        let b = a.merge(&random_version(&mut rng));
        let c = b.merge(&random_version(&mut rng));
        assert!(matches!(
            a.compare(&c),
            VersionOrder::Before | VersionOrder::Tie
        ));
    }
}

#[test]
fn lamport_stamps_increase_under_concurrency() {
    let order = Arc::new(LamportOrder::new(3));
    let observer = {
        let order = Arc::clone(&order);
        thread::spawn(move || {
            for logical in 0..500 {
                let remote = HybridTimestamp::pack(logical * 2, 1);
                order.update_clock(&Version::from_entries([(1, remote.raw())]));
            }
        })
    };

    let content = Content::new("k", None);
    let mut last = 0;
    for _ in 0..500 {
        let counter = order.time_stamping(&content, None, 0).counter(3);
        assert!(counter > last);
        last = counter;
    }
    observer.join().expect("observer thread");
}

#[test]
fn vector_stamps_increase_for_the_local_node() {
    let order = VectorOrder::new(2);
    let content = Content::new("k", None);
    let mut rng = StdRng::seed_from_u64(3);
    let mut last = 0;
    for _ in 0..ROUNDS {
        let durable = random_version(&mut rng);
        let stamped = order.time_stamping(&content, Some(&durable), 0);
        assert_eq!(durable.compare(&stamped), VersionOrder::Before);
        assert!(stamped.counter(2) > last);
        last = stamped.counter(2);
    }
}
