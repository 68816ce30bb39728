//! Property tests over the structural invariants of the test-case model
//! and the tracer distance functions.

use std::sync::Arc;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use forjar::cluster::{ClusterFilters, TestCluster};
use forjar::execution::tracer::{compare_distances, normalize};
use forjar::lang::ast::CompareOp;
use forjar::lang::parser::parse_module;
use forjar::lang::value::Value;
use forjar::seeding::ConstantPool;
use forjar::testcase::factory::{FactoryOptions, TestFactory};
use forjar::testcase::{crossover, TestCase};

const TARGET: &str = r#"
def mix(a: int, b: float, label: str) -> float { return b }
def tail(items: list) -> int | none { return none }
class Box {
    def init(self, start: int) { self.value = start }
    def bump(self, by: int) -> int { return by }
}
"#;

fn factory() -> TestFactory {
    let ast = parse_module("m", TARGET).expect("parse");
    let cluster = Arc::new(TestCluster::from_module(&ast, &ClusterFilters::default()));
    TestFactory::new(
        cluster,
        Arc::new(ConstantPool::new()),
        FactoryOptions::default(),
    )
}

fn arbitrary_test(seed: u64, max_len: usize) -> TestCase {
    let factory = factory();
    let mut rng = StdRng::seed_from_u64(seed);
    factory.random_test_case(max_len.max(1), &mut rng)
}

proptest! {
    /// Every test the factory produces satisfies reference-before-use.
    #[test]
    fn factory_output_has_valid_references(seed in any::<u64>(), max_len in 1usize..20) {
        let test = arbitrary_test(seed, max_len);
        prop_assert!(test.references_valid());
        prop_assert!(test.size() <= max_len);
    }

    /// Reference validity survives arbitrary mutation chains.
    #[test]
    fn mutation_chains_preserve_reference_validity(
        seed in any::<u64>(),
        ops in proptest::collection::vec(0u8..3, 1..12),
    ) {
        let factory = factory();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut test = factory.random_test_case(8, &mut rng);
        for op in ops {
            match op {
                0 => { factory.mutate_delete(&mut test, &mut rng); }
                1 => { factory.mutate_change(&mut test, &mut rng); }
                _ => { factory.mutate_insert(&mut test, 10, &mut rng); }
            }
            prop_assert!(test.references_valid());
            prop_assert!(test.size() <= 10);
        }
    }

    /// Crossover offspring are closed under the reference relation and
    /// bounded by the longer parent.
    #[test]
    fn crossover_offspring_are_closed(seed_one in any::<u64>(), seed_two in any::<u64>()) {
        let p1 = arbitrary_test(seed_one, 9);
        let p2 = arbitrary_test(seed_two, 14);
        let mut rng = StdRng::seed_from_u64(seed_one ^ seed_two);
        let (o1, o2) = crossover(&p1, &p2, &mut rng);
        prop_assert!(o1.references_valid());
        prop_assert!(o2.references_valid());
        prop_assert!(o1.size() <= p1.size().max(p2.size()));
        prop_assert!(o2.size() <= p1.size().max(p2.size()));
    }

    /// Chopping keeps the remaining reference graph closed.
    #[test]
    fn chopping_keeps_the_graph_closed(seed in any::<u64>(), keep in 1usize..12) {
        let mut test = arbitrary_test(seed, 12);
        test.chop(keep);
        prop_assert!(test.size() <= keep);
        prop_assert!(test.references_valid());
    }

    /// Normalized distances lie in the unit interval and exactly one branch
    /// outcome is satisfied.
    #[test]
    fn branch_distances_are_normalized(left in any::<i64>(), right in any::<i64>(), op in 0u8..6) {
        let op = match op {
            0 => CompareOp::Eq,
            1 => CompareOp::Ne,
            2 => CompareOp::Lt,
            3 => CompareOp::Le,
            4 => CompareOp::Gt,
            _ => CompareOp::Ge,
        };
        let (t, f) = compare_distances(op, &Value::Int(left), &Value::Int(right));
        prop_assert!(t >= 0.0 && f >= 0.0);
        prop_assert!(t == 0.0 || f == 0.0, "one outcome must be satisfied");
        prop_assert!(!(t == 0.0 && f == 0.0), "outcomes are mutually exclusive");
        let (nt, nf) = (normalize(t), normalize(f));
        prop_assert!((0.0..=1.0).contains(&nt));
        prop_assert!((0.0..=1.0).contains(&nf));
    }

    /// String comparisons obey the same contract.
    #[test]
    fn string_distances_are_normalized(a in "[a-c]{0,6}", b in "[a-c]{0,6}", op in 0u8..4) {
        let op = match op {
            0 => CompareOp::Eq,
            1 => CompareOp::Ne,
            2 => CompareOp::Lt,
            _ => CompareOp::Le,
        };
        let (t, f) = compare_distances(op, &Value::str(a), &Value::str(b));
        prop_assert!(t == 0.0 || f == 0.0);
        prop_assert!((0.0..=1.0).contains(&normalize(t)));
        prop_assert!((0.0..=1.0).contains(&normalize(f)));
    }

    /// Structural equality is invariant under cloning.
    #[test]
    fn clones_are_structurally_equal(seed in any::<u64>()) {
        let test = arbitrary_test(seed, 10);
        prop_assert!(test.structurally_equal(&test.clone()));
    }
}
