//! Chromosomes of the search: single test cases and whole suites, with the
//! per-chromosome computation cache for fitness and coverage values.
//!
//! The cache memoizes goal fitness against the most recent execution
//! result; any structural mutation invalidates it. Coverage is inferred
//! from a zero fitness, never recomputed separately.

use std::collections::HashMap;

use rand::Rng;

use crate::execution::trace::ExecutionResult;
use crate::fitness::{GoalId, GoalPool};
use crate::testcase::factory::TestFactory;
use crate::testcase::TestCase;

/// Independent application probabilities of the test-case mutations.
#[derive(Debug, Clone, Copy)]
pub struct MutationProbabilities {
    pub insert: f64,
    pub change: f64,
    pub delete: f64,
}

impl Default for MutationProbabilities {
    fn default() -> Self {
        Self {
            insert: 1.0 / 3.0,
            change: 1.0 / 3.0,
            delete: 1.0 / 3.0,
        }
    }
}

/// A test case plus its execution state and fitness cache.
#[derive(Debug, Clone)]
pub struct TestCaseChromosome {
    test: TestCase,
    result: Option<ExecutionResult>,
    cache: HashMap<GoalId, f64>,
    changed: bool,
    /// Generation the chromosome was created in, for reporting.
    pub birth_iteration: u64,
}

impl TestCaseChromosome {
    #[must_use]
    pub fn new(test: TestCase, birth_iteration: u64) -> Self {
        Self {
            test,
            result: None,
            cache: HashMap::new(),
            changed: true,
            birth_iteration,
        }
    }

    #[must_use]
    pub fn test(&self) -> &TestCase {
        &self.test
    }

    /// Mutable access to the underlying test; marks the chromosome changed.
    pub fn test_mut(&mut self) -> &mut TestCase {
        self.invalidate();
        &mut self.test
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.test.size()
    }

    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Marks the chromosome structurally changed, dropping cached state.
    pub fn invalidate(&mut self) {
        self.changed = true;
        self.cache.clear();
        self.result = None;
    }

    #[must_use]
    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: ExecutionResult) {
        self.result = Some(result);
        self.cache.clear();
        self.changed = false;
    }

    /// Whether the last execution timed out; such chromosomes never enter
    /// the archive.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.timed_out)
    }

    /// Cached goal fitness. Requires an execution result.
    pub fn fitness(&mut self, pool: &GoalPool, goal: GoalId) -> f64 {
        if let Some(&cached) = self.cache.get(&goal) {
            return cached;
        }
        let value = match &self.result {
            Some(result) => pool.fitness(goal, result),
            None => f64::INFINITY,
        };
        self.cache.insert(goal, value);
        value
    }

    /// Whether the goal is covered, inferred from fitness.
    pub fn covers(&mut self, pool: &GoalPool, goal: GoalId) -> bool {
        self.fitness(pool, goal) == 0.0
    }

    /// Sum of fitness over the given goals.
    pub fn aggregated_fitness(&mut self, pool: &GoalPool, goals: &[GoalId]) -> f64 {
        goals.iter().map(|&g| self.fitness(pool, g)).sum()
    }

    /// Applies the three mutation operators, each with its own probability,
    /// then re-establishes the length bound by chopping.
    pub fn mutate(
        &mut self,
        factory: &TestFactory,
        probabilities: MutationProbabilities,
        max_test_length: usize,
        rng: &mut impl Rng,
    ) {
        let mut mutated = false;
        if rng.gen::<f64>() < probabilities.delete && factory.mutate_delete(&mut self.test, rng)
        {
            mutated = true;
        }
        if rng.gen::<f64>() < probabilities.change && factory.mutate_change(&mut self.test, rng)
        {
            mutated = true;
        }
        if rng.gen::<f64>() < probabilities.insert
            && factory.mutate_insert(&mut self.test, max_test_length, rng)
        {
            mutated = true;
        }
        if self.test.size() > max_test_length {
            self.test.chop(max_test_length);
            mutated = true;
        }
        if self.test.is_empty() {
            // an empty test helps nobody; regrow a minimal one
            self.test = factory.random_test_case(max_test_length, rng);
            mutated = true;
        }
        if mutated {
            self.invalidate();
        }
        debug_assert!(self.test.references_valid());
    }
}

/// A multiset of test cases evolved as one unit (whole-suite mode).
#[derive(Debug, Clone, Default)]
pub struct TestSuiteChromosome {
    tests: Vec<TestCaseChromosome>,
}

impl TestSuiteChromosome {
    #[must_use]
    pub fn new(tests: Vec<TestCaseChromosome>) -> Self {
        Self { tests }
    }

    #[must_use]
    pub fn tests(&self) -> &[TestCaseChromosome] {
        &self.tests
    }

    pub fn tests_mut(&mut self) -> &mut Vec<TestCaseChromosome> {
        &mut self.tests
    }

    pub fn push(&mut self, test: TestCaseChromosome) {
        self.tests.push(test);
    }

    /// Total statement count over all member tests.
    #[must_use]
    pub fn length(&self) -> usize {
        self.tests.iter().map(TestCaseChromosome::size).sum()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.tests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Suite fitness: per goal, the best member fitness; summed.
    pub fn fitness(&mut self, pool: &GoalPool, goals: &[GoalId]) -> f64 {
        goals
            .iter()
            .map(|&goal| {
                self.tests
                    .iter_mut()
                    .map(|t| t.fitness(pool, goal))
                    .fold(f64::INFINITY, f64::min)
            })
            .map(|f| if f.is_finite() { f } else { 1.0 })
            .sum()
    }

    /// Fraction of goals covered by at least one member.
    pub fn coverage(&mut self, pool: &GoalPool, goals: &[GoalId]) -> f64 {
        if goals.is_empty() {
            return 1.0;
        }
        let covered = goals
            .iter()
            .filter(|&&goal| self.tests.iter_mut().any(|t| t.covers(pool, goal)))
            .count();
        covered as f64 / goals.len() as f64
    }

    /// Structural deduplication of member tests.
    pub fn deduplicate(&mut self) {
        let mut kept: Vec<TestCaseChromosome> = Vec::with_capacity(self.tests.len());
        for test in self.tests.drain(..) {
            if !kept
                .iter()
                .any(|existing| existing.test().structurally_equal(test.test()))
            {
                kept.push(test);
            }
        }
        self.tests = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterFilters, TestCluster};
    use crate::lang::parser::parse_module;
    use crate::seeding::ConstantPool;
    use crate::testcase::factory::FactoryOptions;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn factory() -> TestFactory {
        let ast = parse_module(
            "m",
            "def add(a: int, b: int) -> int { return a + b }",
        )
        .expect("parse");
        let cluster = Arc::new(TestCluster::from_module(&ast, &ClusterFilters::default()));
        TestFactory::new(
            cluster,
            Arc::new(ConstantPool::new()),
            FactoryOptions::default(),
        )
    }

    #[test]
    fn mutation_invalidates_cache_and_result() {
        let factory = factory();
        let mut rng = StdRng::seed_from_u64(1);
        let test = factory.random_test_case(6, &mut rng);
        let mut chromosome = TestCaseChromosome::new(test, 0);
        chromosome.set_result(ExecutionResult::default());
        assert!(!chromosome.has_changed());
        chromosome.mutate(
            &factory,
            MutationProbabilities {
                insert: 1.0,
                change: 0.0,
                delete: 0.0,
            },
            10,
            &mut rng,
        );
        assert!(chromosome.has_changed());
        assert!(chromosome.result().is_none());
    }

    #[test]
    fn mutation_respects_length_bound() {
        let factory = factory();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            let test = factory.random_test_case(6, &mut rng);
            let mut chromosome = TestCaseChromosome::new(test, 0);
            chromosome.mutate(
                &factory,
                MutationProbabilities::default(),
                6,
                &mut rng,
            );
            assert!(chromosome.size() <= 6);
            assert!(chromosome.test().references_valid());
        }
    }

    #[test]
    fn suite_deduplicates_structurally_equal_members() {
        let factory = factory();
        let mut rng = StdRng::seed_from_u64(3);
        let test = factory.random_test_case(4, &mut rng);
        let mut suite = TestSuiteChromosome::default();
        suite.push(TestCaseChromosome::new(test.clone(), 0));
        suite.push(TestCaseChromosome::new(test, 0));
        suite.deduplicate();
        assert_eq!(suite.size(), 1);
    }
}
