//! Whole-suite evolution: chromosomes are entire suites, fitness
//! aggregates over all goals, and elitism preserves the best suites.
//!
//! # References
//!
//! - Fraser & Arcuri (2013): "Whole Test Suite Generation"

use rand::Rng;

use crate::fitness::GoalId;
use crate::ga::archive::CoverageArchive;
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use crate::testcase::crossover;

use super::{SearchAlgorithm, SearchContext};

/// Number of elite suites carried over unchanged each generation.
const ELITE_COUNT: usize = 1;
/// Probability of appending a fresh test during suite mutation.
const TEST_INSERTION_PROBABILITY: f64 = 0.1;

#[derive(Debug, Default)]
pub struct WholeSuiteSearch;

impl WholeSuiteSearch {
    fn random_suite(ctx: &mut SearchContext) -> TestSuiteChromosome {
        let count = ctx
            .rng
            .gen_range(1..=ctx.max_suite_length.clamp(1, 10));
        let mut suite = TestSuiteChromosome::default();
        for _ in 0..count {
            let test = ctx
                .factory
                .random_test_case(ctx.max_test_length, &mut ctx.rng);
            suite.push(TestCaseChromosome::new(test, 0));
        }
        suite
    }

    fn evaluate_suite(ctx: &mut SearchContext, suite: &mut TestSuiteChromosome) {
        ctx.evaluate(suite.tests_mut());
    }

    /// Mutates every member test with probability `1/size` and sometimes
    /// appends a fresh test.
    fn mutate_suite(ctx: &mut SearchContext, suite: &mut TestSuiteChromosome) {
        let size = suite.size().max(1);
        let per_test = 1.0 / size as f64;
        for test in suite.tests_mut() {
            if ctx.rng.gen::<f64>() < per_test {
                test.mutate(&ctx.factory, ctx.mutation, ctx.max_test_length, &mut ctx.rng);
            }
        }
        if suite.size() < ctx.max_suite_length
            && ctx.rng.gen::<f64>() < TEST_INSERTION_PROBABILITY
        {
            let test = ctx
                .factory
                .random_test_case(ctx.max_test_length, &mut ctx.rng);
            suite.push(TestCaseChromosome::new(test, ctx.iterations));
        }
    }

    /// Single-point crossover on the member lists.
    fn crossover_suites(
        ctx: &mut SearchContext,
        first: &TestSuiteChromosome,
        second: &TestSuiteChromosome,
    ) -> (TestSuiteChromosome, TestSuiteChromosome) {
        if first.is_empty() || second.is_empty() {
            return (first.clone(), second.clone());
        }
        // suite-level: swap tails of the member lists; member-level: splice
        // one pair of tests
        let cut_one = ctx.rng.gen_range(0..=first.size());
        let cut_two = ctx.rng.gen_range(0..=second.size());
        let mut child_one = TestSuiteChromosome::new(
            first.tests()[..cut_one]
                .iter()
                .chain(&second.tests()[cut_two..])
                .cloned()
                .collect(),
        );
        let mut child_two = TestSuiteChromosome::new(
            second.tests()[..cut_two]
                .iter()
                .chain(&first.tests()[cut_one..])
                .cloned()
                .collect(),
        );
        if !child_one.is_empty() && !child_two.is_empty() && ctx.rng.gen_bool(0.5) {
            let index_one = ctx.rng.gen_range(0..child_one.size());
            let index_two = ctx.rng.gen_range(0..child_two.size());
            let (spliced_one, spliced_two) = crossover(
                child_one.tests()[index_one].test(),
                child_two.tests()[index_two].test(),
                &mut ctx.rng,
            );
            child_one.tests_mut()[index_one] =
                TestCaseChromosome::new(spliced_one, ctx.iterations);
            child_two.tests_mut()[index_two] =
                TestCaseChromosome::new(spliced_two, ctx.iterations);
        }
        (child_one, child_two)
    }
}

impl SearchAlgorithm for WholeSuiteSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        let pool = ctx.pool.clone();
        let goals: Vec<GoalId> = pool.ids();
        // archive kept for coverage accounting and the final suite
        let mut archive = CoverageArchive::new(goals.iter().copied());
        ctx.stopping.start();

        let mut population: Vec<TestSuiteChromosome> = (0..ctx.population_size)
            .map(|_| Self::random_suite(ctx))
            .collect();
        for suite in &mut population {
            Self::evaluate_suite(ctx, suite);
            archive.update(suite.tests_mut(), &pool);
        }

        while !ctx.should_stop(archive.coverage(), archive.num_covered()) {
            let mut scored: Vec<(f64, usize)> = population
                .iter_mut()
                .enumerate()
                .map(|(index, suite)| (suite.fitness(&pool, &goals), index))
                .collect();
            scored.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        population[a.1]
                            .length()
                            .cmp(&population[b.1].length()),
                    )
            });

            let mut next: Vec<TestSuiteChromosome> = scored
                .iter()
                .take(ELITE_COUNT)
                .map(|&(_, index)| population[index].clone())
                .collect();

            while next.len() < ctx.population_size {
                let first = tournament(ctx, &scored);
                let second = tournament(ctx, &scored);
                let (mut child_one, mut child_two) = if ctx.should_crossover() {
                    Self::crossover_suites(ctx, &population[first], &population[second])
                } else {
                    (population[first].clone(), population[second].clone())
                };
                for child in [&mut child_one, &mut child_two] {
                    Self::mutate_suite(ctx, child);
                    Self::evaluate_suite(ctx, child);
                    archive.update(child.tests_mut(), &pool);
                }
                // offspring replace parents only when not worse, preferring
                // shorter suites on ties
                for (child, parent_index) in
                    [(child_one, first), (child_two, second)]
                {
                    let mut child = child;
                    let child_fitness = child.fitness(&pool, &goals);
                    let parent_fitness = population[parent_index].fitness(&pool, &goals);
                    let keep_child = child_fitness < parent_fitness
                        || (child_fitness == parent_fitness
                            && child.length() <= population[parent_index].length());
                    if next.len() < ctx.population_size {
                        next.push(if keep_child {
                            child
                        } else {
                            population[parent_index].clone()
                        });
                    }
                }
            }
            population = next;
            ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
        }

        // emit the best evolved suite, enriched by archive coverers
        let mut best = population
            .into_iter()
            .min_by(|a, b| {
                let mut a = a.clone();
                let mut b = b.clone();
                a.fitness(&pool, &goals)
                    .partial_cmp(&b.fitness(&pool, &goals))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or_default();
        for solution in archive.solutions() {
            if !best
                .tests()
                .iter()
                .any(|t| t.test().structurally_equal(solution.test()))
            {
                best.push(solution);
            }
        }
        best.deduplicate();
        best
    }
}

/// Binary tournament over the pre-scored population.
fn tournament(ctx: &mut SearchContext, scored: &[(f64, usize)]) -> usize {
    let a = ctx.rng.gen_range(0..scored.len());
    let b = ctx.rng.gen_range(0..scored.len());
    // scored is sorted best-first, so the smaller position wins
    let winner = a.min(b);
    scored[winner].1
}
