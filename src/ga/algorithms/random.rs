//! Random baselines: feedback-directed random test growth and pure random
//! suite sampling.
//!
//! # References
//!
//! - Pacheco & Ernst (2007): "Randoop: Feedback-Directed Random Testing"

use rand::Rng;

use crate::ga::archive::CoverageArchive;
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};

use super::{suite_from_solutions, SearchAlgorithm, SearchContext};

/// Feedback-directed random generation: pick a random callable, extend an
/// existing passing test with it, and partition the outcome into passing
/// and failing pools. Duplicates are dropped by structural equality.
#[derive(Debug, Default)]
pub struct RandomTestSearch;

impl SearchAlgorithm for RandomTestSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        let pool = ctx.pool.clone();
        let mut archive = CoverageArchive::new(pool.ids());
        ctx.stopping.start();

        let mut passing: Vec<TestCaseChromosome> = Vec::new();
        let mut failing: Vec<TestCaseChromosome> = Vec::new();

        while !ctx.should_stop(archive.coverage(), archive.num_covered()) {
            let mut test = if passing.is_empty() || ctx.rng.gen_bool(0.3) {
                crate::testcase::TestCase::new()
            } else {
                passing[ctx.rng.gen_range(0..passing.len())].test().clone()
            };
            let Some(callable) = ctx.factory.cluster().clone().random_accessible(&mut ctx.rng)
            else {
                break;
            };
            if ctx.factory.add_call(&mut test, &callable, &mut ctx.rng).is_none() {
                ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
                continue;
            }
            test.chop(ctx.max_test_length);

            let duplicate = passing
                .iter()
                .chain(failing.iter())
                .any(|existing| existing.test().structurally_equal(&test));
            if duplicate {
                ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
                continue;
            }

            let mut chromosome = TestCaseChromosome::new(test, ctx.iterations);
            ctx.evaluate(std::slice::from_mut(&mut chromosome));
            archive.update(std::slice::from_mut(&mut chromosome), &pool);

            let failed = chromosome.timed_out()
                || chromosome
                    .result()
                    .map_or(true, crate::execution::trace::ExecutionResult::has_exceptions);
            if failed {
                failing.push(chromosome);
            } else {
                passing.push(chromosome);
            }

            ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
        }

        suite_from_solutions(archive.solutions(), ctx.max_suite_length)
    }
}

/// Pure random search: sample fresh tests every iteration, ignore history.
#[derive(Debug, Default)]
pub struct RandomSearch;

impl SearchAlgorithm for RandomSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        let pool = ctx.pool.clone();
        let mut archive = CoverageArchive::new(pool.ids());
        ctx.stopping.start();

        while !ctx.should_stop(archive.coverage(), archive.num_covered()) {
            let mut batch: Vec<TestCaseChromosome> = (0..ctx.population_size)
                .map(|_| {
                    let test = ctx
                        .factory
                        .random_test_case(ctx.max_test_length, &mut ctx.rng);
                    TestCaseChromosome::new(test, ctx.iterations)
                })
                .collect();
            ctx.evaluate(&mut batch);
            archive.update(&mut batch, &pool);
            ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
        }

        suite_from_solutions(archive.solutions(), ctx.max_suite_length)
    }
}
