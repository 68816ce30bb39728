//! The search algorithms: shared context, the common evolution loop
//! skeleton, and the concrete strategies (DynaMOSA, MOSA, MIO, whole-suite,
//! and the random baselines).

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::info;

use crate::execution::executor::{IsolatedExecutor, TestCaseExecutor};
use crate::execution::trace::ExecutionResult;
use crate::fitness::GoalPool;
use crate::testcase::factory::TestFactory;
use crate::testcase::TestCase;

use super::chromosome::{MutationProbabilities, TestCaseChromosome, TestSuiteChromosome};
use super::selection::Selection;
use super::stopping::{CompositeStoppingCondition, SearchStatus};

pub mod mio;
pub mod mosa;
pub mod random;
pub mod whole_suite;

pub use mio::MioSearch;
pub use mosa::{DynaMosaSearch, MosaSearch};
pub use random::{RandomSearch, RandomTestSearch};
pub use whole_suite::WholeSuiteSearch;

/// Observer of per-iteration progress.
pub trait SearchObserver {
    fn iteration(&mut self, iteration: u64, coverage: f64, archive_size: usize);
}

/// How test cases reach the instrumented module.
pub enum ExecutorKind {
    /// One worker thread per test.
    PerTest(TestCaseExecutor),
    /// Long-lived isolated worker, batched.
    Isolated(IsolatedExecutor),
}

impl ExecutorKind {
    pub fn execute_all(&mut self, tests: &[TestCase]) -> Vec<ExecutionResult> {
        match self {
            ExecutorKind::PerTest(executor) => {
                tests.iter().map(|t| executor.execute(t)).collect()
            }
            ExecutorKind::Isolated(executor) => executor.execute_batch(tests.to_vec()),
        }
    }

    #[must_use]
    pub fn test_executions(&self) -> u64 {
        match self {
            ExecutorKind::PerTest(executor) => executor.executed_tests(),
            ExecutorKind::Isolated(executor) => executor.executed_tests(),
        }
    }

    #[must_use]
    pub fn statement_executions(&self) -> u64 {
        match self {
            ExecutorKind::PerTest(executor) => executor.executed_statements(),
            ExecutorKind::Isolated(executor) => executor.executed_statements(),
        }
    }
}

/// Everything a strategy needs to run: operators, budget, and the seeded
/// PRNG every stochastic choice must consult.
pub struct SearchContext {
    pub factory: TestFactory,
    pub executor: ExecutorKind,
    pub pool: Arc<GoalPool>,
    pub rng: StdRng,
    pub population_size: usize,
    pub max_test_length: usize,
    pub max_suite_length: usize,
    pub crossover_probability: f64,
    pub mutation: MutationProbabilities,
    pub selection: Selection,
    pub stopping: CompositeStoppingCondition,
    pub observers: Vec<Box<dyn SearchObserver>>,
    pub iterations: u64,
}

impl SearchContext {
    /// Executes every not-yet-evaluated chromosome in the slice.
    pub fn evaluate(&mut self, population: &mut [TestCaseChromosome]) {
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, c)| c.result().is_none())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return;
        }
        let tests: Vec<TestCase> = pending
            .iter()
            .map(|&i| population[i].test().clone())
            .collect();
        let results = self.executor.execute_all(&tests);
        for (&index, result) in pending.iter().zip(results) {
            population[index].set_result(result);
        }
    }

    /// Fresh random population of evaluated chromosomes.
    pub fn initial_population(&mut self) -> Vec<TestCaseChromosome> {
        let mut population = Vec::with_capacity(self.population_size);
        for _ in 0..self.population_size {
            let test = self
                .factory
                .random_test_case(self.max_test_length, &mut self.rng);
            population.push(TestCaseChromosome::new(test, 0));
        }
        self.evaluate(&mut population);
        population
    }

    #[must_use]
    pub fn status(&self, coverage: f64, covered_goals: usize) -> SearchStatus {
        SearchStatus {
            iterations: self.iterations,
            test_executions: self.executor.test_executions(),
            statement_executions: self.executor.statement_executions(),
            coverage,
            covered_goals,
        }
    }

    /// Ends one iteration: feeds stopping conditions and observers.
    pub fn finish_iteration(&mut self, coverage: f64, covered_goals: usize, archive_size: usize) {
        self.iterations += 1;
        let status = self.status(coverage, covered_goals);
        self.stopping.observe_iteration(&status);
        for observer in &mut self.observers {
            observer.iteration(self.iterations, coverage, archive_size);
        }
        info!(
            iteration = self.iterations,
            coverage = format!("{coverage:.4}"),
            archive = archive_size,
            "iteration complete"
        );
    }

    /// Whether the loop must exit before starting another iteration.
    #[must_use]
    pub fn should_stop(&self, coverage: f64, covered_goals: usize) -> bool {
        let status = self.status(coverage, covered_goals);
        if let Some(reason) = self.stopping.fired(&status) {
            info!(%reason, "stopping condition fired");
            return true;
        }
        false
    }

    /// A random boolean with the configured crossover probability.
    pub fn should_crossover(&mut self) -> bool {
        self.rng.gen::<f64>() < self.crossover_probability
    }
}

/// A search strategy producing a final test suite.
pub trait SearchAlgorithm {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome;
}

/// Wraps archive solutions into the final suite, bounded by the configured
/// suite length.
pub fn suite_from_solutions(
    mut solutions: Vec<TestCaseChromosome>,
    max_suite_length: usize,
) -> TestSuiteChromosome {
    // shortest tests first so truncation loses the least valuable ones last
    solutions.sort_by_key(TestCaseChromosome::size);
    if max_suite_length > 0 && solutions.len() > max_suite_length {
        solutions.truncate(max_suite_length);
    }
    TestSuiteChromosome::new(solutions)
}
