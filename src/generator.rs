//! The generation entry point: wires instrumentation, cluster, search,
//! and assertion generation together for one target module.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::assertion::mutation::{filter_assertions, MutationAnalysisOptions};
use crate::assertion::{generate_assertions, AssertionOptions};
use crate::cluster::{ClusterFilters, TestCluster};
use crate::config::{
    Algorithm, AssertionStrategy, Configuration, ConfigurationError, ExitCode, SelectionConfig,
    StoppingConfig,
};
use crate::execution::executor::{ExecutorOptions, IsolatedExecutor, TestCaseExecutor};
use crate::execution::tracer::{ExecutionTracer, TracerHandle};
use crate::execution::vm::native_names;
use crate::fitness::{CoverageMetrics, GoalPool};
use crate::ga::algorithms::{
    DynaMosaSearch, ExecutorKind, MioSearch, MosaSearch, RandomSearch, RandomTestSearch,
    SearchAlgorithm, SearchContext, SearchObserver,
};
use crate::ga::chromosome::MutationProbabilities;
use crate::ga::selection::Selection;
use crate::ga::stopping::{CompositeStoppingCondition, StoppingCondition};
use crate::instrumentation::{InstrumentationError, InstrumentationOptions, Instrumenter};
use crate::lang::{compile_module, LoadError, Project};
use crate::seeding::{harvest_static_constants, ConstantPool};
use crate::statistics::RunStatistics;
use crate::testcase::factory::{FactoryOptions, TestFactory};
use crate::testcase::TestCase;

/// Environment flag the host must set before any target code is loaded.
pub const CONSENT_ENV: &str = "FORJAR_ALLOW_TARGET_EXECUTION";

/// Fatal failure of a generation run.
#[derive(Debug)]
pub enum GenerationError {
    /// The consent flag is missing; no target code was loaded.
    ConsentMissing,
    Configuration(ConfigurationError),
    /// Parsing, compiling, or instrumenting the target failed.
    Setup(SetupError),
}

#[derive(Debug)]
pub enum SetupError {
    Load(LoadError),
    Instrumentation(InstrumentationError),
    EmptyCluster(String),
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::ConsentMissing => write!(
                f,
                "refusing to execute target code: set {CONSENT_ENV} to opt in"
            ),
            GenerationError::Configuration(err) => write!(f, "{err}"),
            GenerationError::Setup(SetupError::Load(err)) => write!(f, "setup failed: {err}"),
            GenerationError::Setup(SetupError::Instrumentation(err)) => {
                write!(f, "setup failed: {err}")
            }
            GenerationError::Setup(SetupError::EmptyCluster(module)) => {
                write!(f, "setup failed: no accessible callables in module {module}")
            }
        }
    }
}

impl std::error::Error for GenerationError {}

impl GenerationError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            GenerationError::ConsentMissing => ExitCode::ConsentMissing,
            GenerationError::Configuration(_) => ExitCode::Configuration,
            GenerationError::Setup(_) => ExitCode::Setup,
        }
    }
}

/// Result of a completed run: the assertion-enriched tests for the external
/// unparser plus the reporting record.
#[derive(Debug)]
pub struct GenerationReport {
    pub tests: Vec<TestCase>,
    pub coverage: f64,
    pub covered_goals: usize,
    pub total_goals: usize,
    pub iterations: u64,
    pub mutation_score: Option<f64>,
    /// Coverage after each iteration, from the observer hook.
    pub iteration_history: Vec<f64>,
    pub statistics: RunStatistics,
}

impl GenerationReport {
    /// Exit code 0 when at least one goal is covered, 3 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.covered_goals > 0 {
            ExitCode::Success
        } else {
            ExitCode::NoCoverage
        }
    }
}

/// Records per-iteration coverage for the report.
#[derive(Default)]
struct HistoryObserver {
    history: std::sync::Arc<std::sync::Mutex<Vec<f64>>>,
}

impl SearchObserver for HistoryObserver {
    fn iteration(&mut self, _iteration: u64, coverage: f64, _archive_size: usize) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(coverage);
    }
}

/// Runs the whole pipeline for one target module.
pub fn generate(
    project: &Project,
    module_name: &str,
    config: &Configuration,
) -> Result<GenerationReport, GenerationError> {
    if std::env::var_os(CONSENT_ENV).is_none() {
        return Err(GenerationError::ConsentMissing);
    }
    config.validate().map_err(GenerationError::Configuration)?;
    if config.exclude_modules.iter().any(|m| m == module_name) {
        return Err(GenerationError::Configuration(ConfigurationError {
            message: format!("target module {module_name} is excluded"),
        }));
    }
    let started = Instant::now();

    // --- setup phase: parse, compile, instrument, enumerate ---
    let ast = project
        .parse(module_name)
        .map_err(|e| GenerationError::Setup(SetupError::Load(e)))?;
    let module = compile_module(&ast)
        .map_err(|e| GenerationError::Setup(SetupError::Load(LoadError::Compile(e))))?;

    let pool = Arc::new(ConstantPool::new());
    if let Some(path) = &config.seed_constants_file {
        if let Ok(text) = std::fs::read_to_string(path) {
            pool.load_csv(&text);
            debug!(entries = pool.len(), "loaded seed constants");
        }
    }
    harvest_static_constants(&ast, &pool);

    let mut tracer = ExecutionTracer::new(pool.clone());
    let instrumentation_options = InstrumentationOptions {
        branch_coverage: config.coverage_metrics.branch,
        line_coverage: config.coverage_metrics.line || config.coverage_metrics.checked,
        checked_coverage: config.coverage_metrics.checked,
        dynamic_seeding: true,
        excluded_lines: config.excluded_lines.iter().copied().collect(),
    };
    let instrumenter = Instrumenter::new(instrumentation_options, native_names());
    let instrumented = instrumenter
        .instrument_module(&module, &mut tracer)
        .map_err(|e| GenerationError::Setup(SetupError::Instrumentation(e)))?;
    let instrumented = Arc::new(instrumented);

    let filters = ClusterFilters {
        include_methods: config.include_methods.clone(),
        exclude_methods: config.exclude_methods.clone(),
    };
    let cluster = Arc::new(TestCluster::from_module(&ast, &filters));
    if cluster.is_empty() {
        return Err(GenerationError::Setup(SetupError::EmptyCluster(
            module_name.to_string(),
        )));
    }
    info!(
        callables = cluster.accessible().len(),
        "test cluster constructed"
    );

    let subject = Arc::new(tracer.subject().clone());
    let goal_pool = Arc::new(GoalPool::new(
        subject,
        CoverageMetrics {
            branch: config.coverage_metrics.branch,
            line: config.coverage_metrics.line,
            checked: config.coverage_metrics.checked,
        },
    ));
    let total_goals = goal_pool.len();
    let tracer_handle = TracerHandle::new(tracer);

    // --- search phase ---
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
    info!(seed, "search seeded");
    let rng = StdRng::seed_from_u64(seed);

    let executor_options = ExecutorOptions {
        per_statement_timeout: config.timeouts.per_statement(),
        per_test_timeout: config.timeouts.per_test(),
        ..ExecutorOptions::default()
    };
    let executor = if config.subprocess {
        ExecutorKind::Isolated(IsolatedExecutor::new(
            instrumented.clone(),
            tracer_handle.clone(),
            executor_options.clone(),
        ))
    } else {
        ExecutorKind::PerTest(TestCaseExecutor::new(
            instrumented.clone(),
            tracer_handle.clone(),
            executor_options.clone(),
        ))
    };

    let mut stopping: Vec<StoppingCondition> = config
        .stopping
        .iter()
        .map(|condition| match condition {
            StoppingConfig::MaxTimeSeconds(seconds) => {
                StoppingCondition::max_time(std::time::Duration::from_secs(*seconds))
            }
            StoppingConfig::MaxIterations(limit) => StoppingCondition::max_iterations(*limit),
            StoppingConfig::MaxStatementExecutions(limit) => {
                StoppingCondition::MaxStatementExecutions { limit: *limit }
            }
            StoppingConfig::MaxTestExecutions(limit) => {
                StoppingCondition::MaxTestExecutions { limit: *limit }
            }
            StoppingConfig::MaxCoverage(limit) => StoppingCondition::MaxCoverage { limit: *limit },
            StoppingConfig::CoveragePlateau(patience) => {
                StoppingCondition::coverage_plateau(*patience)
            }
            StoppingConfig::MaxMemoryBytes(limit) => StoppingCondition::MaxMemory {
                limit_bytes: *limit,
            },
        })
        .collect();
    if let Some(total_ms) = config.timeouts.total_ms {
        stopping.push(StoppingCondition::max_time(std::time::Duration::from_millis(
            total_ms,
        )));
    }

    let history = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let observer = HistoryObserver {
        history: history.clone(),
    };

    let mut context = SearchContext {
        factory: TestFactory::new(cluster, pool.clone(), FactoryOptions::default()),
        executor,
        pool: goal_pool.clone(),
        rng,
        population_size: config.population_size,
        max_test_length: config.max_test_length,
        max_suite_length: config.max_suite_length,
        crossover_probability: config.crossover_probability,
        mutation: MutationProbabilities {
            insert: config.mutation_probabilities.insert,
            change: config.mutation_probabilities.change,
            delete: config.mutation_probabilities.delete,
        },
        selection: match config.selection {
            SelectionConfig::Rank { bias } => Selection::Rank { bias },
            SelectionConfig::Tournament { size } => Selection::Tournament { size },
        },
        stopping: CompositeStoppingCondition::new(stopping),
        observers: vec![Box::new(observer)],
        iterations: 0,
    };

    let mut suite = match config.algorithm {
        Algorithm::DynaMosa => DynaMosaSearch::default().generate_tests(&mut context),
        Algorithm::Mosa => MosaSearch::default().generate_tests(&mut context),
        Algorithm::Mio => MioSearch::default().generate_tests(&mut context),
        Algorithm::WholeSuite => {
            crate::ga::algorithms::WholeSuiteSearch::default().generate_tests(&mut context)
        }
        Algorithm::Random => RandomTestSearch::default().generate_tests(&mut context),
        Algorithm::RandomSearch => RandomSearch::default().generate_tests(&mut context),
    };
    suite.deduplicate();
    let iterations = context.iterations;

    let mut tests: Vec<TestCase> = suite.tests().iter().map(|c| c.test().clone()).collect();
    let covered_goals = {
        let mut chromosomes: Vec<_> = suite.tests().to_vec();
        goal_pool
            .ids()
            .into_iter()
            .filter(|&goal| {
                chromosomes
                    .iter_mut()
                    .any(|c| c.covers(&goal_pool, goal))
            })
            .count()
    };
    let coverage = if total_goals == 0 {
        1.0
    } else {
        covered_goals as f64 / total_goals as f64
    };
    info!(coverage = format!("{coverage:.4}"), tests = tests.len(), "search finished");

    // --- assertion phase ---
    let mut mutation_score = None;
    if config.assertion_strategy != AssertionStrategy::None && !tests.is_empty() {
        let mut assertion_executor = TestCaseExecutor::new(
            instrumented.clone(),
            tracer_handle.clone(),
            executor_options.clone(),
        );
        generate_assertions(
            &mut tests,
            &mut assertion_executor,
            &AssertionOptions::default(),
        );
        if config.assertion_strategy == AssertionStrategy::Mutation {
            let report = filter_assertions(
                &mut tests,
                &ast,
                &MutationAnalysisOptions {
                    operators: config.mutation_operators.clone(),
                    higher_order: config.higher_order_mutants,
                    executor: executor_options,
                    float_tolerance: 1e-6,
                },
            );
            if report.mutants_created > 0 {
                mutation_score = Some(report.score());
                info!(
                    created = report.mutants_created,
                    killed = report.mutants_killed,
                    score = format!("{:.4}", report.score()),
                    "mutation analysis finished"
                );
            }
        }
    }

    // --- reporting phase ---
    if let Some(path) = &config.seed_constants_file {
        if let Err(error) = std::fs::write(path, pool.to_csv()) {
            warn!(%error, "could not persist seed constants");
        }
    }
    let statistics = RunStatistics {
        run_id: format!("{module_name}-{seed}"),
        module: module_name.to_string(),
        algorithm: format!("{:?}", config.algorithm),
        seed,
        coverage,
        covered_goals,
        total_goals,
        archive_size: tests.len(),
        iterations,
        test_executions: context.executor.test_executions(),
        statement_executions: context.executor.statement_executions(),
        mutation_score,
        wall_time_ms: started.elapsed().as_millis() as u64,
        configuration: serde_json::to_string(config).unwrap_or_default(),
    };
    if let Some(path) = &config.statistics_file {
        if let Err(error) = crate::statistics::append_csv(path, &statistics) {
            warn!(%error, "could not append statistics row");
        }
    }

    let iteration_history = history.lock().unwrap_or_else(|p| p.into_inner()).clone();
    Ok(GenerationReport {
        tests,
        coverage,
        covered_goals,
        total_goals,
        iterations,
        mutation_score,
        iteration_history,
        statistics,
    })
}
