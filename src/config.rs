//! Configuration recognized by the generation core.
//!
//! The configuration object arrives from the external CLI/loader; the core
//! validates it and fails fast with exit code 1 on invalid combinations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assertion::mutation::MutationOperator;

/// The search strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    DynaMosa,
    Mosa,
    Mio,
    WholeSuite,
    Random,
    RandomSearch,
}

/// Which coverage metrics contribute goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageMetricSet {
    pub branch: bool,
    pub line: bool,
    pub checked: bool,
}

impl Default for CoverageMetricSet {
    fn default() -> Self {
        Self {
            branch: true,
            line: false,
            checked: false,
        }
    }
}

/// Independent application probabilities of the test-case mutations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutationConfig {
    pub insert: f64,
    pub change: f64,
    pub delete: f64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            insert: 1.0 / 3.0,
            change: 1.0 / 3.0,
            delete: 1.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SelectionConfig {
    Rank { bias: f64 },
    Tournament { size: usize },
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig::Tournament { size: 5 }
    }
}

/// Named stopping conditions with thresholds; combined as an OR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoppingConfig {
    MaxTimeSeconds(u64),
    MaxIterations(u64),
    MaxStatementExecutions(u64),
    MaxTestExecutions(u64),
    MaxCoverage(f64),
    CoveragePlateau(u64),
    MaxMemoryBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssertionStrategy {
    Simple,
    Mutation,
    None,
}

/// Timeouts of the execution layer, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub per_statement_ms: u64,
    pub per_test_ms: u64,
    /// Overall budget; mapped onto a max-time stopping condition.
    pub total_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_statement_ms: 2_000,
            per_test_ms: 10_000,
            total_ms: None,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn per_statement(&self) -> Duration {
        Duration::from_millis(self.per_statement_ms)
    }

    #[must_use]
    pub fn per_test(&self) -> Duration {
        Duration::from_millis(self.per_test_ms)
    }
}

/// All options the core recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub algorithm: Algorithm,
    pub coverage_metrics: CoverageMetricSet,
    pub population_size: usize,
    pub max_test_length: usize,
    pub max_suite_length: usize,
    pub mutation_probabilities: MutationConfig,
    pub crossover_probability: f64,
    pub selection: SelectionConfig,
    pub stopping: Vec<StoppingConfig>,
    /// Unset means auto-seeded (and logged).
    pub seed: Option<u64>,
    pub assertion_strategy: AssertionStrategy,
    pub mutation_operators: Vec<MutationOperator>,
    /// Pair mutations into higher-order mutants.
    pub higher_order_mutants: bool,
    pub timeouts: TimeoutConfig,
    /// Run test batches in the isolated worker.
    pub subprocess: bool,
    pub include_methods: Vec<String>,
    pub exclude_methods: Vec<String>,
    pub exclude_modules: Vec<String>,
    /// Source lines excluded from line coverage (pragma-style exclusions).
    pub excluded_lines: Vec<u32>,
    /// Seed-constant CSV, read before the run and appended after it.
    pub seed_constants_file: Option<PathBuf>,
    /// Statistics CSV; one row is appended per run, header on first write.
    pub statistics_file: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::DynaMosa,
            coverage_metrics: CoverageMetricSet::default(),
            population_size: 50,
            max_test_length: 25,
            max_suite_length: 50,
            mutation_probabilities: MutationConfig::default(),
            crossover_probability: 0.75,
            selection: SelectionConfig::default(),
            stopping: vec![StoppingConfig::MaxTimeSeconds(600)],
            seed: None,
            assertion_strategy: AssertionStrategy::Mutation,
            mutation_operators: MutationOperator::all(),
            higher_order_mutants: false,
            timeouts: TimeoutConfig::default(),
            subprocess: false,
            include_methods: Vec::new(),
            exclude_methods: Vec::new(),
            exclude_modules: Vec::new(),
            excluded_lines: Vec::new(),
            seed_constants_file: None,
            statistics_file: None,
        }
    }
}

/// Invalid option combination; surfaced immediately with exit code 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub message: String,
}

impl ConfigurationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigurationError {}

impl Configuration {
    /// Validates option ranges and combinations.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let metrics = self.coverage_metrics;
        if !metrics.branch && !metrics.line && !metrics.checked {
            return Err(ConfigurationError::new(
                "at least one coverage metric is required",
            ));
        }
        if self.population_size == 0 {
            return Err(ConfigurationError::new("population_size must be positive"));
        }
        if self.max_test_length == 0 {
            return Err(ConfigurationError::new("max_test_length must be positive"));
        }
        if !(0.0..=1.0).contains(&self.crossover_probability) {
            return Err(ConfigurationError::new(
                "crossover_probability must lie in [0, 1]",
            ));
        }
        let m = self.mutation_probabilities;
        for (name, value) in [
            ("insert", m.insert),
            ("change", m.change),
            ("delete", m.delete),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigurationError::new(format!(
                    "mutation probability {name} must lie in [0, 1]"
                )));
            }
        }
        if m.insert + m.change + m.delete > 1.0 + 1e-9 {
            return Err(ConfigurationError::new(
                "mutation probabilities must sum to at most 1",
            ));
        }
        match self.selection {
            SelectionConfig::Rank { bias } => {
                if !(bias > 1.0 && bias <= 2.0) {
                    return Err(ConfigurationError::new("rank bias must lie in (1, 2]"));
                }
            }
            SelectionConfig::Tournament { size } => {
                if size == 0 {
                    return Err(ConfigurationError::new("tournament size must be positive"));
                }
            }
        }
        if self.stopping.is_empty() {
            return Err(ConfigurationError::new(
                "at least one stopping condition is required",
            ));
        }
        for condition in &self.stopping {
            if let StoppingConfig::MaxCoverage(limit) = condition {
                if !(0.0..=1.0).contains(limit) {
                    return Err(ConfigurationError::new("max coverage must lie in [0, 1]"));
                }
            }
        }
        if self.assertion_strategy == AssertionStrategy::Mutation
            && self.mutation_operators.is_empty()
        {
            return Err(ConfigurationError::new(
                "mutation assertion strategy needs a non-empty operator set",
            ));
        }
        if self.timeouts.per_statement_ms == 0 || self.timeouts.per_test_ms == 0 {
            return Err(ConfigurationError::new("timeouts must be positive"));
        }
        Ok(())
    }
}

/// Process exit codes of the generation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Suite emitted with at least one covered goal.
    Success,
    /// Invalid configuration.
    Configuration,
    /// Instrumentation or import of the target failed.
    Setup,
    /// Budget exhausted with nothing covered.
    NoCoverage,
    /// The execution-consent flag was not set.
    ConsentMissing,
}

impl ExitCode {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Configuration => 1,
            ExitCode::Setup => 2,
            ExitCode::NoCoverage => 3,
            ExitCode::ConsentMissing => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_metrics_and_bad_probabilities() {
        let mut config = Configuration::default();
        config.coverage_metrics = CoverageMetricSet {
            branch: false,
            line: false,
            checked: false,
        };
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.mutation_probabilities = MutationConfig {
            insert: 0.6,
            change: 0.6,
            delete: 0.2,
        };
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.selection = SelectionConfig::Rank { bias: 2.5 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn configuration_round_trips_through_serde() {
        let config = Configuration::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let restored: Configuration = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.population_size, config.population_size);
        assert_eq!(restored.algorithm, config.algorithm);
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Configuration.code(), 1);
        assert_eq!(ExitCode::Setup.code(), 2);
        assert_eq!(ExitCode::NoCoverage.code(), 3);
        assert_eq!(ExitCode::ConsentMissing.code(), 4);
    }
}
