//! Convenience re-exports for embedding the generator.

pub use crate::assertion::mutation::{MutationAnalysisOptions, MutationOperator, MutationReport};
pub use crate::assertion::AssertionOptions;
pub use crate::cluster::{CallableDescriptor, CallableKind, TestCluster, TypeInfo};
pub use crate::config::{
    Algorithm, AssertionStrategy, Configuration, CoverageMetricSet, ExitCode, SelectionConfig,
    StoppingConfig,
};
pub use crate::execution::{ExecutionResult, ExecutionTrace, StatementOutcome, ValueSnapshot};
pub use crate::fitness::{CoverageGoal, CoverageMetrics, GoalId, GoalPool};
pub use crate::ga::{
    CoverageArchive, MioArchive, TestCaseChromosome, TestSuiteChromosome,
};
pub use crate::generator::{generate, GenerationError, GenerationReport, CONSENT_ENV};
pub use crate::lang::Project;
pub use crate::testcase::{Assertion, TestCase, TestFactory};
