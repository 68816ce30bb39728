//! The evolutionary core: chromosomes, archives, ranking, selection,
//! stopping conditions, and the search algorithms themselves.

pub mod algorithms;
pub mod archive;
pub mod chromosome;
pub mod ranking;
pub mod selection;
pub mod stopping;

pub use algorithms::{
    DynaMosaSearch, ExecutorKind, MioSearch, MosaSearch, RandomSearch, RandomTestSearch,
    SearchAlgorithm, SearchContext, SearchObserver, WholeSuiteSearch,
};
pub use archive::{CoverageArchive, MioArchive};
pub use chromosome::{MutationProbabilities, TestCaseChromosome, TestSuiteChromosome};
pub use ranking::{preference_sort, Ranking};
pub use selection::Selection;
pub use stopping::{CompositeStoppingCondition, SearchStatus, StoppingCondition};
