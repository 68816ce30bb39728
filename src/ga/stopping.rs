//! Stopping conditions: a composable OR of termination predicates,
//! evaluated at the top of each iteration. A firing condition cancels the
//! next iteration, never the current one.

use std::time::{Duration, Instant};

/// Search progress snapshot handed to the conditions each iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStatus {
    pub iterations: u64,
    pub test_executions: u64,
    pub statement_executions: u64,
    pub coverage: f64,
    pub covered_goals: usize,
}

/// A single termination predicate.
#[derive(Debug, Clone)]
pub enum StoppingCondition {
    MaxTime {
        limit: Duration,
        started: Option<Instant>,
    },
    MaxIterations {
        limit: u64,
    },
    MaxStatementExecutions {
        limit: u64,
    },
    MaxTestExecutions {
        limit: u64,
    },
    MaxCoverage {
        limit: f64,
    },
    /// No archive growth for the given number of consecutive iterations.
    CoveragePlateau {
        patience: u64,
        last_covered: usize,
        stagnant: u64,
    },
    /// Resident-set bound in bytes.
    MaxMemory {
        limit_bytes: usize,
    },
}

impl StoppingCondition {
    #[must_use]
    pub fn max_time(limit: Duration) -> Self {
        StoppingCondition::MaxTime {
            limit,
            started: None,
        }
    }

    #[must_use]
    pub fn max_iterations(limit: u64) -> Self {
        StoppingCondition::MaxIterations { limit }
    }

    #[must_use]
    pub fn coverage_plateau(patience: u64) -> Self {
        StoppingCondition::CoveragePlateau {
            patience,
            last_covered: 0,
            stagnant: 0,
        }
    }

    fn start(&mut self) {
        if let StoppingCondition::MaxTime { started, .. } = self {
            *started = Some(Instant::now());
        }
    }

    fn observe(&mut self, status: &SearchStatus) {
        if let StoppingCondition::CoveragePlateau {
            last_covered,
            stagnant,
            ..
        } = self
        {
            if status.covered_goals > *last_covered {
                *last_covered = status.covered_goals;
                *stagnant = 0;
            } else {
                *stagnant += 1;
            }
        }
    }

    fn fulfilled(&self, status: &SearchStatus) -> bool {
        match self {
            StoppingCondition::MaxTime { limit, started } => started
                .map_or(false, |s| s.elapsed() >= *limit),
            StoppingCondition::MaxIterations { limit } => status.iterations >= *limit,
            StoppingCondition::MaxStatementExecutions { limit } => {
                status.statement_executions >= *limit
            }
            StoppingCondition::MaxTestExecutions { limit } => status.test_executions >= *limit,
            StoppingCondition::MaxCoverage { limit } => status.coverage >= *limit,
            StoppingCondition::CoveragePlateau {
                patience, stagnant, ..
            } => *stagnant >= *patience,
            StoppingCondition::MaxMemory { limit_bytes } => {
                resident_memory_bytes().map_or(false, |used| used >= *limit_bytes)
            }
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            StoppingCondition::MaxTime { limit, .. } => format!("max time {limit:?}"),
            StoppingCondition::MaxIterations { limit } => format!("max iterations {limit}"),
            StoppingCondition::MaxStatementExecutions { limit } => {
                format!("max statement executions {limit}")
            }
            StoppingCondition::MaxTestExecutions { limit } => {
                format!("max test executions {limit}")
            }
            StoppingCondition::MaxCoverage { limit } => format!("coverage {limit}"),
            StoppingCondition::CoveragePlateau { patience, .. } => {
                format!("coverage plateau over {patience} iterations")
            }
            StoppingCondition::MaxMemory { limit_bytes } => {
                format!("max resident memory {limit_bytes} bytes")
            }
        }
    }
}

/// Approximate resident set size of the current process.
fn resident_memory_bytes() -> Option<usize> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: usize = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Composite OR over a set of conditions.
#[derive(Debug, Clone, Default)]
pub struct CompositeStoppingCondition {
    conditions: Vec<StoppingCondition>,
}

impl CompositeStoppingCondition {
    #[must_use]
    pub fn new(conditions: Vec<StoppingCondition>) -> Self {
        Self { conditions }
    }

    /// Starts clocks. Call once before the first iteration.
    pub fn start(&mut self) {
        for condition in &mut self.conditions {
            condition.start();
        }
    }

    /// Feeds the per-iteration status to stateful conditions.
    pub fn observe_iteration(&mut self, status: &SearchStatus) {
        for condition in &mut self.conditions {
            condition.observe(status);
        }
    }

    /// Whether any condition fires. The caller finishes the current
    /// iteration and then exits.
    #[must_use]
    pub fn fulfilled(&self, status: &SearchStatus) -> bool {
        self.conditions.iter().any(|c| c.fulfilled(status))
    }

    /// Which condition fired, for logging.
    #[must_use]
    pub fn fired(&self, status: &SearchStatus) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| c.fulfilled(status))
            .map(StoppingCondition::describe)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_limit_fires_exactly_at_limit() {
        let composite =
            CompositeStoppingCondition::new(vec![StoppingCondition::max_iterations(5)]);
        let mut status = SearchStatus::default();
        status.iterations = 4;
        assert!(!composite.fulfilled(&status));
        status.iterations = 5;
        assert!(composite.fulfilled(&status));
    }

    #[test]
    fn plateau_counts_stagnant_iterations() {
        let mut composite =
            CompositeStoppingCondition::new(vec![StoppingCondition::coverage_plateau(3)]);
        let mut status = SearchStatus::default();
        status.covered_goals = 2;
        composite.observe_iteration(&status);
        assert!(!composite.fulfilled(&status));
        // three iterations with no growth
        for _ in 0..3 {
            composite.observe_iteration(&status);
        }
        assert!(composite.fulfilled(&status));
        // growth resets the counter
        let mut composite =
            CompositeStoppingCondition::new(vec![StoppingCondition::coverage_plateau(3)]);
        composite.observe_iteration(&status);
        composite.observe_iteration(&status);
        status.covered_goals = 3;
        composite.observe_iteration(&status);
        assert!(!composite.fulfilled(&status));
    }

    #[test]
    fn composite_is_an_or() {
        let composite = CompositeStoppingCondition::new(vec![
            StoppingCondition::max_iterations(100),
            StoppingCondition::MaxCoverage { limit: 1.0 },
        ]);
        let mut status = SearchStatus::default();
        status.coverage = 1.0;
        assert!(composite.fulfilled(&status));
        assert!(composite.fired(&status).unwrap().contains("coverage"));
    }
}
