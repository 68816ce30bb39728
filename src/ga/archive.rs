//! Archives: the shortest-covering-test archive shared by MOSA, DynaMOSA
//! and whole-suite search, and the per-target population archive of MIO.
//!
//! Invariants of the coverage archive: one stored individual per covered
//! goal, and never one that is longer than a previously presented coverer.
//! Updates inside an iteration are serialized in insertion order; a tie on
//! length keeps the incumbent.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use tracing::debug;

use crate::execution::tracer::normalize;
use crate::fitness::{GoalId, GoalPool};

use super::chromosome::TestCaseChromosome;

/// Goal -> shortest known covering test.
#[derive(Debug, Default)]
pub struct CoverageArchive {
    covered: BTreeMap<GoalId, TestCaseChromosome>,
    uncovered: BTreeSet<GoalId>,
    goals: BTreeSet<GoalId>,
}

impl CoverageArchive {
    #[must_use]
    pub fn new(goals: impl IntoIterator<Item = GoalId>) -> Self {
        let goals: BTreeSet<GoalId> = goals.into_iter().collect();
        Self {
            uncovered: goals.clone(),
            covered: BTreeMap::new(),
            goals,
        }
    }

    /// Adds goals discovered after construction (DynaMOSA activation).
    pub fn add_goals(&mut self, new_goals: impl IntoIterator<Item = GoalId>) {
        for goal in new_goals {
            if self.goals.insert(goal) && !self.covered.contains_key(&goal) {
                self.uncovered.insert(goal);
            }
        }
    }

    #[must_use]
    pub fn goals(&self) -> &BTreeSet<GoalId> {
        &self.goals
    }

    #[must_use]
    pub fn uncovered_goals(&self) -> &BTreeSet<GoalId> {
        &self.uncovered
    }

    #[must_use]
    pub fn num_covered(&self) -> usize {
        self.covered.len()
    }

    #[must_use]
    pub fn coverage(&self) -> f64 {
        if self.goals.is_empty() {
            1.0
        } else {
            self.covered.len() as f64 / self.goals.len() as f64
        }
    }

    /// Updates the archive with candidate solutions. Returns the number of
    /// newly covered goals.
    pub fn update(&mut self, candidates: &mut [TestCaseChromosome], pool: &GoalPool) -> usize {
        let mut newly_covered = 0;
        let goals: Vec<GoalId> = self.goals.iter().copied().collect();
        for goal in goals {
            for candidate in candidates.iter_mut() {
                if candidate.result().is_none() || candidate.timed_out() {
                    continue;
                }
                if !candidate.covers(pool, goal) {
                    continue;
                }
                let candidate_size = candidate.size();
                match self.covered.get(&goal) {
                    Some(incumbent) if incumbent.size() <= candidate_size => {}
                    previous => {
                        if previous.is_none() {
                            newly_covered += 1;
                            self.uncovered.remove(&goal);
                        }
                        self.covered.insert(goal, candidate.clone());
                    }
                }
            }
        }
        if newly_covered > 0 {
            debug!(newly_covered, total = self.covered.len(), "archive grew");
        }
        newly_covered
    }

    /// The best solutions, deduplicated by structural equality.
    #[must_use]
    pub fn solutions(&self) -> Vec<TestCaseChromosome> {
        let mut out: Vec<TestCaseChromosome> = Vec::new();
        for chromosome in self.covered.values() {
            if !out
                .iter()
                .any(|existing| existing.test().structurally_equal(chromosome.test()))
            {
                out.push(chromosome.clone());
            }
        }
        out
    }

    /// The stored coverer of a goal, if any.
    #[must_use]
    pub fn covering_solution(&self, goal: GoalId) -> Option<&TestCaseChromosome> {
        self.covered.get(&goal)
    }
}

/// One entry of a MIO per-target population.
#[derive(Debug, Clone)]
struct MioEntry {
    chromosome: TestCaseChromosome,
    h: f64,
    sample_count: u64,
}

/// The MIO archive: per goal a bounded population scored by
/// `h = 1 - normalized_fitness`; `h = 1` denotes coverage.
#[derive(Debug)]
pub struct MioArchive {
    populations: BTreeMap<GoalId, Vec<MioEntry>>,
    capacity: usize,
}

impl MioArchive {
    #[must_use]
    pub fn new(goals: impl IntoIterator<Item = GoalId>, capacity: usize) -> Self {
        let populations = goals.into_iter().map(|g| (g, Vec::new())).collect();
        Self {
            populations,
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn num_goals(&self) -> usize {
        self.populations.len()
    }

    #[must_use]
    pub fn num_covered(&self) -> usize {
        self.populations
            .values()
            .filter(|population| population.first().map_or(false, |e| e.h >= 1.0))
            .count()
    }

    #[must_use]
    pub fn coverage(&self) -> f64 {
        if self.populations.is_empty() {
            1.0
        } else {
            self.num_covered() as f64 / self.populations.len() as f64
        }
    }

    /// Feeds a candidate to every target population. Returns `true` when at
    /// least one population improved.
    pub fn update(&mut self, candidate: &mut TestCaseChromosome, pool: &GoalPool) -> bool {
        if candidate.result().is_none() || candidate.timed_out() {
            return false;
        }
        let mut improved = false;
        let capacity = self.capacity;
        for (&goal, population) in &mut self.populations {
            let fitness = candidate.fitness(pool, goal);
            let h = 1.0 - normalize(fitness);
            if h <= 0.0 {
                continue;
            }
            let covered = fitness == 0.0;
            if covered {
                // a covering test shrinks the population to the single best
                let replace = population.first().map_or(true, |best| {
                    best.h < 1.0 || candidate.size() < best.chromosome.size()
                });
                if replace {
                    population.clear();
                    population.push(MioEntry {
                        chromosome: candidate.clone(),
                        h: 1.0,
                        sample_count: 0,
                    });
                    improved = true;
                }
                continue;
            }
            if population.first().map_or(false, |best| best.h >= 1.0) {
                // already covered; only shorter coverers may enter
                continue;
            }
            let is_better = population.len() < capacity
                || population.last().is_some_and(|worst| h > worst.h);
            if is_better {
                population.push(MioEntry {
                    chromosome: candidate.clone(),
                    h,
                    sample_count: 0,
                });
                population.sort_by(|a, b| {
                    b.h.partial_cmp(&a.h)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.chromosome.size().cmp(&b.chromosome.size()))
                });
                population.truncate(capacity);
                improved = true;
            }
        }
        improved
    }

    /// Samples an individual for mutation, preferring rarely sampled
    /// entries of a random non-covered target.
    pub fn sample(&mut self, rng: &mut impl Rng) -> Option<TestCaseChromosome> {
        let candidates: Vec<GoalId> = self
            .populations
            .iter()
            .filter(|(_, population)| {
                !population.is_empty() && population.first().map_or(false, |e| e.h < 1.0)
            })
            .map(|(&g, _)| g)
            .collect();
        let goal = if candidates.is_empty() {
            // everything covered (or empty): fall back to any population
            let non_empty: Vec<GoalId> = self
                .populations
                .iter()
                .filter(|(_, p)| !p.is_empty())
                .map(|(&g, _)| g)
                .collect();
            *non_empty.get(rng.gen_range(0..non_empty.len().max(1)))?
        } else {
            candidates[rng.gen_range(0..candidates.len())]
        };
        let population = self.populations.get_mut(&goal)?;
        let min_samples = population.iter().map(|e| e.sample_count).min()?;
        let least_sampled: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, e)| e.sample_count == min_samples)
            .map(|(i, _)| i)
            .collect();
        let chosen = least_sampled[rng.gen_range(0..least_sampled.len())];
        population[chosen].sample_count += 1;
        Some(population[chosen].chromosome.clone())
    }

    /// Shrinks every population to the new capacity (exploitation phase).
    pub fn shrink(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for population in self.populations.values_mut() {
            population.truncate(self.capacity);
        }
    }

    /// Best chromosome per covered goal.
    #[must_use]
    pub fn solutions(&self) -> Vec<TestCaseChromosome> {
        let mut out: Vec<TestCaseChromosome> = Vec::new();
        for population in self.populations.values() {
            let Some(best) = population.first() else {
                continue;
            };
            if best.h >= 1.0
                && !out
                    .iter()
                    .any(|existing| existing.test().structurally_equal(best.chromosome.test()))
            {
                out.push(best.chromosome.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TypeInfo;
    use crate::execution::trace::{ExecutionResult, ExecutionTrace};
    use crate::execution::tracer::{ExecutionTracer, SubjectProperties};
    use crate::fitness::{CoverageMetrics, GoalPool};
    use crate::seeding::ConstantPool;
    use crate::testcase::statement::{Statement, StatementKind};
    use crate::testcase::TestCase;
    use std::sync::Arc;

    /// A pool with one branchless code-object goal.
    fn single_goal_pool() -> GoalPool {
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        tracer.register_code_object("m.f", 1);
        let subject: SubjectProperties = tracer.subject().clone();
        GoalPool::new(Arc::new(subject), CoverageMetrics::default())
    }

    fn chromosome_with(size: usize, covers: bool) -> TestCaseChromosome {
        let mut test = TestCase::new();
        for i in 0..size {
            test.push(Statement::new(
                StatementKind::IntLiteral(i as i64),
                TypeInfo::Int,
            ));
        }
        let mut chromosome = TestCaseChromosome::new(test, 0);
        let mut trace = ExecutionTrace::default();
        if covers {
            trace.executed_code_objects.insert(0);
        }
        chromosome.set_result(ExecutionResult {
            trace,
            outcomes: Vec::new(),
            statement_log_ranges: Vec::new(),
            timed_out: false,
        });
        chromosome
    }

    #[test]
    fn archive_keeps_shortest_coverer() {
        let pool = single_goal_pool();
        let mut archive = CoverageArchive::new(pool.ids());
        let mut first = [chromosome_with(5, true)];
        assert_eq!(archive.update(&mut first, &pool), 1);
        let mut longer = [chromosome_with(8, true)];
        assert_eq!(archive.update(&mut longer, &pool), 0);
        assert_eq!(archive.covering_solution(GoalId(0)).unwrap().size(), 5);
        let mut shorter = [chromosome_with(2, true)];
        archive.update(&mut shorter, &pool);
        assert_eq!(archive.covering_solution(GoalId(0)).unwrap().size(), 2);
        assert_eq!(archive.coverage(), 1.0);
    }

    #[test]
    fn equal_length_keeps_incumbent() {
        let pool = single_goal_pool();
        let mut archive = CoverageArchive::new(pool.ids());
        let mut first = [chromosome_with(3, true)];
        archive.update(&mut first, &pool);
        let incumbent = archive.covering_solution(GoalId(0)).unwrap().test().clone();
        let mut tie = [chromosome_with(3, true)];
        archive.update(&mut tie, &pool);
        assert!(archive
            .covering_solution(GoalId(0))
            .unwrap()
            .test()
            .structurally_equal(&incumbent));
    }

    #[test]
    fn non_coverers_never_enter() {
        let pool = single_goal_pool();
        let mut archive = CoverageArchive::new(pool.ids());
        let mut miss = [chromosome_with(1, false)];
        assert_eq!(archive.update(&mut miss, &pool), 0);
        assert_eq!(archive.num_covered(), 0);
        assert_eq!(archive.uncovered_goals().len(), 1);
    }

    #[test]
    fn dynamic_goal_addition_recomputes_uncovered() {
        let pool = single_goal_pool();
        let mut archive = CoverageArchive::new(Vec::new());
        assert_eq!(archive.uncovered_goals().len(), 0);
        archive.add_goals(pool.ids());
        assert_eq!(archive.uncovered_goals().len(), 1);
    }

    #[test]
    fn mio_archive_prefers_high_h_and_short_tests() {
        let pool = single_goal_pool();
        let mut archive = MioArchive::new(pool.ids(), 3);
        let mut miss = chromosome_with(4, false);
        // fitness 1 -> h = 0.5
        assert!(archive.update(&mut miss, &pool));
        assert_eq!(archive.num_covered(), 0);
        let mut hit = chromosome_with(6, true);
        assert!(archive.update(&mut hit, &pool));
        assert_eq!(archive.num_covered(), 1);
        // once covered, only strictly shorter coverers replace
        let mut longer_hit = chromosome_with(9, true);
        assert!(!archive.update(&mut longer_hit, &pool));
        let mut shorter_hit = chromosome_with(2, true);
        assert!(archive.update(&mut shorter_hit, &pool));
        assert_eq!(archive.solutions().len(), 1);
        assert_eq!(archive.solutions()[0].size(), 2);
    }

    #[test]
    fn mio_sampling_prefers_low_sample_counts() {
        let pool = single_goal_pool();
        let mut archive = MioArchive::new(pool.ids(), 5);
        let mut near = chromosome_with(3, false);
        archive.update(&mut near, &pool);
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        let first = archive.sample(&mut rng);
        assert!(first.is_some());
    }
}
