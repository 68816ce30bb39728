//! Preference sorting and non-dominated ranking for the many-objective
//! algorithms.
//!
//! Rank 0 holds, per uncovered goal, the single individual with the lowest
//! fitness on that goal (shorter wins ties, then a coin flip). Remaining
//! individuals are ranked by fast non-dominated sorting over the
//! uncovered-goal vector; within a front, the fast epsilon-dominance
//! assignment approximates crowding distance.
//!
//! # References
//!
//! - Panichella, Kifetew & Tonella (2015): "Reformulating Branch Coverage
//!   as a Many-Objective Optimization Problem"

use std::cmp::Ordering;

use rand::Rng;

use crate::fitness::{GoalId, GoalPool};

use super::chromosome::TestCaseChromosome;

/// Result of a ranking assignment over one population.
#[derive(Debug, Clone)]
pub struct Ranking {
    /// Fronts of population indices, rank 0 first.
    pub fronts: Vec<Vec<usize>>,
    /// Rank per population index.
    pub rank: Vec<usize>,
    /// Crowding measure per population index (higher is better).
    pub distance: Vec<f64>,
}

impl Ranking {
    #[must_use]
    pub fn rank_of(&self, index: usize) -> usize {
        self.rank[index]
    }

    #[must_use]
    pub fn distance_of(&self, index: usize) -> f64 {
        self.distance[index]
    }

    /// True when `a` is preferable to `b` (lower rank, then larger
    /// distance).
    #[must_use]
    pub fn preferred(&self, a: usize, b: usize) -> bool {
        match self.rank[a].cmp(&self.rank[b]) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.distance[a] > self.distance[b],
        }
    }
}

/// Whether `a` dominates `b` on the given goals.
fn dominates(
    a: usize,
    b: usize,
    fitness: &[Vec<f64>],
) -> bool {
    let mut strictly_better = false;
    for goal_index in 0..fitness[a].len() {
        let (fa, fb) = (fitness[a][goal_index], fitness[b][goal_index]);
        if fa > fb {
            return false;
        }
        if fa < fb {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Computes the full preference-sorting ranking assignment.
pub fn preference_sort(
    population: &mut [TestCaseChromosome],
    uncovered: &[GoalId],
    pool: &GoalPool,
    population_size: usize,
    rng: &mut impl Rng,
) -> Ranking {
    let n = population.len();
    let mut ranking = Ranking {
        fronts: Vec::new(),
        rank: vec![usize::MAX; n],
        distance: vec![0.0; n],
    };
    if n == 0 {
        return ranking;
    }

    // fitness matrix: population x uncovered goals
    let fitness: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            uncovered
                .iter()
                .map(|&g| population[i].fitness(pool, g))
                .collect()
        })
        .collect();

    // rank 0: best individual per uncovered goal
    let mut zero_front: Vec<usize> = Vec::new();
    for (goal_index, _) in uncovered.iter().enumerate() {
        let mut best: Option<usize> = None;
        for candidate in 0..n {
            let better = match best {
                None => true,
                Some(current) => {
                    match fitness[candidate][goal_index]
                        .partial_cmp(&fitness[current][goal_index])
                        .unwrap_or(Ordering::Equal)
                    {
                        Ordering::Less => true,
                        Ordering::Greater => false,
                        Ordering::Equal => {
                            match population[candidate].size().cmp(&population[current].size())
                            {
                                Ordering::Less => true,
                                Ordering::Greater => false,
                                Ordering::Equal => rng.gen_bool(0.5),
                            }
                        }
                    }
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        if let Some(best) = best {
            if !zero_front.contains(&best) {
                zero_front.push(best);
            }
        }
    }
    if uncovered.is_empty() {
        // nothing left to optimize: everything lands in one front
        zero_front = (0..n).collect();
    }
    for &index in &zero_front {
        ranking.rank[index] = 0;
    }
    ranking.fronts.push(zero_front.clone());

    // non-dominated sorting of the remainder, stopping once the population
    // size is ranked
    let mut remaining: Vec<usize> = (0..n).filter(|i| !zero_front.contains(i)).collect();
    let mut ranked = zero_front.len();
    let mut front_index = 1;
    while !remaining.is_empty() && ranked < population_size {
        let mut front: Vec<usize> = Vec::new();
        for &candidate in &remaining {
            let dominated = remaining
                .iter()
                .any(|&other| other != candidate && dominates(other, candidate, &fitness));
            if !dominated {
                front.push(candidate);
            }
        }
        if front.is_empty() {
            // all mutually non-comparable (e.g. identical vectors)
            front = remaining.clone();
        }
        for &index in &front {
            ranking.rank[index] = front_index;
        }
        remaining.retain(|i| !front.contains(i));
        ranked += front.len();
        ranking.fronts.push(front);
        front_index += 1;
    }
    if !remaining.is_empty() {
        for &index in &remaining {
            ranking.rank[index] = front_index;
        }
        ranking.fronts.push(remaining);
    }

    // fast epsilon-dominance assignment within each front
    for front in &ranking.fronts {
        if front.len() <= 1 || uncovered.is_empty() {
            continue;
        }
        for goal_index in 0..uncovered.len() {
            let min = front
                .iter()
                .map(|&i| fitness[i][goal_index])
                .fold(f64::INFINITY, f64::min);
            let attaining: Vec<usize> = front
                .iter()
                .copied()
                .filter(|&i| fitness[i][goal_index] == min)
                .collect();
            if attaining.len() < front.len() {
                let credit = 1.0 / attaining.len() as f64;
                for index in attaining {
                    ranking.distance[index] += credit;
                }
            }
        }
    }
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TypeInfo;
    use crate::execution::trace::{ExecutionResult, ExecutionTrace};
    use crate::execution::tracer::ExecutionTracer;
    use crate::fitness::{CoverageMetrics, GoalPool};
    use crate::seeding::ConstantPool;
    use crate::testcase::statement::{Statement, StatementKind};
    use crate::testcase::TestCase;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    /// Two branchless code objects -> two goals.
    fn two_goal_pool() -> GoalPool {
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        tracer.register_code_object("m.f", 1);
        tracer.register_code_object("m.g", 1);
        GoalPool::new(Arc::new(tracer.subject().clone()), CoverageMetrics::default())
    }

    fn chromosome_covering(code_objects: &[u32], size: usize) -> TestCaseChromosome {
        let mut test = TestCase::new();
        for i in 0..size {
            test.push(Statement::new(
                StatementKind::IntLiteral(i as i64),
                TypeInfo::Int,
            ));
        }
        let mut chromosome = TestCaseChromosome::new(test, 0);
        let mut trace = ExecutionTrace::default();
        trace
            .executed_code_objects
            .extend(code_objects.iter().copied());
        chromosome.set_result(ExecutionResult {
            trace,
            outcomes: Vec::new(),
            statement_log_ranges: Vec::new(),
            timed_out: false,
        });
        chromosome
    }

    #[test]
    fn zero_front_holds_best_per_goal() {
        let pool = two_goal_pool();
        let goals = pool.ids();
        let mut population = vec![
            chromosome_covering(&[0], 2),
            chromosome_covering(&[1], 3),
            chromosome_covering(&[], 1),
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let ranking = preference_sort(&mut population, &goals, &pool, 3, &mut rng);
        assert_eq!(ranking.rank_of(0), 0);
        assert_eq!(ranking.rank_of(1), 0);
        assert!(ranking.rank_of(2) > 0);
    }

    #[test]
    fn dominated_individuals_rank_behind() {
        let pool = two_goal_pool();
        let goals = pool.ids();
        // index 0 covers both goals, index 1 covers none
        let mut population = vec![
            chromosome_covering(&[0, 1], 2),
            chromosome_covering(&[], 2),
            chromosome_covering(&[], 2),
            chromosome_covering(&[], 2),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let ranking = preference_sort(&mut population, &goals, &pool, 4, &mut rng);
        assert_eq!(ranking.rank_of(0), 0);
        for i in 1..4 {
            assert!(ranking.rank_of(i) >= 1);
        }
        assert!(ranking.preferred(0, 1));
    }
}
