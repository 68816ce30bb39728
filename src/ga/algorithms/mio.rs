//! MIO: many independent objectives with per-target populations and a
//! linear exploration-to-exploitation schedule.
//!
//! # References
//!
//! - Arcuri (2017): "Many Independent Objective (MIO) Algorithm for Test
//!   Suite Generation"

use rand::Rng;
use tracing::debug;

use crate::ga::archive::MioArchive;
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};

use super::{suite_from_solutions, SearchAlgorithm, SearchContext};

/// The adaptive parameter triple `(Pr, n, m)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MioParameters {
    /// Probability of sampling a fresh random test instead of the archive.
    pub random_probability: f64,
    /// Per-target population capacity.
    pub population_per_target: usize,
    /// Mutations applied to one individual before sampling anew.
    pub mutation_count: usize,
}

/// Exploration and exploitation endpoints plus the focus threshold.
#[derive(Debug, Clone, Copy)]
pub struct MioSchedule {
    pub initial: MioParameters,
    pub focused: MioParameters,
    /// Fraction of covered goals at which the focused phase begins.
    pub focus_threshold: f64,
}

impl Default for MioSchedule {
    fn default() -> Self {
        Self {
            initial: MioParameters {
                random_probability: 0.5,
                population_per_target: 5,
                mutation_count: 1,
            },
            focused: MioParameters {
                random_probability: 0.0,
                population_per_target: 1,
                mutation_count: 10,
            },
            focus_threshold: 0.85,
        }
    }
}

impl MioSchedule {
    /// Linear interpolation of the parameters at the given progress.
    #[must_use]
    fn at(&self, progress: f64) -> (MioParameters, bool) {
        if progress >= self.focus_threshold {
            return (self.focused, true);
        }
        let fraction = (progress / self.focus_threshold).clamp(0.0, 1.0);
        let scale = |initial: f64, focused: f64| initial + (focused - initial) * fraction;
        (
            MioParameters {
                random_probability: scale(
                    self.initial.random_probability,
                    self.focused.random_probability,
                ),
                population_per_target: scale(
                    self.initial.population_per_target as f64,
                    self.focused.population_per_target as f64,
                )
                .ceil()
                .max(1.0) as usize,
                mutation_count: scale(
                    self.initial.mutation_count as f64,
                    self.focused.mutation_count as f64,
                )
                .ceil()
                .max(1.0) as usize,
            },
            false,
        )
    }
}

/// MIO search over per-goal populations.
pub struct MioSearch {
    schedule: MioSchedule,
}

impl MioSearch {
    #[must_use]
    pub fn new(schedule: MioSchedule) -> Self {
        Self { schedule }
    }
}

impl Default for MioSearch {
    fn default() -> Self {
        Self::new(MioSchedule::default())
    }
}

impl SearchAlgorithm for MioSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        let pool = ctx.pool.clone();
        let mut archive = MioArchive::new(pool.ids(), self.schedule.initial.population_per_target);
        ctx.stopping.start();

        let mut parameters = self.schedule.initial;
        let mut focused = false;
        let mut current: Option<TestCaseChromosome> = None;
        let mut mutations_done = 0usize;

        while !ctx.should_stop(archive.coverage(), archive.num_covered()) {
            let mut offspring = match &current {
                Some(solution) if mutations_done < parameters.mutation_count => {
                    mutations_done += 1;
                    let mut clone = solution.clone();
                    clone.mutate(&ctx.factory, ctx.mutation, ctx.max_test_length, &mut ctx.rng);
                    clone
                }
                _ => {
                    mutations_done = 1;
                    if ctx.rng.gen_bool(parameters.random_probability.clamp(0.0, 1.0)) {
                        let test = ctx
                            .factory
                            .random_test_case(ctx.max_test_length, &mut ctx.rng);
                        TestCaseChromosome::new(test, ctx.iterations)
                    } else if let Some(mut sampled) = archive.sample(&mut ctx.rng) {
                        sampled.mutate(
                            &ctx.factory,
                            ctx.mutation,
                            ctx.max_test_length,
                            &mut ctx.rng,
                        );
                        sampled
                    } else {
                        let test = ctx
                            .factory
                            .random_test_case(ctx.max_test_length, &mut ctx.rng);
                        TestCaseChromosome::new(test, ctx.iterations)
                    }
                }
            };
            ctx.evaluate(std::slice::from_mut(&mut offspring));
            if archive.update(&mut offspring, &pool) {
                current = Some(offspring);
            }

            if !focused {
                let (next, now_focused) = self.schedule.at(archive.coverage());
                if next.population_per_target != parameters.population_per_target {
                    archive.shrink(next.population_per_target);
                }
                if now_focused {
                    debug!("entering focused phase");
                    focused = true;
                }
                parameters = next;
            }

            ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
        }

        suite_from_solutions(archive.solutions(), ctx.max_suite_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_interpolates_linearly_to_the_focus_point() {
        let schedule = MioSchedule::default();
        let (start, focused) = schedule.at(0.0);
        assert!(!focused);
        assert_eq!(start.random_probability, 0.5);
        assert_eq!(start.population_per_target, 5);
        let (mid, _) = schedule.at(0.425);
        assert!(mid.random_probability < 0.5 && mid.random_probability > 0.0);
        assert!(mid.population_per_target <= 5 && mid.population_per_target >= 1);
        let (end, focused) = schedule.at(0.9);
        assert!(focused);
        assert_eq!(end.random_probability, 0.0);
        assert_eq!(end.population_per_target, 1);
        assert_eq!(end.mutation_count, 10);
    }
}
