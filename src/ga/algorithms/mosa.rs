//! MOSA and DynaMOSA: many-objective search with preference sorting and a
//! shortest-covering archive. DynaMOSA additionally activates goals along
//! the control-dependence structure as their parents are covered.
//!
//! # References
//!
//! - Panichella, Kifetew & Tonella (2015, 2018)

use std::collections::BTreeSet;

use crate::fitness::GoalId;
use crate::ga::archive::CoverageArchive;
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use crate::ga::ranking::preference_sort;
use crate::ga::selection::preference_order;
use crate::testcase::crossover;

use super::{suite_from_solutions, SearchAlgorithm, SearchContext};

/// Goal handling shared by MOSA and DynaMOSA.
trait GoalStrategy {
    /// Goals active at the start of the search.
    fn initial_goals(&self, ctx: &SearchContext) -> Vec<GoalId>;

    /// Goals to activate after an archive update. Returns an empty vec when
    /// nothing new becomes active.
    fn newly_activated(&self, ctx: &SearchContext, archive: &CoverageArchive) -> Vec<GoalId>;
}

struct AllGoals;

impl GoalStrategy for AllGoals {
    fn initial_goals(&self, ctx: &SearchContext) -> Vec<GoalId> {
        ctx.pool.ids()
    }

    fn newly_activated(&self, _ctx: &SearchContext, _archive: &CoverageArchive) -> Vec<GoalId> {
        Vec::new()
    }
}

struct DependencyGoals;

impl GoalStrategy for DependencyGoals {
    fn initial_goals(&self, ctx: &SearchContext) -> Vec<GoalId> {
        ctx.pool.root_goals().to_vec()
    }

    fn newly_activated(&self, ctx: &SearchContext, archive: &CoverageArchive) -> Vec<GoalId> {
        let mut activated = Vec::new();
        let known: BTreeSet<GoalId> = archive.goals().iter().copied().collect();
        let covered: Vec<GoalId> = archive
            .goals()
            .iter()
            .copied()
            .filter(|&g| !archive.uncovered_goals().contains(&g))
            .collect();
        for goal in covered {
            for &child in ctx.pool.children_of(goal) {
                if !known.contains(&child) && !activated.contains(&child) {
                    activated.push(child);
                }
            }
        }
        activated
    }
}

fn evolve<G: GoalStrategy>(strategy: &G, ctx: &mut SearchContext) -> TestSuiteChromosome {
    let mut archive = CoverageArchive::new(strategy.initial_goals(ctx));
    ctx.stopping.start();

    let mut population = ctx.initial_population();
    archive.update(&mut population, &ctx.pool.clone());
    activate_fixpoint(strategy, ctx, &mut archive);

    while !ctx.should_stop(archive.coverage(), archive.num_covered()) {
        let breeding_goals: Vec<GoalId> = if archive.uncovered_goals().is_empty() {
            archive.goals().iter().copied().collect()
        } else {
            archive.uncovered_goals().iter().copied().collect()
        };
        let offspring = breed(ctx, &mut population, &breeding_goals);
        population.extend(offspring);
        ctx.evaluate(&mut population);
        let pool = ctx.pool.clone();
        archive.update(&mut population, &pool);
        activate_fixpoint(strategy, ctx, &mut archive);

        let uncovered: Vec<GoalId> = archive.uncovered_goals().iter().copied().collect();
        let ranking = preference_sort(
            &mut population,
            &uncovered,
            &pool,
            ctx.population_size,
            &mut ctx.rng,
        );
        let order = preference_order(&ranking, population.len());
        let survivors: Vec<TestCaseChromosome> = order
            .into_iter()
            .take(ctx.population_size)
            .map(|i| population[i].clone())
            .collect();
        population = survivors;

        ctx.finish_iteration(archive.coverage(), archive.num_covered(), archive.num_covered());
    }

    suite_from_solutions(archive.solutions(), ctx.max_suite_length)
}

/// Activates children of covered goals until nothing more activates.
fn activate_fixpoint<G: GoalStrategy>(
    strategy: &G,
    ctx: &SearchContext,
    archive: &mut CoverageArchive,
) {
    loop {
        let activated = strategy.newly_activated(ctx, archive);
        if activated.is_empty() {
            return;
        }
        archive.add_goals(activated);
    }
}

/// Produces one offspring population via selection, crossover, mutation.
fn breed(
    ctx: &mut SearchContext,
    population: &mut Vec<TestCaseChromosome>,
    goals: &[GoalId],
) -> Vec<TestCaseChromosome> {
    let pool = ctx.pool.clone();
    let ranking = preference_sort(
        population,
        goals,
        &pool,
        ctx.population_size,
        &mut ctx.rng,
    );
    let order = preference_order(&ranking, population.len());

    let mut offspring = Vec::with_capacity(ctx.population_size);
    while offspring.len() < ctx.population_size {
        let first = ctx.selection.select(&ranking, &order, &mut ctx.rng);
        let second = ctx.selection.select(&ranking, &order, &mut ctx.rng);
        let (mut child_one, mut child_two) = if ctx.should_crossover() {
            let (a, b) = crossover(
                population[first].test(),
                population[second].test(),
                &mut ctx.rng,
            );
            (
                TestCaseChromosome::new(a, ctx.iterations),
                TestCaseChromosome::new(b, ctx.iterations),
            )
        } else {
            (population[first].clone(), population[second].clone())
        };
        child_one.mutate(&ctx.factory, ctx.mutation, ctx.max_test_length, &mut ctx.rng);
        child_two.mutate(&ctx.factory, ctx.mutation, ctx.max_test_length, &mut ctx.rng);
        offspring.push(child_one);
        if offspring.len() < ctx.population_size {
            offspring.push(child_two);
        }
    }
    ctx.evaluate(&mut offspring);
    offspring
}

/// MOSA: every goal is an objective from the start.
#[derive(Debug, Default)]
pub struct MosaSearch;

impl SearchAlgorithm for MosaSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        evolve(&AllGoals, ctx)
    }
}

/// DynaMOSA: goals activate as their control-dependence parents are
/// covered, so preference sorting never wastes budget on unreachable
/// targets.
#[derive(Debug, Default)]
pub struct DynaMosaSearch;

impl SearchAlgorithm for DynaMosaSearch {
    fn generate_tests(&mut self, ctx: &mut SearchContext) -> TestSuiteChromosome {
        evolve(&DependencyGoals, ctx)
    }
}
