//! Coverage goals and their fitness functions.
//!
//! Fitness is minimization: 0.0 means covered, and coverage is inferred
//! from a zero fitness without a separate evaluation pass. Branch fitness
//! combines the approach level through the control-dependence chain with
//! the normalized branch distance at the closest executed ancestor.
//!
//! # References
//!
//! - Wegener, Baresel & Sthamer (2001): "Evolutionary test environment for
//!   automatic structural testing"
//! - Panichella, Kifetew & Tonella (2018): "Automated Test Case Generation
//!   as a Many-Objective Optimisation Problem with Dynamic Selection of the
//!   Targets"

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::execution::trace::ExecutionResult;
use crate::execution::tracer::{normalize, SubjectProperties};
use crate::slicer;

/// A coverage target with a stable identity (its position in the pool).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoverageGoal {
    /// A branchless code object was entered.
    CodeObjectEntered { code_object: u32 },
    /// A predicate took the given branch.
    BranchTaken { predicate: u32, value: bool },
    /// A line was executed.
    LineCovered { line: u32 },
    /// A line contributes, by backward slice, to an observed value.
    StatementChecked { line: u32 },
}

/// Index of a goal inside its pool; the archive key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GoalId(pub usize);

/// Which coverage metrics contribute goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageMetrics {
    pub branch: bool,
    pub line: bool,
    pub checked: bool,
}

impl Default for CoverageMetrics {
    fn default() -> Self {
        Self {
            branch: true,
            line: false,
            checked: false,
        }
    }
}

/// The immutable pool of goals for one run, in deterministic order.
#[derive(Debug)]
pub struct GoalPool {
    goals: Vec<CoverageGoal>,
    subject: Arc<SubjectProperties>,
    /// Goal activation structure for DynaMOSA: children per goal.
    children: HashMap<GoalId, Vec<GoalId>>,
    roots: Vec<GoalId>,
}

impl GoalPool {
    /// Builds the pool from the instrumented subject.
    #[must_use]
    pub fn new(subject: Arc<SubjectProperties>, metrics: CoverageMetrics) -> Self {
        let mut goals = Vec::new();
        if metrics.branch {
            for code_object in subject.branchless_code_objects() {
                goals.push(CoverageGoal::CodeObjectEntered { code_object });
            }
            let mut predicate_ids: Vec<u32> = subject.predicates.keys().copied().collect();
            predicate_ids.sort_unstable();
            for predicate in predicate_ids {
                goals.push(CoverageGoal::BranchTaken {
                    predicate,
                    value: true,
                });
                goals.push(CoverageGoal::BranchTaken {
                    predicate,
                    value: false,
                });
            }
        }
        if metrics.line || metrics.checked {
            let mut line_ids: Vec<u32> = subject.lines.keys().copied().collect();
            line_ids.sort_unstable();
            for line in &line_ids {
                if metrics.line {
                    goals.push(CoverageGoal::LineCovered { line: *line });
                }
                if metrics.checked {
                    goals.push(CoverageGoal::StatementChecked { line: *line });
                }
            }
        }

        let (children, roots) = goal_dependencies(&goals, &subject);
        Self {
            goals,
            subject,
            children,
            roots,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.goals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    #[must_use]
    pub fn goal(&self, id: GoalId) -> &CoverageGoal {
        &self.goals[id.0]
    }

    #[must_use]
    pub fn ids(&self) -> Vec<GoalId> {
        (0..self.goals.len()).map(GoalId).collect()
    }

    #[must_use]
    pub fn subject(&self) -> &SubjectProperties {
        &self.subject
    }

    /// Goals that are initially active (not control-dependent on another
    /// branch goal).
    #[must_use]
    pub fn root_goals(&self) -> &[GoalId] {
        &self.roots
    }

    /// Goals that become active once `covered` is reached.
    #[must_use]
    pub fn children_of(&self, covered: GoalId) -> &[GoalId] {
        self.children
            .get(&covered)
            .map_or(&[], |children| children.as_slice())
    }

    /// Fitness of one goal against one execution result.
    #[must_use]
    pub fn fitness(&self, id: GoalId, result: &ExecutionResult) -> f64 {
        if result.timed_out {
            return worst_fitness(&self.subject);
        }
        match self.goal(id) {
            CoverageGoal::CodeObjectEntered { code_object } => {
                if result.trace.executed_code_objects.contains(code_object) {
                    0.0
                } else {
                    1.0
                }
            }
            CoverageGoal::BranchTaken { predicate, value } => {
                branch_fitness(*predicate, *value, result, &self.subject)
            }
            CoverageGoal::LineCovered { line } => {
                if result.trace.covered_lines.contains(line) {
                    0.0
                } else {
                    1.0
                }
            }
            CoverageGoal::StatementChecked { line } => {
                let checked = checked_positions(result);
                let lines = slicer::checked_lines(result, &self.subject, &checked);
                let Some((_, source_line)) = self.subject.lines.get(line) else {
                    return 1.0;
                };
                if lines.contains(source_line) {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    /// Coverage of a result over a goal subset: covered / total.
    #[must_use]
    pub fn coverage(&self, ids: &[GoalId], result: &ExecutionResult) -> f64 {
        if ids.is_empty() {
            return 1.0;
        }
        let covered = ids
            .iter()
            .filter(|&&id| self.fitness(id, result) == 0.0)
            .count();
        covered as f64 / ids.len() as f64
    }
}

/// Positions whose values count as observed for checked coverage: assertion
/// positions when present, otherwise every completed statement.
fn checked_positions(result: &ExecutionResult) -> Vec<usize> {
    (0..result.outcomes.len())
        .filter(|&i| {
            matches!(
                result.outcomes[i],
                crate::execution::trace::StatementOutcome::Ok { .. }
            )
        })
        .collect()
}

/// A pessimistic fitness for timed-out executions, larger than any
/// reachable branch fitness.
fn worst_fitness(subject: &SubjectProperties) -> f64 {
    subject.predicates.len() as f64 + 2.0
}

fn distance_toward(
    predicate: u32,
    value: bool,
    result: &ExecutionResult,
) -> Option<f64> {
    let distances = if value {
        &result.trace.true_distances
    } else {
        &result.trace.false_distances
    };
    distances.get(&predicate).copied()
}

/// Approach level plus normalized branch distance.
fn branch_fitness(
    predicate: u32,
    value: bool,
    result: &ExecutionResult,
    subject: &SubjectProperties,
) -> f64 {
    if let Some(distance) = distance_toward(predicate, value, result) {
        return normalize(distance);
    }

    // predicate never executed: climb the control-dependence chain to the
    // nearest executed ancestor
    let mut frontier: Vec<(u32, bool)> = subject
        .predicates
        .get(&predicate)
        .map(|meta| meta.parents.clone())
        .unwrap_or_default();
    let mut visited: HashSet<u32> = HashSet::new();
    visited.insert(predicate);
    let mut level = 1.0;
    while !frontier.is_empty() {
        let mut best: Option<f64> = None;
        for (ancestor, needed) in &frontier {
            if let Some(distance) = distance_toward(*ancestor, *needed, result) {
                let candidate = normalize(distance);
                best = Some(best.map_or(candidate, |b: f64| b.min(candidate)));
            }
        }
        if let Some(distance) = best {
            return level + distance;
        }
        let mut next = Vec::new();
        for (ancestor, _) in frontier {
            if visited.insert(ancestor) {
                if let Some(meta) = subject.predicates.get(&ancestor) {
                    next.extend(meta.parents.iter().copied());
                }
            }
        }
        frontier = next;
        level += 1.0;
    }
    // not even the code object was entered
    level + 1.0
}

/// Builds the DynaMOSA activation structure: branch goals whose predicate
/// is control-dependent on a parent branch become children of the parent's
/// direction goal; everything else is a root.
fn goal_dependencies(
    goals: &[CoverageGoal],
    subject: &SubjectProperties,
) -> (HashMap<GoalId, Vec<GoalId>>, Vec<GoalId>) {
    let mut by_branch: HashMap<(u32, bool), GoalId> = HashMap::new();
    for (index, goal) in goals.iter().enumerate() {
        if let CoverageGoal::BranchTaken { predicate, value } = goal {
            by_branch.insert((*predicate, *value), GoalId(index));
        }
    }

    let mut children: HashMap<GoalId, Vec<GoalId>> = HashMap::new();
    let mut roots = Vec::new();
    for (index, goal) in goals.iter().enumerate() {
        let id = GoalId(index);
        match goal {
            CoverageGoal::BranchTaken { predicate, .. } => {
                let parents = subject
                    .predicates
                    .get(predicate)
                    .map(|meta| meta.parents.as_slice())
                    .unwrap_or(&[]);
                if parents.is_empty() {
                    roots.push(id);
                } else {
                    for (parent, parent_value) in parents {
                        if let Some(&parent_goal) = by_branch.get(&(*parent, *parent_value)) {
                            children.entry(parent_goal).or_default().push(id);
                        } else {
                            roots.push(id);
                            break;
                        }
                    }
                }
            }
            _ => roots.push(id),
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
        list.dedup();
    }
    roots.sort_unstable();
    roots.dedup();
    (children, roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::trace::ExecutionTrace;
    use crate::execution::tracer::{ExecutionTracer, TracerHandle};
    use crate::execution::vm::{native_names, Vm};
    use crate::instrumentation::{InstrumentationOptions, Instrumenter};
    use crate::lang::value::Value;
    use crate::lang::{compile_module, parse_module};
    use crate::seeding::ConstantPool;
    use std::sync::atomic::AtomicBool;

    fn run(source: &str, call: &str, args: Vec<Value>) -> (Arc<SubjectProperties>, ExecutionResult) {
        let ast = parse_module("m", source).expect("parse");
        let module = compile_module(&ast).expect("compile");
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        let handle = TracerHandle::new(tracer);
        let mut vm = Vm::new(
            Arc::new(instrumented),
            handle.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let _ = vm.call_function(call, args, vec![]);
        let trace = handle.lock().take_trace();
        let subject = Arc::new(handle.lock().subject().clone());
        let result = ExecutionResult {
            trace,
            outcomes: Vec::new(),
            statement_log_ranges: Vec::new(),
            timed_out: false,
        };
        (subject, result)
    }

    const SIGN: &str =
        "def sign(x: int) -> int { if x < 0 { return -1 } if x > 0 { return 1 } return 0 }";

    #[test]
    fn covered_branch_has_zero_fitness() {
        let (subject, result) = run(SIGN, "sign", vec![Value::Int(-5)]);
        let pool = GoalPool::new(subject, CoverageMetrics::default());
        let ids = pool.ids();
        // exactly one branch goal is covered with fitness zero: x < 0 true
        let covered: Vec<_> = ids
            .iter()
            .filter(|&&id| pool.fitness(id, &result) == 0.0)
            .collect();
        assert!(!covered.is_empty());
        assert!(covered.iter().all(|&&id| matches!(
            pool.goal(id),
            CoverageGoal::BranchTaken { .. } | CoverageGoal::CodeObjectEntered { .. }
        )));
    }

    #[test]
    fn uncovered_branch_fitness_reflects_distance() {
        let (subject, result) = run(SIGN, "sign", vec![Value::Int(10)]);
        let pool = GoalPool::new(subject.clone(), CoverageMetrics::default());
        // the "x < 0 true" goal was executed but not taken: normalized
        // distance strictly between 0 and 1
        let goal = pool
            .ids()
            .into_iter()
            .find(|&id| {
                matches!(
                    pool.goal(id),
                    CoverageGoal::BranchTaken { value: true, predicate } if *predicate == 0
                )
            })
            .expect("goal");
        let fitness = pool.fitness(goal, &result);
        assert!(fitness > 0.0 && fitness < 1.0, "fitness {fitness}");
    }

    #[test]
    fn unexecuted_predicate_gets_approach_level() {
        let nested = r#"
def classify(x: int) -> str {
    if x > 0 {
        if x > 100 { return "big" }
        return "small"
    }
    return "neg"
}
"#;
        let (subject, result) = run(nested, "classify", vec![Value::Int(-1)]);
        let pool = GoalPool::new(subject.clone(), CoverageMetrics::default());
        // the inner predicate (x > 100) never ran; its fitness must exceed 1
        let inner = subject
            .predicates
            .values()
            .find(|p| !p.parents.is_empty())
            .expect("nested predicate");
        let goal = pool
            .ids()
            .into_iter()
            .find(|&id| {
                matches!(
                    pool.goal(id),
                    CoverageGoal::BranchTaken { predicate, value: true } if *predicate == inner.id
                )
            })
            .expect("goal");
        let fitness = pool.fitness(goal, &result);
        assert!(fitness >= 1.0, "fitness {fitness}");
        assert!(fitness < 2.0, "one approach level expected, got {fitness}");
    }

    #[test]
    fn timed_out_results_get_worst_fitness() {
        let (subject, mut result) = run(SIGN, "sign", vec![Value::Int(1)]);
        result.timed_out = true;
        result.trace = ExecutionTrace::default();
        let pool = GoalPool::new(subject, CoverageMetrics::default());
        for id in pool.ids() {
            assert!(pool.fitness(id, &result) >= 1.0);
        }
    }

    #[test]
    fn dynamosa_roots_exclude_dependent_branches() {
        let nested = r#"
def classify(x: int) -> str {
    if x > 0 {
        if x > 100 { return "big" }
        return "small"
    }
    return "neg"
}
"#;
        let ast = parse_module("m", nested).expect("parse");
        let module = compile_module(&ast).expect("compile");
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let _ = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        let subject = Arc::new(tracer.subject().clone());
        let pool = GoalPool::new(subject, CoverageMetrics::default());
        let total = pool.len();
        let roots = pool.root_goals().len();
        assert!(roots < total, "nested goals must not be roots");
        // the outer-true goal activates the inner pair
        let with_children: Vec<_> = pool
            .ids()
            .into_iter()
            .filter(|&id| !pool.children_of(id).is_empty())
            .collect();
        assert_eq!(with_children.len(), 1);
        assert_eq!(pool.children_of(with_children[0]).len(), 2);
    }
}
