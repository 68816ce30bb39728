//! Mutation analysis: AST-level mutation operators, higher-order pairing,
//! and the mutant-killing filter over candidate assertions.
//!
//! Mutation sites are enumerated deterministically over the target AST;
//! applying a mutant means rewriting one (or, for higher-order mutants,
//! two) sites and recompiling. Each mutant module lives in its own
//! executor, so installing and restoring it is naturally scoped.
//!
//! # References
//!
//! - Jia & Harman (2011): "An Analysis and Survey of the Development of
//!   Mutation Testing"

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::execution::executor::{ExecutorOptions, TestCaseExecutor};
use crate::execution::tracer::{ExecutionTracer, TracerHandle};
use crate::lang::ast::{
    BinaryOp, BoolOp, CompareOp, Expr, Literal, ModuleAst, Stmt, UnaryOp,
};
use crate::lang::compiler::compile_module;
use crate::seeding::ConstantPool;
use crate::testcase::TestCase;

use super::assertion_holds;

/// The mutation-operator catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MutationOperator {
    ArithmeticOperatorReplacement,
    UnaryOperatorDeletion,
    ComparisonOperatorReplacement,
    BooleanOperatorSwap,
    NegationDeletion,
    LoopJumpSwap,
    ExceptionTypeSwap,
    HandlerRemoval,
    ConstantTweak,
}

impl MutationOperator {
    /// The default operator set.
    #[must_use]
    pub fn all() -> Vec<MutationOperator> {
        vec![
            MutationOperator::ArithmeticOperatorReplacement,
            MutationOperator::UnaryOperatorDeletion,
            MutationOperator::ComparisonOperatorReplacement,
            MutationOperator::BooleanOperatorSwap,
            MutationOperator::NegationDeletion,
            MutationOperator::LoopJumpSwap,
            MutationOperator::ExceptionTypeSwap,
            MutationOperator::HandlerRemoval,
            MutationOperator::ConstantTweak,
        ]
    }
}

/// One applicable mutation site in the target AST.
#[derive(Debug, Clone)]
pub struct MutationSite {
    pub index: usize,
    pub operator: MutationOperator,
    pub line: u32,
    pub description: String,
}

/// A generated mutant: the sites it flips and its description.
#[derive(Debug, Clone)]
pub struct Mutant {
    pub sites: Vec<usize>,
    pub description: String,
}

/// Enumerates every mutation site admitted by the operator set.
#[must_use]
pub fn enumerate_sites(ast: &ModuleAst, operators: &[MutationOperator]) -> Vec<MutationSite> {
    let enabled: HashSet<MutationOperator> = operators.iter().copied().collect();
    let mut walker = SiteWalker {
        enabled,
        apply: None,
        sites: Vec::new(),
        counter: 0,
    };
    let mut clone = ast.clone();
    walker.module(&mut clone);
    walker.sites
}

/// Applies the mutations at the given site indices, returning the mutated
/// module AST.
#[must_use]
pub fn apply_mutant(ast: &ModuleAst, operators: &[MutationOperator], sites: &[usize]) -> ModuleAst {
    let enabled: HashSet<MutationOperator> = operators.iter().copied().collect();
    let mut walker = SiteWalker {
        enabled,
        apply: Some(sites.iter().copied().collect()),
        sites: Vec::new(),
        counter: 0,
    };
    let mut mutated = ast.clone();
    walker.module(&mut mutated);
    mutated
}

/// First-order mutants, one per site.
#[must_use]
pub fn first_order_mutants(sites: &[MutationSite]) -> Vec<Mutant> {
    sites
        .iter()
        .map(|site| Mutant {
            sites: vec![site.index],
            description: site.description.clone(),
        })
        .collect()
}

/// Higher-order mutants: pair sites of distinct operators, halving the
/// mutant count while preserving operator diversity.
#[must_use]
pub fn higher_order_mutants(sites: &[MutationSite]) -> Vec<Mutant> {
    let mut mutants = Vec::new();
    let mut used = vec![false; sites.len()];
    for first in 0..sites.len() {
        if used[first] {
            continue;
        }
        let partner = (first + 1..sites.len()).find(|&second| {
            !used[second] && sites[second].operator != sites[first].operator
        });
        match partner {
            Some(second) => {
                used[first] = true;
                used[second] = true;
                mutants.push(Mutant {
                    sites: vec![sites[first].index, sites[second].index],
                    description: format!(
                        "{} + {}",
                        sites[first].description, sites[second].description
                    ),
                });
            }
            None => {
                used[first] = true;
                mutants.push(Mutant {
                    sites: vec![sites[first].index],
                    description: sites[first].description.clone(),
                });
            }
        }
    }
    mutants
}

struct SiteWalker {
    enabled: HashSet<MutationOperator>,
    /// `None` enumerates; `Some(sites)` applies those sites.
    apply: Option<HashSet<usize>>,
    sites: Vec<MutationSite>,
    counter: usize,
}

impl SiteWalker {
    fn module(&mut self, ast: &mut ModuleAst) {
        for function in &mut ast.functions {
            self.body(&mut function.body);
        }
        for class in &mut ast.classes {
            for method in &mut class.methods {
                self.body(&mut method.body);
            }
        }
    }

    /// Registers a site; returns whether it must be applied now.
    fn site(
        &mut self,
        operator: MutationOperator,
        line: u32,
        description: impl FnOnce() -> String,
    ) -> bool {
        if !self.enabled.contains(&operator) {
            return false;
        }
        let index = self.counter;
        self.counter += 1;
        match &self.apply {
            None => {
                self.sites.push(MutationSite {
                    index,
                    operator,
                    line,
                    description: description(),
                });
                false
            }
            Some(targets) => targets.contains(&index),
        }
    }

    fn body(&mut self, body: &mut Vec<Stmt>) {
        for stmt in body {
            self.statement(stmt);
        }
    }

    fn statement(&mut self, stmt: &mut Stmt) {
        let line = stmt.line();
        match stmt {
            Stmt::Break { .. } => {
                if self.site(MutationOperator::LoopJumpSwap, line, || {
                    "break -> continue".to_string()
                }) {
                    *stmt = Stmt::Continue { line };
                }
            }
            Stmt::Continue { .. } => {
                if self.site(MutationOperator::LoopJumpSwap, line, || {
                    "continue -> break".to_string()
                }) {
                    *stmt = Stmt::Break { line };
                }
            }
            Stmt::Assign { value, .. } => self.expression(value, line),
            Stmt::If {
                test,
                then_body,
                else_body,
                ..
            } => {
                self.expression(test, line);
                self.body(then_body);
                self.body(else_body);
            }
            Stmt::While { test, body, .. } => {
                self.expression(test, line);
                self.body(body);
            }
            Stmt::For { iter, body, .. } => {
                self.expression(iter, line);
                self.body(body);
            }
            Stmt::Try { body, handlers, .. } => {
                // removal is modeled as making the handler unmatchable, so
                // the traversal (and with it the site numbering) is the
                // same whether or not the mutation is applied
                if self.site(MutationOperator::HandlerRemoval, line, || {
                    "remove exception handler".to_string()
                }) {
                    if let Some(handler) = handlers.last_mut() {
                        handler.exc_type = "<removed>".to_string();
                    }
                }
                self.body(body);
                for handler in handlers {
                    let handler_line = handler.line;
                    if self.site(MutationOperator::ExceptionTypeSwap, handler_line, || {
                        format!("swap handled type {}", handler.exc_type)
                    }) {
                        handler.exc_type = swapped_exception_type(&handler.exc_type);
                    }
                    self.body(&mut handler.body);
                }
            }
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    self.expression(expr, line);
                }
            }
            Stmt::Raise { exc, .. } => {
                if let Expr::Call { function, .. } = exc {
                    if self.site(MutationOperator::ExceptionTypeSwap, line, || {
                        format!("swap raised type {function}")
                    }) {
                        *function = swapped_exception_type(function);
                    }
                }
                self.expression(exc, line);
            }
            Stmt::Expr { value, .. } => self.expression(value, line),
        }
    }

    fn expression(&mut self, expr: &mut Expr, line: u32) {
        match expr {
            Expr::Literal(literal) => {
                let describe = || format!("tweak constant {literal:?}");
                if self.site(MutationOperator::ConstantTweak, line, describe) {
                    tweak_literal(literal);
                }
            }
            Expr::Unary { op, operand } => {
                let operator = match op {
                    UnaryOp::Neg => MutationOperator::UnaryOperatorDeletion,
                    UnaryOp::Not => MutationOperator::NegationDeletion,
                };
                let description = match op {
                    UnaryOp::Neg => "delete unary minus",
                    UnaryOp::Not => "delete negation",
                };
                if self.site(operator, line, || description.to_string()) {
                    *expr = (**operand).clone();
                    self.expression(expr, line);
                    return;
                }
                self.expression(operand, line);
            }
            Expr::Binary { op, left, right } => {
                if self.site(MutationOperator::ArithmeticOperatorReplacement, line, || {
                    format!("replace arithmetic {op:?}")
                }) {
                    *op = replaced_arithmetic(*op);
                }
                self.expression(left, line);
                self.expression(right, line);
            }
            Expr::Compare { op, left, right } => {
                if self.site(MutationOperator::ComparisonOperatorReplacement, line, || {
                    format!("replace comparison {op:?}")
                }) {
                    *op = replaced_comparison(*op);
                }
                self.expression(left, line);
                self.expression(right, line);
            }
            Expr::Bool { op, left, right } => {
                if self.site(MutationOperator::BooleanOperatorSwap, line, || {
                    format!("swap boolean {op:?}")
                }) {
                    *op = match op {
                        BoolOp::And => BoolOp::Or,
                        BoolOp::Or => BoolOp::And,
                    };
                }
                self.expression(left, line);
                self.expression(right, line);
            }
            Expr::Call { args, kwargs, .. } => {
                for arg in args {
                    self.expression(arg, line);
                }
                for (_, arg) in kwargs {
                    self.expression(arg, line);
                }
            }
            Expr::MethodCall { object, args, .. } => {
                self.expression(object, line);
                for arg in args {
                    self.expression(arg, line);
                }
            }
            Expr::Attribute { object, .. } => self.expression(object, line),
            Expr::Index { object, index } => {
                self.expression(object, line);
                self.expression(index, line);
            }
            Expr::ListLit(items) => {
                for item in items {
                    self.expression(item, line);
                }
            }
            Expr::Name(_) => {}
        }
    }
}

fn replaced_arithmetic(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Add => BinaryOp::Sub,
        BinaryOp::Sub => BinaryOp::Add,
        BinaryOp::Mul => BinaryOp::Div,
        BinaryOp::Div => BinaryOp::Mul,
        BinaryOp::Mod => BinaryOp::Mul,
    }
}

fn replaced_comparison(op: CompareOp) -> CompareOp {
    match op {
        CompareOp::Eq => CompareOp::Ne,
        CompareOp::Ne => CompareOp::Eq,
        CompareOp::Lt => CompareOp::Ge,
        CompareOp::Le => CompareOp::Gt,
        CompareOp::Gt => CompareOp::Le,
        CompareOp::Ge => CompareOp::Lt,
        CompareOp::In => CompareOp::Eq,
        CompareOp::Is => CompareOp::Eq,
    }
}

fn swapped_exception_type(current: &str) -> String {
    match current {
        "ZeroDivisionError" => "ValueError".to_string(),
        "ValueError" => "TypeError".to_string(),
        "IndexError" => "KeyError".to_string(),
        _ => "RuntimeError".to_string(),
    }
}

fn tweak_literal(literal: &mut Literal) {
    *literal = match literal {
        Literal::Int(value) => Literal::Int(value.wrapping_add(1)),
        Literal::Float(value) => Literal::Float(*value + 1.0),
        Literal::Bool(value) => Literal::Bool(!*value),
        Literal::Str(value) if !value.is_empty() => Literal::Str(String::new()),
        // none-injection for the remaining constants
        _ => Literal::None,
    };
}

/// Outcome of the mutation-filtering phase.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub mutants_created: usize,
    pub mutants_killed: usize,
    pub mutants_timed_out: usize,
}

impl MutationReport {
    /// `killed / (created - timed_out)`.
    #[must_use]
    pub fn score(&self) -> f64 {
        let denominator = self.mutants_created.saturating_sub(self.mutants_timed_out);
        if denominator == 0 {
            0.0
        } else {
            self.mutants_killed as f64 / denominator as f64
        }
    }
}

/// Options of the filtering phase.
#[derive(Debug, Clone)]
pub struct MutationAnalysisOptions {
    pub operators: Vec<MutationOperator>,
    /// Pair mutations to reduce the mutant count.
    pub higher_order: bool,
    pub executor: ExecutorOptions,
    pub float_tolerance: f64,
}

impl Default for MutationAnalysisOptions {
    fn default() -> Self {
        Self {
            operators: MutationOperator::all(),
            higher_order: false,
            executor: ExecutorOptions::default(),
            float_tolerance: 1e-6,
        }
    }
}

/// Re-executes the assertion-enriched tests against every mutant and prunes
/// assertions that kill none of them. An empty mutant set keeps every
/// candidate assertion. Returns the report for the statistics record.
pub fn filter_assertions(
    tests: &mut [TestCase],
    target: &ModuleAst,
    options: &MutationAnalysisOptions,
) -> MutationReport {
    let sites = enumerate_sites(target, &options.operators);
    let mutants = if options.higher_order {
        higher_order_mutants(&sites)
    } else {
        first_order_mutants(&sites)
    };
    info!(
        sites = sites.len(),
        mutants = mutants.len(),
        "starting mutation analysis"
    );
    if mutants.is_empty() {
        return MutationReport {
            mutants_created: 0,
            mutants_killed: 0,
            mutants_timed_out: 0,
        };
    }

    // kill bookkeeping: per test, per assertion index, whether it killed
    let mut killers: Vec<Vec<bool>> = tests
        .iter()
        .map(|t| vec![false; t.assertions().len()])
        .collect();
    let mut killed = 0usize;
    let mut timed_out = 0usize;

    for mutant in &mutants {
        let mutated_ast = apply_mutant(target, &options.operators, &mutant.sites);
        let Ok(module) = compile_module(&mutated_ast) else {
            // a structurally invalid mutant counts as stillborn
            timed_out += 1;
            continue;
        };
        // mutants run unobserved: fresh disabled tracer, no instrumentation
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        tracer.set_enabled(false);
        let mut executor = TestCaseExecutor::new(
            Arc::new(module),
            TracerHandle::new(tracer),
            options.executor.clone(),
        );
        let mut mutant_killed = false;
        let mut mutant_timed_out = false;
        for (test_index, test) in tests.iter().enumerate() {
            if test.assertions().is_empty() {
                continue;
            }
            let result = executor.execute(test);
            if result.timed_out {
                mutant_timed_out = true;
                continue;
            }
            for (assertion_index, assertion) in test.assertions().iter().enumerate() {
                if !assertion_holds(assertion, &result, options.float_tolerance) {
                    killers[test_index][assertion_index] = true;
                    mutant_killed = true;
                }
            }
        }
        if mutant_killed {
            killed += 1;
            debug!(mutant = %mutant.description, "mutant killed");
        } else if mutant_timed_out {
            timed_out += 1;
        }
    }

    // retain only mutant-killing assertions
    for (test, kill_flags) in tests.iter_mut().zip(&killers) {
        let mut index = 0;
        test.retain_assertions(|_| {
            let keep = kill_flags.get(index).copied().unwrap_or(false);
            index += 1;
            keep
        });
    }

    MutationReport {
        mutants_created: mutants.len(),
        mutants_killed: killed,
        mutants_timed_out: timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_module;

    const SOURCE: &str = r#"
def clamp(x: int) -> int {
    if x < 0 { return 0 }
    if x > 10 { return 10 }
    return x
}
"#;

    #[test]
    fn sites_cover_comparisons_and_constants() {
        let ast = parse_module("m", SOURCE).expect("parse");
        let sites = enumerate_sites(&ast, &MutationOperator::all());
        assert!(sites
            .iter()
            .any(|s| s.operator == MutationOperator::ComparisonOperatorReplacement));
        assert!(sites
            .iter()
            .any(|s| s.operator == MutationOperator::ConstantTweak));
        // deterministic enumeration
        let again = enumerate_sites(&ast, &MutationOperator::all());
        assert_eq!(sites.len(), again.len());
    }

    #[test]
    fn applying_a_comparison_site_changes_the_ast() {
        let ast = parse_module("m", SOURCE).expect("parse");
        let sites = enumerate_sites(&ast, &MutationOperator::all());
        let comparison = sites
            .iter()
            .find(|s| s.operator == MutationOperator::ComparisonOperatorReplacement)
            .expect("comparison site");
        let mutated = apply_mutant(&ast, &MutationOperator::all(), &[comparison.index]);
        assert_ne!(ast, mutated);
        // the mutant still compiles
        assert!(compile_module(&mutated).is_ok());
    }

    #[test]
    fn higher_order_pairs_distinct_operators() {
        let ast = parse_module("m", SOURCE).expect("parse");
        let sites = enumerate_sites(&ast, &MutationOperator::all());
        let mutants = higher_order_mutants(&sites);
        assert!(mutants.len() < sites.len());
        assert!(mutants.iter().any(|m| m.sites.len() == 2));
    }

    #[test]
    fn operator_filter_limits_sites() {
        let ast = parse_module("m", SOURCE).expect("parse");
        let only_constants =
            enumerate_sites(&ast, &[MutationOperator::ConstantTweak]);
        assert!(only_constants
            .iter()
            .all(|s| s.operator == MutationOperator::ConstantTweak));
        let everything = enumerate_sites(&ast, &MutationOperator::all());
        assert!(only_constants.len() < everything.len());
    }
}
