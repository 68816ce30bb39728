//! Regression-assertion generation.
//!
//! Phase 1 replays every final test case against the original module and
//! turns stable observations into assertions: exact equality for int, bool
//! and str, approximate equality for float, structural checks (type name,
//! length, public primitive fields) for aggregates, and expected-exception
//! wrappers for raising statements. Values that vary across replays are
//! flaky and produce nothing. Generators and iterators are opaque.
//!
//! Phase 2 (see [`mutation`]) prunes the candidates down to those that
//! kill at least one mutant.

pub mod mutation;

use tracing::debug;

use crate::execution::executor::TestCaseExecutor;
use crate::execution::trace::{ExecutionResult, StatementOutcome, ValueSnapshot};
use crate::lang::value::exception_is_subtype;
use crate::testcase::{Assertion, TestCase};

/// Knobs of the candidate-generation phase.
#[derive(Debug, Clone)]
pub struct AssertionOptions {
    /// Replays per test; values must agree across all of them.
    pub replays: usize,
    /// Tolerance of approximate float assertions.
    pub float_tolerance: f64,
}

impl Default for AssertionOptions {
    fn default() -> Self {
        Self {
            replays: 2,
            float_tolerance: 1e-6,
        }
    }
}

/// Attaches candidate assertions to every test case by repeated replay.
pub fn generate_assertions(
    tests: &mut [TestCase],
    executor: &mut TestCaseExecutor,
    options: &AssertionOptions,
) {
    for test in tests.iter_mut() {
        test.clear_assertions();
        let replays: Vec<ExecutionResult> = (0..options.replays.max(1))
            .map(|_| executor.execute(test))
            .collect();
        let Some(first) = replays.first() else {
            continue;
        };
        if replays.iter().any(|r| r.timed_out) {
            continue;
        }
        let assertable: Vec<usize> = assertable_positions(test);
        for position in 0..test.size() {
            let outcome = &first.outcomes[position];
            let stable = replays.iter().all(|replay| {
                replay
                    .outcomes
                    .get(position)
                    .is_some_and(|other| same_observation(outcome, other))
            });
            if !stable {
                debug!(position, "dropping flaky observation");
                continue;
            }
            match outcome {
                StatementOutcome::Raised { exception, .. } => {
                    test.add_assertion(Assertion::ExpectedException {
                        position,
                        exception_type: exception.type_name.clone(),
                    });
                    // nothing executes after the raise
                    break;
                }
                StatementOutcome::Ok { value, .. } if assertable.contains(&position) => {
                    for assertion in
                        assertions_for_value(position, value, options.float_tolerance)
                    {
                        test.add_assertion(assertion);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Observation equality for the flakiness filter: values and exceptions
/// must agree; timings never matter.
fn same_observation(a: &StatementOutcome, b: &StatementOutcome) -> bool {
    match (a, b) {
        (StatementOutcome::Ok { value: va, .. }, StatementOutcome::Ok { value: vb, .. }) => {
            va == vb
        }
        (
            StatementOutcome::Raised { exception: ea, .. },
            StatementOutcome::Raised { exception: eb, .. },
        ) => ea == eb,
        (StatementOutcome::TimedOut, StatementOutcome::TimedOut)
        | (StatementOutcome::NotExecuted, StatementOutcome::NotExecuted) => true,
        _ => false,
    }
}

/// Positions worth asserting on: calls and field reads, not literals.
fn assertable_positions(test: &TestCase) -> Vec<usize> {
    use crate::testcase::StatementKind;
    test.statements()
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            matches!(
                s.kind,
                StatementKind::FunctionCall { .. }
                    | StatementKind::ConstructorCall { .. }
                    | StatementKind::MethodCall { .. }
                    | StatementKind::FieldRead { .. }
            )
        })
        .map(|(i, _)| i)
        .collect()
}

fn assertions_for_value(
    position: usize,
    value: &ValueSnapshot,
    float_tolerance: f64,
) -> Vec<Assertion> {
    match value {
        ValueSnapshot::None
        | ValueSnapshot::Bool(_)
        | ValueSnapshot::Int(_)
        | ValueSnapshot::Str(_) => vec![Assertion::ValueEquals {
            position,
            expected: value.clone(),
        }],
        ValueSnapshot::Float(expected) => vec![Assertion::FloatApprox {
            position,
            expected: *expected,
            tolerance: float_tolerance,
        }],
        ValueSnapshot::Collection { type_name, len } => vec![
            Assertion::TypeNameIs {
                position,
                expected: type_name.clone(),
            },
            Assertion::LenEquals {
                position,
                expected: *len,
            },
        ],
        ValueSnapshot::Object { type_name, fields } => {
            let mut assertions = vec![Assertion::TypeNameIs {
                position,
                expected: type_name.clone(),
            }];
            for (field, snapshot) in fields {
                if snapshot.is_primitive() {
                    assertions.push(Assertion::FieldEquals {
                        position,
                        field: field.clone(),
                        expected: snapshot.clone(),
                    });
                }
            }
            assertions
        }
        // iterators and other opaque values: type name only
        ValueSnapshot::Opaque { .. } => Vec::new(),
    }
}

/// Whether an assertion holds against an execution result.
#[must_use]
pub fn assertion_holds(
    assertion: &Assertion,
    result: &ExecutionResult,
    float_tolerance: f64,
) -> bool {
    let outcome = match result.outcomes.get(assertion.position()) {
        Some(outcome) => outcome,
        None => return false,
    };
    match assertion {
        Assertion::ExpectedException { exception_type, .. } => match outcome {
            StatementOutcome::Raised { exception, .. } => {
                exception_is_subtype(&exception.type_name, exception_type)
            }
            _ => false,
        },
        _ => {
            let StatementOutcome::Ok { value, .. } = outcome else {
                return false;
            };
            match assertion {
                Assertion::ValueEquals { expected, .. } => value == expected,
                Assertion::FloatApprox {
                    expected,
                    tolerance,
                    ..
                } => match value {
                    ValueSnapshot::Float(actual) => {
                        (actual - expected).abs() <= tolerance.max(float_tolerance)
                    }
                    ValueSnapshot::Int(actual) => {
                        (*actual as f64 - expected).abs() <= tolerance.max(float_tolerance)
                    }
                    _ => false,
                },
                Assertion::TypeNameIs { expected, .. } => value.type_name() == expected,
                Assertion::LenEquals { expected, .. } => match value {
                    ValueSnapshot::Collection { len, .. } => len == expected,
                    ValueSnapshot::Str(text) => text.chars().count() == *expected,
                    _ => false,
                },
                Assertion::FieldEquals {
                    field, expected, ..
                } => match value {
                    ValueSnapshot::Object { fields, .. } => fields.get(field) == Some(expected),
                    _ => false,
                },
                Assertion::ExpectedException { .. } => unreachable!("handled above"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterFilters, TestCluster, TypeInfo};
    use crate::execution::executor::ExecutorOptions;
    use crate::execution::tracer::{ExecutionTracer, TracerHandle};
    use crate::execution::vm::native_names;
    use crate::instrumentation::{InstrumentationOptions, Instrumenter};
    use crate::lang::{compile_module, parse_module};
    use crate::seeding::ConstantPool;
    use crate::testcase::statement::{Statement, StatementKind};
    use std::sync::Arc;

    const SOURCE: &str = r#"
def half(x: int) -> float { return x / 2 }
def shout(word: str) -> str { return word + "!" }
def safe_div(a: int, b: int) -> float {
    if b == 0 { raise ZeroDivisionError("division by zero") }
    return a / b
}
"#;

    fn executor() -> (TestCaseExecutor, Arc<TestCluster>) {
        let ast = parse_module("m", SOURCE).expect("parse");
        let cluster = Arc::new(TestCluster::from_module(&ast, &ClusterFilters::default()));
        let module = compile_module(&ast).expect("compile");
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        (
            TestCaseExecutor::new(
                Arc::new(instrumented),
                TracerHandle::new(tracer),
                ExecutorOptions::default(),
            ),
            cluster,
        )
    }

    fn call_test(cluster: &TestCluster, function: &str, args: Vec<StatementKind>) -> TestCase {
        let callable = cluster
            .accessible()
            .iter()
            .find(|c| c.name == function)
            .expect("callable")
            .clone();
        let mut test = TestCase::new();
        let mut refs = Vec::new();
        for kind in args {
            let value_type = match &kind {
                StatementKind::IntLiteral(_) => TypeInfo::Int,
                StatementKind::StrLiteral(_) => TypeInfo::Str,
                _ => TypeInfo::Any,
            };
            refs.push(test.push(Statement::new(kind, value_type)));
        }
        test.push(Statement::new(
            StatementKind::FunctionCall {
                callable,
                args: refs,
                kwargs: std::collections::BTreeMap::new(),
            },
            TypeInfo::Any,
        ));
        test
    }

    #[test]
    fn generates_exact_and_approximate_assertions() {
        let (mut executor, cluster) = executor();
        let mut tests = vec![
            call_test(&cluster, "half", vec![StatementKind::IntLiteral(7)]),
            call_test(
                &cluster,
                "shout",
                vec![StatementKind::StrLiteral("hey".to_string())],
            ),
        ];
        generate_assertions(&mut tests, &mut executor, &AssertionOptions::default());
        assert!(tests[0]
            .assertions()
            .iter()
            .any(|a| matches!(a, Assertion::FloatApprox { expected, .. } if (expected - 3.5).abs() < 1e-9)));
        assert!(tests[1].assertions().iter().any(|a| matches!(
            a,
            Assertion::ValueEquals { expected: ValueSnapshot::Str(s), .. } if s == "hey!"
        )));
    }

    #[test]
    fn raising_statement_gets_expected_exception() {
        let (mut executor, cluster) = executor();
        let mut tests = vec![call_test(
            &cluster,
            "safe_div",
            vec![StatementKind::IntLiteral(1), StatementKind::IntLiteral(0)],
        )];
        generate_assertions(&mut tests, &mut executor, &AssertionOptions::default());
        assert!(tests[0].assertions().iter().any(|a| matches!(
            a,
            Assertion::ExpectedException { exception_type, .. } if exception_type == "ZeroDivisionError"
        )));
    }

    #[test]
    fn assertion_holds_checks_subtypes_for_exceptions() {
        let (mut executor, cluster) = executor();
        let test = call_test(
            &cluster,
            "safe_div",
            vec![StatementKind::IntLiteral(1), StatementKind::IntLiteral(0)],
        );
        let result = executor.execute(&test);
        let assertion = Assertion::ExpectedException {
            position: 2,
            exception_type: "ArithmeticError".to_string(),
        };
        assert!(assertion_holds(&assertion, &result, 1e-6));
        let wrong = Assertion::ExpectedException {
            position: 2,
            exception_type: "LookupError".to_string(),
        };
        assert!(!assertion_holds(&wrong, &result, 1e-6));
    }
}
