//! Execution traces and value snapshots.
//!
//! A trace is the record of one instrumented run: which code objects were
//! entered, per-predicate execution counts and minimum branch distances,
//! covered lines, and (when checked coverage is enabled) the ordered
//! instruction log the dynamic slicer walks backwards.
//!
//! Observed values cross the worker-thread boundary as snapshots: primitives
//! by value, aggregates reduced to type name, length, and primitive fields.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::bytecode::MemoryAccess;
use crate::lang::value::{ExceptionValue, Value};

/// One logged memory-access instruction, input to the dynamic slicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedInstruction {
    pub code_object: u32,
    pub offset: u32,
    pub line: u32,
    pub access: MemoryAccess,
    /// Local or attribute name; `<subscript>` for index accesses.
    pub symbol: String,
    /// The innermost predicate governing this instruction at runtime.
    pub controlling_predicate: Option<u32>,
}

/// The record of events emitted during one instrumented execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    pub executed_code_objects: HashSet<u32>,
    pub predicate_counts: HashMap<u32, u32>,
    pub true_distances: HashMap<u32, f64>,
    pub false_distances: HashMap<u32, f64>,
    pub covered_lines: HashSet<u32>,
    pub instruction_log: Vec<LoggedInstruction>,
    pub runtime: Duration,
    pub memory_high_watermark: usize,
}

impl ExecutionTrace {
    /// Merges another trace into this one, keeping minimum distances and
    /// unioning coverage. Used when a test case executes several statements.
    pub fn merge(&mut self, other: &ExecutionTrace) {
        self.executed_code_objects
            .extend(other.executed_code_objects.iter().copied());
        for (predicate, count) in &other.predicate_counts {
            *self.predicate_counts.entry(*predicate).or_insert(0) += count;
        }
        for (predicate, distance) in &other.true_distances {
            let entry = self
                .true_distances
                .entry(*predicate)
                .or_insert(f64::INFINITY);
            *entry = entry.min(*distance);
        }
        for (predicate, distance) in &other.false_distances {
            let entry = self
                .false_distances
                .entry(*predicate)
                .or_insert(f64::INFINITY);
            *entry = entry.min(*distance);
        }
        self.covered_lines.extend(other.covered_lines.iter().copied());
        self.instruction_log.extend(other.instruction_log.iter().cloned());
        self.memory_high_watermark = self.memory_high_watermark.max(other.memory_high_watermark);
    }
}

/// A value observation that is safe to carry across threads and replays.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSnapshot {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A container reduced to its type name and length.
    Collection { type_name: String, len: usize },
    /// An object instance reduced to its class name and primitive fields.
    Object {
        type_name: String,
        fields: BTreeMap<String, ValueSnapshot>,
    },
    /// Iterators, generators and anything else observed only by type name.
    Opaque { type_name: String },
}

impl ValueSnapshot {
    /// Captures a runtime value. Aggregates are reduced, never retained.
    #[must_use]
    pub fn capture(value: &Value) -> Self {
        match value.unproxied() {
            Value::None => ValueSnapshot::None,
            Value::Bool(b) => ValueSnapshot::Bool(*b),
            Value::Int(i) => ValueSnapshot::Int(*i),
            Value::Float(f) => ValueSnapshot::Float(*f),
            Value::Str(s) => ValueSnapshot::Str(s.as_ref().clone()),
            Value::List(items) => ValueSnapshot::Collection {
                type_name: "list".to_string(),
                len: items.borrow().len(),
            },
            Value::Object(data) => {
                let data = data.borrow();
                let mut fields = BTreeMap::new();
                for (name, field) in &data.fields {
                    if name.starts_with('_') {
                        continue;
                    }
                    match field.unproxied() {
                        Value::None
                        | Value::Bool(_)
                        | Value::Int(_)
                        | Value::Float(_)
                        | Value::Str(_) => {
                            fields.insert(name.clone(), ValueSnapshot::capture(field));
                        }
                        Value::List(items) => {
                            fields.insert(
                                name.clone(),
                                ValueSnapshot::Collection {
                                    type_name: "list".to_string(),
                                    len: items.borrow().len(),
                                },
                            );
                        }
                        _ => {}
                    }
                }
                ValueSnapshot::Object {
                    type_name: data.class_name.clone(),
                    fields,
                }
            }
            Value::Exception(exc) => ValueSnapshot::Opaque {
                type_name: exc.type_name.clone(),
            },
            Value::Iterator(_) => ValueSnapshot::Opaque {
                type_name: "iterator".to_string(),
            },
            Value::Proxy { .. } => unreachable!("unproxied returned a proxy"),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            ValueSnapshot::None => "none",
            ValueSnapshot::Bool(_) => "bool",
            ValueSnapshot::Int(_) => "int",
            ValueSnapshot::Float(_) => "float",
            ValueSnapshot::Str(_) => "str",
            ValueSnapshot::Collection { type_name, .. }
            | ValueSnapshot::Object { type_name, .. }
            | ValueSnapshot::Opaque { type_name } => type_name,
        }
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ValueSnapshot::None
                | ValueSnapshot::Bool(_)
                | ValueSnapshot::Int(_)
                | ValueSnapshot::Float(_)
                | ValueSnapshot::Str(_)
        )
    }
}

/// Outcome of one statement of a test case.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Ok {
        value: ValueSnapshot,
        elapsed: Duration,
    },
    Raised {
        exception: ExceptionValue,
        elapsed: Duration,
    },
    TimedOut,
    NotExecuted,
}

impl StatementOutcome {
    #[must_use]
    pub fn raised(&self) -> Option<&ExceptionValue> {
        match self {
            StatementOutcome::Raised { exception, .. } => Some(exception),
            _ => None,
        }
    }
}

/// Everything observed while running one test case.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub trace: ExecutionTrace,
    pub outcomes: Vec<StatementOutcome>,
    /// Per test-case statement, the half-open range of `instruction_log`
    /// entries it produced. Lets the slicer seed from a statement position.
    pub statement_log_ranges: Vec<(usize, usize)>,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Whether any statement raised.
    #[must_use]
    pub fn has_exceptions(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, StatementOutcome::Raised { .. }))
    }

    /// Position of the first raising statement.
    #[must_use]
    pub fn first_exception_position(&self) -> Option<usize> {
        self.outcomes
            .iter()
            .position(|o| matches!(o, StatementOutcome::Raised { .. }))
    }

    /// Total number of instructions executed, for budget accounting.
    #[must_use]
    pub fn executed_statements(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o, StatementOutcome::NotExecuted))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_minimum_distances() {
        let mut first = ExecutionTrace::default();
        first.true_distances.insert(1, 5.0);
        let mut second = ExecutionTrace::default();
        second.true_distances.insert(1, 2.0);
        second.false_distances.insert(1, 0.0);
        first.merge(&second);
        assert_eq!(first.true_distances[&1], 2.0);
        assert_eq!(first.false_distances[&1], 0.0);
    }

    #[test]
    fn snapshot_reduces_objects_to_primitive_fields() {
        let object = Value::Object(std::rc::Rc::new(std::cell::RefCell::new(
            crate::lang::value::ObjectData {
                class_name: "Queue".to_string(),
                fields: [
                    ("count".to_string(), Value::Int(2)),
                    ("items".to_string(), Value::list(vec![Value::Int(1)])),
                    ("_hidden".to_string(), Value::Int(9)),
                ]
                .into_iter()
                .collect(),
            },
        )));
        let snapshot = ValueSnapshot::capture(&object);
        match snapshot {
            ValueSnapshot::Object { type_name, fields } => {
                assert_eq!(type_name, "Queue");
                assert_eq!(fields["count"], ValueSnapshot::Int(2));
                assert!(matches!(
                    fields["items"],
                    ValueSnapshot::Collection { len: 1, .. }
                ));
                assert!(!fields.contains_key("_hidden"));
            }
            other => panic!("unexpected snapshot {other:?}"),
        }
    }
}
