//! Statement variants of the test-case model.
//!
//! Statements live in the arena owned by their test case and refer to
//! arguments by arena index ([`VariableRef`]), never by pointer, so cloning
//! a test case is a plain deep copy and reference identity is positional.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::{CallableDescriptor, TypeInfo};

/// Handle to the value produced by an earlier statement of the same test
/// case. Compares by position, which is identity within one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableRef(pub usize);

impl VariableRef {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// The polymorphic statement family.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    NoneLiteral,
    BoolLiteral(bool),
    IntLiteral(i64),
    FloatLiteral(f64),
    StrLiteral(String),
    ListLiteral(Vec<VariableRef>),
    FunctionCall {
        callable: Arc<CallableDescriptor>,
        args: Vec<VariableRef>,
        kwargs: BTreeMap<String, VariableRef>,
    },
    ConstructorCall {
        callable: Arc<CallableDescriptor>,
        args: Vec<VariableRef>,
    },
    MethodCall {
        callable: Arc<CallableDescriptor>,
        receiver: VariableRef,
        args: Vec<VariableRef>,
    },
    FieldRead {
        receiver: VariableRef,
        field: String,
    },
    FieldWrite {
        receiver: VariableRef,
        field: String,
        value: VariableRef,
    },
    /// Re-binds an earlier value under a fresh reference.
    Assignment {
        source: VariableRef,
    },
}

/// One statement plus the inferred type of the value it produces.
#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    /// Inferred at construction, may be refined after execution.
    pub value_type: TypeInfo,
}

impl Statement {
    #[must_use]
    pub fn new(kind: StatementKind, value_type: TypeInfo) -> Self {
        Self { kind, value_type }
    }

    /// Every argument reference of this statement, receivers included.
    #[must_use]
    pub fn references(&self) -> Vec<VariableRef> {
        match &self.kind {
            StatementKind::NoneLiteral
            | StatementKind::BoolLiteral(_)
            | StatementKind::IntLiteral(_)
            | StatementKind::FloatLiteral(_)
            | StatementKind::StrLiteral(_) => Vec::new(),
            StatementKind::ListLiteral(items) => items.clone(),
            StatementKind::FunctionCall { args, kwargs, .. } => {
                let mut refs = args.clone();
                refs.extend(kwargs.values().copied());
                refs
            }
            StatementKind::ConstructorCall { args, .. } => args.clone(),
            StatementKind::MethodCall { receiver, args, .. } => {
                let mut refs = vec![*receiver];
                refs.extend(args.iter().copied());
                refs
            }
            StatementKind::FieldRead { receiver, .. } => vec![*receiver],
            StatementKind::FieldWrite {
                receiver, value, ..
            } => vec![*receiver, *value],
            StatementKind::Assignment { source } => vec![*source],
        }
    }

    /// Rewrites every reference through `remap`; returns `false` when some
    /// reference cannot be resolved (the statement must then be dropped).
    pub fn remap_references(&mut self, remap: &dyn Fn(VariableRef) -> Option<VariableRef>) -> bool {
        let apply = |r: &mut VariableRef| -> bool {
            match remap(*r) {
                Some(new) => {
                    *r = new;
                    true
                }
                None => false,
            }
        };
        match &mut self.kind {
            StatementKind::NoneLiteral
            | StatementKind::BoolLiteral(_)
            | StatementKind::IntLiteral(_)
            | StatementKind::FloatLiteral(_)
            | StatementKind::StrLiteral(_) => true,
            StatementKind::ListLiteral(items) => items.iter_mut().all(apply),
            StatementKind::FunctionCall { args, kwargs, .. } => {
                args.iter_mut().all(apply) && kwargs.values_mut().all(apply)
            }
            StatementKind::ConstructorCall { args, .. } => args.iter_mut().all(apply),
            StatementKind::MethodCall { receiver, args, .. } => {
                apply(receiver) && args.iter_mut().all(apply)
            }
            StatementKind::FieldRead { receiver, .. } => apply(receiver),
            StatementKind::FieldWrite {
                receiver, value, ..
            } => apply(receiver) && apply(value),
            StatementKind::Assignment { source } => apply(source),
        }
    }

    /// Whether the produced value is a primitive literal.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::NoneLiteral
                | StatementKind::BoolLiteral(_)
                | StatementKind::IntLiteral(_)
                | StatementKind::FloatLiteral(_)
                | StatementKind::StrLiteral(_)
        )
    }

    /// The callable this statement invokes, if any.
    #[must_use]
    pub fn callable(&self) -> Option<&Arc<CallableDescriptor>> {
        match &self.kind {
            StatementKind::FunctionCall { callable, .. }
            | StatementKind::ConstructorCall { callable, .. }
            | StatementKind::MethodCall { callable, .. } => Some(callable),
            _ => None,
        }
    }
}
