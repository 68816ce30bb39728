//! Runtime values of the Guion language.
//!
//! Values are reference-counted where they are mutable aggregates (lists,
//! objects) so that aliasing inside a target module behaves like in any
//! dynamically-typed language. Exceptions are plain data, never unwound
//! through the engine itself.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// A runtime value of the target language.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectData>>),
    Exception(ExceptionValue),
    /// Opaque iteration state produced by `GetIter`; observed only by type
    /// name outside the VM.
    Iterator(Rc<RefCell<IterState>>),
    /// Transparent argument proxy used for type refinement. Operations on a
    /// proxy unwrap to the inner value and report usage to the tracer; native
    /// routines cannot tolerate proxies, which is why instrumented call
    /// sites into native code unwrap their arguments first.
    Proxy {
        inner: Box<Value>,
        knowledge: u32,
    },
}

/// Instance state of a user-defined class.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub class_name: String,
    pub fields: BTreeMap<String, Value>,
}

/// Iteration state over a materialized element sequence.
#[derive(Debug, Clone)]
pub struct IterState {
    pub items: Vec<Value>,
    pub position: usize,
}

/// An exception as data: a type name from the builtin hierarchy plus a
/// message. Raised exceptions travel through the VM as values, never as
/// Rust panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionValue {
    pub type_name: String,
    pub message: String,
}

impl ExceptionValue {
    #[must_use]
    pub fn new(type_name: &str, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }
}

/// The builtin exception hierarchy. Returns the parent type name, or `None`
/// for the root `Exception`.
#[must_use]
pub fn exception_parent(type_name: &str) -> Option<&'static str> {
    match type_name {
        "ZeroDivisionError" | "OverflowError" => Some("ArithmeticError"),
        "IndexError" | "KeyError" => Some("LookupError"),
        "ArithmeticError" | "LookupError" | "ValueError" | "TypeError" | "AttributeError"
        | "NameError" | "RuntimeError" | "StopIteration" => Some("Exception"),
        _ => None,
    }
}

/// Whether `sub` is `sup` or a transitive descendant in the builtin
/// exception hierarchy.
#[must_use]
pub fn exception_is_subtype(sub: &str, sup: &str) -> bool {
    if sub == sup {
        return true;
    }
    let mut current = sub;
    while let Some(parent) = exception_parent(current) {
        if parent == sup {
            return true;
        }
        current = parent;
    }
    false
}

impl Value {
    /// Strips any proxy layers without reporting usage.
    #[must_use]
    pub fn unproxied(&self) -> &Value {
        let mut value = self;
        while let Value::Proxy { inner, .. } = value {
            value = inner;
        }
        value
    }

    /// The runtime type name, matching what the target language would report.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.unproxied() {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Exception(_) => "exception",
            Value::Iterator(_) => "iterator",
            Value::Proxy { .. } => unreachable!("unproxied returned a proxy"),
        }
    }

    /// Class name for objects, type name otherwise.
    #[must_use]
    pub fn concrete_type_name(&self) -> String {
        match self.unproxied() {
            Value::Object(data) => data.borrow().class_name.clone(),
            other => other.type_name().to_string(),
        }
    }

    /// Truthiness following the usual dynamic-language conventions.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self.unproxied() {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Object(_) | Value::Exception(_) | Value::Iterator(_) => true,
            Value::Proxy { .. } => unreachable!("unproxied returned a proxy"),
        }
    }

    #[must_use]
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(Rc::new(text.into()))
    }

    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Identity comparison (`is`): reference identity for aggregates, value
    /// identity for immutable primitives.
    #[must_use]
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self.unproxied(), other.unproxied()) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality (`==`). Heterogeneous numeric comparisons follow
    /// the usual widening; any other heterogeneous pair is unequal.
    #[must_use]
    pub fn is_equal(&self, other: &Value) -> bool {
        match (self.unproxied(), other.unproxied()) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(y))
            }
            (Value::Exception(a), Value::Exception(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unproxied() {
            Value::None => write!(f, "none"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(data) => write!(f, "<{} object>", data.borrow().class_name),
            Value::Exception(exc) => write!(f, "{}: {}", exc.type_name, exc.message),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Proxy { .. } => unreachable!("unproxied returned a proxy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_subtyping_is_reflexive_and_transitive() {
        assert!(exception_is_subtype("ZeroDivisionError", "ZeroDivisionError"));
        assert!(exception_is_subtype("ZeroDivisionError", "ArithmeticError"));
        assert!(exception_is_subtype("ZeroDivisionError", "Exception"));
        assert!(!exception_is_subtype("ArithmeticError", "ZeroDivisionError"));
        assert!(!exception_is_subtype("ValueError", "LookupError"));
    }

    #[test]
    fn identity_distinguishes_aliases_from_copies() {
        let a = Value::list(vec![Value::Int(1)]);
        let alias = a.clone();
        let copy = Value::list(vec![Value::Int(1)]);
        assert!(a.is_identical(&alias));
        assert!(!a.is_identical(&copy));
        assert!(a.is_equal(&copy));
    }

    #[test]
    fn proxies_are_transparent_for_equality() {
        let proxied = Value::Proxy {
            inner: Box::new(Value::Int(7)),
            knowledge: 0,
        };
        assert!(proxied.is_equal(&Value::Int(7)));
        assert_eq!(proxied.type_name(), "int");
        assert!(proxied.is_truthy());
    }
}
