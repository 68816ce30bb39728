//! Constant seeding: a pool of primitive values harvested from the target.
//!
//! Two feeds: a static harvest of literals from the target AST before the
//! search starts, and dynamic capture of compared values by the seeding
//! probes during execution. The pool is append-only and thread-safe; the
//! factory samples it when synthesizing primitive statements.

use std::sync::Mutex;

use rand::Rng;

use crate::lang::ast::{Expr, Literal, ModuleAst, Stmt};
use crate::lang::value::Value;

/// A primitive constant usable as a seed.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Append-only pool of seed constants.
#[derive(Debug, Default)]
pub struct ConstantPool {
    ints: Mutex<Vec<i64>>,
    floats: Mutex<Vec<f64>>,
    strings: Mutex<Vec<String>>,
}

impl ConstantPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(&self, value: i64) {
        let mut ints = self.ints.lock().unwrap_or_else(|p| p.into_inner());
        if !ints.contains(&value) {
            ints.push(value);
        }
    }

    pub fn add_float(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut floats = self.floats.lock().unwrap_or_else(|p| p.into_inner());
        if !floats.contains(&value) {
            floats.push(value);
        }
    }

    pub fn add_string(&self, value: &str) {
        let mut strings = self.strings.lock().unwrap_or_else(|p| p.into_inner());
        if !strings.iter().any(|s| s == value) {
            strings.push(value.to_string());
        }
    }

    /// Records a runtime value observed by a seeding probe.
    pub fn observe(&self, value: &Value) {
        match value.unproxied() {
            Value::Int(i) => self.add_int(*i),
            Value::Float(f) => self.add_float(*f),
            Value::Str(s) => self.add_string(s),
            _ => {}
        }
    }

    #[must_use]
    pub fn random_int(&self, rng: &mut impl Rng) -> Option<i64> {
        let ints = self.ints.lock().unwrap_or_else(|p| p.into_inner());
        if ints.is_empty() {
            None
        } else {
            Some(ints[rng.gen_range(0..ints.len())])
        }
    }

    #[must_use]
    pub fn random_float(&self, rng: &mut impl Rng) -> Option<f64> {
        let floats = self.floats.lock().unwrap_or_else(|p| p.into_inner());
        if floats.is_empty() {
            None
        } else {
            Some(floats[rng.gen_range(0..floats.len())])
        }
    }

    #[must_use]
    pub fn random_string(&self, rng: &mut impl Rng) -> Option<String> {
        let strings = self.strings.lock().unwrap_or_else(|p| p.into_inner());
        if strings.is_empty() {
            None
        } else {
            Some(strings[rng.gen_range(0..strings.len())].clone())
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ints.lock().unwrap_or_else(|p| p.into_inner()).len()
            + self.floats.lock().unwrap_or_else(|p| p.into_inner()).len()
            + self.strings.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All pool entries, for persistence.
    #[must_use]
    pub fn entries(&self) -> Vec<SeedValue> {
        let mut out = Vec::new();
        out.extend(
            self.ints
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .map(|&i| SeedValue::Int(i)),
        );
        out.extend(
            self.floats
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .map(|&f| SeedValue::Float(f)),
        );
        out.extend(
            self.strings
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .map(|s| SeedValue::Str(s.clone())),
        );
        out
    }

    /// Loads entries from the CSV seed-file format (`kind,value` rows).
    pub fn load_csv(&self, text: &str) {
        for row in text.lines() {
            let Some((kind, value)) = row.split_once(',') else {
                continue;
            };
            match kind {
                "int" => {
                    if let Ok(v) = value.parse() {
                        self.add_int(v);
                    }
                }
                "float" => {
                    if let Ok(v) = value.parse() {
                        self.add_float(v);
                    }
                }
                "str" => self.add_string(value),
                _ => {}
            }
        }
    }

    /// Serializes the pool to the CSV seed-file format.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            match entry {
                SeedValue::Int(v) => out.push_str(&format!("int,{v}\n")),
                SeedValue::Float(v) => out.push_str(&format!("float,{v}\n")),
                SeedValue::Str(v) => out.push_str(&format!("str,{v}\n")),
            }
        }
        out
    }
}

/// Harvests every literal of the module AST into the pool.
pub fn harvest_static_constants(ast: &ModuleAst, pool: &ConstantPool) {
    fn literal(lit: &Literal, pool: &ConstantPool) {
        match lit {
            Literal::Int(v) => pool.add_int(*v),
            Literal::Float(v) => pool.add_float(*v),
            Literal::Str(v) => pool.add_string(v),
            Literal::None | Literal::Bool(_) => {}
        }
    }
    fn expr(e: &Expr, pool: &ConstantPool) {
        match e {
            Expr::Literal(lit) => literal(lit, pool),
            Expr::Unary { operand, .. } => expr(operand, pool),
            Expr::Binary { left, right, .. }
            | Expr::Compare { left, right, .. }
            | Expr::Bool { left, right, .. } => {
                expr(left, pool);
                expr(right, pool);
            }
            Expr::Call { args, kwargs, .. } => {
                for a in args {
                    expr(a, pool);
                }
                for (_, a) in kwargs {
                    expr(a, pool);
                }
            }
            Expr::MethodCall { object, args, .. } => {
                expr(object, pool);
                for a in args {
                    expr(a, pool);
                }
            }
            Expr::Attribute { object, .. } => expr(object, pool),
            Expr::Index { object, index } => {
                expr(object, pool);
                expr(index, pool);
            }
            Expr::ListLit(items) => {
                for item in items {
                    expr(item, pool);
                }
            }
            Expr::Name(_) => {}
        }
    }
    fn stmts(body: &[Stmt], pool: &ConstantPool) {
        for s in body {
            match s {
                Stmt::Assign { value, .. } => expr(value, pool),
                Stmt::If {
                    test,
                    then_body,
                    else_body,
                    ..
                } => {
                    expr(test, pool);
                    stmts(then_body, pool);
                    stmts(else_body, pool);
                }
                Stmt::While { test, body, .. } => {
                    expr(test, pool);
                    stmts(body, pool);
                }
                Stmt::For { iter, body, .. } => {
                    expr(iter, pool);
                    stmts(body, pool);
                }
                Stmt::Try { body, handlers, .. } => {
                    stmts(body, pool);
                    for handler in handlers {
                        stmts(&handler.body, pool);
                    }
                }
                Stmt::Return { value, .. } => {
                    if let Some(value) = value {
                        expr(value, pool);
                    }
                }
                Stmt::Raise { exc, .. } => expr(exc, pool),
                Stmt::Expr { value, .. } => expr(value, pool),
                Stmt::Break { .. } | Stmt::Continue { .. } => {}
            }
        }
    }
    for function in &ast.functions {
        for param in &function.params {
            if let Some(default) = &param.default {
                literal(default, pool);
            }
        }
        stmts(&function.body, pool);
    }
    for class in &ast.classes {
        for method in &class.methods {
            stmts(&method.body, pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_module;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn harvest_collects_literals_from_all_positions() {
        let ast = parse_module(
            "m",
            r#"
def grade(score: int) -> str {
    if score >= 90 { return "A" }
    if score >= 80 { return "B" }
    return "F"
}
"#,
        )
        .expect("parse");
        let pool = ConstantPool::new();
        harvest_static_constants(&ast, &pool);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pool.random_int(&mut rng).is_some());
        let entries = pool.entries();
        assert!(entries.contains(&SeedValue::Int(90)));
        assert!(entries.contains(&SeedValue::Str("A".to_string())));
    }

    #[test]
    fn csv_round_trip_preserves_entries() {
        let pool = ConstantPool::new();
        pool.add_int(42);
        pool.add_float(1.5);
        pool.add_string("hello");
        let csv = pool.to_csv();
        let restored = ConstantPool::new();
        restored.load_csv(&csv);
        assert_eq!(restored.entries(), pool.entries());
    }

    #[test]
    fn pool_deduplicates() {
        let pool = ConstantPool::new();
        pool.add_int(1);
        pool.add_int(1);
        assert_eq!(pool.len(), 1);
    }
}
