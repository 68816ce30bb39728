//! Compiles the Guion AST to stack bytecode.
//!
//! One code object per function or method; classes compile to a method
//! table plus the field list harvested from constructor assignments.
//! Compilation is total over parsed input except for structural errors
//! (break outside a loop), which are setup failures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::{CodeObject, CompiledClass, CompiledModule, Constant, Instruction, ParamSpec};

use super::ast::{
    AssignTarget, BoolOp, Expr, FunctionDef, Literal, ModuleAst, Stmt, UnaryOp,
};

/// Structural compilation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub function: String,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compile error in {} (line {}): {}",
            self.function, self.line, self.message
        )
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

/// Compiles a parsed module.
pub fn compile_module(ast: &ModuleAst) -> CompileResult<CompiledModule> {
    let mut functions = BTreeMap::new();
    for function in &ast.functions {
        let qualified = format!("{}.{}", ast.name, function.name);
        let code = compile_function(function, &qualified, false)?;
        functions.insert(function.name.clone(), Arc::new(code));
    }
    let mut classes = BTreeMap::new();
    for class in &ast.classes {
        let mut methods = BTreeMap::new();
        for method in &class.methods {
            let qualified = format!("{}.{}.{}", ast.name, class.name, method.name);
            let code = compile_function(method, &qualified, true)?;
            methods.insert(method.name.clone(), Arc::new(code));
        }
        let fields = constructor_fields(class.methods.iter().find(|m| m.name == "init"));
        classes.insert(
            class.name.clone(),
            CompiledClass {
                name: class.name.clone(),
                methods,
                fields,
            },
        );
    }
    Ok(CompiledModule {
        name: ast.name.clone(),
        functions,
        classes,
    })
}

/// Fields assigned as `self.<name> = ...` anywhere in the constructor body.
fn constructor_fields(init: Option<&FunctionDef>) -> Vec<String> {
    let mut fields = Vec::new();
    let Some(init) = init else {
        return fields;
    };
    fn walk(body: &[Stmt], fields: &mut Vec<String>) {
        for stmt in body {
            match stmt {
                Stmt::Assign {
                    target: AssignTarget::Attr { object, name },
                    ..
                } => {
                    if matches!(object, Expr::Name(n) if n == "self")
                        && !fields.contains(name)
                    {
                        fields.push(name.clone());
                    }
                }
                Stmt::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    walk(then_body, fields);
                    walk(else_body, fields);
                }
                Stmt::While { body, .. } | Stmt::For { body, .. } => walk(body, fields),
                Stmt::Try { body, handlers, .. } => {
                    walk(body, fields);
                    for handler in handlers {
                        walk(&handler.body, fields);
                    }
                }
                _ => {}
            }
        }
    }
    walk(&init.body, &mut fields);
    fields
}

struct LoopContext {
    start_block_label: u32,
    break_patches: Vec<usize>,
    /// Whether the loop keeps an iterator on the stack (for-loops do).
    has_iterator: bool,
}

struct FunctionCompiler {
    name: String,
    instructions: Vec<Instruction>,
    lines: Vec<u32>,
    consts: Vec<Constant>,
    names: Vec<String>,
    locals: Vec<String>,
    kw_tables: Vec<Vec<String>>,
    loops: Vec<LoopContext>,
    current_line: u32,
}

fn compile_function(
    function: &FunctionDef,
    qualified: &str,
    _is_method: bool,
) -> CompileResult<CodeObject> {
    let mut locals: Vec<String> = function.params.iter().map(|p| p.name.clone()).collect();
    collect_assigned_names(&function.body, &mut locals);

    let mut compiler = FunctionCompiler {
        name: qualified.to_string(),
        instructions: Vec::new(),
        lines: Vec::new(),
        consts: Vec::new(),
        names: Vec::new(),
        locals,
        kw_tables: Vec::new(),
        loops: Vec::new(),
        current_line: function.line,
    };
    compiler.block(&function.body)?;
    // implicit `return none`
    let none = compiler.const_idx(Constant::None);
    compiler.emit(Instruction::LoadConst(none));
    compiler.emit(Instruction::Return);

    let params = function
        .params
        .iter()
        .map(|p| ParamSpec {
            name: p.name.clone(),
            default: p.default.as_ref().map(literal_to_constant),
        })
        .collect();

    Ok(CodeObject {
        name: compiler.name,
        params,
        consts: compiler.consts,
        names: compiler.names,
        locals: compiler.locals,
        kw_tables: compiler.kw_tables,
        instructions: compiler.instructions,
        lines: compiler.lines,
        first_line: function.line,
    })
}

fn literal_to_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::None => Constant::None,
        Literal::Bool(b) => Constant::Bool(*b),
        Literal::Int(i) => Constant::Int(*i),
        Literal::Float(f) => Constant::Float(*f),
        Literal::Str(s) => Constant::Str(s.clone()),
    }
}

fn collect_assigned_names(body: &[Stmt], locals: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign {
                target: AssignTarget::Name(name),
                ..
            } => {
                if !locals.contains(name) {
                    locals.push(name.clone());
                }
            }
            Stmt::For { var, body, .. } => {
                if !locals.contains(var) {
                    locals.push(var.clone());
                }
                collect_assigned_names(body, locals);
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_assigned_names(then_body, locals);
                collect_assigned_names(else_body, locals);
            }
            Stmt::While { body, .. } => collect_assigned_names(body, locals),
            Stmt::Try { body, handlers, .. } => {
                collect_assigned_names(body, locals);
                for handler in handlers {
                    collect_assigned_names(&handler.body, locals);
                }
            }
            _ => {}
        }
    }
}

impl FunctionCompiler {
    fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.lines.push(self.current_line);
        self.instructions.len() - 1
    }

    fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch(&mut self, index: usize, target: u32) {
        self.instructions[index].set_jump_target(target);
    }

    fn const_idx(&mut self, constant: Constant) -> u32 {
        if let Some(found) = self.consts.iter().position(|c| c == &constant) {
            return found as u32;
        }
        self.consts.push(constant);
        (self.consts.len() - 1) as u32
    }

    fn name_idx(&mut self, name: &str) -> u32 {
        if let Some(found) = self.names.iter().position(|n| n == name) {
            return found as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    fn local_idx(&mut self, name: &str) -> Option<u32> {
        self.locals.iter().position(|l| l == name).map(|i| i as u32)
    }

    fn error(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            function: self.name.clone(),
            line,
            message: message.into(),
        }
    }

    fn block(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.current_line = stmt.line();
        match stmt {
            Stmt::Assign {
                target,
                value,
                line,
            } => match target {
                AssignTarget::Name(name) => {
                    self.expression(value)?;
                    let slot = self
                        .local_idx(name)
                        .ok_or_else(|| self.error(*line, format!("unknown local {name}")))?;
                    self.emit(Instruction::StoreLocal(slot));
                }
                AssignTarget::Attr { object, name } => {
                    self.expression(object)?;
                    self.expression(value)?;
                    let name = self.name_idx(name);
                    self.emit(Instruction::StoreAttr(name));
                }
                AssignTarget::Index { object, index } => {
                    self.expression(object)?;
                    self.expression(index)?;
                    self.expression(value)?;
                    self.emit(Instruction::StoreIndex);
                }
            },
            Stmt::If {
                test,
                then_body,
                else_body,
                ..
            } => {
                self.expression(test)?;
                let to_else = self.emit(Instruction::JumpIfFalse(0));
                self.block(then_body)?;
                if else_body.is_empty() {
                    let end = self.here();
                    self.patch(to_else, end);
                } else {
                    let to_end = self.emit(Instruction::Jump(0));
                    let else_start = self.here();
                    self.patch(to_else, else_start);
                    self.block(else_body)?;
                    let end = self.here();
                    self.patch(to_end, end);
                }
            }
            Stmt::While { test, body, .. } => {
                let start = self.here();
                self.expression(test)?;
                let to_end = self.emit(Instruction::JumpIfFalse(0));
                self.loops.push(LoopContext {
                    start_block_label: start,
                    break_patches: Vec::new(),
                    has_iterator: false,
                });
                self.block(body)?;
                let context = self.loops.pop().expect("loop context");
                self.emit(Instruction::Jump(context.start_block_label));
                let end = self.here();
                self.patch(to_end, end);
                for patch in context.break_patches {
                    self.patch(patch, end);
                }
            }
            Stmt::For {
                var, iter, body, ..
            } => {
                self.expression(iter)?;
                self.emit(Instruction::GetIter);
                let start = self.here();
                let for_iter = self.emit(Instruction::ForIter(0));
                let slot = self
                    .local_idx(var)
                    .expect("loop variable collected as local");
                self.emit(Instruction::StoreLocal(slot));
                self.loops.push(LoopContext {
                    start_block_label: start,
                    break_patches: Vec::new(),
                    has_iterator: true,
                });
                self.block(body)?;
                let context = self.loops.pop().expect("loop context");
                self.emit(Instruction::Jump(context.start_block_label));
                let end = self.here();
                self.patch(for_iter, end);
                for patch in context.break_patches {
                    self.patch(patch, end);
                }
            }
            Stmt::Try { body, handlers, .. } => {
                let setup = self.emit(Instruction::SetupExcept(0));
                self.block(body)?;
                self.emit(Instruction::PopBlock);
                let to_end_after_body = self.emit(Instruction::Jump(0));
                let handler_start = self.here();
                self.patch(setup, handler_start);
                let mut end_patches = vec![to_end_after_body];
                for handler in handlers {
                    self.current_line = handler.line;
                    let type_idx = self.name_idx(&handler.exc_type);
                    self.emit(Instruction::ExcMatch(type_idx));
                    let to_next = self.emit(Instruction::JumpIfFalse(0));
                    // matched: drop the exception value and run the handler
                    self.emit(Instruction::PopTop);
                    self.block(&handler.body)?;
                    end_patches.push(self.emit(Instruction::Jump(0)));
                    let next = self.here();
                    self.patch(to_next, next);
                }
                self.emit(Instruction::Reraise);
                let end = self.here();
                for patch in end_patches {
                    self.patch(patch, end);
                }
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => self.expression(value)?,
                    None => {
                        let none = self.const_idx(Constant::None);
                        self.emit(Instruction::LoadConst(none));
                    }
                }
                self.emit(Instruction::Return);
            }
            Stmt::Raise { exc, .. } => {
                self.expression(exc)?;
                self.emit(Instruction::Raise);
            }
            Stmt::Break { line } => {
                let has_iterator = match self.loops.last() {
                    Some(context) => context.has_iterator,
                    None => return Err(self.error(*line, "break outside loop")),
                };
                if has_iterator {
                    self.emit(Instruction::PopTop);
                }
                let patch = self.emit(Instruction::Jump(0));
                self.loops
                    .last_mut()
                    .expect("loop context")
                    .break_patches
                    .push(patch);
            }
            Stmt::Continue { line } => {
                let start = match self.loops.last() {
                    Some(context) => context.start_block_label,
                    None => return Err(self.error(*line, "continue outside loop")),
                };
                self.emit(Instruction::Jump(start));
            }
            Stmt::Expr { value, .. } => {
                self.expression(value)?;
                self.emit(Instruction::PopTop);
            }
        }
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Literal(literal) => {
                let idx = self.const_idx(literal_to_constant(literal));
                self.emit(Instruction::LoadConst(idx));
            }
            Expr::Name(name) => match self.local_idx(name) {
                Some(slot) => {
                    self.emit(Instruction::LoadLocal(slot));
                }
                None => {
                    let idx = self.name_idx(name);
                    self.emit(Instruction::LoadGlobal(idx));
                }
            },
            Expr::Unary { op, operand } => {
                self.expression(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Instruction::UnaryNeg,
                    UnaryOp::Not => Instruction::UnaryNot,
                });
            }
            Expr::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit(Instruction::Binary(*op));
            }
            Expr::Compare { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit(Instruction::Compare(*op));
            }
            Expr::Bool { op, left, right } => {
                self.expression(left)?;
                let short = self.emit(match op {
                    BoolOp::And => Instruction::JumpIfFalseOrPop(0),
                    BoolOp::Or => Instruction::JumpIfTrueOrPop(0),
                });
                self.expression(right)?;
                let end = self.here();
                self.patch(short, end);
            }
            Expr::Call {
                function,
                args,
                kwargs,
            } => {
                for arg in args {
                    self.expression(arg)?;
                }
                let kw = if kwargs.is_empty() {
                    None
                } else {
                    for (_, value) in kwargs {
                        self.expression(value)?;
                    }
                    let table: Vec<String> = kwargs.iter().map(|(n, _)| n.clone()).collect();
                    self.kw_tables.push(table);
                    Some((self.kw_tables.len() - 1) as u32)
                };
                let name = self.name_idx(function);
                self.emit(Instruction::CallFunction {
                    name,
                    argc: args.len() as u8,
                    kw,
                });
            }
            Expr::MethodCall {
                object,
                method,
                args,
            } => {
                self.expression(object)?;
                for arg in args {
                    self.expression(arg)?;
                }
                let name = self.name_idx(method);
                self.emit(Instruction::CallMethod {
                    name,
                    argc: args.len() as u8,
                });
            }
            Expr::Attribute { object, name } => {
                self.expression(object)?;
                let name = self.name_idx(name);
                self.emit(Instruction::LoadAttr(name));
            }
            Expr::Index { object, index } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit(Instruction::LoadIndex);
            }
            Expr::ListLit(items) => {
                for item in items {
                    self.expression(item)?;
                }
                self.emit(Instruction::BuildList(items.len() as u32));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_module;

    fn compile(source: &str) -> CompiledModule {
        let ast = parse_module("m", source).expect("parse");
        compile_module(&ast).expect("compile")
    }

    #[test]
    fn compiles_branching_function() {
        let module = compile(
            "def sign(x: int) -> int { if x < 0 { return -1 } if x > 0 { return 1 } return 0 }",
        );
        let code = &module.functions["sign"];
        assert!(code
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::JumpIfFalse(_))));
        // implicit trailing return is present
        assert!(matches!(
            code.instructions.last(),
            Some(Instruction::Return)
        ));
    }

    #[test]
    fn constructor_fields_are_harvested() {
        let module = compile(
            "class Queue { def init(self) { self.items = [] self.count = 0 } }",
        );
        assert_eq!(module.classes["Queue"].fields, vec!["items", "count"]);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let ast = parse_module("m", "def f() { break }").expect("parse");
        let err = compile_module(&ast).unwrap_err();
        assert!(err.message.contains("break"));
    }

    #[test]
    fn loop_compiles_with_back_edge() {
        let module = compile("def total(xs: list) -> int { t = 0 for x in xs { t = t + x } return t }");
        let code = &module.functions["total"];
        assert!(code
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::ForIter(_))));
        assert!(code
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::GetIter)));
    }

    #[test]
    fn keyword_call_records_name_table() {
        let module = compile("def f() { return g(1, fallback=2) }");
        let code = &module.functions["f"];
        assert_eq!(code.kw_tables.len(), 1);
        assert_eq!(code.kw_tables[0], vec!["fallback"]);
    }
}
