//! Bytecode interpreter for instrumented Guion modules.
//!
//! Target exceptions are data, not unwinding: every entry point returns
//! `Result<Value, VmError>` where `VmError::Raised` carries the exception
//! value. Abort requests (statement deadline, cooperative cancel flag) are
//! checked on a fixed instruction cadence, so target loops can always be
//! interrupted without OS-level preemption.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bytecode::{CodeObject, CompiledModule, Constant, Instruction, MemoryAccess};
use crate::lang::ast::{BinaryOp, CompareOp};
use crate::lang::value::{ExceptionValue, IterState, ObjectData, Value};

use super::trace::LoggedInstruction;
use super::tracer::TracerHandle;

/// Why execution of a statement stopped without a value.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// The target raised; the exception travels as data.
    Raised(ExceptionValue),
    /// The statement deadline expired or a cooperative abort was requested.
    Aborted,
}

impl VmError {
    fn raise(type_name: &str, message: impl Into<String>) -> Self {
        VmError::Raised(ExceptionValue::new(type_name, message))
    }
}

pub type VmResult<T> = Result<T, VmError>;

const ABORT_CHECK_INTERVAL: u64 = 64;
const MAX_CALL_DEPTH: usize = 128;
/// Rough per-aggregate cost used for the memory high-watermark.
const AGGREGATE_COST: usize = 64;

/// Builtin function names; calls to these resolve natively and must not
/// receive proxies.
pub const NATIVE_FUNCTIONS: &[&str] = &["len", "abs", "str", "int", "float", "min", "max"];

/// Exception type names usable as constructors in target code.
pub const EXCEPTION_TYPES: &[&str] = &[
    "Exception",
    "ArithmeticError",
    "ZeroDivisionError",
    "OverflowError",
    "LookupError",
    "IndexError",
    "KeyError",
    "ValueError",
    "TypeError",
    "AttributeError",
    "NameError",
    "RuntimeError",
    "StopIteration",
];

/// All names the unwrap adapter must treat as native.
#[must_use]
pub fn native_names() -> std::collections::HashSet<String> {
    NATIVE_FUNCTIONS
        .iter()
        .chain(EXCEPTION_TYPES.iter())
        .map(|s| (*s).to_string())
        .collect()
}

/// The interpreter for one instrumented module.
pub struct Vm {
    module: Arc<CompiledModule>,
    tracer: TracerHandle,
    abort: Arc<AtomicBool>,
    deadline: Option<Instant>,
    instructions_executed: u64,
    memory_estimate: usize,
    depth: usize,
    /// code object name -> tracer id, for instruction logging
    code_ids: HashMap<String, u32>,
}

struct ExceptBlock {
    handler: usize,
    stack_depth: usize,
}

impl Vm {
    #[must_use]
    pub fn new(module: Arc<CompiledModule>, tracer: TracerHandle, abort: Arc<AtomicBool>) -> Self {
        let code_ids = {
            let guard = tracer.lock();
            guard
                .subject()
                .code_objects
                .values()
                .map(|meta| (meta.name.clone(), meta.id))
                .collect()
        };
        Self {
            module,
            tracer,
            abort,
            deadline: None,
            instructions_executed: 0,
            memory_estimate: 0,
            depth: 0,
            code_ids,
        }
    }

    /// Sets the deadline checked on the abort cadence. `None` disables it.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    #[must_use]
    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    /// Calls a module-level function by name.
    pub fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> VmResult<Value> {
        if let Some(code) = self.module.functions.get(name).cloned() {
            let locals = bind_arguments(&code, args, kwargs)?;
            return self.run_code(&code, locals);
        }
        if self.module.classes.contains_key(name) {
            if !kwargs.is_empty() {
                return Err(VmError::raise(
                    "TypeError",
                    "constructors take positional arguments only",
                ));
            }
            return self.construct(name, args);
        }
        self.call_native(name, args, kwargs)
    }

    /// Instantiates a class, running its constructor when present.
    pub fn construct(&mut self, class_name: &str, args: Vec<Value>) -> VmResult<Value> {
        let class = self.module.classes.get(class_name).cloned().ok_or_else(|| {
            VmError::raise("NameError", format!("name '{class_name}' is not defined"))
        })?;
        let object = Value::Object(Rc::new(RefCell::new(ObjectData {
            class_name: class_name.to_string(),
            fields: BTreeMap::new(),
        })));
        self.memory_estimate += AGGREGATE_COST;
        if let Some(init) = class.methods.get("init").cloned() {
            let mut full_args = vec![object.clone()];
            full_args.extend(args);
            let locals = bind_arguments(&init, full_args, Vec::new())?;
            self.run_code(&init, locals)?;
        } else if !args.is_empty() {
            return Err(VmError::raise(
                "TypeError",
                format!("{class_name}() takes no arguments"),
            ));
        }
        Ok(object)
    }

    /// Calls a method on a receiver value.
    pub fn call_method(
        &mut self,
        receiver: Value,
        method: &str,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let receiver = self.observe_receiver(receiver, method);
        match receiver.unproxied().clone() {
            Value::Object(data) => {
                let class_name = data.borrow().class_name.clone();
                let class = self.module.classes.get(&class_name).cloned().ok_or_else(
                    || VmError::raise("NameError", format!("unknown class {class_name}")),
                )?;
                let code = class.methods.get(method).cloned().ok_or_else(|| {
                    VmError::raise(
                        "AttributeError",
                        format!("'{class_name}' object has no attribute '{method}'"),
                    )
                })?;
                let mut full_args = vec![Value::Object(data)];
                full_args.extend(args);
                let locals = bind_arguments(&code, full_args, Vec::new())?;
                self.run_code(&code, locals)
            }
            Value::List(items) => list_method(&items, method, args, &mut self.memory_estimate),
            Value::Str(text) => string_method(&text, method, args),
            other => Err(VmError::raise(
                "AttributeError",
                format!("'{}' object has no attribute '{method}'", other.type_name()),
            )),
        }
    }

    /// Reads an attribute from an object.
    pub fn get_attr(&mut self, receiver: &Value, name: &str) -> VmResult<Value> {
        if let Value::Proxy { inner, knowledge } = receiver {
            self.tracer.lock().record_proxy_usage(
                *knowledge,
                Some(inner.type_name()),
                None,
                Some(name),
            );
        }
        match receiver.unproxied() {
            Value::Object(data) => data.borrow().fields.get(name).cloned().ok_or_else(|| {
                VmError::raise(
                    "AttributeError",
                    format!(
                        "'{}' object has no attribute '{name}'",
                        data.borrow().class_name
                    ),
                )
            }),
            other => Err(VmError::raise(
                "AttributeError",
                format!("'{}' object has no attribute '{name}'", other.type_name()),
            )),
        }
    }

    /// Writes an attribute on an object.
    pub fn set_attr(&mut self, receiver: &Value, name: &str, value: Value) -> VmResult<()> {
        match receiver.unproxied() {
            Value::Object(data) => {
                data.borrow_mut().fields.insert(name.to_string(), value);
                Ok(())
            }
            other => Err(VmError::raise(
                "TypeError",
                format!("cannot set attribute on '{}'", other.type_name()),
            )),
        }
    }

    fn observe_receiver(&mut self, receiver: Value, method: &str) -> Value {
        if let Value::Proxy { ref inner, knowledge } = receiver {
            self.tracer.lock().record_proxy_usage(
                knowledge,
                Some(inner.type_name()),
                Some(method),
                None,
            );
        }
        receiver
    }

    fn check_abort(&self) -> VmResult<()> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(VmError::Aborted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(VmError::Aborted);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn run_code(&mut self, code: &CodeObject, mut locals: Vec<Value>) -> VmResult<Value> {
        self.depth += 1;
        if self.depth > MAX_CALL_DEPTH {
            self.depth -= 1;
            return Err(VmError::raise(
                "RuntimeError",
                "maximum recursion depth exceeded",
            ));
        }
        let result = self.run_frame(code, &mut locals);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, code: &CodeObject, locals: &mut Vec<Value>) -> VmResult<Value> {
        locals.resize(code.locals.len(), Value::None);
        let mut stack: Vec<Value> = Vec::with_capacity(8);
        let mut blocks: Vec<ExceptBlock> = Vec::new();
        let mut pc = 0usize;
        let mut pending_for: Option<u32> = None;
        let mut last_predicate: Option<u32> = None;
        let code_id = self.code_ids.get(&code.name).copied();

        macro_rules! raise_or_handle {
            ($stack:ident, $blocks:ident, $pc:ident, $exc:expr) => {{
                let exc = $exc;
                match $blocks.pop() {
                    Some(block) => {
                        $stack.truncate(block.stack_depth);
                        $stack.push(Value::Exception(exc));
                        $pc = block.handler;
                        continue;
                    }
                    None => return Err(VmError::Raised(exc)),
                }
            }};
        }

        loop {
            if pc >= code.instructions.len() {
                // well-formed code objects end in Return; treat fallthrough
                // as returning none
                return Ok(Value::None);
            }
            self.instructions_executed += 1;
            if self.instructions_executed % ABORT_CHECK_INTERVAL == 0 {
                self.check_abort()?;
            }

            let line = code.lines[pc];
            let instruction = code.instructions[pc].clone();
            pc += 1;

            macro_rules! try_value {
                ($expr:expr) => {
                    match $expr {
                        Ok(value) => value,
                        Err(VmError::Raised(exc)) => raise_or_handle!(stack, blocks, pc, exc),
                        Err(other) => return Err(other),
                    }
                };
            }

            match instruction {
                Instruction::LoadConst(idx) => {
                    stack.push(constant_value(&code.consts[idx as usize]));
                }
                Instruction::LoadLocal(slot) => {
                    stack.push(locals[slot as usize].clone());
                }
                Instruction::StoreLocal(slot) => {
                    let value = stack.pop().expect("stack underflow");
                    locals[slot as usize] = value;
                }
                Instruction::LoadGlobal(name) => {
                    let name = &code.names[name as usize];
                    raise_or_handle!(
                        stack,
                        blocks,
                        pc,
                        ExceptionValue::new(
                            "NameError",
                            format!("name '{name}' is not defined")
                        )
                    );
                }
                Instruction::LoadAttr(name) => {
                    let receiver = stack.pop().expect("stack underflow");
                    let value = try_value!(self.get_attr(&receiver, &code.names[name as usize]));
                    stack.push(value);
                }
                Instruction::StoreAttr(name) => {
                    let value = stack.pop().expect("stack underflow");
                    let receiver = stack.pop().expect("stack underflow");
                    try_value!(self.set_attr(&receiver, &code.names[name as usize], value));
                }
                Instruction::LoadIndex => {
                    let index = stack.pop().expect("stack underflow");
                    let object = stack.pop().expect("stack underflow");
                    stack.push(try_value!(load_index(&object, &index)));
                }
                Instruction::StoreIndex => {
                    let value = stack.pop().expect("stack underflow");
                    let index = stack.pop().expect("stack underflow");
                    let object = stack.pop().expect("stack underflow");
                    try_value!(store_index(&object, &index, value));
                }
                Instruction::BuildList(n) => {
                    let start = stack.len() - n as usize;
                    let items: Vec<Value> = stack.split_off(start);
                    self.memory_estimate += AGGREGATE_COST + items.len() * 8;
                    stack.push(Value::list(items));
                }
                Instruction::UnaryNeg => {
                    let value = stack.pop().expect("stack underflow");
                    stack.push(try_value!(negate(&value)));
                }
                Instruction::UnaryNot => {
                    let value = stack.pop().expect("stack underflow");
                    stack.push(Value::Bool(!value.is_truthy()));
                }
                Instruction::Binary(op) => {
                    let right = stack.pop().expect("stack underflow");
                    let left = stack.pop().expect("stack underflow");
                    self.observe_operand(&left);
                    self.observe_operand(&right);
                    stack.push(try_value!(binary(op, &left, &right, &mut self.memory_estimate)));
                }
                Instruction::Compare(op) => {
                    let right = stack.pop().expect("stack underflow");
                    let left = stack.pop().expect("stack underflow");
                    self.observe_operand(&left);
                    self.observe_operand(&right);
                    stack.push(try_value!(compare(op, &left, &right)));
                }
                Instruction::Jump(target) => {
                    pc = target as usize;
                }
                Instruction::JumpIfFalse(target) => {
                    let value = stack.pop().expect("stack underflow");
                    if !value.is_truthy() {
                        pc = target as usize;
                    }
                }
                Instruction::JumpIfTrue(target) => {
                    let value = stack.pop().expect("stack underflow");
                    if value.is_truthy() {
                        pc = target as usize;
                    }
                }
                Instruction::JumpIfFalseOrPop(target) => {
                    let value = stack.last().expect("stack underflow");
                    if value.is_truthy() {
                        stack.pop();
                    } else {
                        pc = target as usize;
                    }
                }
                Instruction::JumpIfTrueOrPop(target) => {
                    let value = stack.last().expect("stack underflow");
                    if value.is_truthy() {
                        pc = target as usize;
                    } else {
                        stack.pop();
                    }
                }
                Instruction::GetIter => {
                    let value = stack.pop().expect("stack underflow");
                    stack.push(try_value!(get_iter(&value)));
                }
                Instruction::ForIter(target) => {
                    let next = {
                        let Value::Iterator(state) = stack
                            .last()
                            .expect("stack underflow")
                            .unproxied()
                            .clone()
                        else {
                            raise_or_handle!(
                                stack,
                                blocks,
                                pc,
                                ExceptionValue::new("TypeError", "for target is not iterable")
                            );
                        };
                        let mut state = state.borrow_mut();
                        let next = state.items.get(state.position).cloned();
                        state.position += 1;
                        next
                    };
                    let entered = next.is_some();
                    if let Some(predicate) = pending_for.take() {
                        self.tracer.lock().executed_for_predicate(predicate, entered);
                    }
                    match next {
                        Some(value) => stack.push(value),
                        None => {
                            stack.pop();
                            pc = target as usize;
                        }
                    }
                }
                Instruction::CallFunction { name, argc, kw } => {
                    let kw_names = kw.map(|idx| code.kw_tables[idx as usize].clone());
                    let kw_count = kw_names.as_ref().map_or(0, Vec::len);
                    let kw_values = stack.split_off(stack.len() - kw_count);
                    let args = stack.split_off(stack.len() - argc as usize);
                    let kwargs = kw_names
                        .unwrap_or_default()
                        .into_iter()
                        .zip(kw_values)
                        .collect();
                    let callee = code.names[name as usize].clone();
                    let value = try_value!(self.call_function(&callee, args, kwargs));
                    stack.push(value);
                }
                Instruction::CallMethod { name, argc } => {
                    let args = stack.split_off(stack.len() - argc as usize);
                    let receiver = stack.pop().expect("stack underflow");
                    let method = code.names[name as usize].clone();
                    let value = try_value!(self.call_method(receiver, &method, args));
                    stack.push(value);
                }
                Instruction::SetupExcept(handler) => {
                    blocks.push(ExceptBlock {
                        handler: handler as usize,
                        stack_depth: stack.len(),
                    });
                }
                Instruction::PopBlock => {
                    blocks.pop();
                }
                Instruction::ExcMatch(name) => {
                    let expected = &code.names[name as usize];
                    let matched = match stack.last().expect("stack underflow").unproxied() {
                        Value::Exception(exc) => {
                            crate::lang::value::exception_is_subtype(&exc.type_name, expected)
                        }
                        _ => false,
                    };
                    stack.push(Value::Bool(matched));
                }
                Instruction::Reraise => {
                    let value = stack.pop().expect("stack underflow");
                    let exc = match value.unproxied() {
                        Value::Exception(exc) => exc.clone(),
                        _ => ExceptionValue::new("RuntimeError", "reraise of non-exception"),
                    };
                    raise_or_handle!(stack, blocks, pc, exc);
                }
                Instruction::PopTop => {
                    stack.pop();
                }
                Instruction::Return => {
                    let value = stack.pop().expect("stack underflow");
                    return Ok(value);
                }
                Instruction::Raise => {
                    let value = stack.pop().expect("stack underflow");
                    let exc = match value.unproxied() {
                        Value::Exception(exc) => exc.clone(),
                        other => ExceptionValue::new(
                            "TypeError",
                            format!("exceptions must derive Exception, not {}", other.type_name()),
                        ),
                    };
                    raise_or_handle!(stack, blocks, pc, exc);
                }

                // --- probes ---
                Instruction::TraceEntered(id) => {
                    self.tracer.lock().executed_code_object(id);
                }
                Instruction::TraceLine(id) => {
                    self.tracer.lock().track_line(id);
                }
                Instruction::TraceCompare { predicate, op } => {
                    let right = &stack[stack.len() - 1];
                    let left = &stack[stack.len() - 2];
                    self.tracer
                        .lock()
                        .executed_compare_predicate(predicate, op, left, right);
                    last_predicate = Some(predicate);
                }
                Instruction::TraceBool { predicate } => {
                    let value = stack.last().expect("stack underflow");
                    self.tracer
                        .lock()
                        .executed_bool_predicate(predicate, value.is_truthy());
                    last_predicate = Some(predicate);
                }
                Instruction::TraceFor { predicate } => {
                    pending_for = Some(predicate);
                    last_predicate = Some(predicate);
                }
                Instruction::TraceExcMatch { predicate, name } => {
                    let expected = &code.names[name as usize];
                    let raised = match stack.last().expect("stack underflow").unproxied() {
                        Value::Exception(exc) => exc.type_name.clone(),
                        other => other.type_name().to_string(),
                    };
                    self.tracer
                        .lock()
                        .executed_exception_match(predicate, &raised, expected);
                    last_predicate = Some(predicate);
                }
                Instruction::TraceMemory { access, symbol } => {
                    if let Some(code_object) = code_id {
                        let symbol = symbol_name(code, access, symbol);
                        self.tracer.lock().log_instruction(LoggedInstruction {
                            code_object,
                            offset: (pc - 1) as u32,
                            line,
                            access,
                            symbol,
                            controlling_predicate: last_predicate,
                        });
                    }
                }
                Instruction::TraceSeed { count } => {
                    let start = stack.len() - count as usize;
                    let mut guard = self.tracer.lock();
                    for value in &stack[start..] {
                        guard.capture_seed(value);
                    }
                }
                Instruction::UnwrapArgs { argc } => {
                    let start = stack.len() - argc as usize;
                    for slot in &mut stack[start..] {
                        if let Value::Proxy { inner, .. } = slot {
                            *slot = (**inner).clone();
                        }
                    }
                }
            }
        }
    }

    fn observe_operand(&mut self, value: &Value) {
        if let Value::Proxy { inner, knowledge } = value {
            self.tracer
                .lock()
                .record_proxy_usage(*knowledge, Some(inner.type_name()), None, None);
        }
    }

    /// Finishes a run: reports the memory estimate to the tracer.
    pub fn finish(&mut self) {
        self.tracer.lock().observe_memory(self.memory_estimate);
    }

    fn call_native(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> VmResult<Value> {
        if !kwargs.is_empty() {
            return Err(VmError::raise(
                "TypeError",
                format!("{name}() takes no keyword arguments"),
            ));
        }
        if EXCEPTION_TYPES.contains(&name) {
            let message = match args.first().map(Value::unproxied) {
                None => String::new(),
                Some(Value::Str(s)) => s.as_ref().clone(),
                Some(other) => other.to_string(),
            };
            return Ok(Value::Exception(ExceptionValue::new(name, message)));
        }
        if !NATIVE_FUNCTIONS.contains(&name) {
            return Err(VmError::raise(
                "NameError",
                format!("name '{name}' is not defined"),
            ));
        }
        if args.iter().any(|a| matches!(a, Value::Proxy { .. })) {
            // the unwrap adapter failed us; surface loudly
            return Err(VmError::raise(
                "TypeError",
                format!("{name}() received a proxied argument"),
            ));
        }
        native_function(name, args)
    }
}

fn symbol_name(code: &CodeObject, access: MemoryAccess, symbol: u32) -> String {
    match access {
        MemoryAccess::LoadLocal | MemoryAccess::StoreLocal => {
            code.locals[symbol as usize].clone()
        }
        MemoryAccess::LoadAttr | MemoryAccess::StoreAttr => code.names[symbol as usize].clone(),
        MemoryAccess::LoadIndex | MemoryAccess::StoreIndex => "<subscript>".to_string(),
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::str(s.clone()),
    }
}

/// Binds positional and keyword arguments to parameter slots, applying
/// defaults for missing optional parameters.
fn bind_arguments(
    code: &CodeObject,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> VmResult<Vec<Value>> {
    if args.len() > code.params.len() {
        return Err(VmError::raise(
            "TypeError",
            format!(
                "{}() takes {} arguments but {} were given",
                code.name,
                code.params.len(),
                args.len()
            ),
        ));
    }
    let mut slots: Vec<Option<Value>> = vec![None; code.params.len()];
    for (slot, value) in args.into_iter().enumerate() {
        slots[slot] = Some(value);
    }
    for (name, value) in kwargs {
        let Some(position) = code.params.iter().position(|p| p.name == name) else {
            return Err(VmError::raise(
                "TypeError",
                format!("{}() got an unexpected keyword argument '{name}'", code.name),
            ));
        };
        if slots[position].is_some() {
            return Err(VmError::raise(
                "TypeError",
                format!("{}() got multiple values for argument '{name}'", code.name),
            ));
        }
        slots[position] = Some(value);
    }
    let mut locals = Vec::with_capacity(code.locals.len());
    for (position, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(value) => locals.push(value),
            None => match &code.params[position].default {
                Some(default) => locals.push(constant_value(default)),
                None => {
                    return Err(VmError::raise(
                        "TypeError",
                        format!(
                            "{}() missing required argument '{}'",
                            code.name, code.params[position].name
                        ),
                    ))
                }
            },
        }
    }
    Ok(locals)
}

fn as_number(value: &Value) -> Option<f64> {
    match value.unproxied() {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(f64::from(*b)),
        _ => None,
    }
}

fn negate(value: &Value) -> VmResult<Value> {
    match value.unproxied() {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| VmError::raise("OverflowError", "integer negation overflow")),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Bool(b) => Ok(Value::Int(-i64::from(*b))),
        other => Err(VmError::raise(
            "TypeError",
            format!("bad operand type for unary -: '{}'", other.type_name()),
        )),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value, memory: &mut usize) -> VmResult<Value> {
    use BinaryOp::{Add, Div, Mod, Mul, Sub};
    let (l, r) = (left.unproxied(), right.unproxied());
    match (op, l, r) {
        (Add, Value::Str(a), Value::Str(b)) => {
            let mut out = a.as_ref().clone();
            out.push_str(b);
            *memory += out.len();
            Ok(Value::str(out))
        }
        (Add, Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            *memory += AGGREGATE_COST + out.len() * 8;
            Ok(Value::list(out))
        }
        (Add, Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| VmError::raise("OverflowError", "integer addition overflow")),
        (Sub, Value::Int(a), Value::Int(b)) => a
            .checked_sub(*b)
            .map(Value::Int)
            .ok_or_else(|| VmError::raise("OverflowError", "integer subtraction overflow")),
        (Mul, Value::Int(a), Value::Int(b)) => a
            .checked_mul(*b)
            .map(Value::Int)
            .ok_or_else(|| VmError::raise("OverflowError", "integer multiplication overflow")),
        (Mod, Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(VmError::raise("ZeroDivisionError", "integer modulo by zero"))
            } else {
                Ok(Value::Int(a.rem_euclid(*b)))
            }
        }
        (Div, _, _) => {
            let (Some(a), Some(b)) = (as_number(l), as_number(r)) else {
                return Err(type_error(op, l, r));
            };
            if b == 0.0 {
                Err(VmError::raise("ZeroDivisionError", "division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        _ => {
            let (Some(a), Some(b)) = (as_number(l), as_number(r)) else {
                return Err(type_error(op, l, r));
            };
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Mod => {
                    if b == 0.0 {
                        return Err(VmError::raise("ZeroDivisionError", "float modulo"));
                    }
                    a.rem_euclid(b)
                }
                Div => unreachable!("handled above"),
            };
            Ok(Value::Float(result))
        }
    }
}

fn type_error(op: BinaryOp, left: &Value, right: &Value) -> VmError {
    VmError::raise(
        "TypeError",
        format!(
            "unsupported operand types for {op:?}: '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ),
    )
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> VmResult<Value> {
    use CompareOp::{Eq, Ge, Gt, In, Is, Le, Lt, Ne};
    let (l, r) = (left.unproxied(), right.unproxied());
    let result = match op {
        Eq => left.is_equal(right),
        Ne => !left.is_equal(right),
        Is => left.is_identical(right),
        In => match r {
            Value::List(items) => items.borrow().iter().any(|item| item.is_equal(l)),
            Value::Str(text) => match l {
                Value::Str(needle) => text.contains(needle.as_str()),
                _ => {
                    return Err(VmError::raise(
                        "TypeError",
                        "'in <str>' requires string operand",
                    ))
                }
            },
            other => {
                return Err(VmError::raise(
                    "TypeError",
                    format!("argument of type '{}' is not iterable", other.type_name()),
                ))
            }
        },
        Lt | Le | Gt | Ge => {
            let ordering = match (l, r) {
                (Value::Str(a), Value::Str(b)) => a.as_str().cmp(b.as_str()),
                _ => {
                    let (Some(a), Some(b)) = (as_number(l), as_number(r)) else {
                        return Err(VmError::raise(
                            "TypeError",
                            format!(
                                "'{}' not supported between '{}' and '{}'",
                                compare_symbol(op),
                                l.type_name(),
                                r.type_name()
                            ),
                        ));
                    };
                    a.partial_cmp(&b).ok_or_else(|| {
                        VmError::raise("ValueError", "comparison with NaN is undefined")
                    })?
                }
            };
            match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn compare_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::In => "in",
        CompareOp::Is => "is",
    }
}

fn load_index(object: &Value, index: &Value) -> VmResult<Value> {
    let idx = match index.unproxied() {
        Value::Int(i) => *i,
        other => {
            return Err(VmError::raise(
                "TypeError",
                format!("indices must be integers, not '{}'", other.type_name()),
            ))
        }
    };
    match object.unproxied() {
        Value::List(items) => {
            let items = items.borrow();
            let resolved = resolve_index(idx, items.len())?;
            Ok(items[resolved].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let resolved = resolve_index(idx, chars.len())?;
            Ok(Value::str(chars[resolved].to_string()))
        }
        other => Err(VmError::raise(
            "TypeError",
            format!("'{}' object is not subscriptable", other.type_name()),
        )),
    }
}

fn store_index(object: &Value, index: &Value, value: Value) -> VmResult<()> {
    let idx = match index.unproxied() {
        Value::Int(i) => *i,
        other => {
            return Err(VmError::raise(
                "TypeError",
                format!("indices must be integers, not '{}'", other.type_name()),
            ))
        }
    };
    match object.unproxied() {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let resolved = resolve_index(idx, len)?;
            items[resolved] = value;
            Ok(())
        }
        other => Err(VmError::raise(
            "TypeError",
            format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ),
        )),
    }
}

fn resolve_index(index: i64, len: usize) -> VmResult<usize> {
    let adjusted = if index < 0 { index + len as i64 } else { index };
    if adjusted < 0 || adjusted as usize >= len {
        Err(VmError::raise("IndexError", "index out of range"))
    } else {
        Ok(adjusted as usize)
    }
}

fn get_iter(value: &Value) -> VmResult<Value> {
    match value.unproxied() {
        Value::List(items) => Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
            items: items.borrow().clone(),
            position: 0,
        })))),
        Value::Str(text) => Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
            items: text.chars().map(|c| Value::str(c.to_string())).collect(),
            position: 0,
        })))),
        Value::Iterator(state) => Ok(Value::Iterator(state.clone())),
        other => Err(VmError::raise(
            "TypeError",
            format!("'{}' object is not iterable", other.type_name()),
        )),
    }
}

fn list_method(
    items: &Rc<RefCell<Vec<Value>>>,
    method: &str,
    mut args: Vec<Value>,
    memory: &mut usize,
) -> VmResult<Value> {
    match (method, args.len()) {
        ("append", 1) => {
            items.borrow_mut().push(args.remove(0));
            *memory += 8;
            Ok(Value::None)
        }
        ("pop", 0) => items
            .borrow_mut()
            .pop()
            .ok_or_else(|| VmError::raise("IndexError", "pop from empty list")),
        ("pop", 1) => {
            let index = match args[0].unproxied() {
                Value::Int(i) => *i,
                _ => return Err(VmError::raise("TypeError", "pop index must be an integer")),
            };
            let mut borrowed = items.borrow_mut();
            let len = borrowed.len();
            if len == 0 {
                return Err(VmError::raise("IndexError", "pop from empty list"));
            }
            let resolved = resolve_index(index, len)?;
            Ok(borrowed.remove(resolved))
        }
        ("clear", 0) => {
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        ("index", 1) => {
            let needle = &args[0];
            let borrowed = items.borrow();
            borrowed
                .iter()
                .position(|item| item.is_equal(needle))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| VmError::raise("ValueError", "value not in list"))
        }
        _ => Err(VmError::raise(
            "AttributeError",
            format!("'list' object has no attribute '{method}'"),
        )),
    }
}

fn string_method(text: &Rc<String>, method: &str, args: Vec<Value>) -> VmResult<Value> {
    let arg_str = |position: usize| -> VmResult<String> {
        match args.get(position).map(Value::unproxied) {
            Some(Value::Str(s)) => Ok(s.as_ref().clone()),
            _ => Err(VmError::raise(
                "TypeError",
                format!("{method}() expects a string argument"),
            )),
        }
    };
    match (method, args.len()) {
        ("startswith", 1) => Ok(Value::Bool(text.starts_with(&arg_str(0)?))),
        ("endswith", 1) => Ok(Value::Bool(text.ends_with(&arg_str(0)?))),
        ("contains", 1) => Ok(Value::Bool(text.contains(&arg_str(0)?))),
        ("upper", 0) => Ok(Value::str(text.to_uppercase())),
        ("lower", 0) => Ok(Value::str(text.to_lowercase())),
        _ => Err(VmError::raise(
            "AttributeError",
            format!("'str' object has no attribute '{method}'"),
        )),
    }
}

fn native_function(name: &str, args: Vec<Value>) -> VmResult<Value> {
    let arity = |expected: usize| -> VmResult<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(VmError::raise(
                "TypeError",
                format!("{name}() takes {expected} argument(s), got {}", args.len()),
            ))
        }
    };
    match name {
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.borrow().len() as i64)),
                other => Err(VmError::raise(
                    "TypeError",
                    format!("object of type '{}' has no len()", other.type_name()),
                )),
            }
        }
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| VmError::raise("OverflowError", "abs overflow")),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(VmError::raise(
                    "TypeError",
                    format!("bad operand type for abs(): '{}'", other.type_name()),
                )),
            }
        }
        "str" => {
            arity(1)?;
            Ok(Value::str(args[0].to_string()))
        }
        "int" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => s.trim().parse().map(Value::Int).map_err(|_| {
                    VmError::raise(
                        "ValueError",
                        format!("invalid literal for int(): '{s}'"),
                    )
                }),
                other => Err(VmError::raise(
                    "TypeError",
                    format!("int() argument must not be '{}'", other.type_name()),
                )),
            }
        }
        "float" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Str(s) => s.trim().parse().map(Value::Float).map_err(|_| {
                    VmError::raise(
                        "ValueError",
                        format!("could not convert string to float: '{s}'"),
                    )
                }),
                other => Err(VmError::raise(
                    "TypeError",
                    format!("float() argument must not be '{}'", other.type_name()),
                )),
            }
        }
        "min" | "max" => {
            if args.len() < 2 {
                return Err(VmError::raise(
                    "TypeError",
                    format!("{name}() takes at least 2 arguments"),
                ));
            }
            let mut best = args[0].clone();
            for candidate in &args[1..] {
                let (Some(a), Some(b)) = (as_number(candidate), as_number(&best)) else {
                    return Err(VmError::raise(
                        "TypeError",
                        format!("{name}() arguments must be numbers"),
                    ));
                };
                let better = if name == "min" { a < b } else { a > b };
                if better {
                    best = candidate.clone();
                }
            }
            Ok(best)
        }
        _ => Err(VmError::raise(
            "NameError",
            format!("name '{name}' is not defined"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tracer::{ExecutionTracer, TracerHandle};
    use crate::instrumentation::{InstrumentationOptions, Instrumenter};
    use crate::lang::{compile_module, parse_module};
    use crate::seeding::ConstantPool;

    fn vm_for(source: &str) -> Vm {
        let ast = parse_module("m", source).expect("parse");
        let module = compile_module(&ast).expect("compile");
        let pool = Arc::new(ConstantPool::new());
        let mut tracer = ExecutionTracer::new(pool);
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        Vm::new(
            Arc::new(instrumented),
            TracerHandle::new(tracer),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn executes_branching_function_and_traces() {
        let mut vm = vm_for(
            r#"
def triangle(a: int, b: int, c: int) -> str {
    if a == b and b == c { return "equilateral" }
    if a == b or b == c or a == c { return "isoceles" }
    return "scalene"
}
"#,
        );
        let result = vm
            .call_function("triangle", vec![Value::Int(1), Value::Int(1), Value::Int(1)], vec![])
            .expect("run");
        assert!(result.is_equal(&Value::str("equilateral")));
        let trace = vm.tracer.lock().take_trace();
        assert!(!trace.executed_code_objects.is_empty());
        assert!(!trace.true_distances.is_empty());
    }

    #[test]
    fn raise_travels_as_data() {
        let mut vm = vm_for(
            "def safe_div(a: int, b: int) -> float { if b == 0 { raise ZeroDivisionError(\"division by zero\") } return a / b }",
        );
        let err = vm
            .call_function("safe_div", vec![Value::Int(1), Value::Int(0)], vec![])
            .unwrap_err();
        match err {
            VmError::Raised(exc) => assert_eq!(exc.type_name, "ZeroDivisionError"),
            other => panic!("unexpected {other:?}"),
        }
        let ok = vm
            .call_function("safe_div", vec![Value::Int(7), Value::Int(2)], vec![])
            .expect("run");
        assert!(ok.is_equal(&Value::Float(3.5)));
    }

    #[test]
    fn try_except_catches_subtypes() {
        let mut vm = vm_for(
            r#"
def guarded(a: int, b: int) -> float {
    try { return a / b } except ArithmeticError { return -1.0 }
}
"#,
        );
        let caught = vm
            .call_function("guarded", vec![Value::Int(1), Value::Int(0)], vec![])
            .expect("run");
        assert!(caught.is_equal(&Value::Float(-1.0)));
    }

    #[test]
    fn class_lifecycle_with_methods() {
        let mut vm = vm_for(
            r#"
class Queue {
    def init(self) { self.items = [] }
    def enqueue(self, value: int) { self.items.append(value) }
    def dequeue(self) -> int | none {
        if len(self.items) == 0 { return none }
        return self.items.pop(0)
    }
    def size(self) -> int { return len(self.items) }
}
"#,
        );
        let queue = vm.construct("Queue", vec![]).expect("construct");
        vm.call_method(queue.clone(), "enqueue", vec![Value::Int(4)])
            .expect("enqueue");
        vm.call_method(queue.clone(), "enqueue", vec![Value::Int(9)])
            .expect("enqueue");
        let first = vm.call_method(queue.clone(), "dequeue", vec![]).expect("dequeue");
        assert!(first.is_equal(&Value::Int(4)));
        let size = vm.call_method(queue, "size", vec![]).expect("size");
        assert!(size.is_equal(&Value::Int(1)));
    }

    #[test]
    fn for_loop_iterates_and_breaks() {
        let mut vm = vm_for(
            r#"
def first_negative(xs: list) -> int | none {
    for x in xs {
        if x < 0 { return x }
    }
    return none
}
"#,
        );
        let found = vm
            .call_function(
                "first_negative",
                vec![Value::list(vec![Value::Int(3), Value::Int(-2), Value::Int(5)])],
                vec![],
            )
            .expect("run");
        assert!(found.is_equal(&Value::Int(-2)));
    }

    #[test]
    fn abort_flag_interrupts_unbounded_loop() {
        let ast = parse_module("m", "def spin() { x = 0 while true { x = x + 0 } }").expect("parse");
        let module = compile_module(&ast).expect("compile");
        let pool = Arc::new(ConstantPool::new());
        let mut tracer = ExecutionTracer::new(pool);
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        let mut vm = Vm::new(
            Arc::new(instrumented),
            TracerHandle::new(tracer),
            Arc::new(AtomicBool::new(false)),
        );
        vm.set_deadline(Some(Instant::now() + std::time::Duration::from_millis(50)));
        let err = vm.call_function("spin", vec![], vec![]).unwrap_err();
        assert_eq!(err, VmError::Aborted);
    }

    #[test]
    fn keyword_defaults_bind() {
        let mut vm = vm_for(
            "def greet(name: str, prefix: str = \"hi\") -> str { return prefix + \" \" + name }",
        );
        let out = vm
            .call_function(
                "greet",
                vec![Value::str("ada")],
                vec![("prefix".to_string(), Value::str("hello"))],
            )
            .expect("run");
        assert!(out.is_equal(&Value::str("hello ada")));
        let defaulted = vm
            .call_function("greet", vec![Value::str("ada")], vec![])
            .expect("run");
        assert!(defaulted.is_equal(&Value::str("hi ada")));
    }
}
