//! Bytecode instrumentation: a chain of adapters over the basic-block graph
//! of each code object.
//!
//! Adapter order is part of the composition contract: coverage adapters
//! (branch, line, checked) run before the seeding adapter, which runs before
//! the unwrap adapter. All probes peek at the operand stack without popping,
//! so the chain preserves stack balance; the instrumenter validates this
//! after rewriting and raises a fatal error on violation.
//!
//! Code objects that cannot be instrumented are registered as skipped and
//! left untouched; they are excluded from coverage denominators.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::bytecode::{
    control_dependencies, BranchKind, CodeObject, CompiledClass, CompiledModule,
    ControlFlowGraph, Instruction, MemoryAccess, OpcodeSuite, SuiteV1,
};
use crate::execution::tracer::ExecutionTracer;

/// Fatal failure while rewriting bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationError {
    pub code_object: String,
    pub message: String,
}

impl fmt::Display for InstrumentationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instrumentation of {} failed: {}",
            self.code_object, self.message
        )
    }
}

impl std::error::Error for InstrumentationError {}

/// Which adapters run, driven by the configured coverage metrics.
#[derive(Debug, Clone)]
pub struct InstrumentationOptions {
    pub branch_coverage: bool,
    pub line_coverage: bool,
    pub checked_coverage: bool,
    pub dynamic_seeding: bool,
    /// Source lines excluded from line coverage (pragma-style exclusions).
    pub excluded_lines: HashSet<u32>,
}

impl Default for InstrumentationOptions {
    fn default() -> Self {
        Self {
            branch_coverage: true,
            line_coverage: true,
            checked_coverage: false,
            dynamic_seeding: true,
            excluded_lines: HashSet::new(),
        }
    }
}

/// String predicates whose arguments feed the dynamic constant pool.
const SEEDED_STRING_PREDICATES: &[&str] = &["startswith", "endswith", "contains"];

/// Rewrites code objects to emit tracer events.
pub struct Instrumenter<S: OpcodeSuite = SuiteV1> {
    suite: S,
    options: InstrumentationOptions,
    /// Names that resolve to native (non-instrumented) routines.
    native_names: HashSet<String>,
}

impl Instrumenter<SuiteV1> {
    #[must_use]
    pub fn new(options: InstrumentationOptions, native_names: HashSet<String>) -> Self {
        Self {
            suite: SuiteV1,
            options,
            native_names,
        }
    }
}

impl<S: OpcodeSuite> Instrumenter<S> {
    /// Instruments every code object of the module, registering code
    /// objects, predicates, and lines with the tracer.
    pub fn instrument_module(
        &self,
        module: &CompiledModule,
        tracer: &mut ExecutionTracer,
    ) -> Result<CompiledModule, InstrumentationError> {
        // names shadowed by the module never resolve natively
        let shadowed: HashSet<&String> = module
            .functions
            .keys()
            .chain(module.classes.keys())
            .collect();

        let mut functions = BTreeMap::new();
        for (name, code) in &module.functions {
            functions.insert(
                name.clone(),
                Arc::new(self.instrument_code(code, &module.name, &shadowed, tracer)?),
            );
        }
        let mut classes = BTreeMap::new();
        for (name, class) in &module.classes {
            let mut methods = BTreeMap::new();
            for (method_name, code) in &class.methods {
                methods.insert(
                    method_name.clone(),
                    Arc::new(self.instrument_code(code, &module.name, &shadowed, tracer)?),
                );
            }
            classes.insert(
                name.clone(),
                CompiledClass {
                    name: class.name.clone(),
                    methods,
                    fields: class.fields.clone(),
                },
            );
        }
        Ok(CompiledModule {
            name: module.name.clone(),
            functions,
            classes,
        })
    }

    fn instrument_code(
        &self,
        code: &CodeObject,
        module_name: &str,
        shadowed: &HashSet<&String>,
        tracer: &mut ExecutionTracer,
    ) -> Result<CodeObject, InstrumentationError> {
        if code.lines.len() != code.instructions.len() || code.lines.contains(&0) {
            // no usable line information: register as skip, leave untouched
            tracer.register_skipped(&code.name);
            debug!(code_object = %code.name, "skipping instrumentation, missing line info");
            return Ok(code.clone());
        }

        let code_object_id = tracer.register_code_object(&code.name, code.first_line);
        let mut cfg = ControlFlowGraph::from_code(code);

        let predicate_blocks = if self.options.branch_coverage {
            self.apply_branch_adapter(&mut cfg, code, code_object_id, tracer)
        } else {
            HashMap::new()
        };
        if self.options.line_coverage {
            self.apply_line_adapter(&mut cfg, module_name, tracer);
        }
        if self.options.checked_coverage {
            self.apply_checked_adapter(&mut cfg);
        }
        if self.options.dynamic_seeding {
            self.apply_seeding_adapter(&mut cfg, code);
        }
        self.apply_unwrap_adapter(&mut cfg, code, shadowed);

        // register predicate control dependencies for goal activation
        for dependence in control_dependencies(&cfg) {
            let Some(&controlling) = predicate_blocks.get(&dependence.controlling) else {
                continue;
            };
            let Some(outcome) = dependence.outcome else {
                continue;
            };
            if let Some(&dependent) = predicate_blocks.get(&dependence.dependent) {
                tracer.register_predicate_parent(dependent, controlling, outcome);
            }
        }

        self.validate(&cfg, code)?;

        let (instructions, lines) = cfg.linearize();
        Ok(CodeObject {
            name: code.name.clone(),
            params: code.params.clone(),
            consts: code.consts.clone(),
            names: code.names.clone(),
            locals: code.locals.clone(),
            kw_tables: code.kw_tables.clone(),
            instructions,
            lines,
            first_line: code.first_line,
        })
    }

    /// Branch-coverage adapter: probes before every conditional jump, plus
    /// the code-object-entered probe at the head of the entry block.
    fn apply_branch_adapter(
        &self,
        cfg: &mut ControlFlowGraph,
        code: &CodeObject,
        code_object_id: u32,
        tracer: &mut ExecutionTracer,
    ) -> HashMap<usize, u32> {
        let mut predicate_blocks = HashMap::new();
        for block in &mut cfg.blocks {
            let Some(jump_index) = block.jump_index() else {
                continue;
            };
            let instructions: Vec<Instruction> =
                block.code.iter().map(|(i, _)| i.clone()).collect();
            if !self.suite.is_conditional_jump(&instructions[jump_index]) {
                continue;
            }
            let kind = self.suite.branch_kind(&instructions, jump_index);
            let line = block.code[jump_index].1;
            let predicate = tracer.register_predicate(code_object_id, line, kind);
            predicate_blocks.insert(block.id, predicate);

            let (probe, insert_at) = match kind {
                BranchKind::Compare(op) => {
                    (self.suite.compare_probe(predicate, op), jump_index - 1)
                }
                BranchKind::ExceptionMatch => {
                    let name = match &instructions[jump_index - 1] {
                        Instruction::ExcMatch(name) => *name,
                        _ => unreachable!("exception-match kind without ExcMatch"),
                    };
                    (self.suite.exception_probe(predicate, name), jump_index - 1)
                }
                BranchKind::ForLoop => (self.suite.for_probe(predicate), jump_index),
                BranchKind::Truthy => (self.suite.bool_probe(predicate), jump_index),
            };
            let line_at = block.code[insert_at].1;
            block.code.insert(insert_at, (probe, line_at));
        }

        let entry = cfg.entry;
        let entry_line = code.first_line;
        cfg.blocks[entry]
            .code
            .insert(0, (self.suite.entered_probe(code_object_id), entry_line));
        predicate_blocks
    }

    /// Line-coverage adapter: one probe at the first instruction of every
    /// source line, honoring the exclusion list.
    fn apply_line_adapter(
        &self,
        cfg: &mut ControlFlowGraph,
        module_name: &str,
        tracer: &mut ExecutionTracer,
    ) {
        let mut last_line = 0u32;
        for block in &mut cfg.blocks {
            let mut index = 0;
            while index < block.code.len() {
                let (instruction, line) = &block.code[index];
                let line = *line;
                if is_probe(instruction) {
                    index += 1;
                    continue;
                }
                if line != last_line && !self.options.excluded_lines.contains(&line) {
                    let line_id = tracer.register_line(module_name, line);
                    block
                        .code
                        .insert(index, (self.suite.line_probe(line_id), line));
                    index += 1;
                }
                last_line = line;
                index += 1;
            }
        }
    }

    /// Checked-coverage adapter: memory-access probes for the slicer.
    fn apply_checked_adapter(&self, cfg: &mut ControlFlowGraph) {
        for block in &mut cfg.blocks {
            let mut index = 0;
            while index < block.code.len() {
                let access = match &block.code[index].0 {
                    Instruction::LoadLocal(slot) => Some((MemoryAccess::LoadLocal, *slot)),
                    Instruction::StoreLocal(slot) => Some((MemoryAccess::StoreLocal, *slot)),
                    Instruction::LoadAttr(name) => Some((MemoryAccess::LoadAttr, *name)),
                    Instruction::StoreAttr(name) => Some((MemoryAccess::StoreAttr, *name)),
                    Instruction::LoadIndex => Some((MemoryAccess::LoadIndex, u32::MAX)),
                    Instruction::StoreIndex => Some((MemoryAccess::StoreIndex, u32::MAX)),
                    _ => None,
                };
                if let Some((access, symbol)) = access {
                    let line = block.code[index].1;
                    block
                        .code
                        .insert(index, (self.suite.memory_probe(access, symbol), line));
                    index += 1;
                }
                index += 1;
            }
        }
    }

    /// Dynamic-seeding adapter: captures compared values and the arguments
    /// of string predicates into the constant pool.
    fn apply_seeding_adapter(&self, cfg: &mut ControlFlowGraph, code: &CodeObject) {
        for block in &mut cfg.blocks {
            let mut index = 0;
            while index < block.code.len() {
                let probe = match &block.code[index].0 {
                    Instruction::Compare(_) => Some(self.suite.seed_probe(2)),
                    Instruction::CallMethod { name, argc } => {
                        let method = &code.names[*name as usize];
                        if SEEDED_STRING_PREDICATES.contains(&method.as_str()) && *argc > 0 {
                            Some(self.suite.seed_probe(*argc))
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(probe) = probe {
                    let line = block.code[index].1;
                    block.code.insert(index, (probe, line));
                    index += 1;
                }
                index += 1;
            }
        }
    }

    /// Unwrap adapter: proxy arguments must not leak into native routines.
    fn apply_unwrap_adapter(
        &self,
        cfg: &mut ControlFlowGraph,
        code: &CodeObject,
        shadowed: &HashSet<&String>,
    ) {
        for block in &mut cfg.blocks {
            let mut index = 0;
            while index < block.code.len() {
                let probe = match &block.code[index].0 {
                    Instruction::CallFunction { name, argc, kw } => {
                        let callee = &code.names[*name as usize];
                        if self.native_names.contains(callee) && !shadowed.contains(callee) {
                            let kw_count = kw
                                .map(|idx| code.kw_tables[idx as usize].len() as u8)
                                .unwrap_or(0);
                            Some(self.suite.unwrap_probe(*argc + kw_count))
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(probe) = probe {
                    let line = block.code[index].1;
                    block.code.insert(index, (probe, line));
                    index += 1;
                }
                index += 1;
            }
        }
    }

    /// Validates the composition contract: probes are stack-neutral and
    /// never terminate a block.
    fn validate(
        &self,
        cfg: &ControlFlowGraph,
        code: &CodeObject,
    ) -> Result<(), InstrumentationError> {
        for block in &cfg.blocks {
            for (position, (instruction, _)) in block.code.iter().enumerate() {
                if !is_probe(instruction) {
                    continue;
                }
                if self.suite.stack_effect(instruction, code) != 0 {
                    return Err(InstrumentationError {
                        code_object: code.name.clone(),
                        message: format!("probe {instruction:?} is not stack-neutral"),
                    });
                }
                if position == block.code.len() - 1 && block.jump_index().is_some() {
                    return Err(InstrumentationError {
                        code_object: code.name.clone(),
                        message: "probe inserted after block terminator".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_probe(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::TraceEntered(_)
            | Instruction::TraceLine(_)
            | Instruction::TraceCompare { .. }
            | Instruction::TraceBool { .. }
            | Instruction::TraceFor { .. }
            | Instruction::TraceExcMatch { .. }
            | Instruction::TraceMemory { .. }
            | Instruction::TraceSeed { .. }
            | Instruction::UnwrapArgs { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tracer::ExecutionTracer;
    use crate::lang::{compile_module, parse_module};
    use crate::seeding::ConstantPool;
    use std::sync::Arc;

    fn instrument(source: &str, options: InstrumentationOptions) -> (CompiledModule, ExecutionTracer) {
        let ast = parse_module("m", source).expect("parse");
        let module = compile_module(&ast).expect("compile");
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        let natives: HashSet<String> = ["len".to_string(), "abs".to_string()].into();
        let instrumenter = Instrumenter::new(options, natives);
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        (instrumented, tracer)
    }

    #[test]
    fn registers_predicates_for_each_conditional_jump() {
        let (_, tracer) = instrument(
            "def sign(x: int) -> int { if x < 0 { return -1 } if x > 0 { return 1 } return 0 }",
            InstrumentationOptions::default(),
        );
        assert_eq!(tracer.subject().predicates.len(), 2);
        assert_eq!(tracer.subject().code_objects.len(), 1);
        assert!(tracer.subject().branchless_code_objects().is_empty());
    }

    #[test]
    fn branchless_code_object_is_registered_once() {
        let (instrumented, tracer) = instrument(
            "def seven() -> int { return 7 }",
            InstrumentationOptions::default(),
        );
        assert_eq!(tracer.subject().branchless_code_objects().len(), 1);
        let code = &instrumented.functions["seven"];
        assert!(matches!(
            code.instructions.first(),
            Some(Instruction::TraceEntered(_))
        ));
    }

    #[test]
    fn nested_branch_gets_control_parent() {
        let (_, tracer) = instrument(
            r#"
def classify(x: int) -> str {
    if x > 0 {
        if x > 100 { return "big" }
        return "small"
    }
    return "neg"
}
"#,
            InstrumentationOptions::default(),
        );
        let subject = tracer.subject();
        let with_parent: Vec<_> = subject
            .predicates
            .values()
            .filter(|p| !p.parents.is_empty())
            .collect();
        assert_eq!(with_parent.len(), 1);
        assert_eq!(with_parent[0].parents[0].1, true);
    }

    #[test]
    fn unwrap_probe_precedes_native_calls_only() {
        let (instrumented, _) = instrument(
            "def measure(xs: list) -> int { return len(xs) }\ndef len2(xs: list) -> int { return measure(xs) }",
            InstrumentationOptions::default(),
        );
        let measure = &instrumented.functions["measure"];
        let unwraps = measure
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::UnwrapArgs { .. }))
            .count();
        assert_eq!(unwraps, 1);
        let len2 = &instrumented.functions["len2"];
        assert!(!len2
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::UnwrapArgs { .. })));
    }

    #[test]
    fn line_probes_cover_each_line_once() {
        let (instrumented, tracer) = instrument(
            "def f(x: int) -> int {\n    y = x + 1\n    return y\n}",
            InstrumentationOptions::default(),
        );
        let code = &instrumented.functions["f"];
        let line_probes = code
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::TraceLine(_)))
            .count();
        assert_eq!(line_probes, tracer.subject().lines.len());
        assert!(line_probes >= 2);
    }

    #[test]
    fn checked_adapter_probes_memory_accesses() {
        let mut options = InstrumentationOptions::default();
        options.checked_coverage = true;
        let (instrumented, _) = instrument("def f(x: int) -> int { y = x return y }", options);
        let code = &instrumented.functions["f"];
        let memory_probes = code
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::TraceMemory { .. }))
            .count();
        // load x, store y, load y
        assert_eq!(memory_probes, 3);
    }
}
