//! The embedded Guion language: AST, parser, bytecode compiler, and runtime
//! values. This is the substrate the generation engine instruments and
//! executes; nothing in here knows about coverage or search.

pub mod ast;
pub mod compiler;
pub mod parser;
pub mod value;

pub use compiler::{compile_module, CompileError, CompileResult};
pub use parser::{parse_module, ParseError, ParseResult};
pub use value::{exception_is_subtype, ExceptionValue, ObjectData, Value};

use crate::bytecode::CompiledModule;

/// A project: named source modules, one of which is the generation target.
#[derive(Debug, Clone, Default)]
pub struct Project {
    modules: Vec<(String, String)>,
}

impl Project {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module's source text under its name.
    #[must_use]
    pub fn with_module(mut self, name: &str, source: &str) -> Self {
        self.modules.push((name.to_string(), source.to_string()));
        self
    }

    #[must_use]
    pub fn source_of(&self, name: &str) -> Option<&str> {
        self.modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_str())
    }

    /// Parses the named module.
    pub fn parse(&self, name: &str) -> Result<ast::ModuleAst, LoadError> {
        let source = self
            .source_of(name)
            .ok_or_else(|| LoadError::UnknownModule(name.to_string()))?;
        parse_module(name, source).map_err(LoadError::Parse)
    }

    /// Parses and compiles the named module without instrumentation.
    pub fn load(&self, name: &str) -> Result<CompiledModule, LoadError> {
        let ast = self.parse(name)?;
        compile_module(&ast).map_err(LoadError::Compile)
    }
}

/// Failure to turn source text into a compiled module.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    UnknownModule(String),
    Parse(ParseError),
    Compile(CompileError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::UnknownModule(name) => write!(f, "unknown module {name}"),
            LoadError::Parse(err) => write!(f, "{err}"),
            LoadError::Compile(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LoadError {}
