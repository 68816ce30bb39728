//! Forjar: search-based regression test generation for Guion modules.
//!
//! Given a target module and a budget, forjar evolves a population of
//! candidate test sequences against instrumented bytecode, measures branch,
//! line and checked coverage, and emits a suite of test cases annotated
//! with regression assertions certified by mutation analysis.
//!
//! # Quick Start
//!
//! ```no_run
//! use forjar::config::Configuration;
//! use forjar::generator::generate;
//! use forjar::lang::Project;
//!
//! let project = Project::new().with_module(
//!     "triangle",
//!     r#"
//! def triangle(a: int, b: int, c: int) -> str {
//!     if a == b and b == c { return "equilateral" }
//!     if a == b or b == c or a == c { return "isoceles" }
//!     return "scalene"
//! }
//! "#,
//! );
//! std::env::set_var(forjar::generator::CONSENT_ENV, "1");
//! let report = generate(&project, "triangle", &Configuration::default()).unwrap();
//! println!("coverage: {:.2}", report.coverage);
//! ```
//!
//! # Modules
//!
//! - [`lang`]: the embedded Guion language (AST, parser, compiler, values)
//! - [`bytecode`]: stack instructions, code objects, CFG and control
//!   dependence
//! - [`instrumentation`]: the adapter chain rewriting code objects
//! - [`execution`]: VM, tracer, branch distances, worker-thread executor
//! - [`cluster`]: callables under test and their type information
//! - [`testcase`]: the test-case model, factory and variation operators
//! - [`fitness`]: coverage goals and fitness functions
//! - [`ga`]: archives, ranking, selection, stopping, search algorithms
//! - [`slicer`]: dynamic backward slicing for checked coverage
//! - [`assertion`]: assertion generation and mutation analysis
//! - [`generator`]: the orchestrated pipeline

pub mod assertion;
pub mod bytecode;
pub mod cluster;
pub mod config;
pub mod execution;
pub mod fitness;
pub mod ga;
pub mod generator;
pub mod instrumentation;
pub mod lang;
pub mod prelude;
pub mod seeding;
pub mod slicer;
pub mod statistics;
pub mod testcase;

pub use config::{Algorithm, Configuration, ExitCode};
pub use generator::{generate, GenerationError, GenerationReport, CONSENT_ENV};
