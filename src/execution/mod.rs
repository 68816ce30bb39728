//! Execution of instrumented modules: the bytecode VM, the tracer with its
//! branch-distance functions, per-test worker threads with timeouts, and
//! the isolated-worker batch mode.

pub mod executor;
pub mod trace;
pub mod tracer;
pub mod vm;

pub use executor::{ExecutorOptions, IsolatedExecutor, TestCaseExecutor};
pub use trace::{ExecutionResult, ExecutionTrace, StatementOutcome, ValueSnapshot};
pub use tracer::{normalize, ExecutionTracer, SubjectProperties, TracerHandle};
pub use vm::{native_names, Vm, VmError};
