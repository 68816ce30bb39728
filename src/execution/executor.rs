//! Test-case execution: a dedicated short-lived worker thread per test with
//! per-statement and per-test deadlines, plus an isolated long-lived worker
//! mode for crash resistance.
//!
//! The worker enforces statement deadlines cooperatively inside the VM
//! instruction loop; the engine thread additionally holds a hard join
//! deadline with a grace interval. A statement that exceeds its deadline is
//! reported as timed out and all trace data it produced is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bytecode::CompiledModule;
use crate::lang::value::Value;
use crate::testcase::statement::StatementKind;
use crate::testcase::TestCase;

use super::trace::{ExecutionResult, ExecutionTrace, StatementOutcome, ValueSnapshot};
use super::tracer::TracerHandle;
use super::vm::{Vm, VmError};

/// Timeouts and isolation knobs of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub per_statement_timeout: Duration,
    pub per_test_timeout: Duration,
    /// Extra time granted after a cooperative abort request before the
    /// worker is abandoned.
    pub abort_grace: Duration,
    /// Wrap call arguments in tracing proxies for type refinement.
    pub type_tracing: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            per_statement_timeout: Duration::from_secs(2),
            per_test_timeout: Duration::from_secs(10),
            abort_grace: Duration::from_millis(500),
            type_tracing: true,
        }
    }
}

/// Executes test cases against one instrumented module.
pub struct TestCaseExecutor {
    module: Arc<CompiledModule>,
    tracer: TracerHandle,
    options: ExecutorOptions,
    executed_tests: u64,
    executed_statements: u64,
}

impl TestCaseExecutor {
    #[must_use]
    pub fn new(module: Arc<CompiledModule>, tracer: TracerHandle, options: ExecutorOptions) -> Self {
        Self {
            module,
            tracer,
            options,
            executed_tests: 0,
            executed_statements: 0,
        }
    }

    #[must_use]
    pub fn tracer(&self) -> &TracerHandle {
        &self.tracer
    }

    /// Total tests executed so far, for budget accounting.
    #[must_use]
    pub fn executed_tests(&self) -> u64 {
        self.executed_tests
    }

    /// Total statements executed so far, for budget accounting.
    #[must_use]
    pub fn executed_statements(&self) -> u64 {
        self.executed_statements
    }

    /// Runs one test case in a fresh worker thread and returns its result.
    pub fn execute(&mut self, test: &TestCase) -> ExecutionResult {
        self.executed_tests += 1;
        let module = self.module.clone();
        let tracer = self.tracer.clone();
        let options = self.options.clone();
        let test = test.clone();
        let statement_count = test.size();
        let abort = Arc::new(AtomicBool::new(false));
        let worker_abort = abort.clone();
        let (sender, receiver) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("forjar-worker".to_string())
            .spawn(move || {
                let result = run_in_worker(&module, &tracer, &options, &test, &worker_abort);
                let _ = sender.send(result);
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(error) => {
                warn!(%error, "failed to spawn worker thread");
                return timed_out_result(statement_count);
            }
        };

        let hard_deadline = self.options.per_test_timeout + self.options.abort_grace;
        let result = match receiver.recv_timeout(hard_deadline) {
            Ok(result) => {
                let _ = handle.join();
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                abort.store(true, Ordering::Relaxed);
                match receiver.recv_timeout(self.options.abort_grace) {
                    Ok(mut result) => {
                        let _ = handle.join();
                        result.timed_out = true;
                        result
                    }
                    Err(_) => {
                        // non-cooperative worker: abandon it, count the test
                        // as timed out with no usable trace
                        debug!("worker ignored abort request, abandoning");
                        timed_out_result(statement_count)
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                timed_out_result(statement_count)
            }
        };
        self.executed_statements += result.executed_statements() as u64;
        result
    }
}

fn timed_out_result(statement_count: usize) -> ExecutionResult {
    ExecutionResult {
        trace: ExecutionTrace::default(),
        outcomes: vec![StatementOutcome::NotExecuted; statement_count],
        statement_log_ranges: vec![(0, 0); statement_count],
        timed_out: true,
    }
}

/// Worker body: claims the tracer, runs statements under deadlines, and
/// assembles the result from per-statement trace increments.
fn run_in_worker(
    module: &Arc<CompiledModule>,
    tracer: &TracerHandle,
    options: &ExecutorOptions,
    test: &TestCase,
    abort: &Arc<AtomicBool>,
) -> ExecutionResult {
    {
        let mut guard = tracer.lock();
        guard.claim_current_thread();
        guard.reset_trace();
    }
    let started = Instant::now();
    let test_deadline = started + options.per_test_timeout;
    let mut vm = Vm::new(module.clone(), tracer.clone(), abort.clone());

    let mut values: Vec<Value> = Vec::with_capacity(test.size());
    let mut outcomes: Vec<StatementOutcome> = Vec::with_capacity(test.size());
    let mut log_ranges: Vec<(usize, usize)> = Vec::with_capacity(test.size());
    let mut accumulated = ExecutionTrace::default();
    let mut timed_out = false;

    for (position, _) in test.statements().iter().enumerate() {
        let statement_started = Instant::now();
        let deadline = (statement_started + options.per_statement_timeout).min(test_deadline);
        vm.set_deadline(Some(deadline));
        let outcome = run_statement(&mut vm, tracer, options, test, position, &mut values);
        let elapsed = statement_started.elapsed();
        let statement_trace = tracer.lock().take_trace();
        let log_start = accumulated.instruction_log.len();
        match outcome {
            Ok(value) => {
                accumulated.merge(&statement_trace);
                log_ranges.push((log_start, accumulated.instruction_log.len()));
                outcomes.push(StatementOutcome::Ok {
                    value: ValueSnapshot::capture(&value),
                    elapsed,
                });
                values.push(value);
            }
            Err(VmError::Raised(exception)) => {
                accumulated.merge(&statement_trace);
                log_ranges.push((log_start, accumulated.instruction_log.len()));
                outcomes.push(StatementOutcome::Raised { exception, elapsed });
                break;
            }
            Err(VmError::Aborted) => {
                // partial trace of the aborting statement is discarded
                log_ranges.push((log_start, log_start));
                outcomes.push(StatementOutcome::TimedOut);
                timed_out = true;
                break;
            }
        }
    }
    while outcomes.len() < test.size() {
        log_ranges.push((accumulated.instruction_log.len(), accumulated.instruction_log.len()));
        outcomes.push(StatementOutcome::NotExecuted);
    }
    vm.finish();
    let final_trace = tracer.lock().take_trace();
    if !timed_out {
        accumulated.merge(&final_trace);
    }
    accumulated.runtime = started.elapsed();

    ExecutionResult {
        trace: accumulated,
        outcomes,
        statement_log_ranges: log_ranges,
        timed_out,
    }
}

fn run_statement(
    vm: &mut Vm,
    tracer: &TracerHandle,
    options: &ExecutorOptions,
    test: &TestCase,
    position: usize,
    values: &mut [Value],
) -> Result<Value, VmError> {
    let wrap = |tracer: &TracerHandle, value: Value| -> Value {
        if options.type_tracing && !matches!(value, Value::Proxy { .. }) {
            let knowledge = tracer.lock().new_proxy_knowledge();
            Value::Proxy {
                inner: Box::new(value),
                knowledge,
            }
        } else {
            value
        }
    };
    let statement = test.statement(position);
    match &statement.kind {
        StatementKind::NoneLiteral => Ok(Value::None),
        StatementKind::BoolLiteral(value) => Ok(Value::Bool(*value)),
        StatementKind::IntLiteral(value) => Ok(Value::Int(*value)),
        StatementKind::FloatLiteral(value) => Ok(Value::Float(*value)),
        StatementKind::StrLiteral(value) => Ok(Value::str(value.clone())),
        StatementKind::ListLiteral(items) => Ok(Value::list(
            items.iter().map(|r| values[r.index()].clone()).collect(),
        )),
        StatementKind::FunctionCall {
            callable,
            args,
            kwargs,
        } => {
            let args = args
                .iter()
                .map(|r| wrap(tracer, values[r.index()].clone()))
                .collect();
            let kwargs = kwargs
                .iter()
                .map(|(name, r)| (name.clone(), wrap(tracer, values[r.index()].clone())))
                .collect();
            vm.call_function(&callable.name, args, kwargs)
        }
        StatementKind::ConstructorCall { callable, args } => {
            let args = args
                .iter()
                .map(|r| wrap(tracer, values[r.index()].clone()))
                .collect();
            vm.construct(&callable.name, args)
        }
        StatementKind::MethodCall {
            callable,
            receiver,
            args,
        } => {
            let receiver = values[receiver.index()].clone();
            let args = args
                .iter()
                .map(|r| wrap(tracer, values[r.index()].clone()))
                .collect();
            vm.call_method(receiver, &callable.name, args)
        }
        StatementKind::FieldRead { receiver, field } => {
            let receiver = values[receiver.index()].clone();
            vm.get_attr(&receiver, field)
        }
        StatementKind::FieldWrite {
            receiver,
            field,
            value,
        } => {
            let receiver = values[receiver.index()].clone();
            let value = values[value.index()].clone();
            vm.set_attr(&receiver, field, value)?;
            Ok(Value::None)
        }
        StatementKind::Assignment { source } => Ok(values[source.index()].clone()),
    }
}

// --- isolated worker mode ---

enum WorkerRequest {
    Batch(Vec<TestCase>),
    Shutdown,
}

/// Crash-resistant execution: a long-lived worker owns the instrumented
/// module and streams serialized results back over a channel. A worker
/// failure invalidates only the batch in flight; the master respawns the
/// worker and keeps its archive and search state.
pub struct IsolatedExecutor {
    module: Arc<CompiledModule>,
    tracer: TracerHandle,
    options: ExecutorOptions,
    worker: Option<WorkerLink>,
    executed_tests: u64,
    executed_statements: u64,
}

struct WorkerLink {
    requests: mpsc::Sender<WorkerRequest>,
    results: mpsc::Receiver<Vec<ExecutionResult>>,
    handle: std::thread::JoinHandle<()>,
}

impl IsolatedExecutor {
    #[must_use]
    pub fn new(module: Arc<CompiledModule>, tracer: TracerHandle, options: ExecutorOptions) -> Self {
        Self {
            module,
            tracer,
            options,
            worker: None,
            executed_tests: 0,
            executed_statements: 0,
        }
    }

    fn spawn_worker(&mut self) -> &WorkerLink {
        if self.worker.is_none() {
            let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>();
            let (result_tx, result_rx) = mpsc::channel();
            let module = self.module.clone();
            let tracer = self.tracer.clone();
            let options = self.options.clone();
            let handle = std::thread::Builder::new()
                .name("forjar-isolated-worker".to_string())
                .spawn(move || {
                    while let Ok(WorkerRequest::Batch(batch)) = request_rx.recv() {
                        let mut results = Vec::with_capacity(batch.len());
                        for test in &batch {
                            let abort = Arc::new(AtomicBool::new(false));
                            results.push(run_in_worker(&module, &tracer, &options, test, &abort));
                        }
                        if result_tx.send(results).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawn isolated worker");
            self.worker = Some(WorkerLink {
                requests: request_tx,
                results: result_rx,
                handle,
            });
        }
        self.worker.as_ref().expect("worker just spawned")
    }

    /// Executes a batch; a dead worker fails only this batch.
    pub fn execute_batch(&mut self, batch: Vec<TestCase>) -> Vec<ExecutionResult> {
        let batch_len = batch.len();
        let statement_counts: Vec<usize> = batch.iter().map(TestCase::size).collect();
        let per_batch = self.options.per_test_timeout * (batch_len.max(1) as u32)
            + self.options.abort_grace;
        let worker = self.spawn_worker();
        let send_failed = worker.requests.send(WorkerRequest::Batch(batch)).is_err();
        let received = if send_failed {
            Err(RecvTimeoutError::Disconnected)
        } else {
            worker.results.recv_timeout(per_batch)
        };
        match received {
            Ok(results) => {
                self.executed_tests += batch_len as u64;
                self.executed_statements += results
                    .iter()
                    .map(|r| r.executed_statements() as u64)
                    .sum::<u64>();
                results
            }
            Err(error) => {
                warn!(?error, "isolated worker failed, invalidating batch");
                if let Some(link) = self.worker.take() {
                    drop(link.requests);
                    let _ = link.handle.join();
                }
                statement_counts.into_iter().map(timed_out_result).collect()
            }
        }
    }

    #[must_use]
    pub fn executed_tests(&self) -> u64 {
        self.executed_tests
    }

    #[must_use]
    pub fn executed_statements(&self) -> u64 {
        self.executed_statements
    }
}

impl Drop for IsolatedExecutor {
    fn drop(&mut self) {
        if let Some(link) = self.worker.take() {
            let _ = link.requests.send(WorkerRequest::Shutdown);
            drop(link.requests);
            let _ = link.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterFilters, TestCluster, TypeInfo};
    use crate::execution::tracer::ExecutionTracer;
    use crate::execution::vm::native_names;
    use crate::instrumentation::{InstrumentationOptions, Instrumenter};
    use crate::lang::{compile_module, parse_module};
    use crate::seeding::ConstantPool;
    use crate::testcase::statement::{Statement, StatementKind};

    const SOURCE: &str = r#"
def triangle(a: int, b: int, c: int) -> str {
    if a == b and b == c { return "equilateral" }
    return "other"
}
def spin() { x = 0 while true { x = x + 1 } }
"#;

    fn setup(source: &str) -> (Arc<CompiledModule>, TracerHandle, Arc<TestCluster>) {
        let ast = parse_module("m", source).expect("parse");
        let cluster = Arc::new(TestCluster::from_module(&ast, &ClusterFilters::default()));
        let module = compile_module(&ast).expect("compile");
        let mut tracer = ExecutionTracer::new(Arc::new(ConstantPool::new()));
        let instrumenter = Instrumenter::new(InstrumentationOptions::default(), native_names());
        let instrumented = instrumenter
            .instrument_module(&module, &mut tracer)
            .expect("instrument");
        (
            Arc::new(instrumented),
            TracerHandle::new(tracer),
            cluster,
        )
    }

    fn triangle_test(cluster: &TestCluster, a: i64, b: i64, c: i64) -> TestCase {
        let callable = cluster
            .accessible()
            .iter()
            .find(|d| d.name == "triangle")
            .expect("triangle callable")
            .clone();
        let mut test = TestCase::new();
        let ra = test.push(Statement::new(StatementKind::IntLiteral(a), TypeInfo::Int));
        let rb = test.push(Statement::new(StatementKind::IntLiteral(b), TypeInfo::Int));
        let rc = test.push(Statement::new(StatementKind::IntLiteral(c), TypeInfo::Int));
        test.push(Statement::new(
            StatementKind::FunctionCall {
                callable,
                args: vec![ra, rb, rc],
                kwargs: std::collections::BTreeMap::new(),
            },
            TypeInfo::Str,
        ));
        test
    }

    #[test]
    fn executes_test_case_and_captures_outcomes() {
        let (module, tracer, cluster) = setup(SOURCE);
        let mut executor = TestCaseExecutor::new(module, tracer, ExecutorOptions::default());
        let test = triangle_test(&cluster, 1, 1, 1);
        let result = executor.execute(&test);
        assert!(!result.timed_out);
        assert_eq!(result.outcomes.len(), 4);
        match &result.outcomes[3] {
            StatementOutcome::Ok { value, .. } => {
                assert_eq!(value, &ValueSnapshot::Str("equilateral".to_string()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!result.trace.executed_code_objects.is_empty());
        assert_eq!(executor.executed_tests(), 1);
    }

    #[test]
    fn statement_timeout_marks_test_and_discards_partial_trace() {
        let (module, tracer, cluster) = setup(SOURCE);
        let options = ExecutorOptions {
            per_statement_timeout: Duration::from_millis(50),
            per_test_timeout: Duration::from_millis(500),
            abort_grace: Duration::from_millis(200),
            type_tracing: true,
        };
        let mut executor = TestCaseExecutor::new(module, tracer, options);
        let spin = cluster
            .accessible()
            .iter()
            .find(|d| d.name == "spin")
            .expect("spin callable")
            .clone();
        let mut test = TestCase::new();
        test.push(Statement::new(
            StatementKind::FunctionCall {
                callable: spin,
                args: vec![],
                kwargs: std::collections::BTreeMap::new(),
            },
            TypeInfo::Any,
        ));
        let result = executor.execute(&test);
        assert!(result.timed_out);
        assert_eq!(result.outcomes[0], StatementOutcome::TimedOut);
        // the aborting statement contributes nothing to the trace
        assert!(result.trace.executed_code_objects.is_empty());
    }

    #[test]
    fn isolated_executor_runs_batches() {
        let (module, tracer, cluster) = setup(SOURCE);
        let mut executor = IsolatedExecutor::new(module, tracer, ExecutorOptions::default());
        let batch = vec![
            triangle_test(&cluster, 1, 1, 1),
            triangle_test(&cluster, 1, 2, 3),
        ];
        let results = executor.execute_batch(batch);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.timed_out));
        assert_eq!(executor.executed_tests(), 2);
    }
}
