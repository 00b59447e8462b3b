use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;

use crate::dispatch::{DispatchError, DispatchTable, InvocationWrapper, InvokeError};
use crate::events::EventSink;
use crate::program::{Arg, CompileError, Op, WorkflowProgram};
use crate::prompt;
use crate::provider::InferenceProvider;

/// Lifecycle of one execution unit. Transitions `Loaded → Running → Purged`
/// exactly once per run; the state machine is terminal and single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Loaded,
    Running,
    Purged,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source for unit '{id}' was rejected by the screen: {reason}")]
    Screened { id: String, reason: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("unit '{id}' is already loaded")]
    AlreadyLoaded { id: String },

    #[error("unit id '{expected}' does not match entry point name '{found}'")]
    NameMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unit '{id}' cannot run from state {state:?}")]
    State { id: String, state: UnitState },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("line {line}: unknown variable '{name}'")]
    UnknownVariable { line: u32, name: String },

    #[error("line {line}: variable '{name}' is still pending; join it with Wait before use")]
    PendingVariable { line: u32, name: String },

    #[error("line {line}: Wait argument '{name}' is not a started capability call")]
    WaitOnValue { line: u32, name: String },

    #[error("line {line}: inference request failed: {source}")]
    Inference { line: u32, source: anyhow::Error },

    #[error("worker thread for the call at line {line} panicked")]
    WorkerPanic { line: u32 },
}

/// One loaded workflow: parsed source plus its lifecycle state, registered
/// under a fresh namespace keyed by the workflow name.
pub struct ExecutionUnit {
    id: String,
    program: WorkflowProgram,
    state: Mutex<UnitState>,
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("state", &self.state())
            .finish()
    }
}

impl ExecutionUnit {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn program(&self) -> &WorkflowProgram {
        &self.program
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock().expect("unit state lock poisoned")
    }
}

/// The dispatch context an execution unit runs against: the bound provider
/// namespaces plus the `Output`/`Sample`/`Wait` builtins (implemented by the
/// interpreter) and the event sink they all report through.
pub struct DispatchContext {
    pub table: Arc<DispatchTable>,
    pub inference: Arc<dyn InferenceProvider>,
    pub sink: EventSink,
}

/// Pre-load screen over generated source. A screen rejection keeps the unit
/// from ever being created; the default only refuses obvious interpreter
/// escapes and is a hook point, not a sandbox.
pub type SourceScreen = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

pub fn default_screen(source: &str) -> Result<(), String> {
    for line in source.lines() {
        let line = line.trim();
        if line.starts_with("import ") || line.starts_with("from ") {
            return Err(format!("imports are not allowed: '{line}'"));
        }
        if line.contains("exec(") || line.contains("eval(") || line.contains("__") {
            return Err(format!("forbidden construct: '{line}'"));
        }
    }
    Ok(())
}

/// What [`UnitRegistry::execute`] observed. Run failures are isolated here
/// rather than propagated: the caller of the overall runner never sees them
/// as errors, only as a report.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub load_error: Option<String>,
    pub run_error: Option<String>,
    pub leaked: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.load_error.is_none() && self.run_error.is_none()
    }
}

/// Registry of live execution units.
///
/// The registry is the explicit ledger leak detection works against: a unit
/// handle still held by anyone after `unload` removed the registry's own
/// clone is reported as a (non-fatal) leak diagnostic.
pub struct UnitRegistry {
    units: Mutex<HashMap<String, Arc<ExecutionUnit>>>,
    screen: SourceScreen,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::with_screen(Box::new(default_screen))
    }

    pub fn with_screen(screen: SourceScreen) -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            screen,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units
            .lock()
            .expect("unit registry lock poisoned")
            .contains_key(id)
    }

    /// Compile `source` as an isolated unit under `id`.
    ///
    /// On any screen or compile failure the unit is not created and nothing
    /// is registered; there is no `Running` transition to unwind.
    pub fn load(&self, id: &str, source: &str) -> Result<Arc<ExecutionUnit>, LoadError> {
        if let Err(reason) = (self.screen)(source) {
            return Err(LoadError::Screened {
                id: id.to_string(),
                reason,
            });
        }

        let program = WorkflowProgram::parse(source)?;
        if program.name != id {
            return Err(LoadError::NameMismatch {
                expected: id.to_string(),
                found: program.name,
            });
        }

        let unit = Arc::new(ExecutionUnit {
            id: id.to_string(),
            program,
            state: Mutex::new(UnitState::Loaded),
        });

        let mut units = self.units.lock().expect("unit registry lock poisoned");
        if units.contains_key(id) {
            return Err(LoadError::AlreadyLoaded { id: id.to_string() });
        }
        units.insert(id.to_string(), Arc::clone(&unit));
        tracing::debug!(unit = %id, "loaded execution unit");
        Ok(unit)
    }

    /// Run a loaded unit to completion or failure.
    pub fn run(&self, unit: &ExecutionUnit, ctx: &DispatchContext) -> Result<(), RunError> {
        {
            let mut state = unit.state.lock().expect("unit state lock poisoned");
            if *state != UnitState::Loaded {
                return Err(RunError::State {
                    id: unit.id.clone(),
                    state: *state,
                });
            }
            *state = UnitState::Running;
        }
        tracing::debug!(unit = %unit.id, "running execution unit");
        interpret(&unit.program, ctx)
    }

    /// Unconditionally remove the unit from the registry and mark it purged.
    ///
    /// Returns true when another handle to the unit is still alive, which is
    /// reported as a diagnostic rather than an error.
    pub fn unload(&self, unit: Arc<ExecutionUnit>) -> bool {
        {
            let mut units = self.units.lock().expect("unit registry lock poisoned");
            units.remove(unit.id());
        }
        {
            let mut state = unit.state.lock().expect("unit state lock poisoned");
            *state = UnitState::Purged;
        }

        // With the registry's clone gone, ours should be the last handle.
        let leaked = Arc::strong_count(&unit) > 1;
        if leaked {
            tracing::warn!(unit = %unit.id(), "unit handle still held after unload; likely not purged");
        } else {
            tracing::debug!(unit = %unit.id(), "purged execution unit");
        }
        leaked
    }

    /// The guaranteed load → run → unload cycle for one workflow.
    ///
    /// The stream always begins with `WorkflowStart` and ends with
    /// `WorkflowEnd`; load and run failures are reported into the stream and
    /// the log, never raised to the caller, and `unload` runs exactly once
    /// after every `run` whatever its outcome.
    pub fn execute(&self, id: &str, source: &str, ctx: &DispatchContext) -> RunReport {
        ctx.sink.workflow_start();

        let report = match self.load(id, source) {
            Err(err) => {
                tracing::error!(unit = %id, error = %err, "failed to load generated source");
                ctx.sink.update(
                    None,
                    format!("Workflow '{id}' failed to load"),
                    Some(err.to_string()),
                );
                RunReport {
                    load_error: Some(err.to_string()),
                    ..RunReport::default()
                }
            }
            Ok(unit) => {
                let run_error = match self.run(&unit, ctx) {
                    Ok(()) => None,
                    Err(err) => {
                        tracing::error!(unit = %id, error = %err, "generated workflow failed");
                        ctx.sink.update(
                            None,
                            format!("Workflow '{id}' failed"),
                            Some(err.to_string()),
                        );
                        Some(err.to_string())
                    }
                };
                let leaked = self.unload(unit);
                RunReport {
                    load_error: None,
                    run_error,
                    leaked,
                }
            }
        };

        ctx.sink.workflow_end();
        report
    }
}

/// A declared-but-not-yet-started capability invocation. Suspended until a
/// `Wait` joins it; starting is what spawns the worker.
struct PendingCall {
    wrapper: Arc<InvocationWrapper>,
    line: u32,
    arguments: Vec<(String, JsonValue)>,
}

enum Slot {
    Value(JsonValue),
    Pending(PendingCall),
}

fn interpret(program: &WorkflowProgram, ctx: &DispatchContext) -> Result<(), RunError> {
    let mut env: HashMap<String, Slot> = HashMap::new();

    let result = run_statements(program, ctx, &mut env);

    // Suspended calls that were never joined never ran; nothing was spawned
    // for them, so dropping them here cannot emit stray events after the run.
    for (name, slot) in env {
        if let Slot::Pending(pending) = slot {
            tracing::warn!(
                variable = %name,
                line = pending.line,
                "capability call was declared but never joined"
            );
        }
    }

    result
}

fn run_statements(
    program: &WorkflowProgram,
    ctx: &DispatchContext,
    env: &mut HashMap<String, Slot>,
) -> Result<(), RunError> {
    for stmt in &program.statements {
        match &stmt.op {
            Op::Invoke {
                target,
                call,
                awaited,
            } => {
                let wrapper = ctx.table.resolve(&call.provider, &call.capability)?;
                let arguments = resolve_arguments(env, stmt.line, &call.arguments)?;
                if *awaited {
                    let value = wrapper.execute(stmt.line, arguments)?;
                    if let Some(target) = target {
                        env.insert(target.clone(), Slot::Value(value));
                    }
                } else if let Some(target) = target {
                    env.insert(
                        target.clone(),
                        Slot::Pending(PendingCall {
                            wrapper,
                            line: stmt.line,
                            arguments,
                        }),
                    );
                } else {
                    tracing::warn!(
                        line = stmt.line,
                        "concurrent call is not bound to a variable and can never be joined"
                    );
                }
            }
            Op::Wait { target, handles } => {
                let values = wait_group(env, stmt.line, handles, &ctx.sink)?;
                if let Some(target) = target {
                    env.insert(target.clone(), Slot::Value(JsonValue::Array(values)));
                }
            }
            Op::Sample { target, question } => {
                let question = text_argument(env, stmt.line, question)?;
                let answer = sample(ctx, stmt.line, &question)?;
                if let Some(target) = target {
                    env.insert(target.clone(), Slot::Value(JsonValue::String(answer)));
                }
            }
            Op::Output { value } => {
                let text = text_argument(env, stmt.line, value)?;
                output(&ctx.sink, stmt.line, &text);
            }
        }
    }
    Ok(())
}

/// The `Wait` builtin: a structured join over suspended calls.
///
/// Emits its own begin/end bracket around the group; every member runs on its
/// own worker and emits its own line-correlated begin/end pair in between.
/// Results come back in argument order, not completion order, and the end
/// event is emitted even when a member failed.
fn wait_group(
    env: &mut HashMap<String, Slot>,
    line: u32,
    handles: &[String],
    sink: &EventSink,
) -> Result<Vec<JsonValue>, RunError> {
    let started = Instant::now();
    sink.update(
        Some(line),
        "Beginning Wait",
        Some("Waiting for this group of requests to return.".to_string()),
    );

    // Take every member first so a bad argument fails before any worker runs.
    let mut pendings = Vec::with_capacity(handles.len());
    for name in handles {
        match env.remove(name) {
            Some(Slot::Pending(pending)) => pendings.push(pending),
            Some(slot @ Slot::Value(_)) => {
                env.insert(name.clone(), slot);
                return Err(RunError::WaitOnValue {
                    line,
                    name: name.clone(),
                });
            }
            None => {
                return Err(RunError::UnknownVariable {
                    line,
                    name: name.clone(),
                })
            }
        }
    }

    let workers: Vec<(u32, JoinHandle<Result<JsonValue, InvokeError>>)> = pendings
        .into_iter()
        .map(|pending| {
            let PendingCall {
                wrapper,
                line,
                arguments,
            } = pending;
            (
                line,
                std::thread::spawn(move || wrapper.execute(line, arguments)),
            )
        })
        .collect();

    let mut values = Vec::with_capacity(workers.len());
    let mut first_failure: Option<RunError> = None;
    for (member_line, worker) in workers {
        match worker.join() {
            Ok(Ok(value)) => values.push(value),
            Ok(Err(err)) => {
                if first_failure.is_none() {
                    first_failure = Some(RunError::Invoke(err));
                }
            }
            Err(_) => {
                if first_failure.is_none() {
                    first_failure = Some(RunError::WorkerPanic { line: member_line });
                }
            }
        }
    }

    let secs = started.elapsed().as_secs_f64();
    sink.update(
        Some(line),
        "Returned from Wait",
        Some(format!("Time: {secs:.2} seconds.")),
    );

    match first_failure {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

/// The `Sample` builtin. A delimiter violation in the model's answer is
/// recovered locally with a fallback string; only a transport failure aborts
/// the run. The metrics update is emitted on every parse outcome.
fn sample(ctx: &DispatchContext, line: u32, question: &str) -> Result<String, RunError> {
    let started = Instant::now();
    ctx.sink.update(
        Some(line),
        "Beginning Sample",
        Some("Making a call to the language model.".to_string()),
    );
    tracing::debug!(line, "sampling the inference provider");

    match ctx
        .inference
        .respond(&prompt::sample_instructions(), question)
    {
        Ok(reply) => {
            let answer = prompt::extract_answer(&reply.answer)
                .unwrap_or_else(|| prompt::fallback_answer(&reply.answer));
            let secs = started.elapsed().as_secs_f64();
            ctx.sink.update(
                Some(line),
                "Received Sample answer",
                Some(format!(
                    "Prompt tokens: {}\nCompletion tokens: {}\nTime: {secs:.2} seconds.",
                    reply.prompt_tokens, reply.completion_tokens
                )),
            );
            Ok(answer)
        }
        Err(source) => {
            let secs = started.elapsed().as_secs_f64();
            ctx.sink.update(
                Some(line),
                "Received Sample answer",
                Some(format!("Request failed: {source}\nTime: {secs:.2} seconds.")),
            );
            Err(RunError::Inference { line, source })
        }
    }
}

/// The `Output` builtin: an answer event bracketed by begin/end markers at
/// the call's own line.
fn output(sink: &EventSink, line: u32, text: &str) {
    sink.update(
        Some(line),
        "Beginning Output",
        Some("This function prints part of the final answer.".to_string()),
    );
    sink.answer(Some(line), text);
    sink.update(Some(line), "Returned from Output", None);
}

fn resolve_arguments(
    env: &HashMap<String, Slot>,
    line: u32,
    arguments: &[(String, Arg)],
) -> Result<Vec<(String, JsonValue)>, RunError> {
    arguments
        .iter()
        .map(|(key, arg)| Ok((key.clone(), arg_value(env, line, arg)?)))
        .collect()
}

fn arg_value(env: &HashMap<String, Slot>, line: u32, arg: &Arg) -> Result<JsonValue, RunError> {
    match arg {
        Arg::Str(s) => Ok(JsonValue::String(s.clone())),
        Arg::Int(n) => Ok(JsonValue::from(*n)),
        Arg::Float(f) => Ok(serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)),
        Arg::Bool(b) => Ok(JsonValue::Bool(*b)),
        Arg::Var(name) => match env.get(name) {
            Some(Slot::Value(value)) => Ok(value.clone()),
            Some(Slot::Pending(_)) => Err(RunError::PendingVariable {
                line,
                name: name.clone(),
            }),
            None => Err(RunError::UnknownVariable {
                line,
                name: name.clone(),
            }),
        },
    }
}

fn text_argument(
    env: &HashMap<String, Slot>,
    line: u32,
    arg: &Arg,
) -> Result<String, RunError> {
    let value = arg_value(env, line, arg)?;
    Ok(match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}
