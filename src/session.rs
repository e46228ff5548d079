//! Engine session: lifecycle state machine over a dedicated dispatcher.
//!
//! ```text
//! Uninitialized -> Initialized -> Starting -> Running -> Stopping -> Stopped
//!                                    \           |          /
//!                                     +------> Faulted <---+
//! ```
//!
//! Every public operation validates the state under the session lock,
//! enqueues at most one work item while still holding it (so queue order
//! always agrees with the order of state transitions), and returns. Work
//! items never hold the lock while calling into the engine, and completions
//! are always delivered after the lock is released, so completion callbacks
//! may call back into the session.

use crate::callbacks::{CallFromScriptHandler, CallbackRegistry};
use crate::completion::{Completion, CompletionResult, CompletionSink, completion};
use crate::config::BridgeConfig;
use crate::dispatcher::{DispatcherOptions, DispatcherTelemetry, EnqueueResult, WorkDispatcher};
use crate::engine::{EngineCapabilities, EngineFactory, ScriptCallRouter, ScriptEngine, ScriptFile};
use crate::error::{Error, Failure, Result};
use crate::quickjs::QuickJsFactory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialized => "Initialized",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Faulted => "Faulted",
        }
    }

    /// States from which an unrecoverable failure leads to `Faulted`.
    #[must_use]
    pub const fn can_fault(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Engine = Box<dyn ScriptEngine>;

/// A rejected admission hands the sink back so the caller decides how the
/// error is reported.
type Admission<T> = std::result::Result<(), (Error, CompletionSink<T>)>;

#[derive(Debug)]
struct Lifecycle {
    state: LifecycleState,
    working_directory: Option<PathBuf>,
    staged: Vec<ScriptFile>,
}

#[derive(Debug)]
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    callbacks: Arc<CallbackRegistry>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, operation: &'static str) {
        let mut lifecycle = self.lock();
        if lifecycle.state.can_fault() {
            tracing::error!(operation, from = %lifecycle.state, "engine session faulted");
            lifecycle.state = LifecycleState::Faulted;
        }
    }
}

pub struct EngineSession {
    shared: Arc<Shared>,
    capabilities: EngineCapabilities,
    live_loading: bool,
    dispatcher: WorkDispatcher<Engine>,
}

impl EngineSession {
    /// QuickJS-backed session in `Initialized`.
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Self::with_factory(config, QuickJsFactory)
    }

    pub fn with_factory<F>(config: &BridgeConfig, factory: F) -> Result<Self>
    where
        F: EngineFactory + 'static,
    {
        let capabilities = factory.capabilities();
        let dispatcher =
            WorkDispatcher::spawn(DispatcherOptions::from(config), move || factory.create())?;
        let live_loading = config.live_loading && capabilities.live_loading;
        if config.live_loading && !capabilities.live_loading {
            tracing::warn!("live loading requested but the engine cannot load files after start");
        }
        tracing::trace!("init()");
        Ok(Self {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: LifecycleState::Initialized,
                    working_directory: None,
                    staged: Vec::new(),
                }),
                callbacks: Arc::new(CallbackRegistry::new()),
            }),
            capabilities,
            live_loading,
            dispatcher,
        })
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<PathBuf> {
        self.shared.lock().working_directory.clone()
    }

    /// Files waiting for `start`.
    #[must_use]
    pub fn staged_files(&self) -> Vec<ScriptFile> {
        self.shared.lock().staged.clone()
    }

    #[must_use]
    pub fn registered_functions(&self) -> Vec<String> {
        self.shared.callbacks.names()
    }

    #[must_use]
    pub const fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    #[must_use]
    pub const fn live_loading(&self) -> bool {
        self.live_loading
    }

    #[must_use]
    pub fn telemetry(&self) -> DispatcherTelemetry {
        self.dispatcher.telemetry()
    }

    #[must_use]
    pub fn is_dispatcher_thread(&self) -> bool {
        self.dispatcher.is_dispatcher_thread()
    }

    #[must_use]
    pub const fn dispatcher_thread_id(&self) -> ThreadId {
        self.dispatcher.worker_thread_id()
    }

    /// Stage a script file for `start`, or evaluate it right away when the
    /// session is running with live loading enabled.
    pub fn define_script_file(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Completion<()>> {
        let file = ScriptFile::new(name, source);
        tracing::trace!("defineScriptFile(\"{}\", \"...\")", file.name);
        admit_future(|sink| self.admit_define(file, sink))
    }

    fn admit_define(&self, file: ScriptFile, sink: CompletionSink<()>) -> Admission<()> {
        if file.name.trim().is_empty() {
            return Err((
                Error::script_load(file.name, "script file name is empty"),
                sink,
            ));
        }
        let mut lifecycle = self.shared.lock();
        let state = lifecycle.state;
        match state {
            LifecycleState::Initialized => {
                if lifecycle.staged.iter().any(|staged| staged.name == file.name) {
                    tracing::debug!(file = %file.name, "script file staged again");
                }
                lifecycle.staged.push(file);
                drop(lifecycle);
                sink.succeed(());
                Ok(())
            }
            LifecycleState::Running if self.live_loading => {
                let shared = Arc::clone(&self.shared);
                self.enqueue(&lifecycle, "define_script_file", move |engine| {
                    let outcome = guarded("define_script_file", || engine.define_script_file(&file));
                    finish(&shared, "define_script_file", outcome, sink);
                });
                Ok(())
            }
            state => Err((
                Error::invalid_state(format!(
                    "cannot define script file '{}' while the engine is {state}",
                    file.name
                )),
                sink,
            )),
        }
    }

    pub fn start(&self, working_directory: impl AsRef<Path>) -> Result<Completion<()>> {
        let dir = working_directory.as_ref().to_path_buf();
        admit_future(|sink| self.admit_start(dir, sink))
    }

    pub fn start_with<F>(&self, working_directory: impl AsRef<Path>, on_complete: F)
    where
        F: FnOnce(CompletionResult<()>) + Send + 'static,
    {
        let dir = working_directory.as_ref().to_path_buf();
        admit_callback(CompletionSink::from_fn(on_complete), |sink| {
            self.admit_start(dir, sink)
        });
    }

    fn admit_start(&self, dir: PathBuf, sink: CompletionSink<()>) -> Admission<()> {
        tracing::trace!("start(\"{}\")", dir.display());
        let mut lifecycle = self.shared.lock();
        if lifecycle.state != LifecycleState::Initialized {
            return Err((
                Error::invalid_state(format!(
                    "start is only valid once, from Initialized (engine is {})",
                    lifecycle.state
                )),
                sink,
            ));
        }
        lifecycle.state = LifecycleState::Starting;
        lifecycle.working_directory = Some(dir.clone());
        let staged = std::mem::take(&mut lifecycle.staged);

        let shared = Arc::clone(&self.shared);
        let router = self.router();
        let bind_names = self.capabilities.native_bindings;
        self.enqueue(&lifecycle, "start", move |engine| {
            let outcome = guarded("start", || {
                engine.start(&dir, router)?;
                if bind_names {
                    for name in shared.callbacks.names() {
                        engine.register_call_from_script(&name)?;
                    }
                }
                for file in &staged {
                    engine.define_script_file(file)?;
                }
                Ok(())
            });

            let mut lifecycle = shared.lock();
            let from = lifecycle.state;
            let result = match outcome {
                Ok(Ok(())) => {
                    // A stop requested while starting keeps the session in Stopping.
                    if from == LifecycleState::Starting {
                        lifecycle.state = LifecycleState::Running;
                    }
                    tracing::info!(files = staged.len(), "engine started");
                    Ok(())
                }
                Ok(Err(err)) | Err(err) => {
                    if from.can_fault() {
                        lifecycle.state = LifecycleState::Faulted;
                    }
                    tracing::error!(error = %err, "engine start failed");
                    Err(err.into_failure())
                }
            };
            drop(lifecycle);
            sink.complete(result);
        });
        Ok(())
    }

    /// Tear the engine down. Idempotent: stopping a stopped (or never
    /// started) session succeeds without doing anything.
    pub fn stop(&self) -> Result<Completion<()>> {
        admit_future(|sink| self.admit_stop(sink))
    }

    pub fn stop_with<F>(&self, on_complete: F)
    where
        F: FnOnce(CompletionResult<()>) + Send + 'static,
    {
        admit_callback(CompletionSink::from_fn(on_complete), |sink| {
            self.admit_stop(sink)
        });
    }

    fn admit_stop(&self, sink: CompletionSink<()>) -> Admission<()> {
        tracing::trace!("stop()");
        let mut lifecycle = self.shared.lock();
        let state = lifecycle.state;
        match state {
            LifecycleState::Uninitialized | LifecycleState::Stopped => {
                drop(lifecycle);
                sink.succeed(());
            }
            LifecycleState::Initialized => {
                lifecycle.state = LifecycleState::Stopped;
                lifecycle.staged.clear();
                drop(lifecycle);
                self.shared.callbacks.clear();
                sink.succeed(());
            }
            LifecycleState::Stopping => {
                // Completes once the teardown already queued has run.
                self.enqueue(&lifecycle, "stop", move |_| sink.succeed(()));
            }
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Faulted => {
                if state != LifecycleState::Faulted {
                    lifecycle.state = LifecycleState::Stopping;
                }
                let shared = Arc::clone(&self.shared);
                self.enqueue(&lifecycle, "stop", move |engine| {
                    let outcome = guarded("stop", || engine.stop());
                    shared.callbacks.clear();

                    let mut lifecycle = shared.lock();
                    let result = match outcome {
                        Ok(Ok(())) => {
                            if lifecycle.state == LifecycleState::Stopping {
                                lifecycle.state = LifecycleState::Stopped;
                            }
                            tracing::info!(state = %lifecycle.state, "engine stopped");
                            Ok(())
                        }
                        Ok(Err(err)) | Err(err) => {
                            lifecycle.state = LifecycleState::Faulted;
                            tracing::error!(error = %err, "engine teardown failed");
                            Err(err.into_failure())
                        }
                    };
                    drop(lifecycle);
                    sink.complete(result);
                });
            }
        }
        Ok(())
    }

    /// Evaluate `code`; resolves to the JSON text of the result.
    pub fn call_script(&self, code: impl Into<String>) -> Result<Completion<String>> {
        let code = code.into();
        admit_future(|sink| self.admit_call(code, sink))
    }

    pub fn call_script_with<F>(&self, code: impl Into<String>, on_complete: F)
    where
        F: FnOnce(CompletionResult<String>) + Send + 'static,
    {
        let code = code.into();
        admit_callback(CompletionSink::from_fn(on_complete), |sink| {
            self.admit_call(code, sink)
        });
    }

    fn admit_call(&self, code: String, sink: CompletionSink<String>) -> Admission<String> {
        tracing::trace!("callScript(\"{code}\")");
        let lifecycle = self.shared.lock();
        if lifecycle.state != LifecycleState::Running {
            return Err((
                Error::invalid_state(format!(
                    "callScript requires a running engine (engine is {})",
                    lifecycle.state
                )),
                sink,
            ));
        }
        let shared = Arc::clone(&self.shared);
        self.enqueue(&lifecycle, "call_script", move |engine| {
            let outcome = guarded("call_script", || engine.call_script(&code));
            finish(&shared, "call_script", outcome, sink);
        });
        Ok(())
    }

    /// Route script calls to `name` to `handler`. Replaces any handler
    /// previously registered under the same name.
    pub fn register_call_from_script<F>(&self, name: &str, handler: F) -> Result<Completion<()>>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let handler: CallFromScriptHandler = Arc::new(handler);
        admit_future(|sink| self.admit_register(name, handler, sink))
    }

    fn admit_register(
        &self,
        name: &str,
        handler: CallFromScriptHandler,
        sink: CompletionSink<()>,
    ) -> Admission<()> {
        tracing::trace!("registerCallFromScript(\"{name}\")");
        let lifecycle = self.shared.lock();
        let state = lifecycle.state;
        let running = match state {
            LifecycleState::Initialized => false,
            LifecycleState::Running => true,
            state => {
                return Err((
                    Error::invalid_state(format!(
                        "cannot register '{name}' while the engine is {state}"
                    )),
                    sink,
                ));
            }
        };
        let replaced = match self.shared.callbacks.register(name, handler) {
            Ok(replaced) => replaced,
            Err(err) => return Err((err, sink)),
        };
        if running && replaced.is_none() && self.capabilities.native_bindings {
            let shared = Arc::clone(&self.shared);
            let name = name.to_string();
            self.enqueue(&lifecycle, "register_call_from_script", move |engine| {
                let outcome = guarded("register_call_from_script", || {
                    engine.register_call_from_script(&name)
                });
                finish(&shared, "register_call_from_script", outcome, sink);
            });
        } else {
            drop(lifecycle);
            sink.succeed(());
        }
        Ok(())
    }

    fn router(&self) -> ScriptCallRouter {
        let callbacks = Arc::clone(&self.shared.callbacks);
        Arc::new(move |name, args_json| callbacks.dispatch(name, args_json))
    }

    /// Enqueue while the caller still holds the lifecycle lock.
    fn enqueue<W>(&self, _lifecycle: &MutexGuard<'_, Lifecycle>, label: &'static str, work: W)
    where
        W: FnOnce(&mut Engine) + Send + 'static,
    {
        if let EnqueueResult::Rejected = self.dispatcher.enqueue(label, work) {
            tracing::warn!(label, "session dispatcher rejected work");
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        let state = self.state();
        if matches!(state, LifecycleState::Starting | LifecycleState::Running) {
            tracing::warn!(%state, "engine session dropped without stop; tearing down");
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("state", &self.state())
            .field("capabilities", &self.capabilities)
            .field("live_loading", &self.live_loading)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

fn admit_future<T>(admit: impl FnOnce(CompletionSink<T>) -> Admission<T>) -> Result<Completion<T>> {
    let (sink, done) = completion();
    match admit(sink) {
        Ok(()) => Ok(done),
        Err((err, sink)) => {
            // Nobody holds the receiver; this only keeps the sink from
            // reporting itself as dropped.
            sink.fail(Failure::new(err.kind(), err.to_string()));
            Err(err)
        }
    }
}

fn admit_callback<T>(sink: CompletionSink<T>, admit: impl FnOnce(CompletionSink<T>) -> Admission<T>) {
    if let Err((err, sink)) = admit(sink) {
        tracing::debug!(error = %err, "operation rejected");
        sink.fail(err);
    }
}

/// Run engine code, turning a panic into an outer `Err`.
fn guarded<T>(operation: &'static str, run: impl FnOnce() -> Result<T>) -> std::result::Result<Result<T>, Error> {
    catch_unwind(AssertUnwindSafe(run)).map_err(|payload| {
        let failure = Failure::from_panic(payload.as_ref());
        tracing::error!(operation, error = %failure, "engine panicked");
        Error::internal(failure.message)
    })
}

/// Deliver the outcome of a work item; an engine panic faults the session.
fn finish<T>(
    shared: &Shared,
    operation: &'static str,
    outcome: std::result::Result<Result<T>, Error>,
    sink: CompletionSink<T>,
) {
    match outcome {
        Ok(result) => sink.complete(result.map_err(Error::into_failure)),
        Err(panic) => {
            shared.fault(operation);
            sink.fail(panic);
        }
    }
}
