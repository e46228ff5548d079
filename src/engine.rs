//! The capability set every embedded engine provides.
//!
//! Engines are not `Send`: an [`EngineFactory`] (which is) builds one on the
//! dispatcher thread and the engine stays there until the session ends. All
//! trait methods are therefore only ever called from that thread.

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Routes a script-initiated call back to the host. Called on the dispatcher
/// thread with `(function_name, args_json)`; an error is rethrown into the
/// calling script.
pub type ScriptCallRouter = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineCapabilities {
    /// Script files may be evaluated after the engine has started.
    pub live_loading: bool,
    /// Script-callable names must be bound inside the engine (as opposed to
    /// being resolved dynamically on each call).
    pub native_bindings: bool,
}

/// A named script source. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    pub source: String,
}

impl ScriptFile {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Capabilities are reported by the [`EngineFactory`] so they are known
/// before the engine exists.
pub trait ScriptEngine {
    /// Bring the engine up rooted at `working_directory`. `router` receives
    /// every call script code makes to a registered name.
    fn start(&mut self, working_directory: &Path, router: ScriptCallRouter) -> Result<()>;

    /// Evaluate a script file. Failures are `ScriptLoadError`s.
    fn define_script_file(&mut self, file: &ScriptFile) -> Result<()>;

    /// Evaluate `code` and return the JSON text of its completion value.
    fn call_script(&mut self, code: &str) -> Result<String>;

    /// Expose `name` to scripts as a function forwarding to the router.
    fn register_call_from_script(&mut self, name: &str) -> Result<()>;

    /// Tear the engine down. Must be safe to call when not started.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Builds engines on the dispatcher thread.
pub trait EngineFactory: Send + Sync {
    /// Capabilities of the engines this factory produces, readable before any
    /// engine exists.
    fn capabilities(&self) -> EngineCapabilities;

    fn create(&self) -> Box<dyn ScriptEngine>;
}

impl<F: EngineFactory + ?Sized> EngineFactory for Arc<F> {
    fn capabilities(&self) -> EngineCapabilities {
        self.as_ref().capabilities()
    }

    fn create(&self) -> Box<dyn ScriptEngine> {
        self.as_ref().create()
    }
}
