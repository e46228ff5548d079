//! QuickJS implementation of [`ScriptEngine`].
//!
//! Uses the synchronous `rquickjs` runtime: the engine lives on the
//! dispatcher thread, so there is nothing to gain from the async flavour.
//! After every evaluation the pending job queue is drained so promise
//! callbacks scheduled by the evaluated code run before the result is
//! reported.

use crate::engine::{EngineCapabilities, EngineFactory, ScriptCallRouter, ScriptEngine, ScriptFile};
use crate::error::{Error, Result};
use rquickjs::context::EvalOptions;
use rquickjs::function::Func;
use rquickjs::loader::{Loader as JsModuleLoader, Resolver as JsModuleResolver};
use rquickjs::module::Declared as JsModuleDeclared;
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Function, IntoJs, Module, Object, Runtime, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

const BRIDGE_CALL_FN: &str = "__jsbridge_call";

/// Installed once per start. Gives scripts the Node-style `global` alias and a
/// minimal `process` object.
const PRELUDE_JS: &str = r"
globalThis.global = globalThis;
globalThis.process = globalThis.process || {
    platform: 'quickjs',
    env: {},
    cwd: () => __jsbridge_cwd,
};
";

#[derive(Debug, Clone, Copy, Default)]
pub struct QuickJsFactory;

impl EngineFactory for QuickJsFactory {
    fn capabilities(&self) -> EngineCapabilities {
        QUICKJS_CAPABILITIES
    }

    fn create(&self) -> Box<dyn ScriptEngine> {
        Box::new(QuickJsEngine::new())
    }
}

const QUICKJS_CAPABILITIES: EngineCapabilities = EngineCapabilities {
    live_loading: true,
    native_bindings: true,
};

struct Instance {
    runtime: Runtime,
    context: Context,
    working_directory: PathBuf,
}

/// Script files defined so far, importable by name from modules.
type DefinedFiles = Rc<RefCell<HashMap<String, String>>>;

#[derive(Default)]
pub struct QuickJsEngine {
    instance: Option<Instance>,
    defined: DefinedFiles,
}

impl QuickJsEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<&Path> {
        self.instance
            .as_ref()
            .map(|instance| instance.working_directory.as_path())
    }

    fn instance(&self) -> Result<&Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| Error::invalid_state("QuickJS engine is not started"))
    }

    fn run_pending_jobs(runtime: &Runtime) {
        loop {
            match runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!("uncaught error in QuickJS job: {err:?}");
                }
            }
        }
    }
}

impl ScriptEngine for QuickJsEngine {
    fn start(&mut self, working_directory: &Path, router: ScriptCallRouter) -> Result<()> {
        if self.instance.is_some() {
            return Err(Error::invalid_state("QuickJS engine already started"));
        }
        let working_directory = std::fs::canonicalize(working_directory).map_err(|err| {
            Error::engine_init_with(
                format!("working directory {} is unusable", working_directory.display()),
                err,
            )
        })?;
        if !working_directory.is_dir() {
            return Err(Error::engine_init(format!(
                "working directory {} is not a directory",
                working_directory.display()
            )));
        }

        let runtime = Runtime::new()
            .map_err(|err| Error::engine_init(format!("create QuickJS runtime: {err:?}")))?;
        runtime.set_loader(
            WorkingDirResolver {
                root: working_directory.clone(),
                defined: Rc::clone(&self.defined),
            },
            WorkingDirLoader {
                defined: Rc::clone(&self.defined),
            },
        );
        let context = Context::full(&runtime)
            .map_err(|err| Error::engine_init(format!("create QuickJS context: {err:?}")))?;

        let cwd = working_directory.to_string_lossy().into_owned();
        context
            .with(|ctx| install_bridge(&ctx, &cwd, router))
            .map_err(Error::engine_init)?;

        tracing::debug!(cwd = %working_directory.display(), "QuickJS engine started");
        self.instance = Some(Instance {
            runtime,
            context,
            working_directory,
        });
        Ok(())
    }

    fn define_script_file(&mut self, file: &ScriptFile) -> Result<()> {
        let instance = self.instance()?;
        let mut options = EvalOptions::default();
        options.filename = Some(file.name.clone());
        let outcome = instance.context.with(|ctx| {
            match ctx.eval_with_options::<(), _>(file.source.as_str(), options) {
                Ok(()) => Ok(()),
                Err(rquickjs::Error::Exception) => Err(describe_exception(&ctx, ctx.catch()).0),
                Err(err) => Err(format!("{err:?}")),
            }
        });
        Self::run_pending_jobs(&instance.runtime);
        outcome.map_err(|message| Error::script_load(&file.name, message))?;
        self.defined
            .borrow_mut()
            .insert(file.name.clone(), file.source.clone());
        tracing::trace!(file = %file.name, "script file evaluated");
        Ok(())
    }

    fn call_script(&mut self, code: &str) -> Result<String> {
        let instance = self.instance()?;
        let outcome = instance.context.with(|ctx| -> Result<String> {
            let value = match ctx.eval::<Value<'_>, _>(code) {
                Ok(value) => value,
                Err(rquickjs::Error::Exception) => {
                    let (message, stack) = describe_exception(&ctx, ctx.catch());
                    return Err(Error::script_evaluation(message, stack));
                }
                Err(err) => return Err(Error::internal(format!("QuickJS eval: {err:?}"))),
            };
            stringify(&ctx, value)
        });
        Self::run_pending_jobs(&instance.runtime);
        outcome
    }

    fn register_call_from_script(&mut self, name: &str) -> Result<()> {
        let instance = self.instance()?;
        let name_literal = serde_json::to_string(name)
            .map_err(|err| Error::internal(format!("encode function name: {err}")))?;
        let script = format!(
            "(function (name) {{
                globalThis[name] = function (...args) {{
                    const payload = args.length === 0 ? null : (args.length === 1 ? args[0] : args);
                    const json = JSON.stringify(payload);
                    return {BRIDGE_CALL_FN}(name, json === undefined ? 'null' : json);
                }};
            }})({name_literal});"
        );
        instance
            .context
            .with(|ctx| match ctx.eval::<(), _>(script.as_str()) {
                Ok(()) => Ok(()),
                Err(rquickjs::Error::Exception) => Err(describe_exception(&ctx, ctx.catch()).0),
                Err(err) => Err(format!("{err:?}")),
            })
            .map_err(|message| Error::internal(format!("bind '{name}': {message}")))?;
        tracing::trace!(name, "script callable bound");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(instance) = self.instance.take() {
            Self::run_pending_jobs(&instance.runtime);
            let Instance {
                runtime,
                context,
                working_directory,
            } = instance;
            drop(context);
            drop(runtime);
            tracing::debug!(cwd = %working_directory.display(), "QuickJS engine stopped");
        }
        self.defined.borrow_mut().clear();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.instance.is_some()
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn install_bridge(ctx: &Ctx<'_>, cwd: &str, router: ScriptCallRouter) -> std::result::Result<(), String> {
    let global = ctx.globals();
    let install = || -> rquickjs::Result<()> {
        global.set("__jsbridge_cwd", cwd)?;
        global.set(
            BRIDGE_CALL_FN,
            Func::from(
                move |ctx: Ctx<'_>, name: String, args_json: String| -> rquickjs::Result<()> {
                    router(&name, &args_json).map_err(|err| throw_message(&ctx, &err.to_string()))
                },
            ),
        )?;
        ctx.eval::<(), _>(PRELUDE_JS)
    };
    match install() {
        Ok(()) => Ok(()),
        Err(rquickjs::Error::Exception) => Err(describe_exception(ctx, ctx.catch()).0),
        Err(err) => Err(format!("install bridge: {err:?}")),
    }
}

/// JSON text of `value`; `null` when it has no JSON form (e.g. `undefined`).
fn stringify<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<String> {
    let json: Object<'js> = ctx
        .globals()
        .get("JSON")
        .map_err(|err| Error::internal(format!("JSON global missing: {err:?}")))?;
    let stringify: Function<'js> = json
        .get("stringify")
        .map_err(|err| Error::internal(format!("JSON.stringify missing: {err:?}")))?;
    match stringify.call::<_, Option<String>>((value,)) {
        Ok(text) => Ok(text.unwrap_or_else(|| "null".to_string())),
        Err(rquickjs::Error::Exception) => {
            let (message, stack) = describe_exception(ctx, ctx.catch());
            Err(Error::script_evaluation(message, stack))
        }
        Err(err) => Err(Error::internal(format!("JSON.stringify: {err:?}"))),
    }
}

fn throw_message(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    match message.into_js(ctx) {
        Ok(value) => ctx.throw(value),
        Err(err) => err,
    }
}

/// Message (`Name: message` for Error objects) and stack of a caught value.
fn describe_exception<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> (String, Option<String>) {
    if let Some(obj) = caught.as_object() {
        if let Some(exception) = Exception::from_object(obj.clone()) {
            let name: Option<String> = obj.get("name").ok();
            let message = match (name, exception.message()) {
                (Some(name), Some(message)) if !name.is_empty() => format!("{name}: {message}"),
                (_, Some(message)) => message,
                (Some(name), None) => name,
                (None, None) => "uncaught exception".to_string(),
            };
            return (message, exception.stack().filter(|stack| !stack.is_empty()));
        }
    }

    match Coerced::<String>::from_js(ctx, caught) {
        Ok(value) => (value.0, None),
        Err(err) => (format!("(failed to stringify QuickJS exception: {err})"), None),
    }
}

struct WorkingDirResolver {
    root: PathBuf,
    defined: DefinedFiles,
}

impl JsModuleResolver for WorkingDirResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let spec = name.trim();
        if self.defined.borrow().contains_key(spec) {
            return Ok(spec.to_string());
        }
        let path = Path::new(spec);
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base_path = Path::new(base);
            let base_dir = if base_path.is_absolute() {
                base_path.parent().unwrap_or(&self.root)
            } else {
                &self.root
            };
            base_dir.join(path)
        };
        if candidate.is_file() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
        Err(rquickjs::Error::new_resolving_message(
            base,
            name,
            format!("no such module under {}", self.root.display()),
        ))
    }
}

struct WorkingDirLoader {
    defined: DefinedFiles,
}

impl JsModuleLoader for WorkingDirLoader {
    fn load<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        name: &str,
    ) -> rquickjs::Result<Module<'js, JsModuleDeclared>> {
        let defined = self.defined.borrow().get(name).cloned();
        let source = match defined {
            Some(source) => source,
            None => std::fs::read_to_string(name)
                .map_err(|err| rquickjs::Error::new_loading_message(name, format!("read: {err}")))?,
        };
        Module::declare(ctx.clone(), name, source)
    }
}
