//! Journaling mock engine.
//!
//! `call_script` understands a tiny command language instead of JavaScript:
//!
//! | code                 | effect                                        |
//! |----------------------|-----------------------------------------------|
//! | `panic`              | panics inside the engine                      |
//! | `throw:<msg>`        | fails with `ScriptEvaluationError`            |
//! | `sleep:<ms>`         | blocks the dispatcher, returns `null`         |
//! | `call:<name>:<json>` | routes a script call to the host              |
//! | `files`              | JSON array of defined file names, in order    |
//! | anything else        | echoed back as a JSON string                  |

#![allow(dead_code)]

use jsbridge::{
    EngineCapabilities, EngineFactory, Error, Result, ScriptCallRouter, ScriptEngine, ScriptFile,
};
use std::collections::{BTreeSet, HashSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Created,
    Started(PathBuf),
    Defined(String),
    Bound(String),
    Called(String),
    Stopped,
    Dropped,
}

#[derive(Debug, Default, Clone)]
struct Faults {
    start: bool,
    stop: bool,
    files: Vec<String>,
}

type Journal = Arc<Mutex<Vec<(ThreadId, EngineEvent)>>>;

#[derive(Clone)]
pub struct MockFactory {
    capabilities: EngineCapabilities,
    faults: Faults,
    journal: Journal,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            capabilities: EngineCapabilities {
                live_loading: true,
                native_bindings: true,
            },
            faults: Faults::default(),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.faults.start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.faults.stop = true;
        self
    }

    pub fn failing_file(mut self, name: &str) -> Self {
        self.faults.files.push(name.to_string());
        self
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Every thread that ever touched an engine built by this factory.
    pub fn threads(&self) -> HashSet<ThreadId> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .map(|(thread, _)| *thread)
            .collect()
    }

    pub fn count(&self, wanted: &EngineEvent) -> usize {
        self.events().iter().filter(|event| *event == wanted).count()
    }
}

impl EngineFactory for MockFactory {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    fn create(&self) -> Box<dyn ScriptEngine> {
        let engine = MockEngine {
            capabilities: self.capabilities,
            faults: self.faults.clone(),
            journal: Arc::clone(&self.journal),
            router: None,
            files: Vec::new(),
            bound: BTreeSet::new(),
            _not_send: PhantomData,
        };
        engine.record(EngineEvent::Created);
        Box::new(engine)
    }
}

struct MockEngine {
    capabilities: EngineCapabilities,
    faults: Faults,
    journal: Journal,
    router: Option<ScriptCallRouter>,
    files: Vec<String>,
    bound: BTreeSet<String>,
    _not_send: PhantomData<Rc<()>>,
}

impl MockEngine {
    fn record(&self, event: EngineEvent) {
        self.journal
            .lock()
            .unwrap()
            .push((thread::current().id(), event));
    }

    fn router(&self) -> Result<&ScriptCallRouter> {
        self.router
            .as_ref()
            .ok_or_else(|| Error::invalid_state("mock engine is not started"))
    }
}

impl ScriptEngine for MockEngine {
    fn start(&mut self, working_directory: &Path, router: ScriptCallRouter) -> Result<()> {
        if self.router.is_some() {
            return Err(Error::invalid_state("mock engine already started"));
        }
        self.record(EngineEvent::Started(working_directory.to_path_buf()));
        if self.faults.start {
            return Err(Error::engine_init("mock engine refused to start"));
        }
        self.router = Some(router);
        Ok(())
    }

    fn define_script_file(&mut self, file: &ScriptFile) -> Result<()> {
        self.router()?;
        self.record(EngineEvent::Defined(file.name.clone()));
        if self.faults.files.contains(&file.name) {
            return Err(Error::script_load(&file.name, "SyntaxError: unexpected token"));
        }
        self.files.push(file.name.clone());
        Ok(())
    }

    fn call_script(&mut self, code: &str) -> Result<String> {
        let router = Arc::clone(self.router()?);
        self.record(EngineEvent::Called(code.to_string()));

        if code == "panic" {
            panic!("mock engine panic");
        }
        if code == "files" {
            return Ok(serde_json::to_string(&self.files).unwrap());
        }
        if let Some(message) = code.strip_prefix("throw:") {
            return Err(Error::script_evaluation(
                format!("Error: {message}"),
                Some("    at <eval> (mock:1)".to_string()),
            ));
        }
        if let Some(ms) = code.strip_prefix("sleep:") {
            thread::sleep(Duration::from_millis(ms.parse().unwrap()));
            return Ok("null".to_string());
        }
        if let Some(rest) = code.strip_prefix("call:") {
            let (name, args) = rest.split_once(':').unwrap_or((rest, "null"));
            if self.capabilities.native_bindings && !self.bound.contains(name) {
                return Err(Error::script_evaluation(
                    format!("ReferenceError: {name} is not defined"),
                    None,
                ));
            }
            router(name, args).map_err(|err| Error::script_evaluation(err.to_string(), None))?;
            return Ok("null".to_string());
        }
        Ok(serde_json::to_string(code).unwrap())
    }

    fn register_call_from_script(&mut self, name: &str) -> Result<()> {
        self.router()?;
        self.record(EngineEvent::Bound(name.to_string()));
        self.bound.insert(name.to_string());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.record(EngineEvent::Stopped);
        self.router = None;
        self.bound.clear();
        if self.faults.stop {
            return Err(Error::internal("mock engine teardown failed"));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.router.is_some()
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.record(EngineEvent::Dropped);
    }
}
