//! Async bridge and lifecycle coordinator for an embedded JavaScript engine.
//!
//! The engine is single-threaded and not `Send`. Each [`EngineSession`] owns
//! one dispatcher thread on which the engine is created, used and torn down;
//! hosts talk to it from any thread through non-blocking operations that
//! report back through a [`Completion`] or a callback.
//!
//! ```no_run
//! use jsbridge::{BridgeConfig, EngineSession};
//!
//! let session = EngineSession::new(&BridgeConfig::default())?;
//! session.define_script_file("math.js", "global.square = (n) => n * n;")?;
//! session.start(std::env::current_dir()?)?.wait()?;
//! assert_eq!(session.call_script("square(7)")?.wait()?, "49");
//! session.stop()?.wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]

pub mod callbacks;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod quickjs;
pub mod registry;
pub mod session;

pub use callbacks::{CallFromScriptHandler, CallbackRegistry};
pub use completion::{Completion, CompletionResult, CompletionSink, completion};
pub use config::{BridgeConfig, ShutdownPolicy};
pub use dispatcher::{DispatcherOptions, DispatcherTelemetry, EnqueueResult, WorkDispatcher};
pub use engine::{EngineCapabilities, EngineFactory, ScriptCallRouter, ScriptEngine, ScriptFile};
pub use error::{Error, ErrorKind, Failure, Result};
pub use logging::{LogHandler, LogSeverity};
pub use quickjs::{QuickJsEngine, QuickJsFactory};
pub use registry::{HostDelivery, SessionHandle, SessionRegistry};
pub use session::{EngineSession, LifecycleState};
