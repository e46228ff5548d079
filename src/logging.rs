//! Process-wide log sink.
//!
//! The crate logs through `tracing`. [`SinkLayer`] forwards every event that
//! passes the current severity threshold to a swappable handler, so an
//! embedding host can route diagnostics to its own logger (logcat, a UI
//! console, a test buffer) without knowing anything about `tracing`.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable holding an `EnvFilter` directive for stderr output.
pub const LOG_FILTER_ENV: &str = "JSBRIDGE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Error = 0,
    Warning = 1,
    Info = 2,
    Verbose = 3,
    Trace = 4,
}

impl LogSeverity {
    #[must_use]
    pub const fn from_level(level: Level) -> Self {
        match level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO => Self::Info,
            Level::DEBUG => Self::Verbose,
            Level::TRACE => Self::Trace,
        }
    }

    #[must_use]
    pub const fn as_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warning => Level::WARN,
            Self::Info => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warning" | "warn" => Some(Self::Warning),
            "info" => Some(Self::Info),
            "verbose" | "debug" => Some(Self::Verbose),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Error,
            1 => Self::Warning,
            2 => Self::Info,
            3 => Self::Verbose,
            _ => Self::Trace,
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Verbose => "verbose",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

pub type LogHandler = Arc<dyn Fn(LogSeverity, &str) + Send + Sync>;

static THRESHOLD: AtomicU8 = AtomicU8::new(LogSeverity::Info as u8);
static HANDLER: RwLock<Option<LogHandler>> = RwLock::new(None);

/// Trace in debug builds, Info otherwise.
#[must_use]
pub const fn default_log_level() -> LogSeverity {
    if cfg!(debug_assertions) {
        LogSeverity::Trace
    } else {
        LogSeverity::Info
    }
}

pub fn set_log_level(level: LogSeverity) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn log_level() -> LogSeverity {
    LogSeverity::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

#[must_use]
pub fn is_enabled(severity: LogSeverity) -> bool {
    severity <= log_level()
}

/// Replace the process-wide handler. Returns the previous one.
pub fn set_log_handler<F>(handler: F) -> Option<LogHandler>
where
    F: Fn(LogSeverity, &str) + Send + Sync + 'static,
{
    let mut slot = HANDLER.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    slot.replace(Arc::new(handler))
}

pub fn clear_log_handler() -> Option<LogHandler> {
    let mut slot = HANDLER.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    slot.take()
}

fn current_handler() -> Option<LogHandler> {
    HANDLER
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Send a message straight to the sink, bypassing `tracing`.
pub fn emit(severity: LogSeverity, message: &str) {
    if !is_enabled(severity) {
        return;
    }
    if let Some(handler) = current_handler() {
        handler(severity, message);
    }
}

/// Apply the build-dependent default threshold.
pub fn static_init() {
    set_log_level(default_log_level());
}

/// Install the global subscriber: the sink layer plus an optional stderr
/// formatter filtered by [`LOG_FILTER_ENV`]. Returns `false` when a global
/// subscriber was already installed.
pub fn init_tracing(level: LogSeverity, stderr: bool) -> bool {
    set_log_level(level);
    let fmt_layer = stderr.then(|| {
        let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(level.as_level().as_str().to_ascii_lowercase()));
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter)
    });
    tracing_subscriber::registry()
        .with(SinkLayer)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Forwards `tracing` events to the installed handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkLayer;

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let severity = LogSeverity::from_level(*event.metadata().level());
        if !is_enabled(severity) {
            return;
        }
        let Some(handler) = current_handler() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        handler(severity, &visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
