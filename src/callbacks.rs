//! Script-callable name to host handler map.
//!
//! Written from host threads (registration) and read on the dispatcher
//! thread (dispatch), so it sits behind a mutex. Handlers are cloned out of
//! the lock before they run, which lets a handler register or replace
//! handlers itself.

use crate::error::{Error, Failure, Result};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

/// Host handler: receives `(function_name, args_json)` on the dispatcher
/// thread. Must not block for long; every other queued engine operation
/// waits behind it.
pub type CallFromScriptHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    handlers: Mutex<BTreeMap<String, CallFromScriptHandler>>,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `name`, returning the handler it replaced.
    pub fn register(
        &self,
        name: &str,
        handler: CallFromScriptHandler,
    ) -> Result<Option<CallFromScriptHandler>> {
        validate_name(name)?;
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(handlers.insert(name.to_string(), handler))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run the handler for `name`. A panicking handler is reported as an
    /// error instead of unwinding into the engine.
    pub fn dispatch(&self, name: &str, args_json: &str) -> Result<()> {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invalid_state(format!("no host handler registered for '{name}'")))?;
        tracing::trace!(name, "call from script");
        catch_unwind(AssertUnwindSafe(|| handler(name, args_json))).map_err(|payload| {
            let failure = Failure::from_panic(payload.as_ref());
            tracing::error!(name, error = %failure, "host handler panicked");
            Error::internal(format!("host handler for '{name}' panicked: {}", failure.message))
        })
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Names become JS globals, so they must be plain identifiers.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c == '_' || c == '$' || c.is_ascii_alphabetic());
    if valid_start && chars.all(|c| c == '_' || c == '$' || c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(Error::invalid_state(format!(
            "'{name}' is not a valid script function name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> CallFromScriptHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn reregistration_replaces_handler() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        assert!(registry.register("onEvent", counting(&first)).unwrap().is_none());
        assert!(registry.register("onEvent", counting(&second)).unwrap().is_some());

        registry.dispatch("onEvent", "{}").unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_name_is_an_error() {
        let registry = CallbackRegistry::new();
        let err = registry.dispatch("nope", "null").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateError);
    }

    #[test]
    fn rejects_non_identifiers() {
        let registry = CallbackRegistry::new();
        let noop: CallFromScriptHandler = Arc::new(|_, _| {});
        for bad in ["", "1abc", "a-b", "x y", "a.b"] {
            assert!(registry.register(bad, Arc::clone(&noop)).is_err(), "{bad}");
        }
        for good in ["a", "_private", "$el", "onEvent2"] {
            registry.register(good, Arc::clone(&noop)).unwrap();
        }
        assert_eq!(registry.names(), vec!["$el", "_private", "a", "onEvent2"]);
    }

    #[test]
    fn panicking_handler_becomes_internal_error() {
        let registry = CallbackRegistry::new();
        registry
            .register("explode", Arc::new(|_, _| panic!("handler failed")))
            .unwrap();
        let err = registry.dispatch("explode", "null").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(err.to_string().contains("handler failed"));
    }

    #[test]
    fn handler_may_reenter_registry() {
        let registry = Arc::new(CallbackRegistry::new());
        let inner = Arc::clone(&registry);
        registry
            .register(
                "install",
                Arc::new(move |_, _| {
                    inner.register("installed", Arc::new(|_, _| {})).unwrap();
                }),
            )
            .unwrap();
        registry.dispatch("install", "null").unwrap();
        assert!(registry.contains("installed"));
        registry.clear();
        assert!(registry.is_empty());
    }
}
