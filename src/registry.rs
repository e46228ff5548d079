//! Handle-based boundary for hosts that cannot hold Rust values.
//!
//! A host (an FFI layer, a CLI, a test) refers to sessions by an opaque
//! [`SessionHandle`]. Script-initiated calls are delivered through a single
//! [`HostDelivery`] together with the handle of the session they came from.

use crate::completion::{Completion, completion};
use crate::config::BridgeConfig;
use crate::engine::EngineFactory;
use crate::error::{Error, Result};
use crate::quickjs::QuickJsFactory;
use crate::session::{EngineSession, LifecycleState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(u64);

impl SessionHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Receives every script-to-host call, on the dispatcher thread of the
/// originating session.
pub trait HostDelivery: Send + Sync {
    fn call_from_script(&self, handle: SessionHandle, function_name: &str, args_json: &str);
}

impl<F> HostDelivery for F
where
    F: Fn(SessionHandle, &str, &str) + Send + Sync,
{
    fn call_from_script(&self, handle: SessionHandle, function_name: &str, args_json: &str) {
        self(handle, function_name, args_json);
    }
}

pub struct SessionRegistry {
    config: BridgeConfig,
    factory: Arc<dyn EngineFactory>,
    delivery: Arc<dyn HostDelivery>,
    sessions: Mutex<HashMap<SessionHandle, Arc<EngineSession>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new<D>(config: BridgeConfig, delivery: D) -> Self
    where
        D: HostDelivery + 'static,
    {
        Self::with_factory(config, Arc::new(QuickJsFactory), delivery)
    }

    pub fn with_factory<D>(config: BridgeConfig, factory: Arc<dyn EngineFactory>, delivery: D) -> Self
    where
        D: HostDelivery + 'static,
    {
        Self {
            config,
            factory,
            delivery: Arc::new(delivery),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create a session in `Initialized` and return its handle.
    pub fn init(&self) -> Result<SessionHandle> {
        let session = EngineSession::with_factory(&self.config, Arc::clone(&self.factory))?;
        let handle = SessionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(session));
        tracing::debug!(%handle, "session created");
        Ok(handle)
    }

    pub fn session(&self, handle: SessionHandle) -> Result<Arc<EngineSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::invalid_state("engine not initialized"))
    }

    /// `Uninitialized` for handles that were never issued or were released.
    #[must_use]
    pub fn state(&self, handle: SessionHandle) -> LifecycleState {
        self.session(handle)
            .map_or(LifecycleState::Uninitialized, |session| session.state())
    }

    #[must_use]
    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        handles.sort_unstable();
        handles
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn define_script_file(
        &self,
        handle: SessionHandle,
        name: &str,
        source: &str,
    ) -> Result<Completion<()>> {
        self.session(handle)?.define_script_file(name, source)
    }

    pub fn start(&self, handle: SessionHandle, working_directory: &Path) -> Result<Completion<()>> {
        self.session(handle)?.start(working_directory)
    }

    /// Stopping an unknown handle is the `Uninitialized` case: a no-op.
    pub fn stop(&self, handle: SessionHandle) -> Result<Completion<()>> {
        match self.session(handle) {
            Ok(session) => session.stop(),
            Err(_) => Ok(Completion::ok(())),
        }
    }

    pub fn call_script(&self, handle: SessionHandle, code: &str) -> Result<Completion<String>> {
        self.session(handle)?.call_script(code)
    }

    /// Deliver script calls to `name` through the registry's [`HostDelivery`].
    pub fn register_call_from_script(
        &self,
        handle: SessionHandle,
        name: &str,
    ) -> Result<Completion<()>> {
        let session = self.session(handle)?;
        let delivery = Arc::clone(&self.delivery);
        session.register_call_from_script(name, move |function_name, args_json| {
            delivery.call_from_script(handle, function_name, args_json);
        })
    }

    /// Stop the session if needed and forget the handle. Returns without
    /// waiting for queued work; the completion resolves once teardown
    /// finished.
    pub fn release(&self, handle: SessionHandle) -> Result<Completion<()>> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or_else(|| Error::invalid_state("engine not initialized"))?;
        tracing::debug!(%handle, state = %session.state(), "releasing session");
        Ok(retire(handle, session))
    }
}

/// Request stop and move the session into its own stop completion. The last
/// reference is then dropped on the dispatcher thread, where dispatcher
/// shutdown only signals instead of joining the worker.
fn retire(handle: SessionHandle, session: Arc<EngineSession>) -> Completion<()> {
    let (sink, done) = completion();
    let owned = Arc::clone(&session);
    session.stop_with(move |result| {
        tracing::debug!(%handle, ok = result.is_ok(), "session released");
        sink.complete(result);
        drop(owned);
    });
    // Still the last reference only if teardown already ran, in which case
    // the worker has nothing left to wait for.
    drop(session);
    done
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let sessions = std::mem::take(
            self.sessions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (handle, session) in sessions {
            drop(retire(handle, session));
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("handles", &self.handles())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn handles_are_distinct_and_released_once() {
        let registry = SessionRegistry::new(BridgeConfig::default(), |_: SessionHandle, _: &str, _: &str| {});
        let a = registry.init().unwrap();
        let b = registry.init().unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.handles(), vec![a, b]);

        registry.release(a).unwrap().wait().unwrap();
        assert_eq!(registry.state(a), LifecycleState::Uninitialized);
        assert_eq!(
            registry.release(a).unwrap_err().kind(),
            ErrorKind::InvalidStateError
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn release_returns_while_engine_work_is_still_running() {
        let registry = SessionRegistry::new(BridgeConfig::default(), |_: SessionHandle, _: &str, _: &str| {});
        let handle = registry.init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        registry.start(handle, dir.path()).unwrap().wait().unwrap();
        let busy = registry
            .call_script(handle, "const t = Date.now(); while (Date.now() - t < 1000) {} 1")
            .unwrap();

        let began = Instant::now();
        let released = registry.release(handle).unwrap();
        let elapsed = began.elapsed();
        assert!(elapsed < Duration::from_millis(500), "release blocked for {elapsed:?}");
        assert_eq!(registry.state(handle), LifecycleState::Uninitialized);

        assert_eq!(busy.wait().unwrap(), "1");
        released.wait().unwrap();
    }

    #[test]
    fn unknown_handle_reports_not_initialized() {
        let registry = SessionRegistry::new(BridgeConfig::default(), |_: SessionHandle, _: &str, _: &str| {});
        let ghost = SessionHandle::from_raw(99);
        let err = registry.call_script(ghost, "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateError);
        assert_eq!(err.to_string(), "engine not initialized");
        registry.stop(ghost).unwrap().wait().unwrap();
    }

    #[test]
    fn delivery_carries_the_originating_handle() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let registry = SessionRegistry::new(
            BridgeConfig::default(),
            move |handle: SessionHandle, name: &str, args: &str| {
                let _ = tx
                    .lock()
                    .unwrap()
                    .send((handle, name.to_string(), args.to_string()));
            },
        );
        let handle = registry.init().unwrap();
        registry.register_call_from_script(handle, "notify").unwrap().wait().unwrap();
        let dir = tempfile::tempdir().unwrap();
        registry.start(handle, dir.path()).unwrap().wait().unwrap();
        registry
            .call_script(handle, "notify({ok: true})")
            .unwrap()
            .wait()
            .unwrap();

        let (from, name, args) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(from, handle);
        assert_eq!(name, "notify");
        assert_eq!(args, r#"{"ok":true}"#);
        registry.release(handle).unwrap().wait().unwrap();
    }
}
