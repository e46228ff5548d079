//! Common test infrastructure for `jsbridge` integration tests.
//!
//! - `harness`: temp working directories and a step log dumped on failure
//! - `mock`: a scripted, journaling [`ScriptEngine`](jsbridge::ScriptEngine)

use std::time::Duration;

pub mod harness;
pub mod mock;

#[allow(unused_imports)]
pub use harness::TestHarness;
#[allow(unused_imports)]
pub use mock::{EngineEvent, MockFactory};

/// Upper bound for any single completion in these tests.
#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(10);

/// Wait for a completion, failing the test instead of hanging it.
#[allow(dead_code)]
pub fn settle<T>(completion: jsbridge::Completion<T>) -> jsbridge::CompletionResult<T> {
    match completion.wait_timeout(WAIT) {
        Ok(result) => result,
        Err(_) => panic!("completion did not settle within {WAIT:?}"),
    }
}
