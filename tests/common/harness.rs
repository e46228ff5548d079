//! Per-test harness: a temporary working directory plus a step log.
//!
//! ```ignore
//! let harness = TestHarness::new("start_applies_files");
//! harness.log("setup", "staging files");
//! session.start(harness.dir())?;
//! // on panic the step log is printed to stderr
//! ```

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tempfile::TempDir;

pub struct TestHarness {
    name: String,
    temp_dir: TempDir,
    started: Instant,
    steps: Arc<Mutex<Vec<String>>>,
}

impl TestHarness {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let temp_dir = TempDir::new().expect("create temp directory");
        let harness = Self {
            name,
            temp_dir,
            started: Instant::now(),
            steps: Arc::new(Mutex::new(Vec::new())),
        };
        harness.log(
            "harness",
            format!("temp dir {}", harness.temp_dir.path().display()),
        );
        harness
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn create_file(&self, name: impl AsRef<Path>, content: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent directories");
        }
        std::fs::write(&path, content).expect("write test file");
        self.log("harness", format!("wrote {} ({} bytes)", path.display(), content.len()));
        path
    }

    pub fn log(&self, category: &str, message: impl AsRef<str>) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.steps.lock().unwrap().push(format!(
            "[{elapsed:>8.3}s] [{category}] {}",
            message.as_ref()
        ));
    }

    /// Shareable step log for handlers running on other threads.
    pub fn steps(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.steps)
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if std::thread::panicking() {
            eprintln!("--- steps for '{}' ---", self.name);
            if let Ok(steps) = self.steps.lock() {
                for step in steps.iter() {
                    eprintln!("{step}");
                }
            }
        }
    }
}
