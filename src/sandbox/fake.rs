//! In-memory backend for tests and non-Docker execution.
//!
//! Useful for:
//! - Unit and integration tests that need a `SandboxBackend`
//! - Exercising pool and session logic without a container runtime
//!
//! Commands are recorded rather than executed; failures can be
//! scripted per command substring.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{ExecOutput, SandboxBackend, SandboxConfig, SandboxError};

#[derive(Default, Clone)]
struct FakeUnit {
    files: HashMap<String, String>,
    /// Ordered log of commands and file writes, for ordering assertions.
    ops: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    units: HashMap<String, FakeUnit>,
    snapshots: HashMap<String, HashMap<String, String>>,
    terminated: Vec<String>,
    fail_command_patterns: Vec<String>,
    fail_next_creates: u32,
}

/// A `SandboxBackend` that keeps everything in process memory.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    counter: AtomicU64,
    creates: AtomicU64,
}

impl FakeBackend {
    /// Creates an empty fake backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }

    /// Scripts every command containing `pattern` to exit nonzero.
    pub fn fail_commands_containing(&self, pattern: &str) {
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .fail_command_patterns
            .push(pattern.to_string());
    }

    /// Scripts the next `n` `create_from_image`/`restore` calls to fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .fail_next_creates = n;
    }

    /// Number of units that have been terminated.
    pub fn terminated_count(&self) -> usize {
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .terminated
            .len()
    }

    /// Ids of terminated units, in termination order.
    pub fn terminated_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .terminated
            .clone()
    }

    /// Number of units ever created (including restores).
    pub fn created_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Ordered command-and-write log for one unit.
    pub fn ops_for(&self, sandbox_id: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .units
            .get(sandbox_id)
            .map(|u| u.ops.clone())
            .unwrap_or_default()
    }

    fn with_unit<T>(
        &self,
        sandbox_id: &str,
        f: impl FnOnce(&mut FakeUnit) -> T,
    ) -> Result<T, SandboxError> {
        let mut state = self.state.lock().expect("fake state lock poisoned");
        state
            .units
            .get_mut(sandbox_id)
            .map(f)
            .ok_or_else(|| SandboxError::backend_failed(format!("unknown unit: {sandbox_id}")))
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn create_from_image(
        &self,
        image_id: &str,
        _config: &SandboxConfig,
    ) -> Result<String, SandboxError> {
        // Provisioning suspends at least once, as any real backend does.
        tokio::task::yield_now().await;
        let id = self.next_id("fake");
        let mut state = self.state.lock().expect("fake state lock poisoned");
        if state.fail_next_creates > 0 {
            state.fail_next_creates -= 1;
            return Err(SandboxError::backend_failed(format!(
                "scripted create failure for image {image_id}"
            )));
        }
        state.units.insert(id.clone(), FakeUnit::default());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let failing = {
            let state = self.state.lock().expect("fake state lock poisoned");
            state
                .fail_command_patterns
                .iter()
                .any(|p| command.contains(p))
        };
        let sha = "d0c0".repeat(10);
        self.with_unit(sandbox_id, |unit| {
            unit.ops.push(format!("exec:{command}"));
            if failing {
                ExecOutput {
                    stdout: String::new(),
                    stderr: format!("scripted failure: {command}"),
                    exit_code: 1,
                }
            } else if command.contains("rev-parse HEAD") {
                ExecOutput {
                    stdout: format!("{sha}\n"),
                    stderr: String::new(),
                    exit_code: 0,
                }
            } else {
                ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                }
            }
        })
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        self.with_unit(sandbox_id, |unit| unit.files.get(path).cloned())?
            .ok_or_else(|| SandboxError::backend_failed(format!("no such file: {path}")))
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        self.with_unit(sandbox_id, |unit| {
            unit.ops.push(format!("write:{path}"));
            unit.files.insert(path.to_string(), content.to_string());
        })
    }

    async fn snapshot(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let files = self.with_unit(sandbox_id, |unit| unit.files.clone())?;
        let snapshot_id = self.next_id("snap");
        self.state
            .lock()
            .expect("fake state lock poisoned")
            .snapshots
            .insert(snapshot_id.clone(), files);
        Ok(snapshot_id)
    }

    async fn restore(
        &self,
        snapshot_id: &str,
        _config: &SandboxConfig,
    ) -> Result<String, SandboxError> {
        tokio::task::yield_now().await;
        let id = self.next_id("fake");
        let mut state = self.state.lock().expect("fake state lock poisoned");
        if state.fail_next_creates > 0 {
            state.fail_next_creates -= 1;
            return Err(SandboxError::backend_failed(
                "scripted restore failure".to_string(),
            ));
        }
        let files = state
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| SandboxError::snapshot_not_found(snapshot_id))?;
        state.units.insert(
            id.clone(),
            FakeUnit {
                files,
                ops: Vec::new(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().expect("fake state lock poisoned");
        state.units.remove(sandbox_id);
        state.terminated.push(sandbox_id.to_string());
        Ok(())
    }
}
