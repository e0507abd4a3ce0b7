//! Sandbox execution units and the backends that provision them.
//!
//! A [`Sandbox`] is a cheap-to-clone handle over one isolated execution
//! environment. Its lifecycle is an explicit state machine; operations
//! that would violate the transition table are rejected with typed
//! errors instead of silently corrupting state.

mod backend;
mod docker;
mod error;
mod fake;

pub use backend::SandboxBackend;
pub use docker::DockerBackend;
pub use error::SandboxError;
pub use fake::FakeBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Lifecycle states of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Backend is provisioning the sandbox.
    Creating,
    /// Checkout is being brought up to the base branch HEAD.
    Syncing,
    /// Idle and available for operations.
    Ready,
    /// One or more commands or file operations are in flight.
    Executing,
    /// A filesystem snapshot is being captured.
    Snapshotting,
    /// Terminal state; the sandbox's resources are released.
    Terminated,
}

/// Returns whether `from -> to` is a legal lifecycle transition.
fn transition_allowed(from: SandboxState, to: SandboxState) -> bool {
    use SandboxState::{Creating, Executing, Ready, Snapshotting, Syncing, Terminated};
    if to == Terminated {
        // Any non-terminal state may be terminated.
        return from != Terminated;
    }
    matches!(
        (from, to),
        (Creating, Syncing)
            | (Syncing, Ready)
            | (Ready, Executing)
            | (Executing, Ready)
            | (Ready, Snapshotting)
            | (Snapshotting, Ready)
    )
}

/// Resource and lifetime configuration for one sandbox.
///
/// Immutable once a sandbox has been created from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Repository this sandbox serves (e.g. "myorg/frontend").
    pub repo_url: String,
    /// Image the sandbox was provisioned from.
    pub base_image: String,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU core allocation.
    pub cpu_cores: u32,
    /// Disk allocation in gigabytes.
    pub disk_gb: u32,
    /// Lifetime cap enforced by the manager's reaper.
    pub timeout_hours: u32,
}

/// User identity for commit attribution.
///
/// The token is used only to authenticate clones; it is never written
/// into the sandbox's git configuration or remotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user id, used as the session id prefix.
    pub id: String,
    /// Display name for `git config user.name`.
    pub name: String,
    /// Email for `git config user.email`.
    pub email: String,
    /// Short-lived GitHub token for clone/auth.
    pub github_token: String,
}

/// Output of a command executed inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Returns true if the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// State cell guarded by a single mutex: lifecycle state plus the
/// number of in-flight command/file operations.
struct StateCell {
    state: SandboxState,
    in_flight: u32,
}

struct SandboxInner {
    id: String,
    config: SandboxConfig,
    created_at: DateTime<Utc>,
    backend: Arc<dyn SandboxBackend>,
    backend_id: Mutex<String>,
    cell: Mutex<StateCell>,
    snapshot_id: Mutex<Option<String>>,
    current_user: Mutex<Option<UserIdentity>>,
}

/// Handle to a sandboxed execution environment.
///
/// Clones share the same underlying sandbox; ownership in the
/// pool-or-claimer sense is tracked by [`crate::pool::WarmPoolManager`]
/// and the session registry, not by the handle itself.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.inner.id)
            .field("repo_url", &self.inner.config.repo_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Provisions a new sandbox from an image.
    ///
    /// The returned sandbox is in `Syncing`: the caller is responsible
    /// for bringing the checkout current and then calling
    /// [`mark_ready`](Sandbox::mark_ready).
    pub async fn create(
        backend: Arc<dyn SandboxBackend>,
        image_id: &str,
        config: SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let backend_id = backend.create_from_image(image_id, &config).await?;
        let sandbox = Self::with_backend_id(backend, backend_id, config, SandboxState::Creating);
        sandbox.transition(SandboxState::Syncing)?;
        debug!(sandbox_id = %sandbox.id(), "Sandbox provisioned, syncing");
        Ok(sandbox)
    }

    /// Provisions a sandbox seeded from a snapshot.
    ///
    /// Snapshots capture an already-synced checkout, so the sandbox is
    /// returned in `Ready`.
    pub async fn from_snapshot(
        backend: Arc<dyn SandboxBackend>,
        snapshot_id: &str,
        config: SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let backend_id = backend.restore(snapshot_id, &config).await?;
        let sandbox = Self::with_backend_id(backend, backend_id, config, SandboxState::Creating);
        sandbox.transition(SandboxState::Syncing)?;
        sandbox.transition(SandboxState::Ready)?;
        debug!(sandbox_id = %sandbox.id(), snapshot_id, "Sandbox restored from snapshot");
        Ok(sandbox)
    }

    fn with_backend_id(
        backend: Arc<dyn SandboxBackend>,
        backend_id: String,
        config: SandboxConfig,
        state: SandboxState,
    ) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                id: format!("sbx-{}", uuid::Uuid::new_v4()),
                config,
                created_at: Utc::now(),
                backend,
                backend_id: Mutex::new(backend_id),
                cell: Mutex::new(StateCell {
                    state,
                    in_flight: 0,
                }),
                snapshot_id: Mutex::new(None),
                current_user: Mutex::new(None),
            }),
        }
    }

    /// Stable sandbox id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The immutable configuration this sandbox was created from.
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.inner.cell.lock().expect("state lock poisoned").state
    }

    /// The most recent snapshot id, if any.
    pub fn snapshot_id(&self) -> Option<String> {
        self.inner
            .snapshot_id
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// The user this sandbox is currently configured for.
    pub fn current_user(&self) -> Option<UserIdentity> {
        self.inner
            .current_user
            .lock()
            .expect("user lock poisoned")
            .clone()
    }

    pub(crate) fn set_current_user(&self, user: UserIdentity) {
        *self
            .inner
            .current_user
            .lock()
            .expect("user lock poisoned") = Some(user);
    }

    fn backend_id(&self) -> String {
        self.inner
            .backend_id
            .lock()
            .expect("backend id lock poisoned")
            .clone()
    }

    /// Applies `to` if the transition table allows it.
    fn transition(&self, to: SandboxState) -> Result<(), SandboxError> {
        let mut cell = self.inner.cell.lock().expect("state lock poisoned");
        if !transition_allowed(cell.state, to) {
            return Err(SandboxError::IllegalTransition {
                from: cell.state,
                to,
            });
        }
        cell.state = to;
        Ok(())
    }

    /// Marks the checkout sync finished, moving `Syncing -> Ready`.
    pub(crate) fn mark_ready(&self) -> Result<(), SandboxError> {
        self.transition(SandboxState::Ready)
    }

    /// Brings the checkout to the head of `base_branch` and marks the
    /// sandbox `Ready`. Only legal while `Syncing`.
    pub async fn sync_checkout(&self, base_branch: &str) -> Result<(), SandboxError> {
        let state = self.state();
        if state != SandboxState::Syncing {
            return Err(SandboxError::WrongState {
                required: "SYNCING",
                actual: state,
            });
        }
        let backend_id = self.backend_id();
        for command in [
            format!("git -C /workspace fetch origin {base_branch}"),
            format!("git -C /workspace reset --hard origin/{base_branch}"),
        ] {
            let output = self
                .inner
                .backend
                .execute_command(&backend_id, &command)
                .await?;
            if !output.success() {
                return Err(SandboxError::command_failed(&command, output.exit_code));
            }
        }
        self.mark_ready()
    }

    /// Enters an operation: `Ready -> Executing`, or joins an existing
    /// `Executing` window.
    fn begin_op(&self) -> Result<(), SandboxError> {
        let mut cell = self.inner.cell.lock().expect("state lock poisoned");
        match cell.state {
            SandboxState::Ready => {
                cell.state = SandboxState::Executing;
                cell.in_flight = 1;
                Ok(())
            }
            SandboxState::Executing => {
                cell.in_flight += 1;
                Ok(())
            }
            other => Err(SandboxError::WrongState {
                required: "READY or EXECUTING",
                actual: other,
            }),
        }
    }

    /// Leaves an operation; the last one out restores `Ready`.
    fn end_op(&self) {
        let mut cell = self.inner.cell.lock().expect("state lock poisoned");
        cell.in_flight = cell.in_flight.saturating_sub(1);
        if cell.in_flight == 0 && cell.state == SandboxState::Executing {
            cell.state = SandboxState::Ready;
        }
    }

    /// Executes a shell command inside the sandbox.
    ///
    /// Requires `Ready` or `Executing`. Returns the raw output; callers
    /// that need a success guarantee should use [`run`](Sandbox::run).
    pub async fn execute_command(&self, command: &str) -> Result<ExecOutput, SandboxError> {
        self.begin_op()?;
        let result = self
            .inner
            .backend
            .execute_command(&self.backend_id(), command)
            .await;
        self.end_op();
        result
    }

    /// Executes a command and converts a nonzero exit into `CommandFailed`.
    pub async fn run(&self, command: &str) -> Result<ExecOutput, SandboxError> {
        let output = self.execute_command(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SandboxError::command_failed(command, output.exit_code))
        }
    }

    /// Reads a file from the sandbox filesystem.
    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.begin_op()?;
        let result = self.inner.backend.read_file(&self.backend_id(), path).await;
        self.end_op();
        result
    }

    /// Writes a file into the sandbox filesystem.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.begin_op()?;
        let result = self
            .inner
            .backend
            .write_file(&self.backend_id(), path, content)
            .await;
        self.end_op();
        result
    }

    /// Captures an immutable snapshot of the filesystem state.
    ///
    /// Requires `Ready` (not mid-operation). The snapshot id is
    /// recorded on the sandbox and returned.
    pub async fn snapshot(&self) -> Result<String, SandboxError> {
        self.transition(SandboxState::Snapshotting).map_err(|_| {
            SandboxError::WrongState {
                required: "READY",
                actual: self.state(),
            }
        })?;
        let result = self.inner.backend.snapshot(&self.backend_id()).await;
        // Snapshotting is a transient state either way.
        let back = self.transition(SandboxState::Ready);
        debug_assert!(back.is_ok());
        let snapshot_id = result?;
        *self
            .inner
            .snapshot_id
            .lock()
            .expect("snapshot lock poisoned") = Some(snapshot_id.clone());
        Ok(snapshot_id)
    }

    /// Replaces the filesystem state with a previous snapshot.
    ///
    /// The backend provisions a fresh unit from the snapshot; the old
    /// one is released.
    pub async fn restore(&self, snapshot_id: &str) -> Result<(), SandboxError> {
        let state = self.state();
        if state != SandboxState::Ready {
            return Err(SandboxError::WrongState {
                required: "READY",
                actual: state,
            });
        }
        let new_backend_id = self
            .inner
            .backend
            .restore(snapshot_id, &self.inner.config)
            .await?;
        let old = {
            let mut guard = self
                .inner
                .backend_id
                .lock()
                .expect("backend id lock poisoned");
            std::mem::replace(&mut *guard, new_backend_id)
        };
        if let Err(e) = self.inner.backend.terminate(&old).await {
            warn!(sandbox_id = %self.id(), "Failed to release replaced backend unit: {e}");
        }
        Ok(())
    }

    /// Terminates the sandbox. Idempotent: a second call is a no-op.
    pub async fn terminate(&self) -> Result<(), SandboxError> {
        {
            let mut cell = self.inner.cell.lock().expect("state lock poisoned");
            if cell.state == SandboxState::Terminated {
                return Ok(());
            }
            cell.state = SandboxState::Terminated;
        }
        if let Err(e) = self.inner.backend.terminate(&self.backend_id()).await {
            warn!(sandbox_id = %self.id(), "Backend terminate failed: {e}");
        }
        debug!(sandbox_id = %self.id(), "Sandbox terminated");
        Ok(())
    }
}
