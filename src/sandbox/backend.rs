//! Capability trait implemented by concrete sandbox backends.
//!
//! The orchestration layer (pools, manager, sessions) is written
//! entirely against this surface, so any provisioning technology
//! (container engine, micro-VM service) can slot in underneath.

use async_trait::async_trait;

use super::{ExecOutput, SandboxConfig, SandboxError};

/// The full capability set a compute backend must expose.
///
/// `sandbox_id` values are backend-scoped handles returned by
/// [`create_from_image`](SandboxBackend::create_from_image) or
/// [`restore`](SandboxBackend::restore); they are opaque to callers.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Provisions a new sandbox from a stored image and starts it.
    async fn create_from_image(
        &self,
        image_id: &str,
        config: &SandboxConfig,
    ) -> Result<String, SandboxError>;

    /// Runs a shell command inside the sandbox and waits for it to finish.
    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError>;

    /// Reads a file from the sandbox filesystem.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError>;

    /// Writes a file into the sandbox filesystem, creating parents as needed.
    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    /// Captures an immutable snapshot of the sandbox filesystem.
    ///
    /// Returns a snapshot id usable with [`restore`](SandboxBackend::restore).
    async fn snapshot(&self, sandbox_id: &str) -> Result<String, SandboxError>;

    /// Provisions a new sandbox seeded from a previous snapshot.
    async fn restore(
        &self,
        snapshot_id: &str,
        config: &SandboxConfig,
    ) -> Result<String, SandboxError>;

    /// Tears down the sandbox and releases its resources.
    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}
