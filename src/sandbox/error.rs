//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use super::SandboxState;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The compute backend (Docker daemon, micro-VM service) is not reachable.
    #[error("Sandbox backend is not available: {message}")]
    BackendUnavailable {
        /// Backend-reported reason.
        message: String,
    },

    /// No image exists for the requested repository.
    #[error("No image available for repository: {repo_url}")]
    ImageNotFound {
        /// Repository with no built image.
        repo_url: String,
    },

    /// The requested snapshot does not exist.
    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound {
        /// The missing snapshot id.
        snapshot_id: String,
    },

    /// A command run inside the sandbox exited with a nonzero status.
    #[error("Command failed with exit code {exit_code}: {command}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// Its exit code.
        exit_code: i64,
    },

    /// A state transition not present in the transition table.
    #[error("Illegal sandbox state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the sandbox was in.
        from: SandboxState,
        /// State the caller tried to move to.
        to: SandboxState,
    },

    /// An operation was attempted on a sandbox in the wrong state.
    #[error("Operation requires state {required}, sandbox is {actual:?}")]
    WrongState {
        /// Human-readable required state(s).
        required: &'static str,
        /// State the sandbox was actually in.
        actual: SandboxState,
    },

    /// A backend operation failed (create, exec, snapshot, terminate, ...).
    #[error("Backend operation failed: {message}")]
    BackendFailed {
        /// Backend-reported reason.
        message: String,
    },
}

impl SandboxError {
    /// Creates a `BackendUnavailable` error.
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(repo_url: impl Into<String>) -> Self {
        Self::ImageNotFound {
            repo_url: repo_url.into(),
        }
    }

    /// Creates a `SnapshotNotFound` error.
    pub fn snapshot_not_found(snapshot_id: impl Into<String>) -> Self {
        Self::SnapshotNotFound {
            snapshot_id: snapshot_id.into(),
        }
    }

    /// Creates a `CommandFailed` error.
    pub fn command_failed(command: impl Into<String>, exit_code: i64) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
        }
    }

    /// Creates a `BackendFailed` error.
    pub fn backend_failed(message: impl Into<String>) -> Self {
        Self::BackendFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is an illegal-transition or wrong-state error.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalTransition { .. } | Self::WrongState { .. }
        )
    }

    /// Returns true if this is a backend availability error.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_error() {
        let err = SandboxError::backend_unavailable("daemon not running");
        assert!(err.is_backend_unavailable());
        assert!(!err.is_state_error());
        assert_eq!(
            err.to_string(),
            "Sandbox backend is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = SandboxError::image_not_found("myorg/frontend");
        assert_eq!(
            err.to_string(),
            "No image available for repository: myorg/frontend"
        );
    }

    #[test]
    fn test_command_failed_error() {
        let err = SandboxError::command_failed("git fetch origin main", 128);
        assert_eq!(
            err.to_string(),
            "Command failed with exit code 128: git fetch origin main"
        );
    }

    #[test]
    fn test_illegal_transition_is_state_error() {
        let err = SandboxError::IllegalTransition {
            from: SandboxState::Terminated,
            to: SandboxState::Ready,
        };
        assert!(err.is_state_error());
        assert!(!err.is_backend_unavailable());
    }

    #[test]
    fn test_snapshot_not_found_error() {
        let err = SandboxError::snapshot_not_found("snap-42");
        assert_eq!(err.to_string(), "Snapshot not found: snap-42");
    }
}
