//! Drydock keeps hosted agent execution environments ready to go.
//!
//! It builds per-repository base images on a schedule, maintains pools
//! of pre-warmed sandboxes whose checkouts a background task keeps
//! current, and hands sandboxes to agent sessions through a three-tier
//! acquisition path (warm hit, snapshot restore, cold start). Sessions
//! gate writes behind the in-flight sync so agent edits never race the
//! checkout, and every sandbox ends its life in a snapshot that a later
//! session can resume from.
//!
//! The [`sandbox::SandboxBackend`] trait is the only seam a concrete
//! provisioning technology has to implement; a Docker backend and an
//! in-memory fake ship in this crate.

pub mod auth;
pub mod config;
pub mod image;
pub mod manager;
pub mod pool;
pub mod sandbox;
pub mod session;

pub use config::Config;
pub use image::{ImageBuilder, RepositoryImage};
pub use manager::SandboxManager;
pub use pool::{SyncState, WarmPoolManager, WarmSandbox};
pub use sandbox::{
    Sandbox, SandboxBackend, SandboxConfig, SandboxError, SandboxState, UserIdentity,
};
pub use session::{AgentSession, SessionError};
