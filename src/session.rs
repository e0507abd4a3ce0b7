//! Agent sessions and the read/write synchronization protocol.
//!
//! A session wraps one sandbox for the duration of an interaction.
//! Reads are always served immediately. Writes submitted while the
//! checkout sync is still pending are queued and applied in submission
//! order once the sync completes, strictly after the sync's own
//! mutations. Each queued write is applied exactly once.

use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info};

use crate::sandbox::{ExecOutput, Sandbox, SandboxError};

/// Errors surfaced by session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pending-write queue hit its configured cap.
    #[error("write queue is full ({limit} pending writes)")]
    WriteQueueFull {
        /// The configured queue cap.
        limit: usize,
    },

    /// The sync signal disappeared before the queued write was applied.
    #[error("sync signal dropped before queued write was applied")]
    SyncAbandoned,

    /// Underlying sandbox failure.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

struct PendingWrite {
    path: String,
    content: String,
    done: oneshot::Sender<Result<(), SandboxError>>,
}

/// One agent interaction bound to one sandbox.
pub struct AgentSession {
    id: String,
    sandbox: Sandbox,
    synced: watch::Sender<bool>,
    queue: Mutex<VecDeque<PendingWrite>>,
    max_pending_writes: usize,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("sandbox", &self.sandbox)
            .field("synced", &self.is_synced())
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    /// Creates a session whose sandbox sync is still pending.
    ///
    /// Writes queue until [`mark_sync_complete`](Self::mark_sync_complete)
    /// is called.
    pub fn new(id: impl Into<String>, sandbox: Sandbox, max_pending_writes: usize) -> Self {
        Self::with_sync_state(id, sandbox, false, max_pending_writes)
    }

    /// Creates a session over an already-synced sandbox.
    pub fn synced(id: impl Into<String>, sandbox: Sandbox, max_pending_writes: usize) -> Self {
        Self::with_sync_state(id, sandbox, true, max_pending_writes)
    }

    fn with_sync_state(
        id: impl Into<String>,
        sandbox: Sandbox,
        synced: bool,
        max_pending_writes: usize,
    ) -> Self {
        let (tx, _rx) = watch::channel(synced);
        Self {
            id: id.into(),
            sandbox,
            synced: tx,
            queue: Mutex::new(VecDeque::new()),
            max_pending_writes,
        }
    }

    /// Session id, `{user_id}_{sandbox_creation_time}`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sandbox this session is bound to.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Whether the checkout sync has completed.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Number of writes currently queued behind the sync.
    pub async fn pending_writes(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Reads a file. Never gated on the sync.
    pub async fn read_file(&self, path: &str) -> Result<String, SessionError> {
        Ok(self.sandbox.read_file(path).await?)
    }

    /// Runs a command in the session's sandbox.
    pub async fn execute_command(&self, command: &str) -> Result<ExecOutput, SessionError> {
        Ok(self.sandbox.execute_command(command).await?)
    }

    /// Writes a file, deferring behind a pending sync.
    ///
    /// If the sync is still pending the write is queued and this call
    /// returns once the flush has applied it. Queue admission and the
    /// sync flag are checked under the same lock, so a write can never
    /// slip into the queue after the flush has drained it.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        let waiter = {
            let mut queue = self.queue.lock().await;
            if *self.synced.borrow() {
                None
            } else {
                if queue.len() >= self.max_pending_writes {
                    return Err(SessionError::WriteQueueFull {
                        limit: self.max_pending_writes,
                    });
                }
                let (tx, rx) = oneshot::channel();
                queue.push_back(PendingWrite {
                    path: path.to_string(),
                    content: content.to_string(),
                    done: tx,
                });
                debug!(session = %self.id, path, "Queued write behind pending sync");
                Some(rx)
            }
        };

        match waiter {
            None => Ok(self.sandbox.write_file(path, content).await?),
            Some(rx) => {
                let applied = rx.await.map_err(|_| SessionError::SyncAbandoned)?;
                applied.map_err(SessionError::from)
            }
        }
    }

    /// Marks the sync complete and flushes queued writes in FIFO order.
    ///
    /// The flag flips under the queue lock and the flush happens before
    /// the lock is released, so no new direct write can interleave with
    /// the queued ones. Each waiter is answered with its own result; a
    /// failed write does not block the writes behind it.
    pub async fn mark_sync_complete(&self) {
        let mut queue = self.queue.lock().await;
        self.synced.send_replace(true);
        if !queue.is_empty() {
            info!(
                session = %self.id,
                pending = queue.len(),
                "Sync complete, flushing queued writes"
            );
        }
        while let Some(write) = queue.pop_front() {
            let result = self.sandbox.write_file(&write.path, &write.content).await;
            // Waiter may have been cancelled; the write still applied.
            let _ = write.done.send(result);
        }
    }
}
