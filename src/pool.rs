//! Warm sandbox pools.
//!
//! Each tracked repository keeps a small pool of pre-provisioned
//! sandboxes whose checkouts a background task is bringing current.
//! Claiming is exclusive: an entry leaves the pool the moment it is
//! handed out, so two concurrent claims can never share a sandbox.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, SandboxResources};
use crate::image::ImageBuilder;
use crate::sandbox::{Sandbox, SandboxBackend, SandboxError};

/// Progress of the background checkout sync for one warm sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Sync task has not finished yet.
    Pending,
    /// Checkout is current; the sandbox is `Ready`.
    Complete,
    /// Sync failed; the entry is permanently invalid.
    Failed,
}

/// A pooled sandbox plus the metadata the pool validates it by.
pub struct WarmSandbox {
    /// The underlying sandbox.
    pub sandbox: Sandbox,
    /// When the entry was pooled.
    pub created_at: DateTime<Utc>,
    /// Image the sandbox was provisioned from.
    pub image_version: String,
    sync: watch::Receiver<SyncState>,
}

impl WarmSandbox {
    /// Current sync progress.
    pub fn sync_state(&self) -> SyncState {
        *self.sync.borrow()
    }

    /// Waits until the background sync finishes, successfully or not.
    ///
    /// A sync task that disappeared (aborted mid-flight) counts as
    /// failed so no claimer waits forever.
    pub async fn wait_for_sync(&mut self) -> SyncState {
        match self.sync.wait_for(|s| *s != SyncState::Pending).await {
            Ok(state) => *state,
            Err(_) => SyncState::Failed,
        }
    }
}

/// Maintains per-repository pools of pre-warmed sandboxes.
pub struct WarmPoolManager {
    backend: Arc<dyn SandboxBackend>,
    images: Arc<ImageBuilder>,
    pool: PoolConfig,
    resources: SandboxResources,
    base_branch: String,
    pools: tokio::sync::Mutex<HashMap<String, Vec<WarmSandbox>>>,
    sync_tasks: std::sync::Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    maintenance: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WarmPoolManager {
    /// Creates a pool manager over the given backend and image registry.
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        images: Arc<ImageBuilder>,
        pool: PoolConfig,
        resources: SandboxResources,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            images,
            pool,
            resources,
            base_branch: base_branch.into(),
            pools: tokio::sync::Mutex::new(HashMap::new()),
            sync_tasks: std::sync::Mutex::new(HashMap::new()),
            maintenance: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn max_age(&self) -> Duration {
        Duration::minutes(i64::from(self.pool.max_age_minutes))
    }

    /// An entry is claimable only if it is fresh, built from the
    /// current image, and its sync has not failed.
    fn is_valid(&self, entry: &WarmSandbox, latest_image_id: &str) -> bool {
        Utc::now() - entry.created_at <= self.max_age()
            && entry.image_version == latest_image_id
            && entry.sync_state() != SyncState::Failed
    }

    /// Claims a valid warm sandbox for `repo_url`, if one exists.
    ///
    /// The claimed entry is removed from the pool under the pool lock,
    /// so a sandbox can never be handed to two callers.
    pub async fn get_warm_sandbox(&self, repo_url: &str) -> Option<WarmSandbox> {
        let latest = self.images.get_latest_image(repo_url)?;
        let mut pools = self.pools.lock().await;
        let entries = pools.get_mut(repo_url)?;
        let idx = entries
            .iter()
            .position(|e| self.is_valid(e, &latest.image_id))?;
        let claimed = entries.remove(idx);
        debug!(
            repo = repo_url,
            sandbox_id = %claimed.sandbox.id(),
            remaining = entries.len(),
            "Claimed warm sandbox"
        );
        Some(claimed)
    }

    /// Returns whether a valid unclaimed entry exists, without claiming it.
    pub async fn has_available(&self, repo_url: &str) -> bool {
        let Some(latest) = self.images.get_latest_image(repo_url) else {
            return false;
        };
        self.pools
            .lock()
            .await
            .get(repo_url)
            .is_some_and(|entries| entries.iter().any(|e| self.is_valid(e, &latest.image_id)))
    }

    /// Brings the pool for `repo_url` back to its target size.
    ///
    /// Invalid entries are pruned and terminated first, then the
    /// shortfall against the target is created. A creation failure is
    /// logged and skipped; it never poisons the rest of the pool.
    pub async fn maintain_pool(&self, repo_url: &str) -> Result<()> {
        // One maintenance pass per repository at a time. The pool lock
        // is released while sandboxes are provisioned, so without this
        // gate two overlapping passes would each provision the full
        // shortfall and overshoot the target.
        let gate = {
            let mut gates = self.maintenance.lock().expect("maintenance lock poisoned");
            gates.entry(repo_url.to_string()).or_default().clone()
        };
        let _pass = gate.lock().await;

        let latest = self
            .images
            .get_latest_image(repo_url)
            .with_context(|| format!("No image built yet for {repo_url}"))?;

        let (pruned, shortfall) = {
            let mut pools = self.pools.lock().await;
            let entries = pools.entry(repo_url.to_string()).or_default();
            let mut kept = Vec::new();
            let mut pruned = Vec::new();
            for entry in entries.drain(..) {
                if self.is_valid(&entry, &latest.image_id) {
                    kept.push(entry);
                } else {
                    pruned.push(entry);
                }
            }
            let shortfall = self.pool.target_size.saturating_sub(kept.len());
            *entries = kept;
            (pruned, shortfall)
        };

        for entry in &pruned {
            debug!(repo = repo_url, sandbox_id = %entry.sandbox.id(), "Pruning stale warm sandbox");
            if let Err(e) = entry.sandbox.terminate().await {
                warn!(repo = repo_url, "Failed to terminate pruned sandbox: {e}");
            }
        }

        let mut created = 0usize;
        for _ in 0..shortfall {
            match self.provision_warm(repo_url, &latest.image_id).await {
                Ok(entry) => {
                    self.pools
                        .lock()
                        .await
                        .entry(repo_url.to_string())
                        .or_default()
                        .push(entry);
                    created += 1;
                }
                Err(e) => {
                    warn!(repo = repo_url, "Warm sandbox creation failed: {e}");
                }
            }
        }

        if !pruned.is_empty() || created > 0 {
            info!(
                event = "pool_maintained",
                repo = repo_url,
                pruned = pruned.len(),
                created,
            );
        }
        Ok(())
    }

    /// Provisions one warm sandbox and starts its tracked sync task.
    async fn provision_warm(
        &self,
        repo_url: &str,
        image_id: &str,
    ) -> Result<WarmSandbox, SandboxError> {
        let config = self.resources.sandbox_config(repo_url, image_id);
        let sandbox = Sandbox::create(self.backend.clone(), image_id, config).await?;

        let (tx, rx) = watch::channel(SyncState::Pending);
        let sync_sandbox = sandbox.clone();
        let base_branch = self.base_branch.clone();
        let repo = repo_url.to_string();
        let handle = tokio::spawn(async move {
            match sync_sandbox.sync_checkout(&base_branch).await {
                Ok(()) => {
                    tx.send_replace(SyncState::Complete);
                }
                Err(e) => {
                    warn!(
                        repo,
                        sandbox_id = %sync_sandbox.id(),
                        "Warm sandbox sync failed: {e}"
                    );
                    tx.send_replace(SyncState::Failed);
                }
            }
        });

        let mut tasks = self.sync_tasks.lock().expect("sync task lock poisoned");
        let repo_tasks = tasks.entry(repo_url.to_string()).or_default();
        repo_tasks.retain(|h| !h.is_finished());
        repo_tasks.push(handle);

        Ok(WarmSandbox {
            created_at: sandbox.created_at(),
            image_version: image_id.to_string(),
            sandbox,
            sync: rx,
        })
    }

    /// Cancels background sync work for `repo_url` and terminates its
    /// unclaimed entries. Claimed sandboxes are untouched.
    pub async fn cancel_repo(&self, repo_url: &str) {
        let handles = self
            .sync_tasks
            .lock()
            .expect("sync task lock poisoned")
            .remove(repo_url)
            .unwrap_or_default();
        for handle in handles {
            handle.abort();
        }

        let entries = self
            .pools
            .lock()
            .await
            .remove(repo_url)
            .unwrap_or_default();
        let count = entries.len();
        for entry in entries {
            if let Err(e) = entry.sandbox.terminate().await {
                warn!(repo = repo_url, "Failed to terminate pooled sandbox: {e}");
            }
        }
        if count > 0 {
            info!(event = "pool_cancelled", repo = repo_url, terminated = count);
        }
    }

    /// Number of pooled (unclaimed) entries for a repository, valid or not.
    pub async fn pool_size(&self, repo_url: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(repo_url)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::config::BuildConfig;
    use crate::sandbox::{FakeBackend, SandboxState};

    const REPO: &str = "myorg/frontend";

    async fn pool_with_image(backend: Arc<FakeBackend>) -> WarmPoolManager {
        let images = Arc::new(ImageBuilder::new(
            backend.clone(),
            Arc::new(StaticTokenProvider::new("ghs_test")),
            BuildConfig::default(),
            SandboxResources::default(),
        ));
        images.build_image(REPO).await.unwrap();
        WarmPoolManager::new(
            backend,
            images,
            PoolConfig::default(),
            SandboxResources::default(),
            "main",
        )
    }

    #[tokio::test]
    async fn test_maintain_reaches_target_size() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend).await;

        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);

        // A second pass is a no-op while everything is still valid.
        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_maintenance_respects_target() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend).await;

        // The build loop and a predictive-warm trigger can run
        // maintenance for the same repository at the same time.
        let (a, b) = tokio::join!(pool.maintain_pool(REPO), pool.maintain_pool(REPO));
        a.unwrap();
        b.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);
    }

    #[tokio::test]
    async fn test_maintain_without_image_fails() {
        let backend: Arc<FakeBackend> = Arc::new(FakeBackend::new());
        let images = Arc::new(ImageBuilder::new(
            backend.clone(),
            Arc::new(StaticTokenProvider::new("ghs_test")),
            BuildConfig::default(),
            SandboxResources::default(),
        ));
        let pool = WarmPoolManager::new(
            backend,
            images,
            PoolConfig::default(),
            SandboxResources::default(),
            "main",
        );
        let err = pool.maintain_pool(REPO).await.unwrap_err();
        assert!(err.to_string().contains("No image built yet"));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_drains() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend).await;
        pool.maintain_pool(REPO).await.unwrap();

        let a = pool.get_warm_sandbox(REPO).await.unwrap();
        let b = pool.get_warm_sandbox(REPO).await.unwrap();
        let c = pool.get_warm_sandbox(REPO).await.unwrap();
        assert_ne!(a.sandbox.id(), b.sandbox.id());
        assert_ne!(b.sandbox.id(), c.sandbox.id());
        assert!(pool.get_warm_sandbox(REPO).await.is_none());
    }

    #[tokio::test]
    async fn test_claimed_sandbox_becomes_ready() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend).await;
        pool.maintain_pool(REPO).await.unwrap();

        let mut claim = pool.get_warm_sandbox(REPO).await.unwrap();
        assert_eq!(claim.wait_for_sync().await, SyncState::Complete);
        assert_eq!(claim.sandbox.state(), SandboxState::Ready);
    }

    #[tokio::test]
    async fn test_aged_entry_is_replaced() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend.clone()).await;
        pool.maintain_pool(REPO).await.unwrap();
        let created_before = backend.created_count();

        // Back-date one entry past max_age; the other two stay valid.
        {
            let mut pools = pool.pools.lock().await;
            let entries = pools.get_mut(REPO).unwrap();
            entries[0].created_at = entries[0].created_at - Duration::minutes(26);
        }

        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);
        // Exactly one replacement, and the aged sandbox was released.
        assert_eq!(backend.created_count(), created_before + 1);
        assert_eq!(backend.terminated_count(), 2); // build sandbox + aged entry
    }

    #[tokio::test]
    async fn test_new_image_invalidates_pool() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend.clone()).await;
        pool.maintain_pool(REPO).await.unwrap();

        // A rebuild supersedes the image the pool was provisioned from.
        pool.images.build_image(REPO).await.unwrap();
        assert!(!pool.has_available(REPO).await);
        assert!(pool.get_warm_sandbox(REPO).await.is_none());

        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);
        let claim = pool.get_warm_sandbox(REPO).await.unwrap();
        assert_eq!(
            claim.image_version,
            pool.images.get_latest_image(REPO).unwrap().image_id
        );
    }

    #[tokio::test]
    async fn test_failed_sync_invalidates_entry() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend.clone()).await;
        backend.fail_commands_containing("fetch origin");
        pool.maintain_pool(REPO).await.unwrap();

        // Let the sync tasks run to their failed conclusion.
        for entry in pool.pools.lock().await.get_mut(REPO).unwrap() {
            assert_eq!(entry.wait_for_sync().await, SyncState::Failed);
        }
        assert!(!pool.has_available(REPO).await);
        assert!(pool.get_warm_sandbox(REPO).await.is_none());
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_partial_pool() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend.clone()).await;
        backend.fail_next_creates(1);

        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 2);

        // The next pass fills the gap.
        pool.maintain_pool(REPO).await.unwrap();
        assert_eq!(pool.pool_size(REPO).await, 3);
    }

    #[tokio::test]
    async fn test_cancel_repo_terminates_unclaimed() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with_image(backend.clone()).await;
        pool.maintain_pool(REPO).await.unwrap();

        let claim = pool.get_warm_sandbox(REPO).await.unwrap();
        pool.cancel_repo(REPO).await;

        assert_eq!(pool.pool_size(REPO).await, 0);
        // Build sandbox + two unclaimed entries; the claim survives.
        assert_eq!(backend.terminated_count(), 3);
        assert_ne!(claim.sandbox.state(), SandboxState::Terminated);
    }
}
