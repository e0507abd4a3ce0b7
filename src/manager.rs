//! Top-level orchestration: the build loop, session acquisition,
//! predictive warming, and the lifetime reaper.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::image::ImageBuilder;
use crate::pool::{SyncState, WarmPoolManager};
use crate::sandbox::{Sandbox, SandboxBackend, SandboxError, UserIdentity};
use crate::session::AgentSession;

struct SessionEntry {
    sandbox: Sandbox,
    started_at: DateTime<Utc>,
}

/// Single-quotes a value for safe interpolation into an `sh -c` string.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Orchestrates images, warm pools, and active sessions for a set of
/// tracked repositories.
pub struct SandboxManager {
    config: Config,
    backend: Arc<dyn SandboxBackend>,
    images: Arc<ImageBuilder>,
    pool: WarmPoolManager,
    repositories: std::sync::Mutex<Vec<String>>,
    sessions: tokio::sync::Mutex<HashMap<String, SessionEntry>>,
    warm_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl SandboxManager {
    /// Creates a manager from configuration, a backend, and an image builder.
    pub fn new(config: Config, backend: Arc<dyn SandboxBackend>, images: Arc<ImageBuilder>) -> Self {
        let pool = WarmPoolManager::new(
            backend.clone(),
            images.clone(),
            config.pool.clone(),
            config.sandbox.clone(),
            config.build.base_branch.clone(),
        );
        let repositories = config.repositories.clone();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            backend,
            images,
            pool,
            repositories: std::sync::Mutex::new(repositories),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            warm_tasks: std::sync::Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// The warm pool this manager maintains.
    pub fn pool(&self) -> &WarmPoolManager {
        &self.pool
    }

    /// The image registry this manager builds into.
    pub fn images(&self) -> &ImageBuilder {
        &self.images
    }

    fn tracked_repositories(&self) -> Vec<String> {
        self.repositories
            .lock()
            .expect("repository lock poisoned")
            .clone()
    }

    /// Adds a repository to the tracked set. No-op if already tracked.
    pub fn add_repository(&self, repo_url: &str) {
        let mut repos = self.repositories.lock().expect("repository lock poisoned");
        if !repos.iter().any(|r| r == repo_url) {
            repos.push(repo_url.to_string());
            info!(repo = repo_url, "Repository added");
        }
    }

    /// Removes a repository and cancels its background work.
    pub async fn remove_repository(&self, repo_url: &str) {
        self.repositories
            .lock()
            .expect("repository lock poisoned")
            .retain(|r| r != repo_url);
        self.pool.cancel_repo(repo_url).await;
        info!(repo = repo_url, "Repository removed");
    }

    /// Runs the periodic image-build and pool-maintenance loop until
    /// shutdown is signalled.
    ///
    /// A failure for one repository is logged and never stops the pass
    /// from covering the rest.
    pub async fn run_build_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_secs(u64::from(self.config.build.interval_minutes) * 60);
        loop {
            if *shutdown.borrow() {
                return;
            }
            for repo in self.tracked_repositories() {
                if let Err(e) = self.refresh_repository(&repo).await {
                    warn!(repo, "Repository refresh failed: {e:#}");
                }
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("Build loop stopping");
                    return;
                }
            }
        }
    }

    /// One build-and-maintain pass for a single repository.
    pub async fn refresh_repository(&self, repo_url: &str) -> Result<()> {
        self.images.build_image(repo_url).await?;
        self.pool.maintain_pool(repo_url).await
    }

    /// Starts a session for `user` on `repo_url`.
    ///
    /// Acquisition order: warm-pool hit (waiting out an in-flight
    /// sync), then `snapshot_id` restore, then a cold start from the
    /// latest image. The acquired sandbox gets the user's git identity
    /// before the session is registered.
    pub async fn start_session(
        &self,
        repo_url: &str,
        user: UserIdentity,
        snapshot_id: Option<&str>,
    ) -> Result<AgentSession> {
        let sandbox = self.acquire_sandbox(repo_url, snapshot_id).await?;

        sandbox
            .run(&format!(
                "git -C /workspace config user.name {}",
                shell_quote(&user.name)
            ))
            .await
            .context("Failed to set git user.name")?;
        sandbox
            .run(&format!(
                "git -C /workspace config user.email {}",
                shell_quote(&user.email)
            ))
            .await
            .context("Failed to set git user.email")?;
        sandbox.set_current_user(user.clone());

        let session_id = format!("{}_{}", user.id, sandbox.created_at().timestamp_millis());
        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionEntry {
                sandbox: sandbox.clone(),
                started_at: Utc::now(),
            },
        );
        info!(
            event = "session_started",
            session = %session_id,
            repo = repo_url,
            user = %user.id,
            sandbox_id = %sandbox.id(),
        );

        Ok(AgentSession::synced(
            session_id,
            sandbox,
            self.config.session.max_pending_writes,
        ))
    }

    async fn acquire_sandbox(
        &self,
        repo_url: &str,
        snapshot_id: Option<&str>,
    ) -> Result<Sandbox> {
        // Warm hits first. A claim whose sync fails is discarded and
        // the next entry tried; the pool is drained before falling
        // through to the slower tiers.
        while let Some(mut claim) = self.pool.get_warm_sandbox(repo_url).await {
            match claim.wait_for_sync().await {
                SyncState::Complete => {
                    debug!(repo = repo_url, sandbox_id = %claim.sandbox.id(), "Warm hit");
                    return Ok(claim.sandbox);
                }
                _ => {
                    warn!(
                        repo = repo_url,
                        sandbox_id = %claim.sandbox.id(),
                        "Claimed warm sandbox failed to sync, discarding"
                    );
                    let _ = claim.sandbox.terminate().await;
                }
            }
        }

        if let Some(snap) = snapshot_id {
            let config = self.config.sandbox.sandbox_config(repo_url, snap);
            match Sandbox::from_snapshot(self.backend.clone(), snap, config).await {
                Ok(sandbox) => {
                    debug!(repo = repo_url, snapshot_id = snap, "Restored from snapshot");
                    return Ok(sandbox);
                }
                Err(SandboxError::SnapshotNotFound { .. }) => {
                    warn!(
                        repo = repo_url,
                        snapshot_id = snap,
                        "Snapshot missing, falling back to cold start"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let image = self
            .images
            .get_latest_image(repo_url)
            .with_context(|| format!("No image available for {repo_url}"))?;
        debug!(repo = repo_url, image_id = %image.image_id, "Cold-starting sandbox");
        let config = self.config.sandbox.sandbox_config(repo_url, &image.image_id);
        let sandbox = Sandbox::create(self.backend.clone(), &image.image_id, config)
            .await
            .context("Cold start failed")?;
        if let Err(e) = sandbox.sync_checkout(&self.config.build.base_branch).await {
            let _ = sandbox.terminate().await;
            return Err(anyhow::Error::new(e).context("Cold-start sync failed"));
        }
        Ok(sandbox)
    }

    /// Best-effort predictive warm, triggered when a user starts typing.
    ///
    /// Never blocks the caller and never surfaces an error; pool
    /// maintenance runs in a tracked background task only when no
    /// valid warm sandbox is currently available.
    pub async fn on_user_typing(self: &Arc<Self>, user: &UserIdentity, repo_url: &str) {
        if self.pool.has_available(repo_url).await {
            return;
        }
        debug!(repo = repo_url, user = %user.id, "Predictive warm triggered");
        let manager = Arc::clone(self);
        let repo = repo_url.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = manager.pool.maintain_pool(&repo).await {
                warn!(repo, "Predictive warm failed: {e:#}");
            }
        });
        let mut tasks = self.warm_tasks.lock().expect("warm task lock poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Ends a session: snapshot, terminate, deregister.
    ///
    /// Returns the snapshot id for later resumption, or `None` for an
    /// unknown session id.
    pub async fn end_session(&self, session_id: &str) -> Result<Option<String>> {
        let entry = self.sessions.lock().await.remove(session_id);
        let Some(entry) = entry else {
            debug!(session = session_id, "end_session for unknown session");
            return Ok(None);
        };

        let snapshot_id = entry
            .sandbox
            .snapshot()
            .await
            .context("Failed to snapshot session sandbox")?;
        entry.sandbox.terminate().await?;
        info!(
            event = "session_ended",
            session = session_id,
            snapshot_id = %snapshot_id,
            duration_secs = (Utc::now() - entry.started_at).num_seconds(),
        );
        Ok(Some(snapshot_id))
    }

    /// Runs the lifetime reaper until shutdown is signalled.
    pub async fn run_reaper(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let interval =
            Duration::from_secs(u64::from(self.config.session.reaper_interval_seconds));
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("Reaper stopping");
                    return;
                }
            }
            self.reap_expired().await;
        }
    }

    /// Terminates session sandboxes past their configured lifetime cap.
    pub async fn reap_expired(&self) {
        let max_lifetime = ChronoDuration::hours(i64::from(self.config.sandbox.timeout_hours));
        let now = Utc::now();
        let expired: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| now - e.sandbox.created_at() > max_lifetime)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in expired {
            warn!(
                event = "session_reaped",
                session = %id,
                sandbox_id = %entry.sandbox.id(),
                "Session exceeded lifetime cap, terminating"
            );
            if let Err(e) = entry.sandbox.terminate().await {
                warn!(session = %id, "Failed to terminate reaped sandbox: {e}");
            }
        }
    }

    /// Number of currently registered sessions.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Signals the build loop and reaper to stop and cancels pool work.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.warm_tasks.lock().expect("warm task lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
        for repo in self.tracked_repositories() {
            self.pool.cancel_repo(&repo).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::sandbox::FakeBackend;

    const REPO: &str = "myorg/frontend";

    fn user() -> UserIdentity {
        UserIdentity {
            id: "u1".to_string(),
            name: "Dev One".to_string(),
            email: "dev@example.com".to_string(),
            github_token: "ghs_session".to_string(),
        }
    }

    fn manager_with(backend: Arc<FakeBackend>, config: Config) -> Arc<SandboxManager> {
        let images = Arc::new(ImageBuilder::new(
            backend.clone(),
            Arc::new(StaticTokenProvider::new("ghs_test")),
            config.build.clone(),
            config.sandbox.clone(),
        ));
        Arc::new(SandboxManager::new(config, backend, images))
    }

    fn manager(backend: Arc<FakeBackend>) -> Arc<SandboxManager> {
        let config = Config {
            repositories: vec![REPO.to_string()],
            ..Config::default()
        };
        manager_with(backend, config)
    }

    #[tokio::test]
    async fn test_refresh_builds_image_and_fills_pool() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        manager.refresh_repository(REPO).await.unwrap();
        assert!(manager.images().get_latest_image(REPO).is_some());
        assert_eq!(manager.pool().pool_size(REPO).await, 3);
    }

    #[tokio::test]
    async fn test_session_configures_git_identity() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend.clone());
        manager.refresh_repository(REPO).await.unwrap();

        let session = manager.start_session(REPO, user(), None).await.unwrap();
        assert!(session.id().starts_with("u1_"));
        assert_eq!(
            session.sandbox().current_user().map(|u| u.email),
            Some("dev@example.com".to_string())
        );

        // fake-0 was the build sandbox and snap-1 its image; the first
        // pooled unit is fake-2 and sits at the head of the pool.
        let ops = backend.ops_for("fake-2");
        assert!(ops
            .iter()
            .any(|op| op.contains("git -C /workspace config user.name 'Dev One'")));
        assert!(ops
            .iter()
            .any(|op| op.contains("git -C /workspace config user.email 'dev@example.com'")));
        // The token must never reach the sandbox.
        assert!(!ops.iter().any(|op| op.contains("ghs_session")));
    }

    #[tokio::test]
    async fn test_git_identity_is_shell_quoted() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend.clone());
        manager.refresh_repository(REPO).await.unwrap();

        let hostile = UserIdentity {
            id: "u1".to_string(),
            name: "Eve\"; touch /tmp/pwned; echo \"".to_string(),
            email: "eve'$(id)'@example.com".to_string(),
            github_token: "ghs_session".to_string(),
        };
        manager.start_session(REPO, hostile, None).await.unwrap();

        let ops = backend.ops_for("fake-2");
        assert!(ops
            .iter()
            .any(|op| op.contains(r#"user.name 'Eve"; touch /tmp/pwned; echo "'"#)));
        assert!(ops
            .iter()
            .any(|op| op.contains(r"user.email 'eve'\''$(id)'\''@example.com'")));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("Dev One"), "'Dev One'");
        assert_eq!(shell_quote("O'Brien"), r"'O'\''Brien'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }

    #[tokio::test]
    async fn test_start_session_without_image_fails() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        let err = manager.start_session(REPO, user(), None).await.unwrap_err();
        assert!(err.to_string().contains("No image available"));
    }

    #[tokio::test]
    async fn test_end_session_returns_snapshot() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        manager.refresh_repository(REPO).await.unwrap();

        let session = manager.start_session(REPO, user(), None).await.unwrap();
        assert_eq!(manager.active_sessions().await, 1);

        let snapshot = manager.end_session(session.id()).await.unwrap();
        assert!(snapshot.is_some());
        assert_eq!(manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_end_unknown_session_is_none() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        assert_eq!(manager.end_session("nope_0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_predictive_warm_fills_empty_pool() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        manager.images().build_image(REPO).await.unwrap();
        assert!(!manager.pool().has_available(REPO).await);

        manager.on_user_typing(&user(), REPO).await;
        // Drain the spawned maintenance task.
        let handle = manager
            .warm_tasks
            .lock()
            .unwrap()
            .pop()
            .expect("warm task spawned");
        handle.await.unwrap();
        assert_eq!(manager.pool().pool_size(REPO).await, 3);
    }

    #[tokio::test]
    async fn test_reaper_terminates_expired_sessions() {
        let backend = Arc::new(FakeBackend::new());
        let mut config = Config {
            repositories: vec![REPO.to_string()],
            ..Config::default()
        };
        config.sandbox.timeout_hours = 0; // everything expires immediately
        let manager = manager_with(backend, config);
        manager.refresh_repository(REPO).await.unwrap();

        let session = manager.start_session(REPO, user(), None).await.unwrap();
        manager.reap_expired().await;
        assert_eq!(manager.active_sessions().await, 0);
        assert_eq!(
            session.sandbox().state(),
            crate::sandbox::SandboxState::Terminated
        );
    }

    #[tokio::test]
    async fn test_remove_repository_cancels_pool() {
        let backend = Arc::new(FakeBackend::new());
        let manager = manager(backend);
        manager.refresh_repository(REPO).await.unwrap();

        manager.remove_repository(REPO).await;
        assert_eq!(manager.pool().pool_size(REPO).await, 0);
        assert!(manager.tracked_repositories().is_empty());
    }
}
