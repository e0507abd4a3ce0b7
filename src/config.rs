//! Configuration for the drydock daemon (`drydock.toml`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::sandbox::SandboxConfig;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "drydock.toml";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Repositories to build images and maintain warm pools for.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Warm pool sizing and staleness.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Image build loop settings.
    #[serde(default)]
    pub build: BuildConfig,
    /// Per-sandbox resource limits.
    #[serde(default)]
    pub sandbox: SandboxResources,
    /// Token provider selection.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Session-level knobs.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Warm pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of unclaimed, valid sandboxes to keep per repository.
    #[serde(default = "default_target_size")]
    pub target_size: usize,

    /// Age after which a warm sandbox is no longer trusted.
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            max_age_minutes: default_max_age_minutes(),
        }
    }
}

/// Image build settings.
///
/// The command set defaults to an npm-style project; override per
/// deployment for other toolchains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Minutes between build loop passes.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    /// Image used to run build steps before the first snapshot exists.
    #[serde(default = "default_bootstrap_image")]
    pub bootstrap_image: String,

    /// Branch the sync task tracks.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Dependency install command.
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// Build command.
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Test command run once to warm caches (failures tolerated).
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Dev-server command started briefly to warm runtime caches.
    #[serde(default = "default_dev_command")]
    pub dev_command: String,

    /// Seconds to let the dev process run during warmup.
    #[serde(default = "default_warmup_seconds")]
    pub warmup_seconds: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            bootstrap_image: default_bootstrap_image(),
            base_branch: default_base_branch(),
            install_command: default_install_command(),
            build_command: default_build_command(),
            test_command: default_test_command(),
            dev_command: default_dev_command(),
            warmup_seconds: default_warmup_seconds(),
        }
    }
}

/// Resource limits applied to every sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResources {
    /// Memory limit in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU cores.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,

    /// Disk allocation in gigabytes.
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,

    /// Lifetime cap in hours, enforced by the reaper.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u32,
}

impl Default for SandboxResources {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            disk_gb: default_disk_gb(),
            timeout_hours: default_timeout_hours(),
        }
    }
}

impl SandboxResources {
    /// Builds the immutable per-sandbox config for a repository/image pair.
    pub fn sandbox_config(&self, repo_url: &str, base_image: &str) -> SandboxConfig {
        SandboxConfig {
            repo_url: repo_url.to_string(),
            base_image: base_image.to_string(),
            memory_mb: self.memory_mb,
            cpu_cores: self.cpu_cores,
            disk_gb: self.disk_gb,
            timeout_hours: self.timeout_hours,
        }
    }
}

/// Token provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Provider kind: "env" or "endpoint".
    #[serde(default = "default_auth_provider")]
    pub provider: String,

    /// Environment variable holding the token (provider = "env").
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// URL returning `{"token": "..."}` on POST (provider = "endpoint").
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Environment variable holding the bearer credential for the endpoint.
    #[serde(default)]
    pub bearer_env: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: default_auth_provider(),
            token_env: default_token_env(),
            endpoint_url: None,
            bearer_env: None,
        }
    }
}

/// Session-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cap on writes queued while a sync is pending.
    #[serde(default = "default_max_pending_writes")]
    pub max_pending_writes: usize,

    /// Seconds between reaper scans for over-lifetime sandboxes.
    #[serde(default = "default_reaper_interval_seconds")]
    pub reaper_interval_seconds: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: default_max_pending_writes(),
            reaper_interval_seconds: default_reaper_interval_seconds(),
        }
    }
}

// Default value functions

fn default_target_size() -> usize {
    3
}

fn default_max_age_minutes() -> u32 {
    25
}

fn default_interval_minutes() -> u32 {
    30
}

fn default_bootstrap_image() -> String {
    "node:20".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_test_command() -> String {
    "npm test -- --run".to_string()
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

fn default_warmup_seconds() -> u32 {
    5
}

fn default_memory_mb() -> u64 {
    4096
}

fn default_cpu_cores() -> u32 {
    2
}

fn default_disk_gb() -> u32 {
    10
}

fn default_timeout_hours() -> u32 {
    4
}

fn default_auth_provider() -> String {
    "env".to_string()
}

fn default_token_env() -> String {
    "DRYDOCK_GITHUB_TOKEN".to_string()
}

fn default_max_pending_writes() -> usize {
    256
}

fn default_reaper_interval_seconds() -> u32 {
    60
}

impl Config {
    /// Load configuration from a file, using defaults if not found.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.repositories.is_empty());
        assert_eq!(config.pool.target_size, 3);
        assert_eq!(config.pool.max_age_minutes, 25);
        assert_eq!(config.build.interval_minutes, 30);
        assert_eq!(config.build.base_branch, "main");
        assert_eq!(config.sandbox.timeout_hours, 4);
        assert_eq!(config.auth.provider, "env");
        assert_eq!(config.session.max_pending_writes, 256);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
repositories = ["myorg/frontend", "myorg/backend"]

[pool]
target_size = 5
max_age_minutes = 20

[build]
interval_minutes = 15
base_branch = "develop"
install_command = "pnpm install"

[sandbox]
memory_mb = 8192
timeout_hours = 8

[auth]
provider = "endpoint"
endpoint_url = "https://tokens.internal/github"
bearer_env = "DRYDOCK_TOKEN_BEARER"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.pool.target_size, 5);
        assert_eq!(config.build.base_branch, "develop");
        assert_eq!(config.build.install_command, "pnpm install");
        // Unspecified fields keep their defaults
        assert_eq!(config.build.build_command, "npm run build");
        assert_eq!(config.sandbox.memory_mb, 8192);
        assert_eq!(config.sandbox.cpu_cores, 2);
        assert_eq!(config.auth.provider, "endpoint");
        assert_eq!(
            config.auth.endpoint_url.as_deref(),
            Some("https://tokens.internal/github")
        );
    }

    #[test]
    fn test_sandbox_config_from_resources() {
        let resources = SandboxResources::default();
        let sc = resources.sandbox_config("myorg/frontend", "img-42");
        assert_eq!(sc.repo_url, "myorg/frontend");
        assert_eq!(sc.base_image, "img-42");
        assert_eq!(sc.memory_mb, 4096);
        assert_eq!(sc.timeout_hours, 4);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("drydock.toml")).unwrap();
        assert_eq!(config.pool.target_size, 3);
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drydock.toml");
        fs::write(&path, "repositories = not-a-list").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
