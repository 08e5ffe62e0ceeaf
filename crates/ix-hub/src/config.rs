//! Hub configuration.
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `$IX_HOME/config.toml`, `[hub]` table
//! 3. environment: `IX_HUB_CACHE`, `IX_ENDPOINT`, `IX_OFFLINE`,
//!    `IX_LOCK_TIMEOUT`, `IX_FETCH_TIMEOUT`, `IX_BRANCH_POLICY`
//! 4. explicit overrides applied by the caller (`with_*` methods)
//!
//! `IX_HOME` (default `~/.interaxions`) locates the config file and the
//! default cache root `$IX_HOME/hub`.
//!
//! ```toml
//! [hub]
//! cache_dir = "/data/interaxions/hub"
//! endpoint = "https://git.example.com"
//! offline = false
//! lock_timeout_secs = 300
//! fetch_timeout_secs = 120
//! branch_policy = "pinned"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://github.com";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const CONFIG_FILE: &str = "config.toml";

/// What a plain load does with a branch that is already cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchPolicy {
    /// Re-resolve the branch online on every call; an unchanged commit reuses the entry.
    #[default]
    Refresh,
    /// Keep the pinned commit until a forced reload.
    Pinned,
}

impl fmt::Display for BranchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchPolicy::Refresh => "refresh",
            BranchPolicy::Pinned => "pinned",
        })
    }
}

impl FromStr for BranchPolicy {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "refresh" => Ok(BranchPolicy::Refresh),
            "pinned" => Ok(BranchPolicy::Pinned),
            other => Err(HubError::Config {
                detail: format!("unknown branch policy '{other}' (expected refresh or pinned)"),
            }),
        }
    }
}

/// Settings for one [`Hub`](crate::Hub).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub cache_dir: PathBuf,
    /// Base URL `org/repo` references are resolved against.
    pub endpoint: String,
    /// Never touch the network; only pinned, cached revisions load.
    pub offline: bool,
    pub lock_timeout: Duration,
    pub fetch_timeout: Duration,
    pub branch_policy: BranchPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    hub: HubSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HubSection {
    cache_dir: Option<PathBuf>,
    endpoint: Option<String>,
    offline: Option<bool>,
    lock_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    branch_policy: Option<BranchPolicy>,
}

impl HubConfig {
    /// Defaults with the cache rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        HubConfig {
            cache_dir: cache_dir.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            offline: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            branch_policy: BranchPolicy::default(),
        }
    }

    /// Load from the config file and the process environment.
    pub fn load() -> Result<Self> {
        Self::from_sources(dirs::home_dir(), |name| std::env::var(name).ok())
    }

    /// Load with an explicit home directory and environment lookup.
    pub fn from_sources(
        home: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let ix_home = match env("IX_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home
                .map(|h| h.join(".interaxions"))
                .ok_or_else(|| HubError::Config {
                    detail: "cannot determine home directory; set IX_HOME or IX_HUB_CACHE".into(),
                })?,
        };

        let mut config = HubConfig::new(ix_home.join("hub"));
        config.apply_file(&ix_home)?;

        if let Some(dir) = env("IX_HUB_CACHE") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = env("IX_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(flag) = env("IX_OFFLINE") {
            config.offline = parse_flag("IX_OFFLINE", &flag)?;
        }
        if let Some(secs) = env("IX_LOCK_TIMEOUT") {
            config.lock_timeout = parse_secs("IX_LOCK_TIMEOUT", &secs)?;
        }
        if let Some(secs) = env("IX_FETCH_TIMEOUT") {
            config.fetch_timeout = parse_secs("IX_FETCH_TIMEOUT", &secs)?;
        }
        if let Some(policy) = env("IX_BRANCH_POLICY") {
            config.branch_policy = policy.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, ix_home: &Path) -> Result<()> {
        let path = ix_home.join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let file: ConfigFile = toml::from_str(&text).map_err(|e| HubError::Config {
            detail: format!("{}: {e}", path.display()),
        })?;
        let hub = file.hub;
        if let Some(dir) = hub.cache_dir {
            self.cache_dir = if dir.is_absolute() {
                dir
            } else {
                ix_home.join(dir)
            };
        }
        if let Some(endpoint) = hub.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(offline) = hub.offline {
            self.offline = offline;
        }
        if let Some(secs) = hub.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = hub.fetch_timeout_secs {
            self.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = hub.branch_policy {
            self.branch_policy = policy;
        }
        Ok(())
    }

    /// Reject settings no hub can run with.
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(HubError::Config {
                detail: "endpoint is empty".into(),
            });
        }
        if endpoint.contains('@') {
            return Err(HubError::Config {
                detail: "endpoint must not embed credentials; pass them per reference".into(),
            });
        }
        if self.fetch_timeout.is_zero() {
            return Err(HubError::Config {
                detail: "fetch timeout must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_branch_policy(mut self, policy: BranchPolicy) -> Self {
        self.branch_policy = policy;
        self
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(HubError::Config {
            detail: format!("{name}: expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| HubError::Config {
            detail: format!("{name}: expected a number of seconds, got '{value}'"),
        })
}
