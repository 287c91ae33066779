use anyhow::Result;
use config::{Config, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::DuoError;

/// Environment variables carrying the caller's identity, as exported into each agent session.
pub const REPO_ENV: &str = "DROID_REPO";
pub const PR_ENV: &str = "DROID_PR_NUMBER";
pub const AGENT_ENV: &str = "DROID_AGENT_NAME";

/// Main configuration structure for duo
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DuoConfig {
    /// Ledger location and locking behaviour
    pub ledger: LedgerConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Remote review-thread mirror
    pub mirror: MirrorConfig,
    /// Agent log tailing
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Directory holding one sub-directory per (repository, PR) session
    pub root_dir: PathBuf,
    /// Upper bound on waiting for the ledger lock
    pub lock_timeout_ms: u64,
    /// Base delay between lock attempts (jitter is added on top)
    pub lock_retry_ms: u64,
    /// How often `init --watch` re-reads the stage
    pub watch_interval_ms: u64,
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms.max(1))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of the compact human format
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    /// Publish status snapshots to the PR thread
    pub enabled: bool,
    /// GitHub API base URL
    pub api_base: String,
    /// GitHub API token (can be set via env var)
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsConfig {
    /// How often a follower re-checks the log file for new data
    pub poll_interval_ms: u64,
}

impl Default for DuoConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig {
                root_dir: std::env::temp_dir(),
                lock_timeout_ms: 5_000,
                lock_retry_ms: 25,
                watch_interval_ms: 2_000,
            },
            observability: ObservabilityConfig {
                log_level: "warn".to_string(),
                json_logs: false,
            },
            mirror: MirrorConfig {
                enabled: true,
                api_base: "https://api.github.com".to_string(),
                token: None, // Will be read from GITHUB_TOKEN / GH_TOKEN
            },
            logs: LogsConfig {
                poll_interval_ms: 250,
            },
        }
    }
}

impl DuoConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (duo.toml, .duo-rc) in the working directory
    /// 3. Environment variables (prefixed with DUO_, nested keys split by `__`)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`DuoConfig::load`] but looks for configuration files in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&DuoConfig::default())?);

        let toml_path = dir.join("duo.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".duo-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("DUO")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut duo_config: DuoConfig = builder.build()?.try_deserialize()?;

        if duo_config.mirror.token.is_none() {
            duo_config.mirror.token = ["GITHUB_TOKEN", "GH_TOKEN"]
                .iter()
                .filter_map(|name| std::env::var(name).ok())
                .find(|token| !token.trim().is_empty());
        }

        Ok(duo_config)
    }

    /// Render the effective configuration, with the token redacted.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.mirror.token.is_some() {
            shown.mirror.token = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: LazyLock<Result<DuoConfig, anyhow::Error>> = LazyLock::new(|| {
    let _ = DuoConfig::load_env_file();
    DuoConfig::load()
});

/// Get the global configuration
pub fn config() -> Result<&'static DuoConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

static REPO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)$").expect("static pattern compiles")
});

static AGENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static pattern compiles"));

/// `owner/name` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn parse(raw: &str) -> Result<Self, DuoError> {
        let caps = REPO_PATTERN.captures(raw.trim()).ok_or_else(|| {
            DuoError::Configuration(format!(
                "repository '{raw}' must look like owner/name"
            ))
        })?;
        let (owner, name) = (&caps[1], &caps[2]);
        if [owner, name].iter().any(|part| part.chars().all(|c| c == '.')) {
            return Err(DuoError::Configuration(format!(
                "repository '{raw}' may not use '.' or '..' as a path part"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Which review session an invocation belongs to: one ledger per (repository, PR).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub repo: RepoSlug,
    pub pr_number: u64,
}

impl SessionIdentity {
    pub fn new(repo: RepoSlug, pr_number: u64) -> Self {
        Self { repo, pr_number }
    }

    /// Build the identity from explicit values, failing before any ledger access when one is missing.
    pub fn resolve(repo: Option<&str>, pr_number: Option<&str>) -> Result<Self, DuoError> {
        let repo = non_empty(repo).ok_or_else(|| {
            DuoError::Configuration(format!("{REPO_ENV} not set. Export it or pass --repo."))
        })?;
        let pr_raw = non_empty(pr_number).ok_or_else(|| {
            DuoError::Configuration(format!("{PR_ENV} not set. Export it or pass --pr."))
        })?;
        let pr_number = pr_raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                DuoError::Configuration(format!("PR number '{pr_raw}' is not a positive integer"))
            })?;

        Ok(Self::new(RepoSlug::parse(repo)?, pr_number))
    }

    /// Session directory name, e.g. `duo-octo-widgets-42`.
    pub fn workspace(&self) -> String {
        format!("duo-{}-{}-{}", self.repo.owner, self.repo.name, self.pr_number)
    }

    pub fn ledger_dir(&self, root: &Path) -> PathBuf {
        root.join(self.workspace())
    }
}

/// Validate an agent name before it is used as a ledger key or a file name.
pub fn validate_agent_name(name: &str) -> Result<&str, DuoError> {
    if AGENT_PATTERN.is_match(name) {
        Ok(name)
    } else {
        Err(DuoError::Configuration(format!(
            "agent name '{name}' must be 1-64 characters of letters, digits, '.', '_' or '-'"
        )))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
