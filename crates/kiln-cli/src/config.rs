//! Configuration file loading.

use anyhow::{Context, Result};
use kiln_core::build::{BuildRequest, Priority, ResourceProfile, SourceRef};
use kiln_core::slot::{Capacity, SlotSpec};
use kiln_scheduler::{PoolConfig, SchedulerConfig};
use kiln_triage::TriageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default file name looked up in the working directory.
pub const CONFIG_FILE: &str = "kiln.yaml";

/// Complete `kiln` configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Where logs, the corpus and build workspaces live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_corpus_file")]
    pub corpus_file: PathBuf,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".kiln/logs")
}

fn default_corpus_file() -> PathBuf {
    PathBuf::from(".kiln/corpus.json")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".kiln/workspaces")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            corpus_file: default_corpus_file(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl KilnConfig {
    /// Load from an explicit path, else `./kiln.yaml`, else the user config
    /// directory, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Self::from_file(&local);
        }
        if let Some(user) = Self::user_config_path()
            && user.exists()
        {
            return Self::from_file(&user);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// `~/.config/kiln/kiln.yaml` or the platform equivalent.
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "kiln", "kiln")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Validate every section. The pool is only required to run builds.
    pub fn validate(&self, require_pool: bool) -> Result<()> {
        self.scheduler.validate()?;
        self.triage.validate()?;
        if require_pool {
            self.pool.validate()?;
        }
        if self.logging.level.trim().is_empty() {
            anyhow::bail!("logging.level must not be empty");
        }
        Ok(())
    }

    /// Starter configuration written by `kiln config init`.
    pub fn starter() -> Self {
        Self {
            pool: PoolConfig::default()
                .with_slot(SlotSpec {
                    node: "mi250x-01".to_string(),
                    capacity: Capacity::new(64, 512, 4),
                    gpu_arch: "gfx90a".to_string(),
                    rocm_version: Some("6.1".to_string()),
                })
                .with_slot(SlotSpec {
                    node: "navi31-01".to_string(),
                    capacity: Capacity::new(16, 64, 1),
                    gpu_arch: "gfx1100".to_string(),
                    rocm_version: Some("6.1".to_string()),
                }),
            ..Self::default()
        }
    }
}

/// One entry of a `--builds` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(flatten)]
    pub source: SourceRef,
    #[serde(default)]
    pub profile: ResourceProfile,
    /// Left out, the scheduler derives the tier from the source.
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl BuildSpec {
    pub fn into_request(self) -> BuildRequest {
        match self.priority {
            Some(priority) => BuildRequest::new(self.source, self.profile, priority),
            None => BuildRequest::unprioritized(self.source, self.profile),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildsFile {
    #[serde(default)]
    pub builds: Vec<BuildSpec>,
}

impl BuildsFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read builds file {}", path.display()))?;
        let file: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid builds file {}", path.display()))?;
        if file.builds.is_empty() {
            anyhow::bail!("{} declares no builds", path.display());
        }
        Ok(file)
    }
}
