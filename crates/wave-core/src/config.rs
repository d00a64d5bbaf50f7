//! `wave.toml` configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::GateKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    pub repo: RepoSection,
    pub store: StoreSection,
    pub scheduler: SchedulerSection,
    pub detector: DetectorSection,
    pub worker: WorkerSection,
    pub gates: GatesSection,
    pub merge: MergeSection,
    pub notify: NotifySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoSection {
    pub root: PathBuf,
    pub trunk: String,
    /// Relative to `root`.
    pub workspace_root: PathBuf,
    pub branch_prefix: String,
    pub git_timeout_secs: u64,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            trunk: "main".to_string(),
            workspace_root: PathBuf::from(".wave/wt"),
            branch_prefix: "wave/".to_string(),
            git_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub sqlite_path: PathBuf,
    pub event_log_root: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from(".wave/wave.sqlite"),
            event_log_root: PathBuf::from(".wave/events"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_concurrency: usize,
    pub tick_interval_ms: u64,
    /// Stop allocating new work for the rest of the run after a conflict.
    pub halt_on_conflict: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tick_interval_ms: 2_000,
            halt_on_conflict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    pub poll_interval_secs: u64,
    pub push_grace_secs: u64,
    pub stale_after_secs: u64,
    /// Additional time a stale worker gets before it is killed.
    pub stale_kill_after_secs: u64,
    pub output_lines: usize,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            push_grace_secs: 5,
            stale_after_secs: 600,
            stale_kill_after_secs: 300,
            output_lines: 200,
        }
    }
}

/// A program plus arguments and environment, all of which may contain
/// `{placeholder}` tokens rendered at spawn time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Sent to the session right after spawn.
    pub initial_input: Option<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: "wave-worker".to_string(),
            args: vec!["{issue_id}".to_string()],
            env: BTreeMap::new(),
            initial_input: None,
        }
    }
}

impl WorkerSection {
    pub fn template(&self) -> CommandTemplate {
        CommandTemplate {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesSection {
    pub timeout_secs: u64,
    pub max_reopens: u32,
    pub commands: BTreeMap<GateKind, CommandTemplate>,
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            max_reopens: 3,
            commands: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    /// Shell command run on trunk after each merge. Discovered when unset.
    pub build_command: Option<String>,
    pub build_timeout_secs: u64,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            build_command: None,
            build_timeout_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub inbox_dir: PathBuf,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            inbox_dir: PathBuf::from(".wave/inbox"),
        }
    }
}

impl WaveConfig {
    /// Makes a relative `repo.root` absolute against `base_dir` (normally
    /// the directory holding the config file).
    pub fn anchor(&mut self, base_dir: &Path) {
        if self.repo.root.is_relative() {
            self.repo.root = base_dir.join(&self.repo.root);
        }
    }

    fn under_root(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo.root.join(path)
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.under_root(&self.repo.workspace_root)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.under_root(&self.store.sqlite_path)
    }

    pub fn event_log_root(&self) -> PathBuf {
        self.under_root(&self.store.event_log_root)
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.under_root(&self.notify.inbox_dir)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.repo.git_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gates.timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.merge.build_timeout_secs)
    }

    pub fn gate_command(&self, gate: GateKind) -> Option<&CommandTemplate> {
        self.gates.commands.get(&gate)
    }
}

pub fn parse_wave_config(contents: &str) -> Result<WaveConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Loads and anchors the config at `path`.
pub fn load_wave_config(path: impl AsRef<Path>) -> Result<WaveConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let mut config = parse_wave_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let base = path_ref
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.anchor(base);
    Ok(config)
}

pub fn save_wave_config(path: impl AsRef<Path>, config: &WaveConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
