//! Manager-wide settings loaded from `$MISSION_HOME/config.toml`.
//!
//! Every field has a default, so a missing file is equivalent to an empty one.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;
use regex_lite::Regex;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_AGENT_PROGRAM: &str = "claude";
const DEFAULT_READY_PROMPT_PATTERN: &str = r"(?m)^\s*(?:>|❯|›|\$)\s*$";
const DEFAULT_CONFIRMATION_PATTERN: &str =
    r"(?i)(?:\(y/n\)|\[y/n\]|\(yes/no\)|\[yes/no\]|do you want to proceed\?)\s*$";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field} pattern: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex_lite::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub restart: RestartSettings,
    pub terminal: TerminalSettings,
    pub streaming: StreamingSettings,
    pub worker: WorkerSettings,
    pub redaction: RedactionSettings,
    pub sessions: SessionSettings,
}

impl ManagerConfig {
    /// Load `config.toml` from the given home directory, or from
    /// [`find_mission_home`] when none is given.
    pub fn load(home: Option<&Path>) -> Result<Self, ConfigError> {
        let home = match home {
            Some(home) => home.to_path_buf(),
            None => find_mission_home().map_err(|source| ConfigError::Read {
                path: PathBuf::from("~/.mission"),
                source,
            })?,
        };
        Self::load_from_file(&home.join(CONFIG_FILE_NAME))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Returns the directory holding mission state.
///
/// `MISSION_HOME` wins when set and non-empty; otherwise `~/.mission`.
pub fn find_mission_home() -> io::Result<PathBuf> {
    if let Ok(val) = std::env::var("MISSION_HOME")
        && !val.is_empty()
    {
        return Ok(PathBuf::from(val));
    }
    let mut home = home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Could not find home directory")
    })?;
    home.push(".mission");
    Ok(home)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RestartSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Interactive CLI driven through a pseudo-terminal.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    pub program: String,
    /// `{task}` is replaced by the task text. When no argument carries the
    /// placeholder the task is typed into the terminal once the ready prompt
    /// shows up.
    pub args: Vec<String>,
    /// Appended when a conversation handle is known; `{conversation_id}` is
    /// substituted.
    pub resume_args: Vec<String>,
    pub ready_prompt_pattern: String,
    pub confirmation_pattern: String,
    pub affirmative_response: String,
    pub auto_approve_delay_ms: u64,
    pub auto_approve_marker: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_AGENT_PROGRAM.to_string(),
            args: Vec::new(),
            resume_args: vec!["--resume".to_string(), "{conversation_id}".to_string()],
            ready_prompt_pattern: DEFAULT_READY_PROMPT_PATTERN.to_string(),
            confirmation_pattern: DEFAULT_CONFIRMATION_PATTERN.to_string(),
            affirmative_response: "y".to_string(),
            auto_approve_delay_ms: 300,
            auto_approve_marker: "[auto-approved]".to_string(),
            cols: 200,
            rows: 50,
        }
    }
}

impl TerminalSettings {
    pub fn auto_approve_delay(&self) -> Duration {
        Duration::from_millis(self.auto_approve_delay_ms)
    }

    pub fn compile_patterns(&self) -> Result<TerminalPatterns, ConfigError> {
        let ready = Regex::new(&self.ready_prompt_pattern).map_err(|source| {
            ConfigError::Pattern {
                field: "ready_prompt_pattern",
                source,
            }
        })?;
        let confirmation = Regex::new(&self.confirmation_pattern).map_err(|source| {
            ConfigError::Pattern {
                field: "confirmation_pattern",
                source,
            }
        })?;
        Ok(TerminalPatterns {
            ready,
            confirmation,
        })
    }
}

/// Compiled terminal trigger patterns.
#[derive(Debug, Clone)]
pub struct TerminalPatterns {
    pub ready: Regex,
    pub confirmation: Regex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub program: String,
    pub extra_args: Vec<String>,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_AGENT_PROGRAM.to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub program: String,
    /// `{task}` and `{budget}` are substituted.
    pub args: Vec<String>,
    pub timeout_ms: u64,
    pub default_budget_usd: f64,
    pub default_max_turns: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_AGENT_PROGRAM.to_string(),
            args: vec![
                "-p".to_string(),
                "{task}".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--max-budget-usd".to_string(),
                "{budget}".to_string(),
            ],
            timeout_ms: 30 * 60 * 1_000,
            default_budget_usd: 2.0,
            default_max_turns: 30,
        }
    }
}

impl WorkerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    /// Environment variables whose name contains one of these (case
    /// insensitive) are treated as secrets.
    pub secret_name_patterns: Vec<String>,
    /// Values shorter than this are never masked.
    pub min_secret_len: usize,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            secret_name_patterns: [
                "KEY",
                "TOKEN",
                "SECRET",
                "PASSWORD",
                "PASSWD",
                "CREDENTIAL",
                "PRIVATE",
                "AUTH",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            min_secret_len: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub output_buffer_max_bytes: usize,
    /// Directory for per-session JSON records. In-memory when unset.
    pub store_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            output_buffer_max_bytes: 1024 * 1024,
            store_dir: None,
        }
    }
}
