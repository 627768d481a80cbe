use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the Slack member id to ping on exit.
pub const USER_ID_VAR: &str = "SLACK_USER_ID";
/// Environment variable holding the bot token (`xoxb-...`).
pub const BOT_TOKEN_VAR: &str = "SLACK_BOT_TOKEN";
/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_PATH_VAR: &str = "SLACK_JOB_MONITOR_CONFIG";

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub slack: SlackConfig,
    pub monitor: PollConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Channel name resolved through `conversations.list`.
    pub channel: String,
    /// Channel id; skips the name lookup when set.
    pub channel_id: Option<String>,
    pub api_base: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub poll_interval_secs: u64,
    pub update_interval_secs: u64,
    pub progress_file: Option<PathBuf>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            channel: "webhooks".to_string(),
            channel_id: None,
            api_base: "https://slack.com/api".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            update_interval_secs: 4,
            progress_file: None,
        }
    }
}

/// Settings the reporter loop actually runs with.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub update_interval: Duration,
    pub progress_file: Option<PathBuf>,
}

impl PollConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            update_interval: Duration::from_secs(self.update_interval_secs),
            progress_file: self.progress_file.clone(),
        }
    }
}

/// Slack credentials, read once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub user_id: String,
    pub bot_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("bot_token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |key: &'static str| match lookup(key) {
            Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(ConfigError::MissingEnv { var: key }),
        };
        Ok(Self {
            user_id: require(USER_ID_VAR)?,
            bot_token: require(BOT_TOKEN_VAR)?,
        })
    }
}

/// Errors that abort startup before any command is spawned.
#[derive(Debug)]
pub enum ConfigError {
    MissingEnv {
        var: &'static str,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingEnv { var } => {
                write!(f, "required environment variable {var} is not set")
            }
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingEnv { .. } | ConfigError::Invalid(_) => None,
        }
    }
}

impl MonitorConfig {
    /// Load config from `path`, or defaults when no path is given.
    ///
    /// An explicitly named file that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Self::parse(path, &contents)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.monitor.update_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.update_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.slack.channel_id.is_none() && self.slack.channel.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "slack.channel or slack.channel_id is required".to_string(),
            ));
        }
        Ok(())
    }
}
