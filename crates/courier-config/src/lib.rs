//! Courier Configuration
//!
//! TOML configuration for the task scheduler: data directory, logging,
//! store tuning and per-command queue overrides

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_DB_FILE: &str = "courier.db";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// Idle sleep between claim attempts when a lane has no eligible task.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            poll_interval_ms: default_poll_interval_ms(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff_ms(),
        }
    }
}

/// Operator overrides for a command's declared queue policy.
/// Unset fields keep whatever the command itself declares.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CommandOverride {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub period_ms: Option<u64>,
    pub requests: Option<u32>,
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub soft_success: Vec<String>,
}

fn default_db_file() -> String {
    DEFAULT_DB_FILE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_busy_retries() -> u32 {
    5
}

fn default_busy_backoff_ms() -> u64 {
    50
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("courier").join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.db_file.trim().is_empty() {
            anyhow::bail!("scheduler.db_file cannot be empty");
        }
        if self.scheduler.poll_interval_ms == 0 {
            anyhow::bail!("scheduler.poll_interval_ms must be greater than zero");
        }

        for (name, cmd) in &self.commands {
            if name.trim().is_empty() {
                anyhow::bail!("Command name cannot be empty");
            }
            if cmd.requests == Some(0) {
                anyhow::bail!("Command '{}' requests must be greater than zero", name);
            }
            if cmd.concurrency == Some(0) {
                anyhow::bail!("Command '{}' concurrency must be greater than zero", name);
            }
            if cmd.period_ms == Some(0) {
                anyhow::bail!("Command '{}' period_ms must be greater than zero", name);
            }
            if cmd.timeout_secs == Some(0) {
                anyhow::bail!("Command '{}' timeout_secs must be greater than zero", name);
            }
            if cmd.soft_success.iter().any(|s| s.trim().is_empty()) {
                anyhow::bail!("Command '{}' has an empty soft_success pattern", name);
            }
        }

        Ok(())
    }

    /// Resolves `core.data_dir`, expanding a leading `~`. Defaults to `~/.courier`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(data_dir) = &self.core.data_dir {
            if data_dir == "~" || data_dir.starts_with("~/") {
                let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                if data_dir == "~" {
                    home
                } else {
                    home.join(data_dir.trim_start_matches("~/"))
                }
            } else {
                PathBuf::from(data_dir)
            }
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".courier")
        }
    }

    pub fn db_path(&self) -> PathBuf {
        let db_file = Path::new(&self.scheduler.db_file);
        if db_file.is_absolute() {
            db_file.to_path_buf()
        } else {
            self.data_dir().join(db_file)
        }
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    pub fn command(&self, name: &str) -> Option<&CommandOverride> {
        self.commands.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_gets_scheduler_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler.db_file, "courier.db");
        assert_eq!(cfg.scheduler.poll_interval_ms, 1000);
        assert_eq!(cfg.scheduler.busy_retries, 5);
        assert!(cfg.commands.is_empty());
        assert_eq!(cfg.log_level(), "info");
    }

    #[test]
    fn parses_command_overrides() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/var/lib/courier"

[commands.download]
max_retries = 5
period_ms = 10000
requests = 1
concurrency = 2
soft_success = ["message to delete not found"]
"#,
        );
        assert!(cfg.validate().is_ok());
        let download = cfg.command("download").expect("download override");
        assert_eq!(download.max_retries, Some(5));
        assert_eq!(download.concurrency, Some(2));
        assert_eq!(download.timeout_secs, None);
        assert_eq!(download.soft_success.len(), 1);
        assert_eq!(
            cfg.db_path(),
            std::path::PathBuf::from("/var/lib/courier/courier.db")
        );
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let cfg = parse_config(
            r#"
[commands.ai]
concurrency = 0
"#,
        );
        let err = cfg.validate().expect_err("zero concurrency must fail");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn validate_rejects_zero_requests() {
        let cfg = parse_config(
            r#"
[commands.ai]
requests = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_soft_success_pattern() {
        let cfg = parse_config(
            r#"
[commands.ai]
soft_success = [" "]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn absolute_db_file_ignores_data_dir() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/srv/courier"

[scheduler]
db_file = "/tmp/queue.db"
"#,
        );
        assert_eq!(cfg.db_path(), std::path::PathBuf::from("/tmp/queue.db"));
    }
}
