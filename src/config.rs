//! Typed configuration.
//!
//! Defaults, overridden by an optional `intakeq.toml`, overridden by
//! `INTAKEQ_*` environment variables. Malformed values fail fast.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::worker::WorkerConfig;

const DEFAULT_CONFIG_FILE: &str = "intakeq.toml";

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the queue layout, the report snapshot, and local
    /// attachment storage.
    pub data_dir: PathBuf,
    pub log_level: String,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("reports.json")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    /// Load configuration: `path` if given (must exist), otherwise
    /// `intakeq.toml` if present, otherwise defaults; env vars win last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("cannot read {}: {e}", p.display())))?;
                parse_file(&raw, p)?
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    let raw = std::fs::read_to_string(default).map_err(|e| {
                        Error::Config(format!("cannot read {}: {e}", default.display()))
                    })?;
                    parse_file(&raw, default)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let worker_file = file.worker.unwrap_or_default();
        let defaults = WorkerConfig::default();

        let worker = WorkerConfig {
            poll_interval: millis_or(
                env_parse("INTAKEQ_POLL_INTERVAL_MS")?.or(worker_file.poll_interval_ms),
                defaults.poll_interval,
            ),
            max_retries: env_parse("INTAKEQ_MAX_RETRIES")?
                .or(worker_file.max_retries)
                .unwrap_or(defaults.max_retries),
            backoff_base: millis_or(
                env_parse("INTAKEQ_BACKOFF_BASE_MS")?.or(worker_file.backoff_base_ms),
                defaults.backoff_base,
            ),
            backoff_cap: millis_or(
                env_parse("INTAKEQ_BACKOFF_CAP_MS")?.or(worker_file.backoff_cap_ms),
                defaults.backoff_cap,
            ),
            attachment_timeout: millis_or(
                env_parse("INTAKEQ_ATTACHMENT_TIMEOUT_MS")?.or(worker_file.attachment_timeout_ms),
                defaults.attachment_timeout,
            ),
            commit_timeout: millis_or(
                env_parse("INTAKEQ_COMMIT_TIMEOUT_MS")?.or(worker_file.commit_timeout_ms),
                defaults.commit_timeout,
            ),
        };

        Ok(Self {
            data_dir: std::env::var("INTAKEQ_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from("data")),
            log_level: std::env::var("INTAKEQ_LOG_LEVEL")
                .ok()
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            worker,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
    worker: Option<WorkerFile>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerFile {
    poll_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    attachment_timeout_ms: Option<u64>,
    commit_timeout_ms: Option<u64>,
}

fn parse_file(raw: &str, path: &Path) -> Result<ConfigFile> {
    toml::from_str(raw).map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}
