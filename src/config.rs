use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::args::CliArgs;
use crate::scheduler::SchedulerConfig;
use crate::types::{ServiceName, ServiceProfile};

/// The config struct used by the running process (SPEC_FULL.md §A.3).
/// Recognized keys map onto spec.md §6's "Configuration options
/// recognized by the core."
#[derive(Debug, Clone)]
pub struct Config {
    /// `core.dispatcher.timeout` — per-submission watch timeout, seconds.
    pub submission_watch_timeout_secs: u64,
    /// `core.dispatcher.extraction_depth_limit` — platform ceiling; a
    /// submission may set a tighter `submission.max_extraction_depth`.
    pub default_extraction_depth_limit: u32,
    /// `system.update_interval` — scheduler config-snapshot refresh, seconds.
    pub metrics_flush_interval_secs: u64,
    /// Per-service `timeout` / `failure_limit` overrides.
    pub services: BTreeMap<ServiceName, ServiceProfile>,
    pub default_service_timeout_secs: u64,
    pub default_service_failure_limit: u32,
    /// Staged service list per file type — the scheduler's declared plan.
    pub stages_by_file_type: BTreeMap<String, Vec<Vec<ServiceName>>>,
    pub tracing_filter: Vec<String>,
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn build_tracing_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.tracing_filter {
            filter = filter.add_directive(directive.parse()?);
        }
        Ok(filter)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            stages_by_file_type: self
                .stages_by_file_type
                .iter()
                .map(|(ty, stages)| {
                    (
                        ty.clone(),
                        stages.iter().map(|s| s.iter().cloned().collect()).collect(),
                    )
                })
                .collect(),
            services: self.services.clone(),
            default_timeout_secs: self.default_service_timeout_secs,
            default_failure_limit: self.default_service_failure_limit,
        }
    }
}

/// The builder we use to build [`Config`]: CLI args override env vars
/// override the TOML config file override defaults, matching the
/// teacher's `ConfigBuilder::build` merge order in spirit.
#[derive(Debug)]
pub struct ConfigBuilder {
    pub args: CliArgs,
}

/// Intermediate struct for the config file, whose values are all optional
/// so missing keys fall back through the merge chain.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct ConfigFile {
    #[serde(default)]
    pub submission_watch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_extraction_depth_limit: Option<u32>,
    #[serde(default)]
    pub metrics_flush_interval_secs: Option<u64>,
    #[serde(default)]
    pub default_service_timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_service_failure_limit: Option<u32>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceFileEntry>,
    #[serde(default)]
    pub stages_by_file_type: BTreeMap<String, Vec<Vec<String>>>,
    #[serde(default)]
    pub tracing_filter: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ServiceFileEntry {
    timeout_secs: u64,
    failure_limit: u32,
    #[serde(default)]
    config: serde_json::Value,
}

pub mod defaults {
    pub const SUBMISSION_WATCH_TIMEOUT_SECS: u64 = 60;
    pub const EXTRACTION_DEPTH_LIMIT: u32 = 5;
    pub const METRICS_FLUSH_INTERVAL_SECS: u64 = 30;
    pub const SERVICE_TIMEOUT_SECS: u64 = 30;
    pub const SERVICE_FAILURE_LIMIT: u32 = 3;
    pub const TRACING_FILTER: [&str; 1] = ["info"];
}

impl ConfigBuilder {
    pub const FILENAME: &str = "dispatcher.toml";
    pub const DIRNAME: &str = ".dispatch-core";
    pub const ENV_VAR_PREFIX: &str = "DISPATCH";

    pub fn new(args: CliArgs) -> Self {
        Self { args }
    }

    pub async fn build(&self) -> Result<Config> {
        let dotenv_path = self
            .args
            .dotenv
            .clone()
            .unwrap_or(std::env::current_dir()?.join(".env"));
        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(dotenv_path) {
                tracing::warn!("error loading dotenv file: {e}, continuing anyway");
            }
        }

        let mut config: ConfigFile = match self.filepath() {
            Ok(path) => {
                let contents = tokio::fs::read_to_string(&path).await?;
                toml::from_str(&contents)?
            }
            Err(_) => {
                tracing::debug!("no dispatcher.toml found, using defaults + env + CLI only");
                ConfigFile::default()
            }
        };

        if let Some(timeout) = Self::env_var("SUBMISSION_WATCH_TIMEOUT_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()?
        {
            config.submission_watch_timeout_secs = Some(timeout);
        }

        if let Some(limit) = Self::env_var("EXTRACTION_DEPTH_LIMIT")
            .map(|v| v.parse::<u32>())
            .transpose()?
        {
            config.default_extraction_depth_limit = Some(limit);
        }

        if let Some(tracing_filter) = Self::env_var("TRACING_FILTER")
            .map(|filter| filter.split(',').map(|x| x.trim().to_string()).collect())
        {
            config.tracing_filter = Some(tracing_filter);
        }

        if !self.args.log_level.is_empty() {
            config.tracing_filter = Some(self.args.log_level.clone());
        }

        let services = config
            .services
            .into_iter()
            .filter_map(|(name, entry)| {
                ServiceName::new(&name)
                    .ok()
                    .map(|name| {
                        (
                            name,
                            ServiceProfile {
                                timeout_secs: entry.timeout_secs,
                                failure_limit: entry.failure_limit,
                                config: entry.config,
                            },
                        )
                    })
            })
            .collect();

        let stages_by_file_type = config
            .stages_by_file_type
            .into_iter()
            .map(|(file_type, stages)| {
                let stages = stages
                    .into_iter()
                    .map(|stage| stage.into_iter().map(ServiceName::new_unchecked).collect())
                    .collect();
                (file_type, stages)
            })
            .collect();

        Ok(Config {
            submission_watch_timeout_secs: config
                .submission_watch_timeout_secs
                .unwrap_or(defaults::SUBMISSION_WATCH_TIMEOUT_SECS),
            default_extraction_depth_limit: config
                .default_extraction_depth_limit
                .unwrap_or(defaults::EXTRACTION_DEPTH_LIMIT),
            metrics_flush_interval_secs: config
                .metrics_flush_interval_secs
                .unwrap_or(defaults::METRICS_FLUSH_INTERVAL_SECS),
            services,
            default_service_timeout_secs: config
                .default_service_timeout_secs
                .unwrap_or(defaults::SERVICE_TIMEOUT_SECS),
            default_service_failure_limit: config
                .default_service_failure_limit
                .unwrap_or(defaults::SERVICE_FAILURE_LIMIT),
            stages_by_file_type,
            tracing_filter: config.tracing_filter.unwrap_or(
                defaults::TRACING_FILTER
                    .iter()
                    .map(|x| x.to_string())
                    .collect(),
            ),
            data_dir: self.args.data.clone(),
        })
    }

    pub fn env_var(name: &str) -> Option<String> {
        std::env::var(format!("{}_{name}", Self::ENV_VAR_PREFIX)).ok()
    }

    pub fn filepath(&self) -> Result<PathBuf> {
        let filepaths_to_try = self.filepaths_to_try();

        filepaths_to_try
            .iter()
            .find(|filename| filename.exists())
            .with_context(|| {
                format!(
                    "no config file found, try creating one of these: {:?}",
                    filepaths_to_try
                )
            })
            .cloned()
    }

    pub fn filepaths_to_try(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(dir) = self.args.home_dir.clone() {
            dirs.push(dir);
        }

        if let Some(dir) = Self::env_var("HOME").map(PathBuf::from) {
            dirs.push(dir);
        }

        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .map(|dir| dir.join(Self::DIRNAME))
        {
            dirs.push(dir);
        }

        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        if let Some(dir) = std::env::current_dir()
            .ok()
            .map(|dir| dir.join(Self::DIRNAME))
        {
            dirs.push(dir);
        }

        dirs.into_iter()
            .map(|dir| dir.join(Self::FILENAME))
            .collect()
    }
}
