use anyhow::{Context, Result};
use clap::ArgMatches;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PollError;
use crate::poll::PollPolicy;
use crate::prober::{validate_ingress, DEFAULT_TRANSPORT_ERROR_THRESHOLD};

/// Frozen configuration snapshot shared by every test in the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Registry prefix for test images.
    pub docker_repo: String,
    /// Whether serving domains resolve from where the tests run.
    pub resolvable_domain: bool,
    /// `host[:port]` of the ingress used when domains do not resolve.
    pub ingress_endpoint: Option<String>,
    pub verbose: bool,
    pub emit_metrics: bool,
    pub poll: PollSettings,
    pub probe: ProbeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub transport_error_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_repo: String::new(),
            resolvable_domain: false,
            ingress_endpoint: None,
            verbose: false,
            emit_metrics: false,
            poll: PollSettings::default(),
            probe: ProbeSettings::default(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 600_000,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 300_000,
            request_timeout_ms: 30_000,
            transport_error_threshold: DEFAULT_TRANSPORT_ERROR_THRESHOLD,
        }
    }
}

impl PollSettings {
    pub fn policy(&self) -> Result<PollPolicy, PollError> {
        PollPolicy::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

impl ProbeSettings {
    pub fn policy(&self) -> Result<PollPolicy, PollError> {
        PollPolicy::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

const ENV_PREFIX: &str = "POLLGATE";

fn cli_value<'a>(matches: &'a ArgMatches, id: &str) -> Option<&'a String> {
    matches.try_get_one::<String>(id).ok().flatten()
}

fn cli_flag(matches: &ArgMatches, id: &str) -> bool {
    matches
        .try_get_one::<bool>(id)
        .ok()
        .flatten()
        .copied()
        .unwrap_or(false)
}

impl Settings {
    /// Load from an optional TOML file and `POLLGATE_*` environment
    /// variables (`__` separates nested keys, e.g. `POLLGATE_POLL__TIMEOUT_MS`).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(config_path, ENV_PREFIX)
    }

    fn load_with_prefix(config_path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                log::info!("Loading configuration from file: {path}");
            } else {
                log::info!("Config file not found: {path}, using defaults");
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(false));
        }

        let mut settings: Settings = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.apply_env_fallbacks();
        Ok(settings)
    }

    /// Load configuration: CLI args > env vars > config file > defaults.
    pub fn load_with_cli(config_path: Option<&str>, matches: &ArgMatches) -> Result<Self> {
        let mut settings = Self::load(config_path)?;
        settings.apply_cli_overrides(matches);
        settings
            .validate()
            .with_context(|| "Configuration validation failed")?;

        log::debug!("Final settings: {settings:?}");
        Ok(settings)
    }

    fn apply_env_fallbacks(&mut self) {
        if self.docker_repo.is_empty() {
            if let Ok(repo) = std::env::var("KO_DOCKER_REPO") {
                self.docker_repo = repo;
            }
        }
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(repo) = cli_value(matches, "docker-repo") {
            self.docker_repo = repo.clone();
        }

        if let Some(resolvable) = cli_value(matches, "resolvable-domain") {
            if let Ok(resolvable) = resolvable.parse::<bool>() {
                self.resolvable_domain = resolvable;
            }
        }

        if let Some(ingress) = cli_value(matches, "ingress") {
            self.ingress_endpoint = Some(ingress.clone());
        }

        if let Some(emit) = cli_value(matches, "emit-metrics") {
            if let Ok(emit) = emit.parse::<bool>() {
                self.emit_metrics = emit;
            }
        }

        if cli_flag(matches, "verbose") {
            self.verbose = true;
        }

        if let Some(interval) = cli_value(matches, "interval-ms") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.probe.interval_ms = interval;
            }
        }

        if let Some(timeout) = cli_value(matches, "timeout-ms") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.probe.timeout_ms = timeout;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.poll.policy().context("Invalid [poll] settings")?;
        self.probe.policy().context("Invalid [probe] settings")?;

        if self.probe.transport_error_threshold == 0 {
            return Err(anyhow::anyhow!(
                "probe.transport_error_threshold must be greater than 0"
            ));
        }

        if self.probe.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "probe.request_timeout_ms must be greater than 0"
            ));
        }

        if let Some(ingress) = self.ingress_endpoint.as_deref().filter(|e| !e.is_empty()) {
            validate_ingress(ingress).context("Invalid ingress_endpoint")?;
        }

        if !self.resolvable_domain
            && self.ingress_endpoint.as_deref().unwrap_or_default().is_empty()
        {
            log::warn!("Domain is not resolvable and no ingress endpoint is configured");
        }

        Ok(())
    }

    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Share the settings read-only for the rest of the process.
    pub fn freeze(self) -> Arc<Settings> {
        Arc::new(self)
    }
}

/// Create a sample configuration file
pub fn create_sample_config(path: &str) -> Result<()> {
    let settings = Settings::default();
    let toml_content =
        toml::to_string_pretty(&settings).context("Failed to serialize default settings")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    log::info!("Sample configuration written to: {path}");
    Ok(())
}
