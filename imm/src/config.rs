// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::services::backoff::BackoffPolicy;
use crate::app::services::batch::BatchConfig;
use crate::app::services::jobs::MonitorSettings;
use crate::app::services::session::SessionSettings;
use crate::app::usecases::CoreSettings;

const APP_DIR_NAME: &str = "imm";
const CONFIG_FILE_NAME: &str = "imm.toml";
const CONFIG_ENV_VAR: &str = "IMM_CONFIG_PATH";
const DEFAULT_SHELL_PROGRAM: &str = "imm-exo-bridge";
const DEFAULT_TOKEN_ENV: &str = "IMM_TOKEN";
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    session: SessionSection,
    #[serde(default)]
    shell: ShellSection,
    #[serde(default)]
    credentials: CredentialsSection,
    #[serde(default)]
    batch: BatchSection,
    #[serde(default)]
    jobs: JobsSection,
    verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionSection {
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ShellSection {
    program: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct CredentialsSection {
    token_env: Option<String>,
    token_file: Option<String>,
    token_lifetime_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchSection {
    concurrency: Option<usize>,
    stop_on_first_blocker: Option<bool>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    per_item_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsSection {
    poll_interval_secs: Option<u64>,
    jitter_ms: Option<u64>,
    max_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Env(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsConfig {
    pub source: TokenSource,
    pub lifetime: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub session: SessionSettings,
    pub shell: ShellConfig,
    pub credentials: CredentialsConfig,
    pub batch: BatchConfig,
    pub jobs: MonitorSettings,
    pub verbose: bool,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            session: self.session,
            monitor: self.jobs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub shell_program: ConfigValue<PathBuf>,
    pub token_source: ConfigValue<String>,
    pub concurrency: ConfigValue<usize>,
    pub max_retries: ConfigValue<u32>,
    pub stop_on_first_blocker: ConfigValue<bool>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub stop_on_first_blocker: Option<bool>,
    pub verbose: Option<bool>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let session = session_settings(&file_config.session)?;
    let jobs = monitor_settings(&file_config.jobs)?;

    let (program, program_source) = match file_config.shell.program.as_deref() {
        Some(raw) if raw.trim().is_empty() => anyhow::bail!("shell.program must not be empty"),
        Some(raw) => (resolve_program(raw, base_dir), ConfigSource::ConfigFile),
        None => (PathBuf::from(DEFAULT_SHELL_PROGRAM), ConfigSource::Default),
    };
    let shell = ShellConfig {
        program,
        args: file_config.shell.args.clone().unwrap_or_default(),
    };

    let credentials_section = &file_config.credentials;
    let (token, token_source) = match (
        credentials_section.token_file.as_deref(),
        credentials_section.token_env.as_deref(),
    ) {
        (Some(_), Some(_)) => {
            anyhow::bail!("credentials.token_file and credentials.token_env are mutually exclusive")
        }
        (Some(raw), None) => (
            TokenSource::File(resolve_path(raw, base_dir)),
            ConfigSource::ConfigFile,
        ),
        (None, Some(var)) if var.trim().is_empty() => {
            anyhow::bail!("credentials.token_env must not be empty")
        }
        (None, Some(var)) => (TokenSource::Env(var.to_string()), ConfigSource::ConfigFile),
        (None, None) => (
            TokenSource::Env(DEFAULT_TOKEN_ENV.to_string()),
            ConfigSource::Default,
        ),
    };
    let lifetime_secs = credentials_section
        .token_lifetime_secs
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    if lifetime_secs == 0 {
        anyhow::bail!("credentials.token_lifetime_secs must be greater than 0");
    }
    let credentials = CredentialsConfig {
        source: token,
        lifetime: Duration::from_secs(lifetime_secs),
    };

    let defaults = BatchConfig::default();
    let (concurrency, concurrency_source) = pick(
        overrides.concurrency,
        file_config.batch.concurrency,
        defaults.concurrency,
    );
    if concurrency == 0 {
        anyhow::bail!("batch concurrency must be at least 1");
    }
    let (max_retries, max_retries_source) = pick(
        overrides.max_retries,
        file_config.batch.max_retries,
        defaults.max_retries,
    );
    let (stop_on_first_blocker, stop_source) = pick(
        overrides.stop_on_first_blocker,
        file_config.batch.stop_on_first_blocker,
        defaults.stop_on_first_blocker,
    );
    let per_item_timeout = match file_config.batch.per_item_timeout_secs {
        Some(0) => anyhow::bail!("batch.per_item_timeout_secs must be greater than 0"),
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };
    let batch = BatchConfig {
        concurrency,
        stop_on_first_blocker,
        max_retries,
        retry_delay: file_config
            .batch
            .retry_delay_ms
            .map_or(defaults.retry_delay, Duration::from_millis),
        per_item_timeout,
        mode: defaults.mode,
    };

    let (verbose, verbose_source) = pick(overrides.verbose, file_config.verbose, false);

    let config = Config {
        session,
        shell,
        credentials,
        batch,
        jobs,
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        shell_program: ConfigValue {
            value: config.shell.program.clone(),
            source: program_source,
        },
        token_source: ConfigValue {
            value: match &config.credentials.source {
                TokenSource::Env(var) => format!("env:{var}"),
                TokenSource::File(path) => format!("file:{}", path.display()),
            },
            source: token_source,
        },
        concurrency: ConfigValue {
            value: config.batch.concurrency,
            source: concurrency_source,
        },
        max_retries: ConfigValue {
            value: config.batch.max_retries,
            source: max_retries_source,
        },
        stop_on_first_blocker: ConfigValue {
            value: config.batch.stop_on_first_blocker,
            source: stop_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn pick<T>(override_value: Option<T>, file_value: Option<T>, default: T) -> (T, ConfigSource) {
    match override_value {
        Some(value) => (value, ConfigSource::Override),
        None => match file_value {
            Some(value) => (value, ConfigSource::ConfigFile),
            None => (default, ConfigSource::Default),
        },
    }
}

fn session_settings(section: &SessionSection) -> Result<SessionSettings> {
    let defaults = SessionSettings::default();
    let backoff = BackoffPolicy {
        base: section
            .backoff_base_ms
            .map_or(defaults.backoff.base, Duration::from_millis),
        max: section
            .backoff_max_ms
            .map_or(defaults.backoff.max, Duration::from_millis),
        max_attempts: section
            .max_reconnect_attempts
            .unwrap_or(defaults.backoff.max_attempts),
    };
    if backoff.base > backoff.max {
        anyhow::bail!(
            "session.backoff_base_ms ({}) must not exceed session.backoff_max_ms ({})",
            backoff.base.as_millis(),
            backoff.max.as_millis()
        );
    }
    if backoff.max_attempts == 0 {
        anyhow::bail!("session.max_reconnect_attempts must be at least 1");
    }
    let command_timeout = match section.command_timeout_secs {
        Some(0) => anyhow::bail!("session.command_timeout_secs must be greater than 0"),
        Some(secs) => Duration::from_secs(secs),
        None => defaults.command_timeout,
    };
    Ok(SessionSettings {
        backoff,
        command_timeout,
    })
}

fn monitor_settings(section: &JobsSection) -> Result<MonitorSettings> {
    let defaults = MonitorSettings::default();
    let poll_interval = match section.poll_interval_secs {
        Some(0) => anyhow::bail!("jobs.poll_interval_secs must be greater than 0"),
        Some(secs) => Duration::from_secs(secs),
        None => defaults.poll_interval,
    };
    let max_wait = match section.max_wait_secs {
        Some(0) => anyhow::bail!("jobs.max_wait_secs must be greater than 0"),
        Some(secs) => Duration::from_secs(secs),
        None => defaults.max_wait,
    };
    Ok(MonitorSettings {
        poll_interval,
        jitter: section.jitter_ms.map_or(defaults.jitter, Duration::from_millis),
        max_wait,
    })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

// Bare names are looked up on PATH by the OS; only paths are anchored to the
// config directory.
fn resolve_program(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    if raw.contains(std::path::MAIN_SEPARATOR) || raw.starts_with('~') {
        resolve_path(raw, base_dir)
    } else {
        PathBuf::from(raw)
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}
