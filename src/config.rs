//! Configuration for showrunner paths and pipeline policy.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHOWRUNNER_HOME)
//! 2. Config file (.showrunner/config.yaml)
//! 3. Defaults (~/.showrunner)
//!
//! Config file discovery walks the current directory and its parents for
//! `.showrunner/config.yaml`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the config file)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Seconds to wait for an approval decision; absent means wait forever
    pub approval_timeout_seconds: Option<u64>,

    /// Target bit rates for transcoding
    pub bit_rates: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatcherConfig {
    /// Worker tasks pulling from the activity queue
    pub workers: Option<usize>,

    /// Retry policy for transient activity failures
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Resolved configuration with absolute paths and concrete policy.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to showrunner home (engine state)
    pub home: PathBuf,

    /// Approval timeout; `None` waits indefinitely
    pub approval_timeout: Option<Duration>,

    /// Target transcode bit rates
    pub bit_rates: Vec<u32>,

    /// Dispatcher worker count
    pub workers: usize,

    /// Dispatcher retry policy
    pub retry: RetryPolicy,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

pub const DEFAULT_BIT_RATES: [u32; 3] = [480, 720, 1080];
const DEFAULT_WORKERS: usize = 4;

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".showrunner").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".showrunner");

    let config_file = find_config_file();
    let parsed = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = if let Ok(env_home) = std::env::var("SHOWRUNNER_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = parsed.as_ref().and_then(|c| c.paths.home.as_deref()) {
        let base = config_file
            .as_ref()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));
        resolve_path(base, home_path)
    } else {
        default_home
    };

    let pipeline = parsed.as_ref().and_then(|c| c.pipeline.clone());
    let dispatcher = parsed.as_ref().and_then(|c| c.dispatcher.clone());

    Ok(ResolvedConfig {
        home,
        approval_timeout: pipeline
            .as_ref()
            .and_then(|p| p.approval_timeout_seconds)
            .map(Duration::from_secs),
        bit_rates: pipeline
            .as_ref()
            .and_then(|p| p.bit_rates.clone())
            .unwrap_or_else(|| DEFAULT_BIT_RATES.to_vec()),
        workers: dispatcher
            .as_ref()
            .and_then(|d| d.workers)
            .unwrap_or(DEFAULT_WORKERS),
        retry: dispatcher
            .as_ref()
            .and_then(|d| d.retry.clone())
            .unwrap_or_default(),
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the showrunner home directory (engine state).
pub fn showrunner_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the instances directory ($SHOWRUNNER_HOME/instances)
pub fn instances_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("instances"))
}
