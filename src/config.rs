use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-jobs.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub proc: Option<usize>,
    #[serde(default)]
    pub slots: Option<usize>,
    #[serde(default)]
    pub fastqc_path: Option<String>,
    #[serde(default)]
    pub dispatch_capacity: Option<usize>,
    #[serde(default)]
    pub log_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_path: Utf8PathBuf,
    /// Slots requested by a single job for its external tools.
    pub proc: usize,
    /// Process-wide slot budget shared by all running jobs.
    pub slots: usize,
    pub fastqc_path: String,
    pub dispatch_capacity: usize,
    pub log_dir: Option<Utf8PathBuf>,
}

impl Settings {
    pub fn with_data_path(data_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            proc: 2,
            slots: default_slots(),
            fastqc_path: "fastqc".to_string(),
            dispatch_capacity: 256,
            log_dir: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; without one, `kira-jobs.json` in the
    /// working directory is used when present and defaults otherwise.
    pub fn resolve(path: Option<&Utf8Path>) -> Result<Settings, KiraError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, KiraError> {
        let data_path = match config.data_path {
            Some(path) => path,
            None => default_data_path()?,
        };

        let slots = config.slots.unwrap_or_else(default_slots);
        if slots == 0 {
            return Err(KiraError::ConfigParse("slots must be at least 1".to_string()));
        }
        let proc = config.proc.unwrap_or(2);
        if proc == 0 {
            return Err(KiraError::ConfigParse("proc must be at least 1".to_string()));
        }
        let dispatch_capacity = config.dispatch_capacity.unwrap_or(256);
        if dispatch_capacity == 0 {
            return Err(KiraError::ConfigParse(
                "dispatch_capacity must be at least 1".to_string(),
            ));
        }

        Ok(Settings {
            data_path,
            proc,
            slots,
            fastqc_path: config.fastqc_path.unwrap_or_else(|| "fastqc".to_string()),
            dispatch_capacity,
            log_dir: config.log_dir,
        })
    }
}

fn default_slots() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(2)
}

fn default_data_path() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("kira-sample-jobs")).ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve data directory".to_string()))
}
