//! Runtime configuration loaded from an optional TOML file and the environment.
//!
//! Layering: built-in defaults, then the file, then environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::error::{PersonaError, Result};

/// Log output format.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Snapshot of configuration values consumed by the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub data_root: PathBuf,
    pub experiment: String,
    pub model_name: String,
    pub search: SearchCfg,
    pub drift: DriftCfg,
    pub predict: PredictCfg,
    pub notify: NotifyCfg,
    pub storage: StorageCfg,
    pub serve: ServeCfg,
    pub log: LogCfg,
}

/// Candidate search parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCfg {
    pub k_min: usize,
    pub k_max: usize,
    /// Random restarts per cluster count.
    pub n_init: usize,
    pub max_iter: usize,
    /// Fixed seed for reproducible searches; unset means best-effort.
    pub seed: Option<u64>,
    pub parallelism: usize,
    /// How many historical runs the selector considers.
    pub history_top_n: usize,
}

/// Dataset drift test thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftCfg {
    /// p-value below which a column counts as drifted (KS).
    pub stattest_threshold: f64,
    /// Normed distance above which a column counts as drifted (Wasserstein).
    pub wasserstein_threshold: f64,
    /// Share of drifted columns that flips the dataset verdict.
    pub drift_share: f64,
    /// Reference sizes above this use Wasserstein instead of KS.
    pub ks_max_rows: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictCfg {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyCfg {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub no_drift_message: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageCfg {
    /// Run history and model registry. Relative paths resolve under `data_root`.
    pub tracking_db: PathBuf,
    /// Feature tables used for batch scoring.
    pub warehouse_db: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeCfg {
    pub bind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCfg {
    /// Overridden by `RUST_LOG` when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            experiment: "dtc_persona_analysis".to_string(),
            model_name: "dtc_persona_clustering_model".to_string(),
            search: SearchCfg::default(),
            drift: DriftCfg::default(),
            predict: PredictCfg::default(),
            notify: NotifyCfg::default(),
            storage: StorageCfg::default(),
            serve: ServeCfg::default(),
            log: LogCfg::default(),
        }
    }
}

impl Default for SearchCfg {
    fn default() -> Self {
        Self {
            k_min: 2,
            k_max: 10,
            n_init: 10,
            max_iter: 300,
            seed: None,
            parallelism: 1,
            history_top_n: 1000,
        }
    }
}

impl Default for DriftCfg {
    fn default() -> Self {
        Self {
            stattest_threshold: 0.05,
            wasserstein_threshold: 0.1,
            drift_share: 0.5,
            ks_max_rows: 1000,
        }
    }
}

impl Default for PredictCfg {
    fn default() -> Self {
        Self {
            url: "http://0.0.0.0:9999/predict".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for NotifyCfg {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            no_drift_message: "No significant data drift detected, production model unchanged."
                .to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            tracking_db: PathBuf::from("tracking.db"),
            warehouse_db: PathBuf::from("warehouse.db"),
        }
    }
}

impl Default for ServeCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9999".to_string(),
        }
    }
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppCfg {
    /// Load defaults, merge the optional file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| PersonaError::Config(err.to_string()))
    }

    /// Overlay environment values. `lookup` is injectable so tests never touch
    /// the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PERSONA_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Some(level) = lookup("PERSONA_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(url) = lookup("PERSONA_PREDICT_URL") {
            self.predict.url = url;
        }
        if let Some(seed) = lookup("PERSONA_SEED") {
            let seed = seed
                .parse()
                .map_err(|_| PersonaError::Config(format!("PERSONA_SEED is not a u64: {seed}")))?;
            self.search.seed = Some(seed);
        }
        if let Some(token) = lookup("BOT_TOKEN") {
            self.notify.bot_token = Some(token);
        }
        if let Some(chat) = lookup("CHAT_ID") {
            self.notify.chat_id = Some(chat);
        }
        if let Some(message) = lookup("MESSAGE_NODRIFT") {
            self.notify.no_drift_message = message;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if s.k_min < 2 {
            return Err(PersonaError::Config(format!(
                "search.k_min must be >= 2, got {}",
                s.k_min
            )));
        }
        if s.k_min > s.k_max {
            return Err(PersonaError::Config(format!(
                "search.k_min ({}) exceeds search.k_max ({})",
                s.k_min, s.k_max
            )));
        }
        if s.n_init == 0 || s.max_iter == 0 {
            return Err(PersonaError::Config(
                "search.n_init and search.max_iter must be positive".into(),
            ));
        }
        let d = &self.drift;
        for (name, value) in [
            ("drift.stattest_threshold", d.stattest_threshold),
            ("drift.wasserstein_threshold", d.wasserstein_threshold),
            ("drift.drift_share", d.drift_share),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(PersonaError::Config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.predict.timeout_secs == 0 {
            return Err(PersonaError::Config("predict.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn tracking_db_path(&self) -> PathBuf {
        self.data_root.join(&self.storage.tracking_db)
    }

    pub fn warehouse_db_path(&self) -> PathBuf {
        self.data_root.join(&self.storage.warehouse_db)
    }
}
