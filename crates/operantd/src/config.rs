//! Daemon configuration: box hardware hooks on top of the experiment config.
//!
//! Stored as one JSON file in the data directory. The experiment keys sit at
//! the top level next to the daemon keys, so a plain experiment config file
//! also loads.

use std::fs;
use std::path::{Path, PathBuf};

use operant::config::ExperimentConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::DaemonError;

fn default_listen_addr() -> String {
    "127.0.0.1:9877".to_string()
}

/// External commands that move the hopper. Empty argv means no hardware:
/// the daemon only logs the movement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HopperCommands {
    #[serde(default)]
    pub up: Vec<String>,
    #[serde(default)]
    pub down: Vec<String>,
}

/// Camera scripts. `start` gets the top and side file paths appended,
/// `stop` gets the trial number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoCommands {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Defaults to `<data>/videos`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl VideoCommands {
    pub fn is_configured(&self) -> bool {
        !self.start.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub hopper: HopperCommands,
    #[serde(default)]
    pub video: VideoCommands,
    #[serde(flatten)]
    pub experiment: ExperimentConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            hopper: HopperCommands::default(),
            video: VideoCommands::default(),
            experiment: ExperimentConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read `path`, or write the defaults there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, DaemonError> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(path)?;
            info!(path = %path.display(), "Wrote default config");
            return Ok(cfg);
        }
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.experiment.validate().map_err(operant::error::SessionError::from)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), DaemonError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Relative stimulus paths resolve against the config file's directory.
    pub fn stimuli_path(&self, config_file: &Path) -> PathBuf {
        let p = &self.experiment.stimuli_path;
        if p.is_absolute() {
            return p.clone();
        }
        config_file
            .parent()
            .map(|dir| dir.join(p))
            .unwrap_or_else(|| p.clone())
    }
}
