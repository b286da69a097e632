//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then environment variables
//! prefixed with `PULSECTRL_` (for example `PULSECTRL_RAMP_STEP=0.005`).
//!
//! ```no_run
//! use pulsectrl_backend::config::CtrlConfig;
//!
//! let config = CtrlConfig::load(Some("pulsectrl.toml".as_ref())).unwrap();
//! println!("data goes to {}", config.data_root.display());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_PREFIX: &str = "PULSECTRL_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Csv,
    Hdf5,
}

impl StorageKind {
    pub fn extension(&self) -> &'static str {
        match self {
            StorageKind::Csv => "csv",
            StorageKind::Hdf5 => "hdf5",
        }
    }
}

/// Settings of a safe voltage ramp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RampSettings {
    pub step: f64,
    pub dwell: Duration,
    /// Targets above this value are set directly, without stepping.
    pub limit: f64,
}

impl Default for RampSettings {
    fn default() -> Self {
        CtrlConfig::default().ramp()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtrlConfig {
    pub data_root: PathBuf,
    pub logger_root: PathBuf,
    pub ramp_step: f64,
    pub ramp_dwell_ms: u64,
    pub ramp_limit: f64,
    pub settle_ms: u64,
    pub cache_threshold_mb: usize,
    pub storage: StorageKind,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            logger_root: PathBuf::from("logger"),
            ramp_step: 0.01,
            ramp_dwell_ms: 5,
            ramp_limit: 50.,
            settle_ms: 10,
            cache_threshold_mb: 50,
            storage: StorageKind::Csv,
        }
    }
}

impl CtrlConfig {
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(CtrlConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path)
            .extract()
            .map_err(|e| Error::Config(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ramp_step >= 0.) {
            return Err(Error::ScanSetup(format!(
                "ramp_step should be non-negative, got {}",
                self.ramp_step
            )));
        }
        Ok(())
    }

    pub fn ramp(&self) -> RampSettings {
        RampSettings {
            step: self.ramp_step,
            dwell: Duration::from_millis(self.ramp_dwell_ms),
            limit: self.ramp_limit,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = CtrlConfig::default();
        assert_eq!(config.ramp().step, 0.01);
        assert_eq!(config.ramp().dwell, Duration::from_millis(5));
        assert_eq!(config.storage.extension(), "csv");
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "ramp_step = 0.002\nstorage = \"hdf5\"\ndata_root = \"/tmp/pulsectrl\"").unwrap();
        let config: CtrlConfig = CtrlConfig::figment(Some(file.path())).extract().unwrap();
        assert_eq!(config.ramp_step, 0.002);
        assert_eq!(config.storage, StorageKind::Hdf5);
        assert_eq!(config.data_root, PathBuf::from("/tmp/pulsectrl"));
        assert_eq!(config.settle_ms, 10);
    }

    #[test]
    fn bad_value_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "storage = \"tape\"").unwrap();
        assert!(matches!(CtrlConfig::load(Some(file.path())), Err(Error::Config(_))));
    }
}
