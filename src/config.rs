//! Simulation configuration: channel parameter sets, PHY thresholds, and
//! the top-level bootstrap description.
//!
//! Channel conditions are usually picked by name (`ideal`, `stable`,
//! `stable_mid_pl`, `stable_high_pl`, `lossy`, `unstable`); an explicit
//! parameter tuple is accepted anywhere a name is.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(String),
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("unknown channel parameter set '{0}'")]
    UnknownChannel(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Propagation-model parameters for one channel condition.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelParams {
    /// Path loss exponent (2.0 free space, up to ~4 obstructed indoor).
    pub pl_exponent: f64,
    /// Reference distance for the log-distance model, meters.
    pub d0: f64,
    /// Shadowing standard deviation, dB. 0 disables shadowing.
    pub shadow_dev: f64,
    /// Gudmundson coherence distance, meters.
    pub coh_dist: f64,
    /// Nakagami-m fading shape; large values approach a deterministic
    /// channel, m = 1 is Rayleigh.
    pub fading_shape: f64,
    /// Receiver filter bandwidth, Hz (sets the thermal noise floor).
    pub filter_bw: f64,
    /// Carrier frequency, Hz.
    pub freq: f64,
}

impl ChannelParams {
    /// Resolve a named channel parameter set.
    pub fn preset(name: &str) -> Option<Self> {
        let (pl_exponent, shadow_dev, coh_dist, fading_shape) = match name {
            "ideal" => (2.0, 0.0, 50.0, 10.0),
            "stable" => (2.2, 2.0, 40.0, 5.0),
            "stable_mid_pl" => (2.5, 2.0, 40.0, 5.0),
            "stable_high_pl" => (2.9, 2.0, 40.0, 5.0),
            "lossy" => (2.8, 3.0, 30.0, 3.0),
            "unstable" => (3.0, 6.0, 20.0, 1.0),
            _ => return None,
        };
        Some(ChannelParams {
            pl_exponent,
            d0: 1.0,
            shadow_dev,
            coh_dist,
            fading_shape,
            filter_bw: 2e6,
            freq: 2.4e9,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pl_exponent <= 0.0 {
            return Err(ConfigError::Invalid(
                "pl_exponent must be positive".to_string(),
            ));
        }
        if self.d0 <= 0.0 {
            return Err(ConfigError::Invalid("d0 must be positive".to_string()));
        }
        if self.shadow_dev < 0.0 {
            return Err(ConfigError::Invalid(
                "shadow_dev must be non-negative".to_string(),
            ));
        }
        if self.coh_dist <= 0.0 {
            return Err(ConfigError::Invalid(
                "coh_dist must be positive".to_string(),
            ));
        }
        if self.fading_shape <= 0.0 {
            return Err(ConfigError::Invalid(
                "fading_shape must be positive".to_string(),
            ));
        }
        if self.filter_bw <= 0.0 || self.freq <= 0.0 {
            return Err(ConfigError::Invalid(
                "filter_bw and freq must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A channel referenced either by preset name or by an explicit tuple.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    Named(String),
    Explicit(ChannelParams),
}

impl ChannelSpec {
    pub fn resolve(&self) -> Result<ChannelParams, ConfigError> {
        let params = match self {
            ChannelSpec::Named(name) => ChannelParams::preset(name)
                .ok_or_else(|| ConfigError::UnknownChannel(name.clone()))?,
            ChannelSpec::Explicit(params) => params.clone(),
        };
        params.validate()?;
        Ok(params)
    }
}

/// Receiver/transmitter thresholds shared by every PHY instance.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PhyParams {
    /// Minimum SINR margin for capture, dB.
    pub capture_threshold_db: f64,
    /// Clear-channel assessment threshold, dBm.
    pub cca_threshold_dbm: f64,
    /// Correlator sensitivity: weaker signals are never tracked, dBm.
    pub correlator_threshold_dbm: f64,
    /// Default transmit power, dBm.
    pub tx_power_dbm: f64,
}

impl Default for PhyParams {
    fn default() -> Self {
        PhyParams {
            capture_threshold_db: 5.0,
            cca_threshold_dbm: -85.0,
            correlator_threshold_dbm: -95.0,
            tx_power_dbm: 0.0,
        }
    }
}

/// Everything the bootstrap needs to build a simulation.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub root_seed: u64,
    #[serde(default)]
    pub worker_id: u64,
    #[serde(default)]
    pub antithetic: bool,
    /// Spacing of the shadowing-map grid, meters.
    pub dspace_step: f64,
    /// Points per axis of the shadowing-map grid; must be even.
    pub dspace_npt: usize,
    pub channel: ChannelSpec,
    #[serde(default)]
    pub phy: PhyParams,
}

impl SimConfig {
    /// Convenience constructor for programmatic setup with a named channel.
    pub fn with_preset(
        root_seed: u64,
        channel: &str,
        dspace_step: f64,
        dspace_npt: usize,
    ) -> Self {
        SimConfig {
            root_seed,
            worker_id: 0,
            antithetic: false,
            dspace_step,
            dspace_npt,
            channel: ChannelSpec::Named(channel.to_string()),
            phy: PhyParams::default(),
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;
        let cfg: SimConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dspace_step <= 0.0 {
            return Err(ConfigError::Invalid(
                "dspace_step must be positive".to_string(),
            ));
        }
        if self.dspace_npt == 0 || self.dspace_npt % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "dspace_npt must be even and non-zero, got {}",
                self.dspace_npt
            )));
        }
        self.channel.resolve().map(|_| ())
    }
}
