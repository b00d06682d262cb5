// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::hotplug::HotplugTier;
use crate::hotplug::HotplugTiers;
use crate::ladder::Band;
use crate::ladder::FrequencyLadder;
use crate::state::DEFAULT_SAFE_DIFF;
use crate::state::DEFAULT_TEMP_THRESHOLD;
use crate::sysfs::DEFAULT_SYSFS_ROOT;

pub const DEFAULT_POLL_MS: u64 = 250;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 20;

const MAX_CONFIG_SIZE: u64 = 64 * 1024;

const CONFIG_PATHS: [&str; 3] = [
    "/etc/msm_thermal/config.toml",
    "/etc/msm_thermal.toml",
    "/usr/share/msm_thermal/config.toml",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base threshold in degrees Celsius.
    pub temp_threshold: i64,
    /// Hysteresis margin below `temp_threshold` required to stop throttling.
    pub safe_diff: i64,
    pub poll_ms: u64,
    pub initial_delay_ms: u64,
    pub sysfs_root: PathBuf,
    pub sensor: Option<SensorConfig>,
    /// Replaces the reference ladder when present. Hottest band first.
    pub ladder: Option<Vec<Band>>,
    pub hotplug: HotplugConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorConfig {
    ThermalZone {
        zone: Option<u32>,
    },
    Adc {
        #[serde(default)]
        device: u32,
        channel: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    pub enabled: bool,
    pub tiers: Vec<HotplugTier>,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: HotplugTiers::reference().tiers().to_vec(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_threshold: DEFAULT_TEMP_THRESHOLD,
            safe_diff: DEFAULT_SAFE_DIFF,
            poll_ms: DEFAULT_POLL_MS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            sensor: None,
            ladder: None,
            hotplug: HotplugConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn build_ladder(&self) -> Result<FrequencyLadder> {
        match &self.ladder {
            Some(bands) => FrequencyLadder::new(bands.clone()).context("Invalid ladder"),
            None => Ok(FrequencyLadder::reference()),
        }
    }

    pub fn build_tiers(&self, ladder: &FrequencyLadder) -> Result<HotplugTiers> {
        if !self.hotplug.enabled {
            return Ok(HotplugTiers::disabled());
        }
        HotplugTiers::new(self.hotplug.tiers.clone(), ladder).context("Invalid hot-plug tiers")
    }

    /// Check everything `probe` would otherwise trip over.
    pub fn validate(&self) -> Result<()> {
        if self.poll_ms == 0 {
            bail!("poll_ms must be greater than 0");
        }
        if self.safe_diff < 0 {
            bail!("safe_diff must not be negative");
        }
        // The sensor itself is only required by the sysfs backends.
        match &self.sensor {
            Some(SensorConfig::ThermalZone { zone: None }) => {
                bail!("sensor.zone is required for a thermal_zone sensor")
            }
            Some(SensorConfig::Adc { channel: None, .. }) => {
                bail!("sensor.channel is required for an adc sensor")
            }
            _ => {}
        }
        let ladder = self.build_ladder()?;
        self.build_tiers(&ladder)?;
        Ok(())
    }
}

/// Load `path`, or the first config found in the standard locations, or the
/// defaults. The result is not validated; CLI overrides are applied first.
pub fn init_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return parse_config_file(path);
    }

    for check_path in CONFIG_PATHS {
        let path = Path::new(check_path);
        if path.exists() {
            log::info!("Using config file: {}", check_path);
            return parse_config_file(path);
        }
    }

    Ok(Config::default())
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to read metadata for {:?}", path))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "Config file {:?} is too large: {} bytes exceeds maximum of {}",
            path,
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
    parse_config_content(&content)
}

pub fn parse_config_content(content: &str) -> Result<Config> {
    if content.trim().is_empty() {
        bail!("The config file is empty!");
    }
    toml::from_str(content).context("Failed to parse TOML configuration")
}
