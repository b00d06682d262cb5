// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency Ladder
//!
//! Maps how far the observed temperature sits above the base threshold to a
//! CPU frequency ceiling. The ladder is an ordered table of bands, hottest
//! first. Selection walks the table and returns the first band whose lower
//! bound the delta reaches:
//!
//!```
//!     use msm_thermal::{FrequencyLadder, FREQ_UNLIMITED};
//!     let ladder = FrequencyLadder::reference();
//!     assert_eq!(ladder.select_ceiling(50, 38), 1036800);
//!     assert_eq!(ladder.select_ceiling(37, 38), FREQ_UNLIMITED);
//!```
//!
//! Bands are inclusive on their lower bound, so a reading exactly on a
//! boundary lands in the hotter band.

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Ceiling value meaning "no limit".
pub const FREQ_UNLIMITED: u32 = u32::MAX;

/// Highest OPP of the reference SoC. Never used as a ceiling.
pub const FREQ_HW_MAX: u32 = 1958400;

pub const FREQ_NOTE_7: u32 = 729600;
pub const FREQ_HELL: u32 = 960000;
pub const FREQ_BBQ: u32 = 1036800;
pub const FREQ_MICROWAVE: u32 = 1190400;
pub const FREQ_VERY_HOT: u32 = 1267200;
pub const FREQ_HOT: u32 = 1497600;
pub const FREQ_WARM: u32 = 1574400;
pub const FREQ_ZIPPY: u32 = 1728000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    /// Smallest `temperature - threshold` that falls into this band.
    pub min_delta: i64,
    /// Ceiling in kHz.
    pub freq: u32,
}

impl Band {
    pub fn new(name: &str, min_delta: i64, freq: u32) -> Self {
        Self {
            name: name.to_string(),
            min_delta,
            freq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyLadder {
    bands: Vec<Band>,
}

impl FrequencyLadder {
    /// Build a ladder from bands ordered hottest first.
    ///
    /// The ladder must be monotonic: lower bounds strictly decreasing and
    /// ceilings strictly increasing along the list. Anything else is a
    /// configuration error.
    pub fn new(bands: Vec<Band>) -> Result<Self> {
        if bands.is_empty() {
            bail!("Frequency ladder must have at least one band");
        }

        for band in bands.iter() {
            if band.freq == 0 || band.freq == FREQ_UNLIMITED {
                bail!("Band {:?} has invalid ceiling {}", band.name, band.freq);
            }
        }

        for pair in bands.windows(2) {
            let (hotter, cooler) = (&pair[0], &pair[1]);
            if hotter.min_delta <= cooler.min_delta {
                bail!(
                    "Band {:?} (delta {}) must start above band {:?} (delta {})",
                    hotter.name,
                    hotter.min_delta,
                    cooler.name,
                    cooler.min_delta
                );
            }
            if hotter.freq >= cooler.freq {
                bail!(
                    "Band {:?} ceiling {} must be below band {:?} ceiling {}",
                    hotter.name,
                    hotter.freq,
                    cooler.name,
                    cooler.freq
                );
            }
        }

        Ok(Self { bands })
    }

    /// The MSM8974 ladder.
    pub fn reference() -> Self {
        Self {
            bands: vec![
                Band::new("note_7", 18, FREQ_NOTE_7),
                Band::new("hell", 14, FREQ_HELL),
                Band::new("bbq", 12, FREQ_BBQ),
                Band::new("microwave", 10, FREQ_MICROWAVE),
                Band::new("very_hot", 8, FREQ_VERY_HOT),
                Band::new("hot", 5, FREQ_HOT),
                Band::new("warm", 2, FREQ_WARM),
                Band::new("zippy", 0, FREQ_ZIPPY),
            ],
        }
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    /// Ceiling for `temperature` against `threshold`, or [`FREQ_UNLIMITED`]
    /// when the reading is below the coolest band.
    pub fn select_ceiling(&self, temperature: i64, threshold: i64) -> u32 {
        let delta = temperature.saturating_sub(threshold);
        self.bands
            .iter()
            .find(|band| delta >= band.min_delta)
            .map(|band| band.freq)
            .unwrap_or(FREQ_UNLIMITED)
    }

    /// Band whose ceiling is exactly `freq`.
    pub fn band_for(&self, freq: u32) -> Option<&Band> {
        self.bands.iter().find(|band| band.freq == freq)
    }

    pub fn contains_freq(&self, freq: u32) -> bool {
        self.band_for(freq).is_some()
    }
}

impl Default for FrequencyLadder {
    fn default() -> Self {
        Self::reference()
    }
}
