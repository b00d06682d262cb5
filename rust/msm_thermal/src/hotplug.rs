// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU hot-plug tiers.
//!
//! Each tier ties one extra CPU to a ladder level. A ceiling strictly above
//! the tier's level justifies bringing the CPU online; a ceiling exactly at
//! the level takes it offline. Hotter ceilings leave the CPU as it is, so
//! small fluctuations inside the hot end of the ladder do not churn cores.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::ladder::FrequencyLadder;
use crate::ladder::FREQ_BBQ;
use crate::ladder::FREQ_MICROWAVE;
use crate::ladder::FREQ_VERY_HOT;

/// The core lifecycle manager. Every call may block for a long time.
pub trait CoreLifecycle: Send {
    fn bring_online(&mut self, cpu: usize) -> Result<()>;

    fn take_offline(&mut self, cpu: usize) -> Result<()>;

    fn is_online(&self, cpu: usize) -> bool;

    fn online_count(&self) -> usize;

    fn max_cores(&self) -> usize;

    /// Online CPUs in ascending order.
    fn online_cpus(&self) -> Vec<usize> {
        (0..self.max_cores()).filter(|&cpu| self.is_online(cpu)).collect()
    }
}

/// Bring `cpu` online unless it already is. Returns whether anything changed.
pub fn cpu_online_wrapper(cores: &mut dyn CoreLifecycle, cpu: usize) -> Result<bool> {
    if cores.is_online(cpu) {
        return Ok(false);
    }
    cores
        .bring_online(cpu)
        .with_context(|| format!("Failed to bring cpu{cpu} online"))?;
    Ok(true)
}

/// Take `cpu` offline unless it already is. Returns whether anything changed.
pub fn cpu_offline_wrapper(cores: &mut dyn CoreLifecycle, cpu: usize) -> Result<bool> {
    if !cores.is_online(cpu) {
        return Ok(false);
    }
    cores
        .take_offline(cpu)
        .with_context(|| format!("Failed to take cpu{cpu} offline"))?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugTier {
    pub cpu: usize,
    pub freq: u32,
}

/// Tiers sorted by ascending ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugTiers {
    tiers: Vec<HotplugTier>,
}

impl HotplugTiers {
    pub fn new(mut tiers: Vec<HotplugTier>, ladder: &FrequencyLadder) -> Result<Self> {
        tiers.sort_by_key(|tier| tier.freq);

        for tier in tiers.iter() {
            if tier.cpu == 0 {
                bail!("cpu0 cannot be a hot-plug tier");
            }
            if !ladder.contains_freq(tier.freq) {
                bail!(
                    "Hot-plug tier for cpu{} uses {} which is not a ladder ceiling",
                    tier.cpu,
                    tier.freq
                );
            }
        }

        for pair in tiers.windows(2) {
            if pair[0].freq == pair[1].freq {
                bail!("Hot-plug tiers share ceiling {}", pair[0].freq);
            }
        }

        let mut cpus: Vec<usize> = tiers.iter().map(|tier| tier.cpu).collect();
        cpus.sort_unstable();
        cpus.dedup();
        if cpus.len() != tiers.len() {
            bail!("Each cpu may appear in at most one hot-plug tier");
        }

        Ok(Self { tiers })
    }

    /// cpu1 at bbq, cpu2 at microwave, cpu3 at very_hot.
    pub fn reference() -> Self {
        Self {
            tiers: vec![
                HotplugTier { cpu: 1, freq: FREQ_BBQ },
                HotplugTier { cpu: 2, freq: FREQ_MICROWAVE },
                HotplugTier { cpu: 3, freq: FREQ_VERY_HOT },
            ],
        }
    }

    /// `tiers` must be a subset of an already validated list.
    pub(crate) fn from_sorted(tiers: Vec<HotplugTier>) -> Self {
        Self { tiers }
    }

    pub fn disabled() -> Self {
        Self { tiers: vec![] }
    }

    pub fn tiers(&self) -> &[HotplugTier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// CPUs a ceiling of `freq` justifies bringing online, in tier order.
    pub fn to_online(&self, freq: u32) -> impl Iterator<Item = usize> + '_ {
        self.tiers
            .iter()
            .filter(move |tier| freq > tier.freq)
            .map(|tier| tier.cpu)
    }

    /// CPU shed at exactly `freq`, if any.
    pub fn to_offline(&self, freq: u32) -> Option<usize> {
        self.tiers
            .iter()
            .find(|tier| tier.freq == freq)
            .map(|tier| tier.cpu)
    }
}

impl Default for HotplugTiers {
    fn default() -> Self {
        Self::reference()
    }
}
