// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Controller memory shared between the actuation path and the policy
//! notifier.
//!
//! Only the actuator writes [`ThrottleState`]. The notifier reads it from
//! whatever thread the frequency-policy subsystem calls it on, so every field
//! is an atomic and readers never block. A reader racing a write sees either
//! the old or the new ceiling.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::ladder::FREQ_UNLIMITED;

pub const DEFAULT_TEMP_THRESHOLD: i64 = 38;
pub const DEFAULT_SAFE_DIFF: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    NotThrottling,
    Throttling,
}

#[derive(Debug)]
pub struct ThrottleState {
    max_allowed_freq: AtomicU32,
    throttling: AtomicBool,
    pending_change: AtomicBool,
}

impl ThrottleState {
    pub fn new() -> Self {
        Self {
            max_allowed_freq: AtomicU32::new(FREQ_UNLIMITED),
            throttling: AtomicBool::new(false),
            pending_change: AtomicBool::new(false),
        }
    }

    pub fn max_allowed_freq(&self) -> u32 {
        self.max_allowed_freq.load(Ordering::Acquire)
    }

    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    pub fn pending_change(&self) -> bool {
        self.pending_change.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> ThrottleMode {
        if self.is_throttling() {
            ThrottleMode::Throttling
        } else {
            ThrottleMode::NotThrottling
        }
    }

    pub(crate) fn begin_change(&self, ceiling: u32) {
        self.max_allowed_freq.store(ceiling, Ordering::Release);
        self.pending_change.store(true, Ordering::Release);
    }

    pub(crate) fn end_change(&self) {
        self.pending_change.store(false, Ordering::Release);
    }

    pub(crate) fn set_throttling(&self, throttling: bool) {
        self.throttling.store(throttling, Ordering::Release);
    }
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Operator-adjustable knobs. Read once at the start of every tick.
#[derive(Debug)]
pub struct Tunables {
    temp_threshold: AtomicI64,
    safe_diff: AtomicI64,
}

impl Tunables {
    pub fn new(temp_threshold: i64, safe_diff: i64) -> Self {
        Self {
            temp_threshold: AtomicI64::new(temp_threshold),
            safe_diff: AtomicI64::new(safe_diff),
        }
    }

    pub fn temp_threshold(&self) -> i64 {
        self.temp_threshold.load(Ordering::Relaxed)
    }

    pub fn set_temp_threshold(&self, threshold: i64) {
        self.temp_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn safe_diff(&self) -> i64 {
        self.safe_diff.load(Ordering::Relaxed)
    }

    pub fn set_safe_diff(&self, safe_diff: i64) {
        self.safe_diff.store(safe_diff, Ordering::Relaxed);
    }

    /// Temperature a throttled controller has to drop strictly below before
    /// it releases the ceiling.
    pub fn recovery_temp(&self) -> i64 {
        self.snapshot().recovery_temp()
    }

    /// Both knobs as of now. A tick works from one snapshot so a concurrent
    /// write never mixes two thresholds.
    pub fn snapshot(&self) -> TunablesSnapshot {
        TunablesSnapshot {
            temp_threshold: self.temp_threshold(),
            safe_diff: self.safe_diff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunablesSnapshot {
    pub temp_threshold: i64,
    pub safe_diff: i64,
}

impl TunablesSnapshot {
    pub fn recovery_temp(&self) -> i64 {
        self.temp_threshold.saturating_sub(self.safe_diff)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new(DEFAULT_TEMP_THRESHOLD, DEFAULT_SAFE_DIFF)
    }
}

/// Everything the controller, actuator and notifier share. Owned through an
/// `Arc` by the driver.
#[derive(Debug, Default)]
pub struct ThermalContext {
    pub state: ThrottleState,
    pub tunables: Tunables,
}

impl ThermalContext {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            state: ThrottleState::new(),
            tunables,
        }
    }
}
