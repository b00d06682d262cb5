// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One tick of the throttle feedback loop.
//!
//! The controller is a two state machine over `NOT_THROTTLING` and
//! `THROTTLING`:
//!
//! 1. Sample the temperature `T`.
//! 2. While throttling, `T < threshold - safe_diff` releases the ceiling and
//!    ends the tick.
//! 3. Otherwise the ladder picks a ceiling for `T`. Any restrictive ceiling
//!    is actuated and the controller is throttling from then on. An
//!    unrestricted result does nothing, which keeps the last ceiling in place
//!    until the hysteresis margin is crossed.
//!
//! A failed read skips the tick entirely. The last good reading is kept for
//! reporting only and is never fed back into the ladder.

use std::sync::Arc;

use log::trace;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

use crate::actuator::Actuation;
use crate::actuator::Actuator;
use crate::ladder::FrequencyLadder;
use crate::ladder::FREQ_UNLIMITED;
use crate::misc::RateLimit;
use crate::sensor::TemperatureSource;
use crate::state::ThermalContext;
use crate::state::TunablesSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The temperature could not be read, nothing was actuated.
    SensorFault,
    /// Temperature dropped below the hysteresis margin, ceiling released.
    Recovered,
    /// The ladder selected this ceiling.
    Throttled(u32),
    /// Below the ladder, no actuation.
    Idle,
}

pub struct Controller {
    ctx: Arc<ThermalContext>,
    ladder: FrequencyLadder,
    actuator: Arc<Actuator>,
    sensor: Box<dyn TemperatureSource>,
    last_temp: Option<i64>,
    fault_limit: RateLimit,
    sensor_errors: Counter,
    temperature: Gauge,
}

impl Controller {
    pub fn new(
        ladder: FrequencyLadder,
        actuator: Arc<Actuator>,
        sensor: Box<dyn TemperatureSource>,
    ) -> Self {
        Self {
            ctx: actuator.context().clone(),
            ladder,
            actuator,
            sensor,
            last_temp: None,
            fault_limit: RateLimit::default(),
            sensor_errors: counter!("thermal_sensor_errors_total"),
            temperature: gauge!("thermal_temperature_celsius"),
        }
    }

    pub fn context(&self) -> &Arc<ThermalContext> {
        &self.ctx
    }

    pub fn ladder(&self) -> &FrequencyLadder {
        &self.ladder
    }

    pub fn last_temp(&self) -> Option<i64> {
        self.last_temp
    }

    pub fn check_temp(&mut self) -> TickOutcome {
        let temp = match self.sensor.read_temperature() {
            Ok(temp) => temp,
            Err(e) => {
                self.sensor_errors.increment(1);
                crate::warn_ratelimited!(
                    self.fault_limit,
                    "Failed to read {}, skipping tick: {:#}",
                    self.sensor.describe(),
                    e
                );
                return TickOutcome::SensorFault;
            }
        };
        self.last_temp = Some(temp);
        self.temperature.set(temp as f64);

        let tunables = self.ctx.tunables.snapshot();
        self.evaluate(temp, tunables)
    }

    /// The decision half of a tick, for a reading already taken.
    pub fn evaluate(&self, temp: i64, tunables: TunablesSnapshot) -> TickOutcome {
        let state = &self.ctx.state;
        let threshold = tunables.temp_threshold;
        trace!(
            "temp={} threshold={} throttling={}",
            temp,
            threshold,
            state.is_throttling()
        );

        if state.is_throttling() && temp < tunables.recovery_temp() {
            self.actuator.limit_cpu_freqs(FREQ_UNLIMITED);
            state.set_throttling(false);
            return TickOutcome::Recovered;
        }

        let ceiling = self.ladder.select_ceiling(temp, threshold);
        if ceiling == FREQ_UNLIMITED {
            return TickOutcome::Idle;
        }

        if let Actuation::Applied { .. } = self.actuator.limit_cpu_freqs(ceiling) {
            if let Some(band) = self.ladder.band_for(ceiling) {
                trace!("entered band {} at {}C", band.name, temp);
            }
        }
        state.set_throttling(true);
        TickOutcome::Throttled(ceiling)
    }
}
