// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Thermal throttling for MSM class SoCs
//!
//! A periodic feedback controller that samples a temperature source, picks
//! a CPU frequency ceiling from a multi-level hysteresis ladder and enforces
//! it two ways: a frequency-policy notifier that caps every CPU's `max`, and
//! hot-plugging CPUs in and out as the ceiling crosses configured tiers.
//!
//! ## Control Loop
//!
//! [`Controller::check_temp`] is one tick. [`ThermalWorker`] runs ticks on a
//! dedicated thread with a fixed delay between them. Every actuation goes
//! through [`Actuator::limit_cpu_freqs`], which publishes the new ceiling in
//! [`ThrottleState`] before anything else, so a concurrent
//! [`ThermalNotifier`] call already clamps to it.
//!
//! ## Collaborators
//!
//! The controller only sees three traits: [`TemperatureSource`],
//! [`FreqPolicy`] and [`CoreLifecycle`]. The [`sysfs`] module implements
//! them on top of Linux sysfs; tests substitute fakes.
//!
//! ## Lifecycle
//!
//! [`ThermalDriver::probe`] validates the [`Config`], registers the notifier
//! and starts the worker. [`ThermalDriver::remove`] undoes it in reverse.

mod actuator;
pub use actuator::fmt_freq;
pub use actuator::Actuation;
pub use actuator::Actuator;

pub mod config;
pub use config::init_config;
pub use config::Config;
pub use config::SensorConfig;

mod controller;
pub use controller::Controller;
pub use controller::TickOutcome;

mod driver;
pub use driver::open_sensor;
pub use driver::Backends;
pub use driver::ThermalDriver;

mod hotplug;
pub use hotplug::CoreLifecycle;
pub use hotplug::HotplugTier;
pub use hotplug::HotplugTiers;

mod ladder;
pub use ladder::Band;
pub use ladder::FrequencyLadder;
pub use ladder::FREQ_BBQ;
pub use ladder::FREQ_HELL;
pub use ladder::FREQ_HOT;
pub use ladder::FREQ_HW_MAX;
pub use ladder::FREQ_MICROWAVE;
pub use ladder::FREQ_NOTE_7;
pub use ladder::FREQ_UNLIMITED;
pub use ladder::FREQ_VERY_HOT;
pub use ladder::FREQ_WARM;
pub use ladder::FREQ_ZIPPY;

pub mod misc;
pub use misc::read_from_file;
pub use misc::RateLimit;

mod policy;
pub use policy::clamp_ceiling;
pub use policy::CpuPolicy;
pub use policy::FreqPolicy;
pub use policy::NotifierId;
pub use policy::PolicyEvent;
pub use policy::PolicyNotifier;
pub use policy::ThermalNotifier;

mod sensor;
pub use sensor::TemperatureSource;

mod state;
pub use state::ThermalContext;
pub use state::ThrottleMode;
pub use state::ThrottleState;
pub use state::Tunables;
pub use state::TunablesSnapshot;

pub mod sysfs;

mod worker;
pub use worker::ThermalWorker;
pub use worker::Tick;
