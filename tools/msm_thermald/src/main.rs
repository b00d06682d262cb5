// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod param;
use param::ParamFile;
use param::DEFAULT_PARAM_DIR;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;
use msm_thermal::init_config;
use msm_thermal::Backends;
use msm_thermal::Config;
use msm_thermal::SensorConfig;
use msm_thermal::ThermalDriver;

const PARAM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// msm_thermald: CPU thermal throttling for MSM class SoCs
///
/// Samples a temperature sensor every poll interval and, once the reading
/// reaches the threshold, caps every CPU's cpufreq maximum according to a
/// ladder of temperature bands. Hotter bands also take CPUs offline; cooling
/// brings them back. Throttling ends once the temperature drops below the
/// threshold minus the safe margin.
///
/// The threshold can be changed at runtime by writing a new value into
/// <param-dir>/temp_threshold.
#[derive(Debug, Parser)]
struct Opts {
    /// TOML configuration file. Without it the standard locations are
    /// searched and built-in defaults are used if none exists.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Throttling threshold in degrees Celsius.
    #[clap(short = 't', long)]
    temp_threshold: Option<i64>,

    /// Degrees below the threshold required to stop throttling.
    #[clap(short = 's', long)]
    safe_diff: Option<i64>,

    /// Polling interval in milliseconds.
    #[clap(short = 'i', long)]
    interval_ms: Option<u64>,

    /// Read the temperature from /sys/class/thermal/thermal_zone<N>.
    #[clap(long, conflicts_with = "sensor_channel")]
    sensor_zone: Option<u32>,

    /// Read the temperature from ADC channel <N> of the configured iio device.
    #[clap(long)]
    sensor_channel: Option<u32>,

    /// Root of the sysfs tree, for testing against a fake hierarchy.
    #[clap(long)]
    sysfs_root: Option<PathBuf>,

    /// Directory holding the writable temp_threshold parameter.
    #[clap(long, default_value = DEFAULT_PARAM_DIR)]
    param_dir: PathBuf,

    /// Never hot-plug CPUs, only cap frequencies.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_hotplug: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Print the effective configuration as TOML and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_config: bool,
}

impl Opts {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.temp_threshold {
            config.temp_threshold = v;
        }
        if let Some(v) = self.safe_diff {
            config.safe_diff = v;
        }
        if let Some(v) = self.interval_ms {
            config.poll_ms = v;
        }
        if let Some(zone) = self.sensor_zone {
            config.sensor = Some(SensorConfig::ThermalZone { zone: Some(zone) });
        }
        if let Some(channel) = self.sensor_channel {
            let device = match config.sensor {
                Some(SensorConfig::Adc { device, .. }) => device,
                _ => 0,
            };
            config.sensor = Some(SensorConfig::Adc {
                device,
                channel: Some(channel),
            });
        }
        if let Some(root) = &self.sysfs_root {
            config.sysfs_root = root.clone();
        }
        if self.no_hotplug {
            config.hotplug.enabled = false;
        }
    }
}

fn run(config: &Config, opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    let backends = Backends::sysfs(config)?;
    let driver = ThermalDriver::probe(config, backends)?;

    let mut param = match ParamFile::create(&opts.param_dir, driver.context().clone()) {
        Ok(param) => Some(param),
        Err(e) => {
            warn!("Runtime threshold changes disabled: {:#}", e);
            None
        }
    };

    let mut next_poll = Instant::now() + PARAM_POLL_INTERVAL;
    while !shutdown.load(Ordering::Relaxed) {
        if !driver.is_running() {
            warn!("Thermal worker exited unexpectedly");
            break;
        }
        let now = Instant::now();
        if now >= next_poll {
            if let Some(param) = param.as_mut() {
                param.poll();
            }
            next_poll = now + PARAM_POLL_INTERVAL;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    if let Some(param) = param.take() {
        if let Err(e) = param.remove() {
            warn!("{:#}", e);
        }
    }
    driver.remove()
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let mut config = init_config(opts.config.as_deref())?;
    opts.apply(&mut config);

    if opts.dump_config {
        let text = toml::to_string(&config).context("Failed to serialize configuration")?;
        print!("{}", text);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    run(&config, &opts, shutdown)
}
